use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::config::{ASSET_API_URL, REMOTE_API_TOKEN};
use super::{AssetStore, RemoteError, UploadFile, status_error};
use crate::http::build_client;

#[derive(Debug, Clone)]
pub struct HttpAssetStore {
    base_url: String,
    token: Option<String>,
    http: Client,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EncodedFile<'a> {
    file_name: &'a str,
    mime_type: &'a str,
    data: String,
}

#[derive(Debug, Serialize)]
struct UploadRequest<'a> {
    files: Vec<EncodedFile<'a>>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    urls: Vec<String>,
}

impl HttpAssetStore {
    pub fn from_env() -> Option<Self> {
        Some(Self {
            base_url: ASSET_API_URL.clone()?,
            token: REMOTE_API_TOKEN.clone(),
            http: build_client(),
        })
    }
}

#[async_trait]
impl AssetStore for HttpAssetStore {
    async fn upload_images(&self, files: &[UploadFile]) -> Result<Vec<String>, RemoteError> {
        let body = UploadRequest {
            files: files
                .iter()
                .map(|file| EncodedFile {
                    file_name: &file.file_name,
                    mime_type: &file.mime_type,
                    data: BASE64.encode(&file.bytes),
                })
                .collect(),
        };
        let mut request = self
            .http
            .post(format!("{}/images", self.base_url))
            .json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|err| RemoteError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), "images"));
        }
        let payload: UploadResponse = response
            .json()
            .await
            .map_err(|err| RemoteError::Deserialize(err.to_string()))?;
        if payload.urls.len() != files.len() {
            return Err(RemoteError::Deserialize(format!(
                "expected {} urls, got {}",
                files.len(),
                payload.urls.len()
            )));
        }
        Ok(payload.urls)
    }

    async fn delete_image(&self, url: &str) -> Result<(), RemoteError> {
        let mut request = self
            .http
            .delete(format!("{}/images", self.base_url))
            .query(&[("url", url)]);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|err| RemoteError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), url));
        }
        Ok(())
    }
}
