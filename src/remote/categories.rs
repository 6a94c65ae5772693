use async_trait::async_trait;
use reqwest::Client;

use super::config::{CATEGORY_API_URL, REMOTE_API_TOKEN};
use super::{Category, CategorySource, RemoteError, status_error};
use crate::http::build_client;

#[derive(Debug, Clone)]
pub struct HttpCategorySource {
    base_url: String,
    token: Option<String>,
    http: Client,
}

impl HttpCategorySource {
    pub fn from_env() -> Option<Self> {
        Some(Self {
            base_url: CATEGORY_API_URL.clone()?,
            token: REMOTE_API_TOKEN.clone(),
            http: build_client(),
        })
    }
}

#[async_trait]
impl CategorySource for HttpCategorySource {
    async fn list_active_categories(&self) -> Result<Vec<Category>, RemoteError> {
        let mut request = self
            .http
            .get(format!("{}/categories", self.base_url))
            .query(&[("active", "true")]);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|err| RemoteError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), "categories"));
        }
        response
            .json()
            .await
            .map_err(|err| RemoteError::Deserialize(err.to_string()))
    }
}
