use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use urlencoding::encode;

use super::config::{PROPERTY_API_URL, REMOTE_API_TOKEN};
use super::{
    CreatedProperty, InventoryPayload, PropertyDetails, PropertyPayload, PropertyStore,
    RemoteError, status_error,
};
use crate::http::build_client;

#[derive(Debug, Clone)]
pub struct HttpPropertyStore {
    base_url: String,
    token: Option<String>,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

impl HttpPropertyStore {
    pub fn from_env() -> Option<Self> {
        let base_url = PROPERTY_API_URL.clone()?;
        Some(Self::new(base_url, REMOTE_API_TOKEN.clone()))
    }

    pub fn new(base_url: String, token: Option<String>) -> Self {
        Self {
            base_url,
            token,
            http: build_client(),
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn property_url(&self, property_id: &str) -> String {
        format!("{}/properties/{}", self.base_url, encode(property_id))
    }

    fn room_types_url(&self, property_id: &str) -> String {
        format!("{}/room-types", self.property_url(property_id))
    }

    async fn send(
        &self,
        request: RequestBuilder,
        what: &str,
    ) -> Result<reqwest::Response, RemoteError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|err| RemoteError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), what));
        }
        Ok(response)
    }
}

#[async_trait]
impl PropertyStore for HttpPropertyStore {
    async fn create_property(
        &self,
        payload: &PropertyPayload,
        idempotency_key: &str,
    ) -> Result<CreatedProperty, RemoteError> {
        let url = format!("{}/properties", self.base_url);
        let request = self
            .http
            .post(url)
            .header("Idempotency-Key", idempotency_key)
            .json(payload);
        self.send(request, "property")
            .await?
            .json()
            .await
            .map_err(|err| RemoteError::Deserialize(err.to_string()))
    }

    async fn update_property(
        &self,
        property_id: &str,
        payload: &PropertyPayload,
    ) -> Result<String, RemoteError> {
        let request = self.http.put(self.property_url(property_id)).json(payload);
        let body: IdResponse = self
            .send(request, property_id)
            .await?
            .json()
            .await
            .map_err(|err| RemoteError::Deserialize(err.to_string()))?;
        Ok(body.id)
    }

    async fn get_property_details(
        &self,
        property_id: &str,
    ) -> Result<PropertyDetails, RemoteError> {
        let url = format!("{}/details", self.property_url(property_id));
        self.send(self.http.get(url), property_id)
            .await?
            .json()
            .await
            .map_err(|err| RemoteError::Deserialize(err.to_string()))
    }

    async fn create_inventory_item(
        &self,
        property_id: &str,
        payload: &InventoryPayload,
        idempotency_key: &str,
    ) -> Result<String, RemoteError> {
        let request = self
            .http
            .post(self.room_types_url(property_id))
            .header("Idempotency-Key", idempotency_key)
            .json(payload);
        let body: IdResponse = self
            .send(request, property_id)
            .await?
            .json()
            .await
            .map_err(|err| RemoteError::Deserialize(err.to_string()))?;
        Ok(body.id)
    }

    async fn update_inventory_item(
        &self,
        property_id: &str,
        item_id: &str,
        payload: &InventoryPayload,
    ) -> Result<(), RemoteError> {
        let url = format!("{}/{}", self.room_types_url(property_id), encode(item_id));
        self.send(self.http.put(url).json(payload), item_id).await?;
        Ok(())
    }

    async fn delete_inventory_item(
        &self,
        property_id: &str,
        item_id: &str,
    ) -> Result<(), RemoteError> {
        let url = format!("{}/{}", self.room_types_url(property_id), encode(item_id));
        self.send(self.http.delete(url), item_id).await?;
        Ok(())
    }
}
