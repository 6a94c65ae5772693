pub mod assets;
pub mod categories;
pub mod config;
pub mod geocoding;
pub mod memory;
pub mod property_store;
pub mod types;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

pub use types::{
    Category, Coordinates, CreatedProperty, InventoryPayload, PropertyDetails, PropertyPayload,
    ResolvedAddress, UploadFile,
};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
    #[error("not found: {0}")]
    NotFound(String),
}

#[async_trait]
pub trait PropertyStore: Send + Sync {
    async fn create_property(
        &self,
        payload: &PropertyPayload,
        idempotency_key: &str,
    ) -> Result<CreatedProperty, RemoteError>;

    async fn update_property(
        &self,
        property_id: &str,
        payload: &PropertyPayload,
    ) -> Result<String, RemoteError>;

    async fn get_property_details(&self, property_id: &str)
    -> Result<PropertyDetails, RemoteError>;

    async fn create_inventory_item(
        &self,
        property_id: &str,
        payload: &InventoryPayload,
        idempotency_key: &str,
    ) -> Result<String, RemoteError>;

    async fn update_inventory_item(
        &self,
        property_id: &str,
        item_id: &str,
        payload: &InventoryPayload,
    ) -> Result<(), RemoteError>;

    async fn delete_inventory_item(&self, property_id: &str, item_id: &str)
    -> Result<(), RemoteError>;
}

#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Store the files and return their URLs in input order.
    async fn upload_images(&self, files: &[UploadFile]) -> Result<Vec<String>, RemoteError>;

    async fn delete_image(&self, url: &str) -> Result<(), RemoteError>;
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn address_to_coordinates(&self, query: &str)
    -> Result<Option<Coordinates>, RemoteError>;

    async fn coordinates_to_address(&self, lat: f64, lng: f64)
    -> Result<ResolvedAddress, RemoteError>;

    async fn distance_between(
        &self,
        from: Coordinates,
        to: Coordinates,
    ) -> Result<f64, RemoteError> {
        Ok(geocoding::haversine_km(from, to))
    }
}

#[async_trait]
pub trait CategorySource: Send + Sync {
    async fn list_active_categories(&self) -> Result<Vec<Category>, RemoteError>;
}

/// The collaborators a wizard talks to. The geocoder is optional; without it
/// submission falls back to the configured coordinate.
#[derive(Clone)]
pub struct Remotes {
    pub properties: Arc<dyn PropertyStore>,
    pub assets: Arc<dyn AssetStore>,
    pub geocoder: Option<Arc<dyn Geocoder>>,
    pub categories: Arc<dyn CategorySource>,
}

impl Remotes {
    /// HTTP clients for every collaborator whose base URL is configured; the
    /// in-memory implementation otherwise.
    pub fn from_env() -> Self {
        let properties: Arc<dyn PropertyStore> = match property_store::HttpPropertyStore::from_env()
        {
            Some(client) => Arc::new(client),
            None => {
                info!(target = "onboarding.remote", "PROPERTY_API_URL unset; using in-memory property store");
                Arc::new(memory::InMemoryPropertyStore::default())
            }
        };
        let assets: Arc<dyn AssetStore> = match assets::HttpAssetStore::from_env() {
            Some(client) => Arc::new(client),
            None => {
                info!(target = "onboarding.remote", "ASSET_API_URL unset; using in-memory asset store");
                Arc::new(memory::InMemoryAssetStore::default())
            }
        };
        let geocoder: Option<Arc<dyn Geocoder>> = match geocoding::HttpGeocoder::from_env() {
            Some(client) => Some(Arc::new(client)),
            None => Some(Arc::new(memory::OfflineGeocoder::default())),
        };
        let categories: Arc<dyn CategorySource> = match categories::HttpCategorySource::from_env()
        {
            Some(client) => Arc::new(client),
            None => Arc::new(memory::StaticCategorySource::default()),
        };
        Self {
            properties,
            assets,
            geocoder,
            categories,
        }
    }
}

/// Map a non-success HTTP status to a `RemoteError`.
pub(crate) fn status_error(status: reqwest::StatusCode, what: &str) -> RemoteError {
    if status == reqwest::StatusCode::NOT_FOUND {
        RemoteError::NotFound(what.to_string())
    } else {
        RemoteError::Request(format!("HTTP {status}"))
    }
}
