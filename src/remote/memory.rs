//! In-process collaborators used when no remote endpoint is configured and
//! by the engine's tests. They record every call they receive.

use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};
use uuid::Uuid;

use super::types::{PropertyRecord, RoomTypeRecord};
use super::{
    AssetStore, Category, CategorySource, Coordinates, CreatedProperty, Geocoder,
    InventoryPayload, PropertyDetails, PropertyPayload, PropertyStore, RemoteError,
    ResolvedAddress, UploadFile,
};

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    CreateProperty {
        room_types: usize,
        idempotency_key: String,
    },
    UpdateProperty {
        property_id: String,
    },
    GetDetails {
        property_id: String,
    },
    CreateItem {
        property_id: String,
        name: String,
        idempotency_key: String,
    },
    UpdateItem {
        property_id: String,
        item_id: String,
    },
    DeleteItem {
        property_id: String,
        item_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    CreateProperty,
    UpdateProperty,
    CreateItem,
    UpdateItem,
    DeleteItem,
}

#[derive(Default)]
struct StoreState {
    records: HashMap<String, PropertyDetails>,
    calls: Vec<StoreCall>,
    /// `(kind, successes left before the next call of that kind fails)`
    failures: Vec<(CallKind, usize)>,
    seen_keys: HashMap<String, String>,
    /// Child ids withheld from the next parent create response.
    withheld_ids: usize,
}

impl StoreState {
    fn check_failure(&mut self, kind: CallKind) -> Result<(), RemoteError> {
        let Some(pos) = self.failures.iter().position(|(k, _)| *k == kind) else {
            return Ok(());
        };
        if self.failures[pos].1 == 0 {
            self.failures.remove(pos);
            return Err(RemoteError::Request("HTTP 503 Service Unavailable".into()));
        }
        self.failures[pos].1 -= 1;
        Ok(())
    }

    fn record_mut(&mut self, property_id: &str) -> Result<&mut PropertyDetails, RemoteError> {
        self.records
            .get_mut(property_id)
            .ok_or_else(|| RemoteError::NotFound(property_id.to_string()))
    }
}

/// Property store that keeps records in memory and de-duplicates creates by
/// idempotency key.
#[derive(Clone, Default)]
pub struct InMemoryPropertyStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryPropertyStore {
    pub fn seed(&self, details: PropertyDetails) {
        let mut state = guard(&self.state);
        state.records.insert(details.property.id.clone(), details);
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        guard(&self.state).calls.clone()
    }

    pub fn clear_calls(&self) {
        guard(&self.state).calls.clear();
    }

    pub fn record(&self, property_id: &str) -> Option<PropertyDetails> {
        guard(&self.state).records.get(property_id).cloned()
    }

    /// Make the call of `kind` fail once after `after` successful calls.
    pub fn fail_on(&self, kind: CallKind, after: usize) {
        guard(&self.state).failures.push((kind, after));
    }

    /// Answer the next parent create with `count` fewer child ids than it
    /// stored.
    pub fn withhold_created_ids(&self, count: usize) {
        guard(&self.state).withheld_ids = count;
    }
}

fn new_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

#[async_trait]
impl PropertyStore for InMemoryPropertyStore {
    async fn create_property(
        &self,
        payload: &PropertyPayload,
        idempotency_key: &str,
    ) -> Result<CreatedProperty, RemoteError> {
        let mut state = guard(&self.state);
        state.calls.push(StoreCall::CreateProperty {
            room_types: payload.room_types.as_ref().map_or(0, Vec::len),
            idempotency_key: idempotency_key.to_string(),
        });
        state.check_failure(CallKind::CreateProperty)?;
        if let Some(existing) = state.seen_keys.get(idempotency_key).cloned()
            && let Some(record) = state.records.get(&existing)
        {
            return Ok(CreatedProperty {
                id: existing,
                room_type_ids: record.room_types.iter().map(|rt| rt.id.clone()).collect(),
            });
        }
        let id = new_id("prop");
        let room_types: Vec<RoomTypeRecord> = payload
            .room_types
            .iter()
            .flatten()
            .map(|item| RoomTypeRecord {
                id: new_id("rt"),
                item: item.clone(),
            })
            .collect();
        let withheld = std::mem::take(&mut state.withheld_ids);
        let room_type_ids = room_types
            .iter()
            .take(room_types.len().saturating_sub(withheld))
            .map(|rt| rt.id.clone())
            .collect();
        let property = PropertyRecord::from_payload(id.clone(), payload);
        state.records.insert(
            id.clone(),
            PropertyDetails {
                property,
                documents: payload.documents.clone().unwrap_or_default(),
                room_types,
            },
        );
        state.seen_keys.insert(idempotency_key.to_string(), id.clone());
        Ok(CreatedProperty { id, room_type_ids })
    }

    async fn update_property(
        &self,
        property_id: &str,
        payload: &PropertyPayload,
    ) -> Result<String, RemoteError> {
        let mut state = guard(&self.state);
        state.calls.push(StoreCall::UpdateProperty {
            property_id: property_id.to_string(),
        });
        state.check_failure(CallKind::UpdateProperty)?;
        let record = state.record_mut(property_id)?;
        record.property = PropertyRecord::from_payload(property_id.to_string(), payload);
        if let Some(documents) = &payload.documents {
            record.documents = documents.clone();
        }
        Ok(property_id.to_string())
    }

    async fn get_property_details(
        &self,
        property_id: &str,
    ) -> Result<PropertyDetails, RemoteError> {
        let mut state = guard(&self.state);
        state.calls.push(StoreCall::GetDetails {
            property_id: property_id.to_string(),
        });
        state
            .records
            .get(property_id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(property_id.to_string()))
    }

    async fn create_inventory_item(
        &self,
        property_id: &str,
        payload: &InventoryPayload,
        idempotency_key: &str,
    ) -> Result<String, RemoteError> {
        let mut state = guard(&self.state);
        state.calls.push(StoreCall::CreateItem {
            property_id: property_id.to_string(),
            name: payload.name.clone(),
            idempotency_key: idempotency_key.to_string(),
        });
        state.check_failure(CallKind::CreateItem)?;
        if let Some(existing) = state.seen_keys.get(idempotency_key) {
            return Ok(existing.clone());
        }
        let id = new_id("rt");
        state.record_mut(property_id)?.room_types.push(RoomTypeRecord {
            id: id.clone(),
            item: payload.clone(),
        });
        state.seen_keys.insert(idempotency_key.to_string(), id.clone());
        Ok(id)
    }

    async fn update_inventory_item(
        &self,
        property_id: &str,
        item_id: &str,
        payload: &InventoryPayload,
    ) -> Result<(), RemoteError> {
        let mut state = guard(&self.state);
        state.calls.push(StoreCall::UpdateItem {
            property_id: property_id.to_string(),
            item_id: item_id.to_string(),
        });
        state.check_failure(CallKind::UpdateItem)?;
        let record = state.record_mut(property_id)?;
        let room = record
            .room_types
            .iter_mut()
            .find(|rt| rt.id == item_id)
            .ok_or_else(|| RemoteError::NotFound(item_id.to_string()))?;
        room.item = payload.clone();
        Ok(())
    }

    async fn delete_inventory_item(
        &self,
        property_id: &str,
        item_id: &str,
    ) -> Result<(), RemoteError> {
        let mut state = guard(&self.state);
        state.calls.push(StoreCall::DeleteItem {
            property_id: property_id.to_string(),
            item_id: item_id.to_string(),
        });
        state.check_failure(CallKind::DeleteItem)?;
        let record = state.record_mut(property_id)?;
        record.room_types.retain(|rt| rt.id != item_id);
        Ok(())
    }
}

#[derive(Default)]
struct AssetState {
    stored: Vec<String>,
    deleted: Vec<String>,
    upload_calls: usize,
    fail_uploads: bool,
    fail_deletes: bool,
}

#[derive(Clone, Default)]
pub struct InMemoryAssetStore {
    state: Arc<Mutex<AssetState>>,
}

impl InMemoryAssetStore {
    pub fn upload_calls(&self) -> usize {
        guard(&self.state).upload_calls
    }

    pub fn deleted(&self) -> Vec<String> {
        guard(&self.state).deleted.clone()
    }

    pub fn set_fail_uploads(&self, fail: bool) {
        guard(&self.state).fail_uploads = fail;
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        guard(&self.state).fail_deletes = fail;
    }
}

#[async_trait]
impl AssetStore for InMemoryAssetStore {
    async fn upload_images(&self, files: &[UploadFile]) -> Result<Vec<String>, RemoteError> {
        let mut state = guard(&self.state);
        state.upload_calls += 1;
        if state.fail_uploads {
            return Err(RemoteError::Request("HTTP 502 Bad Gateway".into()));
        }
        let urls: Vec<String> = files
            .iter()
            .map(|file| {
                format!(
                    "memory://assets/{}/{}",
                    Uuid::new_v4().simple(),
                    file.file_name
                )
            })
            .collect();
        state.stored.extend(urls.iter().cloned());
        Ok(urls)
    }

    async fn delete_image(&self, url: &str) -> Result<(), RemoteError> {
        let mut state = guard(&self.state);
        if state.fail_deletes {
            return Err(RemoteError::Request("HTTP 500 Internal Server Error".into()));
        }
        state.stored.retain(|stored| stored != url);
        state.deleted.push(url.to_string());
        Ok(())
    }
}

/// Geocoder backed by a fixed lookup table; distances use the haversine
/// formula.
#[derive(Clone, Default)]
pub struct OfflineGeocoder {
    forward: Arc<Mutex<HashMap<String, Coordinates>>>,
}

impl OfflineGeocoder {
    pub fn with_entry(self, query: &str, coordinates: Coordinates) -> Self {
        guard(&self.forward).insert(query.trim().to_lowercase(), coordinates);
        self
    }
}

#[async_trait]
impl Geocoder for OfflineGeocoder {
    async fn address_to_coordinates(
        &self,
        query: &str,
    ) -> Result<Option<Coordinates>, RemoteError> {
        Ok(guard(&self.forward).get(&query.trim().to_lowercase()).copied())
    }

    async fn coordinates_to_address(
        &self,
        lat: f64,
        lng: f64,
    ) -> Result<ResolvedAddress, RemoteError> {
        Ok(ResolvedAddress {
            full_address: format!("{lat:.5}, {lng:.5}"),
            ..Default::default()
        })
    }
}

#[derive(Clone)]
pub struct StaticCategorySource {
    categories: Vec<Category>,
}

impl Default for StaticCategorySource {
    fn default() -> Self {
        let categories = [
            ("cat-hotel", "Hotel / Resort", "hotel"),
            ("cat-tent", "Tent & Camp", "tent"),
            ("cat-pg", "PG / Co-Living", "pg"),
            ("cat-hostel", "Hostel", "hostel"),
            ("cat-rent", "Apartment for Rent", "rent"),
            ("cat-sale", "Property for Sale", "buy"),
            ("cat-plot", "Residential Plot", "plot"),
        ]
        .into_iter()
        .map(|(id, display_name, name)| Category {
            id: id.to_string(),
            display_name: display_name.to_string(),
            name: name.to_string(),
        })
        .collect();
        Self { categories }
    }
}

#[async_trait]
impl CategorySource for StaticCategorySource {
    async fn list_active_categories(&self) -> Result<Vec<Category>, RemoteError> {
        Ok(self.categories.clone())
    }
}
