use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::{collections::HashSet, future::Future, time::Instant};
use thiserror::Error;
use tracing::{info, warn};

use super::draft::{Address, CategoryDetails, PropertyDraft};
use super::inventory::InventoryItem;
use super::kind::PropertyKind;
use super::steps::{StepDescriptor, StepKey, contains};
use crate::models::StageReport;
use crate::remote::{
    Coordinates, Geocoder, InventoryPayload, PropertyPayload, RemoteError, Remotes,
    types::DocumentPayload,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SubmissionState {
    Idle,
    Submitting,
    Done { property_id: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionMode {
    /// Parent and children in one call.
    Create,
    /// Parent update, then per-child create/update/delete.
    Update,
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("{stage} failed: {source}")]
pub struct SubmissionError {
    pub stage: &'static str,
    pub source: RemoteError,
}

/// Everything the coordinator needs, copied out of the wizard so no lock is
/// held while remote calls run.
#[derive(Debug, Clone)]
pub struct SubmissionPlan {
    pub kind: PropertyKind,
    pub category_id: Option<String>,
    pub category_label: String,
    pub draft: PropertyDraft,
    pub steps: Vec<StepDescriptor>,
    pub items: Vec<InventoryItem>,
    pub parent_id: Option<String>,
    pub known_backend_ids: Vec<String>,
    pub pending_deletes: Vec<String>,
    pub idempotency_token: String,
    pub fallback: Coordinates,
}

impl SubmissionPlan {
    pub fn mode(&self) -> SubmissionMode {
        if self.parent_id.is_some() {
            SubmissionMode::Update
        } else {
            SubmissionMode::Create
        }
    }
}

/// Remote writes that succeeded, reported even when a later call failed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmissionProgress {
    pub parent_id: Option<String>,
    /// `(local_id, backend_id)` for every child created in this pass.
    pub assigned: Vec<(String, String)>,
    pub deleted: Vec<String>,
}

#[derive(Debug)]
pub struct SubmissionReport {
    pub mode: SubmissionMode,
    pub progress: SubmissionProgress,
    pub stages: Vec<StageReport>,
    pub outcome: Result<String, SubmissionError>,
}

pub async fn execute(plan: &SubmissionPlan, remotes: &Remotes) -> SubmissionReport {
    let mut run = Run::default();
    let outcome = run.drive(plan, remotes).await;
    match &outcome {
        Ok(property_id) => {
            info!(target = "onboarding.submit", %property_id, mode = ?plan.mode(), "submission_done")
        }
        Err(err) => {
            warn!(target = "onboarding.submit", stage = err.stage, error = %err.source, mode = ?plan.mode(), "submission_failed")
        }
    }
    SubmissionReport {
        mode: plan.mode(),
        progress: run.progress,
        stages: run.stages,
        outcome,
    }
}

#[derive(Default)]
struct Run {
    stages: Vec<StageReport>,
    progress: SubmissionProgress,
}

impl Run {
    async fn drive(
        &mut self,
        plan: &SubmissionPlan,
        remotes: &Remotes,
    ) -> Result<String, SubmissionError> {
        let started = Instant::now();
        let (coordinates, source) =
            resolve_coordinates(&plan.draft.address, remotes.geocoder.as_deref(), plan.fallback)
                .await;
        self.record(
            "resolve_coordinates",
            started,
            json!({ "lat": coordinates.lat, "lng": coordinates.lng, "source": source }),
        );

        let payload = build_payload(plan, coordinates);
        let Some(parent_id) = plan.parent_id.clone() else {
            return self.create(plan, remotes, &payload).await;
        };
        self.progress.parent_id = Some(parent_id.clone());

        self.capture("update_property", async {
            remotes
                .properties
                .update_property(&parent_id, &payload)
                .await
                .map(|id| (id.clone(), json!({ "id": id })))
        })
        .await?;

        let started = Instant::now();
        let seen = self.sync_inventory(plan, remotes, &parent_id).await?;
        self.record(
            "sync_inventory",
            started,
            json!({ "items": plan.items.len(), "created": self.progress.assigned.len() }),
        );

        let started = Instant::now();
        self.delete_inventory(plan, remotes, &parent_id, &seen).await?;
        self.record(
            "delete_inventory",
            started,
            json!({ "deleted": self.progress.deleted }),
        );
        Ok(parent_id)
    }

    async fn create(
        &mut self,
        plan: &SubmissionPlan,
        remotes: &Remotes,
        payload: &PropertyPayload,
    ) -> Result<String, SubmissionError> {
        let created = self
            .capture("create_property", async {
                remotes
                    .properties
                    .create_property(payload, &plan.idempotency_token)
                    .await
                    .map(|created| {
                        let output = json!({
                            "id": created.id,
                            "roomTypes": payload.room_types.as_ref().map_or(0, Vec::len),
                        });
                        (created, output)
                    })
            })
            .await?;
        self.progress.parent_id = Some(created.id.clone());
        if payload.room_types.is_some() {
            if created.room_type_ids.len() != plan.items.len() {
                return Err(SubmissionError {
                    stage: "create_property",
                    source: RemoteError::Deserialize(format!(
                        "expected {} room type ids, got {}",
                        plan.items.len(),
                        created.room_type_ids.len()
                    )),
                });
            }
            self.progress.assigned = plan
                .items
                .iter()
                .zip(created.room_type_ids)
                .map(|(item, id)| (item.local_id.clone(), id))
                .collect();
        }
        Ok(created.id)
    }

    /// Items go in array order; every item is attempted before any delete.
    async fn sync_inventory(
        &mut self,
        plan: &SubmissionPlan,
        remotes: &Remotes,
        parent_id: &str,
    ) -> Result<HashSet<String>, SubmissionError> {
        let mut seen = HashSet::new();
        for item in &plan.items {
            let payload = InventoryPayload::from(item);
            match &item.backend_id {
                Some(backend_id) => {
                    remotes
                        .properties
                        .update_inventory_item(parent_id, backend_id, &payload)
                        .await
                        .map_err(|source| SubmissionError {
                            stage: "sync_inventory",
                            source,
                        })?;
                    seen.insert(backend_id.clone());
                }
                None => {
                    let key = format!("{}:{}", plan.idempotency_token, item.local_id);
                    let backend_id = remotes
                        .properties
                        .create_inventory_item(parent_id, &payload, &key)
                        .await
                        .map_err(|source| SubmissionError {
                            stage: "sync_inventory",
                            source,
                        })?;
                    self.progress
                        .assigned
                        .push((item.local_id.clone(), backend_id.clone()));
                    seen.insert(backend_id);
                }
            }
        }
        Ok(seen)
    }

    async fn delete_inventory(
        &mut self,
        plan: &SubmissionPlan,
        remotes: &Remotes,
        parent_id: &str,
        seen: &HashSet<String>,
    ) -> Result<(), SubmissionError> {
        let mut queued = HashSet::new();
        let stale = plan
            .known_backend_ids
            .iter()
            .chain(&plan.pending_deletes)
            .filter(|id| !seen.contains(*id) && queued.insert(id.as_str()));
        for backend_id in stale {
            remotes
                .properties
                .delete_inventory_item(parent_id, backend_id)
                .await
                .map_err(|source| SubmissionError {
                    stage: "delete_inventory",
                    source,
                })?;
            self.progress.deleted.push(backend_id.clone());
        }
        Ok(())
    }

    async fn capture<T, Fut>(&mut self, name: &'static str, fut: Fut) -> Result<T, SubmissionError>
    where
        Fut: Future<Output = Result<(T, Value), RemoteError>>,
    {
        let started = Instant::now();
        let (value, output) = fut.await.map_err(|source| SubmissionError {
            stage: name,
            source,
        })?;
        self.record(name, started, output);
        Ok(value)
    }

    fn record(&mut self, name: &'static str, started: Instant, output: Value) {
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(name, elapsed_ms);
        self.stages.push(StageReport::new(name, elapsed_ms, output));
    }
}

/// Draft coordinates, else a geocoder lookup, else the fallback. Never fails.
pub async fn resolve_coordinates(
    address: &Address,
    geocoder: Option<&dyn Geocoder>,
    fallback: Coordinates,
) -> (Coordinates, &'static str) {
    if let Some((lat, lng)) = address.coordinates() {
        return (Coordinates { lat, lng }, "draft");
    }
    let query = address.query();
    if let Some(geocoder) = geocoder
        && !query.is_empty()
    {
        match geocoder.address_to_coordinates(&query).await {
            Ok(Some(found)) => return (found, "geocoder"),
            Ok(None) => {}
            Err(err) => {
                warn!(target = "onboarding.submit", error = %err, "geocode_failed");
            }
        }
    }
    (fallback, "fallback")
}

/// Parent payload holding only the sections whose step is in the graph.
/// Children are embedded only in create mode.
pub fn build_payload(plan: &SubmissionPlan, coordinates: Coordinates) -> PropertyPayload {
    let draft = &plan.draft;
    let has = |key| contains(&plan.steps, key);
    let identity = &draft.identity;

    let mut address = (*draft.address).clone();
    address.lat = Some(coordinates.lat);
    address.lng = Some(coordinates.lng);

    let (mut rent_details, mut buy_details, mut plot_details) = (None, None, None);
    if has(StepKey::Details) {
        match &*draft.details {
            CategoryDetails::Rent(details) => rent_details = Some(details.clone()),
            CategoryDetails::Buy(details) => buy_details = Some(details.clone()),
            CategoryDetails::Plot(details) => plot_details = Some(details.clone()),
            CategoryDetails::None => {}
        }
    }

    let documents = has(StepKey::Docs).then(|| {
        draft
            .documents
            .iter()
            .filter(|slot| slot.file_url.is_some())
            .map(|slot| DocumentPayload {
                doc_type: slot.doc_type.clone(),
                name: slot.name.clone(),
                file_url: slot.file_url.clone(),
            })
            .collect()
    });

    let room_types = (plan.parent_id.is_none() && has(StepKey::Rooms))
        .then(|| plan.items.iter().map(InventoryPayload::from).collect());

    PropertyPayload {
        kind: plan.kind,
        category_id: plan.category_id.clone(),
        category_label: plan.category_label.clone(),
        name: identity.name.trim().to_string(),
        description: identity.description.clone(),
        short_description: identity.short_description.clone(),
        contact_name: identity.contact_name.clone(),
        contact_phone: identity.contact_phone.clone(),
        contact_email: identity.contact_email.clone(),
        address,
        amenities: has(StepKey::Amenities).then(|| draft.amenities.iter().cloned().collect()),
        nearby_places: has(StepKey::Nearby).then(|| (*draft.nearby).clone()),
        cover_image: draft.media.cover.as_ref().map(|cover| cover.url.clone()),
        gallery: draft.media.gallery.iter().map(|image| image.url.clone()).collect(),
        policies: has(StepKey::Rules).then(|| (*draft.policies).clone()),
        documents,
        rent_details,
        buy_details,
        plot_details,
        room_types,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onboarding::draft::AssetRef;
    use crate::onboarding::kind::StandardKind;
    use crate::onboarding::steps::build_steps;
    use crate::remote::memory::{
        CallKind, InMemoryAssetStore, InMemoryPropertyStore, OfflineGeocoder, StaticCategorySource,
        StoreCall,
    };
    use crate::remote::types::{PropertyRecord, RoomTypeRecord};
    use crate::remote::PropertyDetails;
    use std::sync::Arc;

    const FALLBACK: Coordinates = Coordinates {
        lat: 20.5937,
        lng: 78.9629,
    };

    fn remotes(store: &InMemoryPropertyStore, geocoder: Option<OfflineGeocoder>) -> Remotes {
        Remotes {
            properties: Arc::new(store.clone()),
            assets: Arc::new(InMemoryAssetStore::default()),
            geocoder: geocoder.map(|g| Arc::new(g) as Arc<dyn Geocoder>),
            categories: Arc::new(StaticCategorySource::default()),
        }
    }

    fn item(name: &str, backend_id: Option<&str>) -> InventoryItem {
        let mut item = InventoryItem::with_defaults(PropertyKind::Standard(StandardKind::Hotel));
        item.name = name.to_string();
        item.price_per_night = Some(2500.0);
        item.images = (0..3)
            .map(|i| AssetRef::new(format!("https://cdn/{name}-{i}.jpg")))
            .collect();
        item.backend_id = backend_id.map(str::to_string);
        item
    }

    fn plan(kind: PropertyKind, items: Vec<InventoryItem>, parent_id: Option<&str>) -> SubmissionPlan {
        let known_backend_ids = items.iter().filter_map(|i| i.backend_id.clone()).collect();
        let mut draft = PropertyDraft::new(kind);
        Arc::make_mut(&mut draft.identity).name = "Lakeview Residency".into();
        Arc::make_mut(&mut draft.address).full_address = "12 Lake Road, Udaipur".into();
        SubmissionPlan {
            kind,
            category_id: Some("cat-hotel".into()),
            category_label: "Hotel / Resort".into(),
            draft,
            steps: build_steps(&kind.flags()),
            items,
            parent_id: parent_id.map(str::to_string),
            known_backend_ids,
            pending_deletes: Vec::new(),
            idempotency_token: "tok-1".into(),
            fallback: FALLBACK,
        }
    }

    fn seed(store: &InMemoryPropertyStore, id: &str, rooms: &[&str]) {
        let kind = PropertyKind::Standard(StandardKind::Hotel);
        let payload = build_payload(&plan(kind, Vec::new(), Some(id)), FALLBACK);
        store.seed(PropertyDetails {
            property: PropertyRecord::from_payload(id.to_string(), &payload),
            documents: Vec::new(),
            room_types: rooms
                .iter()
                .map(|room| RoomTypeRecord {
                    id: room.to_string(),
                    item: InventoryPayload::from(&item(room, Some(room))),
                })
                .collect(),
        });
    }

    #[tokio::test]
    async fn new_draft_creates_parent_with_embedded_items() {
        let store = InMemoryPropertyStore::default();
        let hotel = PropertyKind::Standard(StandardKind::Hotel);
        let plan = plan(hotel, vec![item("Deluxe", None), item("Suite", None)], None);

        let report = execute(&plan, &remotes(&store, None)).await;
        let property_id = report.outcome.unwrap();

        let calls = store.calls();
        assert_eq!(
            calls,
            vec![StoreCall::CreateProperty {
                room_types: 2,
                idempotency_key: "tok-1".into()
            }]
        );
        assert_eq!(report.mode, SubmissionMode::Create);
        assert_eq!(report.progress.parent_id.as_deref(), Some(property_id.as_str()));
        assert_eq!(report.progress.assigned.len(), 2);
        let names: Vec<_> = report.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["resolve_coordinates", "create_property"]);
    }

    #[tokio::test]
    async fn short_create_response_assigns_no_item_ids() {
        let store = InMemoryPropertyStore::default();
        store.withhold_created_ids(1);
        let hotel = PropertyKind::Standard(StandardKind::Hotel);
        let plan = plan(hotel, vec![item("Deluxe", None), item("Suite", None)], None);

        let report = execute(&plan, &remotes(&store, None)).await;
        let err = report.outcome.unwrap_err();
        assert_eq!(err.stage, "create_property");
        assert!(matches!(err.source, RemoteError::Deserialize(_)));
        assert!(report.progress.parent_id.is_some());
        assert!(report.progress.assigned.is_empty());
    }

    #[tokio::test]
    async fn update_mode_deletes_only_removed_items() {
        let store = InMemoryPropertyStore::default();
        seed(&store, "prop-1", &["A", "B", "C"]);
        store.clear_calls();
        let hotel = PropertyKind::Standard(StandardKind::Hotel);
        let mut plan = plan(
            hotel,
            vec![item("A", Some("A")), item("C", Some("C"))],
            Some("prop-1"),
        );
        plan.known_backend_ids = vec!["A".into(), "B".into(), "C".into()];

        let report = execute(&plan, &remotes(&store, None)).await;
        assert_eq!(report.outcome.unwrap(), "prop-1");

        let calls = store.calls();
        let deletes: Vec<_> = calls
            .iter()
            .filter(|c| matches!(c, StoreCall::DeleteItem { .. }))
            .collect();
        assert_eq!(
            deletes,
            vec![&StoreCall::DeleteItem {
                property_id: "prop-1".into(),
                item_id: "B".into()
            }]
        );
        assert!(!calls.iter().any(|c| matches!(c, StoreCall::CreateItem { .. })));
        let updates = calls
            .iter()
            .filter(|c| matches!(c, StoreCall::UpdateItem { .. }))
            .count();
        assert_eq!(updates, 2);
        assert!(matches!(calls.last(), Some(StoreCall::DeleteItem { .. })));
        assert_eq!(report.progress.deleted, vec!["B".to_string()]);
    }

    #[tokio::test]
    async fn failed_item_create_keeps_earlier_progress() {
        let store = InMemoryPropertyStore::default();
        seed(&store, "prop-2", &["A"]);
        store.fail_on(CallKind::CreateItem, 1);
        let hotel = PropertyKind::Standard(StandardKind::Hotel);
        let plan = plan(
            hotel,
            vec![item("A", Some("A")), item("New 1", None), item("New 2", None)],
            Some("prop-2"),
        );

        let report = execute(&plan, &remotes(&store, None)).await;
        let err = report.outcome.unwrap_err();
        assert_eq!(err.stage, "sync_inventory");
        assert_eq!(report.progress.assigned.len(), 1);
        assert_eq!(report.progress.assigned[0].0, plan.items[1].local_id);
        assert!(
            !store
                .calls()
                .iter()
                .any(|c| matches!(c, StoreCall::DeleteItem { .. }))
        );
    }

    #[tokio::test]
    async fn retried_create_reuses_idempotency_key() {
        let store = InMemoryPropertyStore::default();
        let plot = PropertyKind::Plot;
        let plan = plan(plot, Vec::new(), None);

        let first = execute(&plan, &remotes(&store, None)).await.outcome.unwrap();
        let second = execute(&plan, &remotes(&store, None)).await.outcome.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn coordinates_prefer_draft_then_geocoder_then_fallback() {
        let mut address = Address {
            full_address: "12 Lake Road, Udaipur".into(),
            ..Default::default()
        };
        let udaipur = Coordinates {
            lat: 24.5854,
            lng: 73.7125,
        };
        let geocoder = OfflineGeocoder::default().with_entry("12 Lake Road, Udaipur", udaipur);

        assert_eq!(
            resolve_coordinates(&address, Some(&geocoder), FALLBACK).await,
            (udaipur, "geocoder")
        );
        assert_eq!(
            resolve_coordinates(&address, None, FALLBACK).await,
            (FALLBACK, "fallback")
        );
        address.lat = Some(1.5);
        address.lng = Some(2.5);
        assert_eq!(
            resolve_coordinates(&address, Some(&geocoder), FALLBACK).await,
            (Coordinates { lat: 1.5, lng: 2.5 }, "draft")
        );
    }

    #[test]
    fn payload_omits_sections_outside_the_graph() {
        let plot = plan(PropertyKind::Plot, Vec::new(), None);
        let payload = build_payload(&plot, FALLBACK);
        assert!(payload.plot_details.is_some());
        assert!(payload.rent_details.is_none());
        assert!(payload.amenities.is_none());
        assert!(payload.nearby_places.is_none());
        assert!(payload.policies.is_none());
        assert!(payload.room_types.is_none());
        assert!(payload.documents.is_some());

        let rent = plan(PropertyKind::Rent, Vec::new(), None);
        let payload = build_payload(&rent, FALLBACK);
        assert!(payload.rent_details.is_some());
        assert!(payload.documents.is_none());
        assert!(payload.amenities.is_some());
        assert_eq!(payload.address.lat, Some(FALLBACK.lat));
    }
}
