use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::draft::{
    AssetRef, CategoryDetails, DraftError, DraftStore, Identity, MAX_NEARBY_PLACES, Media,
    NearbyPlace, PropertyDraft,
};
use super::inventory::{EditingItem, InventoryEditor, InventoryError, InventoryItem, InventoryPatch};
use super::kind::{CategoryFlags, PropertyKind};
use super::persistence::{DraftPersistence, DraftSnapshot, LoadOutcome, SnapshotStore, snapshot_key};
use super::steps::{StepDescriptor, StepKey, build_steps, contains};
use super::submission::{
    self, SubmissionError, SubmissionPlan, SubmissionReport, SubmissionState,
};
use super::upload::{UploadError, UploadManager, UploadSlot, UploadTicket};
use super::validation::{self, GateContext, ValidationError};
use crate::config::EngineConfig;
use crate::models::SubmissionReceipt;
use crate::remote::{
    AssetStore, Coordinates, Geocoder, PropertyDetails, RemoteError, Remotes, ResolvedAddress,
    UploadFile,
    geocoding::haversine_km, types::RoomTypeRecord,
};

/// Collaborators and settings shared by every wizard.
#[derive(Clone)]
pub struct OnboardingContext {
    pub remotes: Remotes,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub config: Arc<EngineConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WizardErrorKind {
    InvalidInput,
    Conflict,
    NotFound,
    Upstream,
}

#[derive(Debug, Error)]
pub enum WizardError {
    #[error(transparent)]
    Draft(#[from] DraftError),
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Submission(#[from] SubmissionError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("{0}")]
    Invalid(String),
    #[error("no asset `{0}` in that slot")]
    UnknownAsset(String),
    #[error("the item these photos were uploaded for is no longer being edited")]
    UploadTargetGone(Vec<AssetRef>),
    #[error("a submission is already running")]
    SubmissionInProgress,
    #[error("this property has already been submitted")]
    AlreadySubmitted,
}

impl WizardError {
    pub fn kind(&self) -> WizardErrorKind {
        match self {
            WizardError::Inventory(InventoryError::AlreadyEditing(_))
            | WizardError::Upload(UploadError::Busy(_))
            | WizardError::UploadTargetGone(_)
            | WizardError::SubmissionInProgress
            | WizardError::AlreadySubmitted => WizardErrorKind::Conflict,
            WizardError::Inventory(InventoryError::UnknownItem(_))
            | WizardError::Remote(RemoteError::NotFound(_))
            | WizardError::UnknownAsset(_) => WizardErrorKind::NotFound,
            WizardError::Upload(UploadError::Remote(_))
            | WizardError::Submission(_)
            | WizardError::Remote(_) => WizardErrorKind::Upstream,
            WizardError::Draft(_)
            | WizardError::Inventory(_)
            | WizardError::Upload(_)
            | WizardError::Validation(_)
            | WizardError::Invalid(_) => WizardErrorKind::InvalidInput,
        }
    }

    /// Short machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            WizardError::Draft(_) => "draft",
            WizardError::Inventory(_) => "inventory",
            WizardError::Upload(_) => "upload",
            WizardError::Validation(_) => "validation",
            WizardError::Submission(err) => err.stage,
            WizardError::Remote(_) => "remote",
            WizardError::Invalid(_) => "invalid_input",
            WizardError::UnknownAsset(_) => "unknown_asset",
            WizardError::UploadTargetGone(_) => "upload_target_gone",
            WizardError::SubmissionInProgress => "submission_in_progress",
            WizardError::AlreadySubmitted => "already_submitted",
        }
    }
}

/// How a nearby place's distance is given.
#[derive(Debug, Clone, Copy)]
pub enum NearbyDistance {
    Km(f64),
    /// Measured from the property's coordinates.
    At(Coordinates),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WizardView {
    pub kind: PropertyKind,
    pub category_id: Option<String>,
    pub category_label: String,
    pub flags: CategoryFlags,
    pub steps: Vec<StepDescriptor>,
    pub current_step: usize,
    pub current_key: StepKey,
    pub furthest_step: usize,
    pub draft: PropertyDraft,
    pub inventory: Vec<InventoryItem>,
    pub editing: Option<EditingItem>,
    pub pending_deletes: Vec<String>,
    pub busy_slot: Option<UploadSlot>,
    pub parent_id: Option<String>,
    pub edit_mode: bool,
    pub submission: SubmissionState,
    pub recovery_failed: bool,
}

/// One onboarding session: a draft, its step position and the components
/// that act on it.
pub struct Wizard {
    kind: PropertyKind,
    category_id: Option<String>,
    category_label: String,
    steps: Vec<StepDescriptor>,
    current: usize,
    furthest: usize,
    store: DraftStore,
    inventory: InventoryEditor,
    uploads: UploadManager,
    persistence: DraftPersistence,
    parent_id: Option<String>,
    known_backend_ids: Vec<String>,
    idempotency_token: String,
    submission: SubmissionState,
    edit_mode: bool,
    recovery_failed: bool,
    min_gallery: usize,
    fallback: Coordinates,
}

impl Wizard {
    fn fresh(
        ctx: &OnboardingContext,
        kind: PropertyKind,
        category_id: Option<String>,
        category_label: String,
        persistence: DraftPersistence,
    ) -> Self {
        Self {
            kind,
            category_id,
            category_label,
            steps: build_steps(&kind.flags()),
            current: 1,
            furthest: 1,
            store: DraftStore::new(PropertyDraft::new(kind)),
            inventory: InventoryEditor::new(kind, Vec::new()),
            uploads: UploadManager::new(ctx.config.max_upload_bytes),
            persistence,
            parent_id: None,
            known_backend_ids: Vec::new(),
            idempotency_token: Uuid::new_v4().to_string(),
            submission: SubmissionState::Idle,
            edit_mode: false,
            recovery_failed: false,
            min_gallery: ctx.config.min_gallery_images,
            fallback: ctx.config.fallback(),
        }
    }

    /// Start a new property. A stored snapshot for the same scope and category
    /// is restored; its kind wins over the label.
    pub async fn create(
        ctx: &OnboardingContext,
        scope: &str,
        category_id: Option<String>,
        category_label: String,
    ) -> Self {
        let key = Self::key_for(ctx, scope, None, category_id.as_deref());
        let persistence = DraftPersistence::spawn(key, ctx.snapshots.clone(), ctx.config.debounce());
        let outcome = persistence.load().await;
        let kind = PropertyKind::from_label(&category_label);
        let mut wizard = Self::fresh(ctx, kind, category_id, category_label, persistence);
        match outcome {
            LoadOutcome::Fresh => {}
            LoadOutcome::Corrupt => wizard.recovery_failed = true,
            LoadOutcome::Restored(snapshot) => wizard.restore(*snapshot),
        }
        info!(
            target = "onboarding.draft",
            key = %wizard.persistence.key(),
            kind = wizard.kind.as_str(),
            step = wizard.current,
            recovery_failed = wizard.recovery_failed,
            "wizard_created"
        );
        wizard
    }

    fn restore(&mut self, snapshot: DraftSnapshot) {
        let kind = snapshot.kind;
        self.kind = kind;
        self.steps = build_steps(&kind.flags());
        self.current = snapshot.step.clamp(1, self.steps.len());
        self.furthest = snapshot.furthest_step.clamp(self.current, self.steps.len());
        self.store = DraftStore::new(snapshot.draft);
        self.inventory = InventoryEditor::restore(kind, snapshot.inventory, snapshot.pending_deletes);
        self.parent_id = snapshot.parent_ref;
        self.known_backend_ids = snapshot.known_backend_ids;
        self.idempotency_token = snapshot.idempotency_token;
        if snapshot.category_id.is_some() {
            self.category_id = snapshot.category_id;
        }
        if !snapshot.category_label.is_empty() {
            self.category_label = snapshot.category_label;
        }
    }

    /// Edit an existing record. The draft is rebuilt from the property store
    /// and never snapshotted.
    pub async fn open_existing(
        ctx: &OnboardingContext,
        scope: &str,
        property_id: &str,
    ) -> Result<Self, WizardError> {
        let details = ctx
            .remotes
            .properties
            .get_property_details(property_id)
            .await?;
        let record = &details.property;
        let stored = stored_details(&details);
        let kind = PropertyKind::for_existing(record.kind, stored.as_ref(), &record.category_label);

        let key = Self::key_for(ctx, scope, Some(property_id), None);
        let persistence = DraftPersistence::disabled(key, ctx.snapshots.clone());
        let mut wizard = Self::fresh(
            ctx,
            kind,
            record.category_id.clone(),
            record.category_label.clone(),
            persistence,
        );
        wizard.store = DraftStore::new(draft_from_record(kind, &details));
        if contains(&wizard.steps, StepKey::Rooms) {
            let items: Vec<InventoryItem> = details.room_types.iter().map(item_from_record).collect();
            wizard.known_backend_ids = details.room_types.iter().map(|rt| rt.id.clone()).collect();
            wizard.inventory = InventoryEditor::new(kind, items);
        }
        wizard.parent_id = Some(property_id.to_string());
        wizard.edit_mode = true;
        wizard.furthest = wizard.steps.len();
        info!(
            target = "onboarding.draft",
            %property_id,
            kind = kind.as_str(),
            items = wizard.inventory.items().len(),
            "wizard_opened_for_edit"
        );
        Ok(wizard)
    }

    /// Key of the draft a session for `property_id` or `category_id` would
    /// edit.
    pub fn key_for(
        ctx: &OnboardingContext,
        scope: &str,
        property_id: Option<&str>,
        category_id: Option<&str>,
    ) -> String {
        snapshot_key(&ctx.config.snapshot_namespace, scope, property_id, category_id)
    }

    pub fn draft_key(&self) -> &str {
        self.persistence.key()
    }

    pub fn view(&self) -> WizardView {
        WizardView {
            kind: self.kind,
            category_id: self.category_id.clone(),
            category_label: self.category_label.clone(),
            flags: self.kind.flags(),
            steps: self.steps.clone(),
            current_step: self.current,
            current_key: self.current_step().key,
            furthest_step: self.furthest,
            draft: self.store.draft().clone(),
            inventory: self.inventory.items().to_vec(),
            editing: self.inventory.editing().cloned(),
            pending_deletes: self.inventory.pending_deletes().to_vec(),
            busy_slot: self.uploads.busy_slot(),
            parent_id: self.parent_id.clone(),
            edit_mode: self.edit_mode,
            submission: self.submission.clone(),
            recovery_failed: self.recovery_failed,
        }
    }

    pub fn current_step(&self) -> &StepDescriptor {
        &self.steps[self.current - 1]
    }

    pub fn get_field(&self, path: &str) -> Result<Value, WizardError> {
        Ok(self.store.get(path)?)
    }

    pub fn set_field(&mut self, path: &str, value: Value) -> Result<(), WizardError> {
        self.ensure_mutable()?;
        self.store.set(path, value)?;
        debug!(target = "onboarding.draft", %path, "draft_field_set");
        self.persist();
        Ok(())
    }

    /// Advance one step once the current step's gate passes.
    pub fn next(&mut self) -> Result<&StepDescriptor, WizardError> {
        self.ensure_mutable()?;
        if self.current >= self.steps.len() {
            return Err(WizardError::Invalid("already on the last step".into()));
        }
        validation::check(self.current_step().key, &self.gate())?;
        self.current += 1;
        self.furthest = self.furthest.max(self.current);
        self.persist();
        Ok(self.current_step())
    }

    pub fn back(&mut self) -> Result<&StepDescriptor, WizardError> {
        self.ensure_mutable()?;
        if self.current == 1 {
            return Err(WizardError::Invalid("already on the first step".into()));
        }
        self.current -= 1;
        self.persist();
        Ok(self.current_step())
    }

    /// Jump to a step that has already been reached.
    pub fn go_to(&mut self, step: usize) -> Result<&StepDescriptor, WizardError> {
        self.ensure_mutable()?;
        if step == 0 || step > self.furthest {
            return Err(WizardError::Invalid(format!(
                "step {step} has not been reached yet"
            )));
        }
        self.current = step;
        self.persist();
        Ok(self.current_step())
    }

    /// Reverse geocode `lat`/`lng`. Runs without the wizard; the result is
    /// applied with [`Wizard::locate`]. Without a geocoder nothing resolves.
    pub async fn reverse_geocode(
        geocoder: Option<&dyn Geocoder>,
        lat: f64,
        lng: f64,
    ) -> Result<ResolvedAddress, WizardError> {
        check_coordinates(lat, lng)?;
        match geocoder {
            Some(geocoder) => Ok(geocoder.coordinates_to_address(lat, lng).await?),
            None => Ok(ResolvedAddress::default()),
        }
    }

    /// Store the coordinates and fill every address field the geocoder
    /// resolved.
    pub fn locate(
        &mut self,
        lat: f64,
        lng: f64,
        resolved: ResolvedAddress,
    ) -> Result<(), WizardError> {
        self.ensure_mutable()?;
        check_coordinates(lat, lng)?;
        self.store.edit(
            |draft| &mut draft.address,
            |address| {
                address.lat = Some(lat);
                address.lng = Some(lng);
                for (field, value) in [
                    (&mut address.full_address, resolved.full_address),
                    (&mut address.area, resolved.area),
                    (&mut address.city, resolved.city),
                    (&mut address.state, resolved.state),
                    (&mut address.country, resolved.country),
                    (&mut address.pincode, resolved.pincode),
                ] {
                    if !value.trim().is_empty() {
                        *field = value;
                    }
                }
            },
        );
        self.persist();
        Ok(())
    }

    /// Check a nearby place can be added and return the property's
    /// coordinates, the origin for measured distances.
    pub fn nearby_origin(&self) -> Result<Option<Coordinates>, WizardError> {
        self.ensure_mutable()?;
        if !contains(&self.steps, StepKey::Nearby) {
            return Err(WizardError::Invalid(format!(
                "{} listings have no nearby places",
                self.kind.as_str()
            )));
        }
        if self.store.draft().nearby.len() >= MAX_NEARBY_PLACES {
            return Err(DraftError::TooManyNearby.into());
        }
        Ok(self
            .store
            .draft()
            .address
            .coordinates()
            .map(|(lat, lng)| Coordinates { lat, lng }))
    }

    /// Turn a distance into kilometres, rounded to two places when measured.
    pub async fn measure(
        geocoder: Option<&dyn Geocoder>,
        origin: Option<Coordinates>,
        distance: NearbyDistance,
    ) -> Result<f64, WizardError> {
        match distance {
            NearbyDistance::Km(km) if km.is_finite() && km >= 0.0 => Ok(km),
            NearbyDistance::Km(km) => Err(WizardError::Invalid(format!(
                "distance {km} is not a valid number of kilometres"
            ))),
            NearbyDistance::At(place) => {
                let Some(origin) = origin else {
                    return Err(WizardError::Invalid(
                        "set the property location before measuring distances".into(),
                    ));
                };
                let km = match geocoder {
                    Some(geocoder) => geocoder.distance_between(origin, place).await?,
                    None => haversine_km(origin, place),
                };
                Ok((km * 100.0).round() / 100.0)
            }
        }
    }

    pub fn add_nearby(
        &mut self,
        name: String,
        kind: String,
        distance_km: f64,
    ) -> Result<NearbyPlace, WizardError> {
        self.nearby_origin()?;
        let place = NearbyPlace {
            name,
            kind,
            distance_km,
        };
        self.store.push_nearby(place.clone())?;
        self.persist();
        Ok(place)
    }

    pub fn remove_nearby(&mut self, index: usize) -> Result<NearbyPlace, WizardError> {
        self.ensure_mutable()?;
        let removed = self
            .store
            .remove_nearby(index)
            .ok_or_else(|| WizardError::Invalid(format!("no nearby place at index {index}")))?;
        self.persist();
        Ok(removed)
    }

    pub fn begin_upload(
        &mut self,
        slot: UploadSlot,
        files: Vec<UploadFile>,
    ) -> Result<UploadTicket, WizardError> {
        self.ensure_mutable()?;
        match slot {
            UploadSlot::Cover | UploadSlot::Document(_) if files.len() > 1 => {
                return Err(UploadError::InvalidSlot(format!("`{slot}` takes a single file")).into());
            }
            UploadSlot::Document(idx) if idx >= self.store.draft().documents.len() => {
                return Err(UploadError::InvalidSlot(format!("no document slot {idx}")).into());
            }
            UploadSlot::InventoryItem if self.inventory.editing().is_none() => {
                return Err(InventoryError::NotEditing(self.kind.inventory_noun()).into());
            }
            _ => {}
        }
        let mut ticket = self.uploads.begin(slot, files)?;
        if slot == UploadSlot::InventoryItem {
            ticket.item = self.editing_local_id();
        }
        Ok(ticket)
    }

    /// Release the busy slot and attach the stored refs to the draft. Photos
    /// for an inventory item land only on the item the upload began for.
    pub fn finish_upload(
        &mut self,
        ticket: UploadTicket,
        outcome: Result<Vec<String>, RemoteError>,
    ) -> Result<Vec<AssetRef>, WizardError> {
        let refs = self.uploads.finish(&ticket, outcome)?;
        match ticket.slot {
            UploadSlot::Cover => {
                let cover = refs.first().cloned();
                self.store.edit(|draft| &mut draft.media, |media| media.cover = cover);
            }
            UploadSlot::Gallery => {
                let added = refs.clone();
                self.store
                    .edit(|draft| &mut draft.media, |media| Arc::make_mut(&mut media.gallery).extend(added));
            }
            UploadSlot::InventoryItem => {
                if ticket.item.is_none() || self.editing_local_id() != ticket.item {
                    warn!(
                        target = "onboarding.upload",
                        item = ?ticket.item,
                        count = refs.len(),
                        "upload_target_gone"
                    );
                    return Err(WizardError::UploadTargetGone(refs));
                }
                self.inventory.add_images(refs.clone())?;
            }
            UploadSlot::Document(idx) => {
                let url = refs.first().map(|asset| asset.url.clone());
                self.store.edit(
                    |draft| &mut draft.documents,
                    |documents| {
                        if let Some(document) = documents.get_mut(idx) {
                            document.file_url = url;
                        }
                    },
                );
            }
        }
        self.persist();
        Ok(refs)
    }

    pub async fn upload(
        &mut self,
        assets: &dyn AssetStore,
        slot: UploadSlot,
        files: Vec<UploadFile>,
    ) -> Result<Vec<AssetRef>, WizardError> {
        let ticket = self.begin_upload(slot, files)?;
        let outcome = assets.upload_images(&ticket.files).await;
        self.finish_upload(ticket, outcome)
    }

    /// Drop an asset reference from its slot. The remote delete is left to
    /// the caller and is best-effort.
    pub fn detach_asset(&mut self, slot: UploadSlot, url: &str) -> Result<AssetRef, WizardError> {
        self.ensure_mutable()?;
        let draft = self.store.draft();
        let present = match slot {
            UploadSlot::Cover => draft.media.cover.as_ref().is_some_and(|c| c.url == url),
            UploadSlot::Gallery => draft.media.gallery.iter().any(|g| g.url == url),
            UploadSlot::Document(idx) => draft
                .documents
                .get(idx)
                .is_some_and(|d| d.file_url.as_deref() == Some(url)),
            UploadSlot::InventoryItem => true,
        };
        if !present {
            return Err(WizardError::UnknownAsset(url.to_string()));
        }
        match slot {
            UploadSlot::Cover => self.store.edit(|draft| &mut draft.media, |media| media.cover = None),
            UploadSlot::Gallery => self.store.edit(
                |draft| &mut draft.media,
                |media| Arc::make_mut(&mut media.gallery).retain(|image| image.url != url),
            ),
            UploadSlot::Document(idx) => self.store.edit(
                |draft| &mut draft.documents,
                |documents| documents[idx].file_url = None,
            ),
            UploadSlot::InventoryItem => {
                if self.inventory.remove_image(url)?.is_none() {
                    return Err(WizardError::UnknownAsset(url.to_string()));
                }
            }
        }
        self.persist();
        Ok(AssetRef::new(url))
    }

    pub async fn remove_asset(
        &mut self,
        assets: &dyn AssetStore,
        slot: UploadSlot,
        url: &str,
    ) -> Result<(), WizardError> {
        let asset = self.detach_asset(slot, url)?;
        UploadManager::remove(assets, &asset, slot).await;
        Ok(())
    }

    pub fn start_add_item(&mut self) -> Result<InventoryItem, WizardError> {
        self.ensure_item_settled()?;
        Ok(self.inventory.start_add()?.clone())
    }

    pub fn start_edit_item(&mut self, local_id: &str) -> Result<InventoryItem, WizardError> {
        self.ensure_item_settled()?;
        Ok(self.inventory.start_edit(local_id)?.clone())
    }

    pub fn patch_item(&mut self, patch: InventoryPatch) -> Result<InventoryItem, WizardError> {
        self.ensure_inventory()?;
        Ok(self.inventory.apply(patch)?.clone())
    }

    pub fn save_item(&mut self) -> Result<InventoryItem, WizardError> {
        self.ensure_item_settled()?;
        let saved = self.inventory.save()?.clone();
        self.persist();
        Ok(saved)
    }

    pub fn cancel_item(&mut self) -> Result<Option<InventoryItem>, WizardError> {
        self.ensure_item_settled()?;
        Ok(self.inventory.cancel())
    }

    pub fn delete_item(&mut self, local_id: &str) -> Result<InventoryItem, WizardError> {
        self.ensure_item_settled()?;
        let removed = self.inventory.delete(local_id)?;
        self.persist();
        Ok(removed)
    }

    /// Check every step in the graph and move to `submitting`. The returned
    /// plan is executed without holding the wizard.
    pub fn begin_submission(&mut self) -> Result<SubmissionPlan, WizardError> {
        match self.submission {
            SubmissionState::Submitting => return Err(WizardError::SubmissionInProgress),
            SubmissionState::Done { .. } => return Err(WizardError::AlreadySubmitted),
            SubmissionState::Idle | SubmissionState::Failed { .. } => {}
        }
        if self.current_step().key != StepKey::Review {
            return Err(WizardError::Invalid(
                "submission starts from the review step".into(),
            ));
        }
        let gate = self.gate();
        for step in &self.steps {
            validation::check(step.key, &gate)?;
        }
        self.submission = SubmissionState::Submitting;
        info!(
            target = "onboarding.submit",
            kind = self.kind.as_str(),
            parent_id = ?self.parent_id,
            items = self.inventory.items().len(),
            "submission_started"
        );
        Ok(SubmissionPlan {
            kind: self.kind,
            category_id: self.category_id.clone(),
            category_label: self.category_label.clone(),
            draft: self.store.draft().clone(),
            steps: self.steps.clone(),
            items: self.inventory.items().to_vec(),
            parent_id: self.parent_id.clone(),
            known_backend_ids: self.known_backend_ids.clone(),
            pending_deletes: self.inventory.pending_deletes().to_vec(),
            idempotency_token: self.idempotency_token.clone(),
            fallback: self.fallback,
        })
    }

    /// Apply whatever the pass achieved, then settle in `done` or `failed`.
    pub async fn finish_submission(
        &mut self,
        report: SubmissionReport,
    ) -> Result<SubmissionReceipt, WizardError> {
        let SubmissionReport {
            mode,
            progress,
            stages,
            outcome,
        } = report;
        if let Some(parent_id) = progress.parent_id {
            self.parent_id = Some(parent_id);
        }
        for (local_id, backend_id) in &progress.assigned {
            self.inventory.assign_backend_id(local_id, backend_id);
            if !self.known_backend_ids.contains(backend_id) {
                self.known_backend_ids.push(backend_id.clone());
            }
        }
        self.known_backend_ids
            .retain(|id| !progress.deleted.contains(id));
        self.inventory.confirm_deleted(&progress.deleted);

        match outcome {
            Ok(property_id) => {
                self.persistence.clear().await;
                self.submission = SubmissionState::Done {
                    property_id: property_id.clone(),
                };
                Ok(SubmissionReceipt {
                    property_id,
                    mode,
                    stages,
                })
            }
            Err(err) => {
                self.submission = SubmissionState::Failed {
                    reason: err.to_string(),
                };
                self.persist();
                Err(err.into())
            }
        }
    }

    pub async fn submit(&mut self, remotes: &Remotes) -> Result<SubmissionReceipt, WizardError> {
        let plan = self.begin_submission()?;
        let report = submission::execute(&plan, remotes).await;
        self.finish_submission(report).await
    }

    /// Abandon the session and drop its snapshot.
    pub async fn exit(&mut self) {
        self.persistence.clear().await;
        info!(target = "onboarding.draft", key = %self.persistence.key(), "wizard_exited");
    }

    fn gate(&self) -> GateContext<'_> {
        GateContext {
            kind: self.kind,
            draft: self.store.draft(),
            inventory: &self.inventory,
            min_gallery: self.min_gallery,
        }
    }

    fn ensure_mutable(&self) -> Result<(), WizardError> {
        match self.submission {
            SubmissionState::Submitting => Err(WizardError::SubmissionInProgress),
            SubmissionState::Done { .. } => Err(WizardError::AlreadySubmitted),
            SubmissionState::Idle | SubmissionState::Failed { .. } => Ok(()),
        }
    }

    fn ensure_inventory(&self) -> Result<(), WizardError> {
        self.ensure_mutable()?;
        if contains(&self.steps, StepKey::Rooms) {
            Ok(())
        } else {
            Err(WizardError::Invalid(format!(
                "{} listings have no inventory",
                self.kind.as_str()
            )))
        }
    }

    /// The editor may not switch items while photos for the current one are
    /// in flight.
    fn ensure_item_settled(&self) -> Result<(), WizardError> {
        self.ensure_inventory()?;
        match self.uploads.busy_slot() {
            Some(UploadSlot::InventoryItem) => {
                Err(UploadError::Busy(UploadSlot::InventoryItem).into())
            }
            _ => Ok(()),
        }
    }

    fn editing_local_id(&self) -> Option<String> {
        self.inventory
            .editing()
            .map(|editing| editing.item.local_id.clone())
    }

    fn persist(&self) {
        if matches!(self.submission, SubmissionState::Done { .. }) {
            return;
        }
        self.persistence.schedule(DraftSnapshot {
            kind: self.kind,
            step: self.current,
            furthest_step: self.furthest,
            draft: self.store.draft().clone(),
            inventory: self.inventory.items().to_vec(),
            parent_ref: self.parent_id.clone(),
            known_backend_ids: self.known_backend_ids.clone(),
            pending_deletes: self.inventory.pending_deletes().to_vec(),
            idempotency_token: self.idempotency_token.clone(),
            category_id: self.category_id.clone(),
            category_label: self.category_label.clone(),
            saved_at: Utc::now(),
        });
    }
}

/// The first non-empty detail object on a stored record.
fn stored_details(details: &PropertyDetails) -> Option<CategoryDetails> {
    let record = &details.property;
    record
        .rent_details
        .clone()
        .filter(|d| !d.is_empty())
        .map(CategoryDetails::Rent)
        .or_else(|| {
            record
                .buy_details
                .clone()
                .filter(|d| !d.is_empty())
                .map(CategoryDetails::Buy)
        })
        .or_else(|| {
            record
                .plot_details
                .clone()
                .filter(|d| !d.is_empty())
                .map(CategoryDetails::Plot)
        })
}

fn draft_from_record(kind: PropertyKind, details: &PropertyDetails) -> PropertyDraft {
    let record = &details.property;
    let mut draft = PropertyDraft::new(kind);
    draft.identity = Arc::new(Identity {
        name: record.name.clone(),
        description: record.description.clone(),
        short_description: record.short_description.clone(),
        contact_name: record.contact_name.clone(),
        contact_phone: record.contact_phone.clone(),
        contact_email: record.contact_email.clone(),
    });
    let category_details = match kind {
        PropertyKind::Rent => record.rent_details.clone().map(CategoryDetails::Rent),
        PropertyKind::Buy => record.buy_details.clone().map(CategoryDetails::Buy),
        PropertyKind::Plot => record.plot_details.clone().map(CategoryDetails::Plot),
        PropertyKind::Standard(_) => None,
    };
    draft.details = Arc::new(category_details.unwrap_or_else(|| kind.empty_details()));
    draft.address = Arc::new(record.address.clone());
    draft.amenities = Arc::new(record.amenities.iter().cloned().collect());
    draft.nearby = Arc::new(
        record
            .nearby_places
            .iter()
            .take(MAX_NEARBY_PLACES)
            .cloned()
            .collect(),
    );
    draft.media = Arc::new(Media {
        cover: record.cover_image.as_deref().map(AssetRef::new),
        gallery: Arc::new(record.gallery.iter().map(|url| AssetRef::new(url.as_str())).collect()),
    });
    draft.policies = Arc::new(record.policies.clone().unwrap_or_default());
    for slot in Arc::make_mut(&mut draft.documents) {
        slot.file_url = details
            .documents
            .iter()
            .find(|doc| doc.doc_type == slot.doc_type)
            .and_then(|doc| doc.file_url.clone());
    }
    draft
}

fn check_coordinates(lat: f64, lng: f64) -> Result<(), WizardError> {
    if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lng) {
        Ok(())
    } else {
        Err(WizardError::Invalid("coordinates are out of range".into()))
    }
}

fn item_from_record(record: &RoomTypeRecord) -> InventoryItem {
    let payload = &record.item;
    InventoryItem {
        local_id: Uuid::new_v4().to_string(),
        backend_id: Some(record.id.clone()),
        name: payload.name.clone(),
        category: payload.category.clone(),
        max_adults: payload.max_adults,
        max_children: payload.max_children,
        total_inventory: payload.total_inventory,
        price_per_night: payload.price_per_night,
        extra_adult_price: payload.extra_adult_price,
        extra_child_price: payload.extra_child_price,
        images: payload.images.iter().map(|url| AssetRef::new(url.as_str())).collect(),
        amenities: payload.amenities.iter().cloned().collect(),
        is_active: payload.is_active,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onboarding::draft::{Address, Policies};
    use crate::onboarding::kind::StandardKind;
    use crate::onboarding::persistence::MemorySnapshotStore;
    use crate::onboarding::submission::SubmissionMode;
    use crate::remote::memory::{
        CallKind, InMemoryAssetStore, InMemoryPropertyStore, OfflineGeocoder, StaticCategorySource,
        StoreCall,
    };
    use crate::remote::types::{DocumentPayload, PropertyRecord};
    use crate::remote::InventoryPayload;
    use serde_json::json;
    use std::time::Duration;

    const SCOPE: &str = "partner-1";

    fn context(store: &InMemoryPropertyStore, snapshots: &MemorySnapshotStore) -> OnboardingContext {
        OnboardingContext {
            remotes: Remotes {
                properties: Arc::new(store.clone()),
                assets: Arc::new(InMemoryAssetStore::default()),
                geocoder: Some(Arc::new(OfflineGeocoder::default())),
                categories: Arc::new(StaticCategorySource::default()),
            },
            snapshots: Arc::new(snapshots.clone()),
            config: Arc::new(EngineConfig::default()),
        }
    }

    fn images(prefix: &str, count: usize) -> Vec<UploadFile> {
        (0..count)
            .map(|i| UploadFile {
                file_name: format!("{prefix}-{i}.jpg"),
                mime_type: "image/jpeg".into(),
                bytes: vec![7u8; 64],
            })
            .collect()
    }

    fn fill_plot(wizard: &mut Wizard) {
        let fields = [
            ("identity.name", json!("Green Acres Plot 14")),
            ("details.plotArea", json!(2400.0)),
            ("details.areaUnit", json!("sqft")),
            ("details.pricePerUnit", json!(3500.0)),
            ("address.fullAddress", json!("Survey 88, Hinjewadi, Pune")),
            ("media.cover", json!({ "url": "https://cdn/cover.jpg" })),
            (
                "media.gallery",
                json!([
                    { "url": "https://cdn/g0.jpg" },
                    { "url": "https://cdn/g1.jpg" },
                    { "url": "https://cdn/g2.jpg" },
                    { "url": "https://cdn/g3.jpg" }
                ]),
            ),
            ("documents.0.fileUrl", json!("https://cdn/deed.pdf")),
            ("documents.2.fileUrl", json!("https://cdn/owner.pdf")),
        ];
        for (path, value) in fields {
            wizard.set_field(path, value).unwrap();
        }
    }

    fn room(id: &str) -> RoomTypeRecord {
        RoomTypeRecord {
            id: id.to_string(),
            item: InventoryPayload {
                name: format!("Room {id}"),
                category: "Standard room".into(),
                max_adults: 2,
                max_children: 1,
                total_inventory: 3,
                price_per_night: Some(3200.0),
                extra_adult_price: None,
                extra_child_price: None,
                images: (0..3).map(|i| format!("https://cdn/{id}{i}.jpg")).collect(),
                amenities: Vec::new(),
                is_active: true,
            },
        }
    }

    fn seed_hotel(store: &InMemoryPropertyStore, id: &str) {
        store.seed(PropertyDetails {
            property: PropertyRecord {
                id: id.to_string(),
                kind: None,
                category_id: Some("cat-hotel".into()),
                category_label: "Hotel / Resort".into(),
                name: "Palace View".into(),
                description: "Lakefront rooms".into(),
                short_description: String::new(),
                contact_name: "Meera".into(),
                contact_phone: "+91 98200 12345".into(),
                contact_email: "stay@palaceview.in".into(),
                address: Address {
                    full_address: "1 Lake Palace Rd, Udaipur".into(),
                    lat: Some(24.5764),
                    lng: Some(73.6828),
                    ..Default::default()
                },
                amenities: vec!["wifi".into()],
                nearby_places: Vec::new(),
                cover_image: Some("https://cdn/cover.jpg".into()),
                gallery: (0..4).map(|i| format!("https://cdn/g{i}.jpg")).collect(),
                policies: Some(Policies {
                    check_in: "12:00".into(),
                    check_out: "11:00".into(),
                    ..Default::default()
                }),
                rent_details: None,
                buy_details: None,
                plot_details: None,
            },
            documents: vec![
                DocumentPayload {
                    doc_type: "trade_licence".into(),
                    name: "Trade licence".into(),
                    file_url: Some("https://cdn/licence.pdf".into()),
                },
                DocumentPayload {
                    doc_type: "owner_id".into(),
                    name: "Owner ID proof".into(),
                    file_url: Some("https://cdn/owner.pdf".into()),
                },
            ],
            room_types: vec![room("A"), room("B")],
        });
    }

    #[tokio::test]
    async fn resume_lands_on_saved_step() {
        let store = InMemoryPropertyStore::default();
        let snapshots = MemorySnapshotStore::default();
        let ctx = context(&store, &snapshots);
        let key = snapshot_key("onboarding", SCOPE, None, Some("cat-rent"));
        let mut draft = PropertyDraft::new(PropertyKind::Rent);
        Arc::make_mut(&mut draft.identity).name = "Sea Breeze 2BHK".into();
        let snapshot = DraftSnapshot {
            kind: PropertyKind::Rent,
            step: 3,
            furthest_step: 3,
            draft: draft.clone(),
            inventory: Vec::new(),
            parent_ref: None,
            known_backend_ids: Vec::new(),
            pending_deletes: Vec::new(),
            idempotency_token: "tok-9".into(),
            category_id: Some("cat-rent".into()),
            category_label: "Apartment for Rent".into(),
            saved_at: Utc::now(),
        };
        snapshots
            .save(&key, serde_json::to_string(&snapshot).unwrap())
            .await
            .unwrap();

        let wizard = Wizard::create(
            &ctx,
            SCOPE,
            Some("cat-rent".into()),
            "Apartment for Rent".into(),
        )
        .await;
        let view = wizard.view();
        assert_eq!(view.steps.len(), 6);
        assert_eq!(view.current_step, 3);
        assert_eq!(view.current_key, StepKey::Location);
        assert_eq!(view.draft, draft);
        assert!(!view.recovery_failed);
        assert_eq!(wizard.idempotency_token, "tok-9");
    }

    #[tokio::test]
    async fn corrupt_snapshot_starts_fresh_and_flags_recovery() {
        let store = InMemoryPropertyStore::default();
        let snapshots = MemorySnapshotStore::default();
        let ctx = context(&store, &snapshots);
        let key = snapshot_key("onboarding", SCOPE, None, Some("cat-hotel"));
        snapshots.save(&key, "not json".into()).await.unwrap();

        let wizard =
            Wizard::create(&ctx, SCOPE, Some("cat-hotel".into()), "Hotel / Resort".into()).await;
        let view = wizard.view();
        assert!(view.recovery_failed);
        assert_eq!(view.current_step, 1);
        assert_eq!(view.kind, PropertyKind::Standard(StandardKind::Hotel));
        assert_eq!(snapshots.get(&key).as_deref(), Some("not json"));
    }

    #[tokio::test]
    async fn navigation_is_gated_and_limited_to_visited_steps() {
        let store = InMemoryPropertyStore::default();
        let snapshots = MemorySnapshotStore::default();
        let ctx = context(&store, &snapshots);
        let mut wizard =
            Wizard::create(&ctx, SCOPE, Some("cat-hotel".into()), "Hotel / Resort".into()).await;

        let err = wizard.next().unwrap_err();
        assert!(matches!(err, WizardError::Validation(ref v) if v.step == StepKey::Basic));
        assert_eq!(err.kind(), WizardErrorKind::InvalidInput);

        wizard.set_field("identity.name", json!("Palm Grove")).unwrap();
        assert_eq!(wizard.next().unwrap().key, StepKey::Location);
        assert!(wizard.go_to(4).is_err());
        assert_eq!(wizard.back().unwrap().key, StepKey::Basic);
        assert!(wizard.back().is_err());
        assert_eq!(wizard.go_to(2).unwrap().key, StepKey::Location);
    }

    #[tokio::test]
    async fn second_upload_conflicts_while_first_is_in_flight() {
        let store = InMemoryPropertyStore::default();
        let snapshots = MemorySnapshotStore::default();
        let ctx = context(&store, &snapshots);
        let mut wizard =
            Wizard::create(&ctx, SCOPE, Some("cat-hotel".into()), "Hotel / Resort".into()).await;

        let ticket = wizard.begin_upload(UploadSlot::Gallery, images("g", 2)).unwrap();
        assert_eq!(wizard.view().busy_slot, Some(UploadSlot::Gallery));
        let err = wizard
            .begin_upload(UploadSlot::Cover, images("c", 1))
            .unwrap_err();
        assert_eq!(err.kind(), WizardErrorKind::Conflict);

        let outcome = ctx.remotes.assets.upload_images(&ticket.files).await;
        let refs = wizard.finish_upload(ticket, outcome).unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(*wizard.view().draft.media.gallery, refs);
        assert_eq!(wizard.view().busy_slot, None);

        wizard
            .remove_asset(&*ctx.remotes.assets, UploadSlot::Gallery, &refs[0].url)
            .await
            .unwrap();
        assert_eq!(*wizard.view().draft.media.gallery, refs[1..].to_vec());
    }

    #[tokio::test]
    async fn submission_is_guarded_and_clears_the_snapshot() {
        let store = InMemoryPropertyStore::default();
        let snapshots = MemorySnapshotStore::default();
        let ctx = context(&store, &snapshots);
        let mut wizard =
            Wizard::create(&ctx, SCOPE, Some("cat-plot".into()), "Residential Plot".into()).await;
        assert_eq!(wizard.kind, PropertyKind::Plot);
        fill_plot(&mut wizard);

        assert!(matches!(
            wizard.begin_submission(),
            Err(WizardError::Invalid(_))
        ));
        while wizard.current_step().key != StepKey::Review {
            wizard.next().unwrap();
        }
        assert_eq!(wizard.current, 6);

        let plan = wizard.begin_submission().unwrap();
        assert_eq!(
            wizard.begin_submission().unwrap_err().kind(),
            WizardErrorKind::Conflict
        );
        assert!(wizard.set_field("identity.name", json!("x")).is_err());

        let report = submission::execute(&plan, &ctx.remotes).await;
        let receipt = wizard.finish_submission(report).await.unwrap();
        assert_eq!(receipt.mode, SubmissionMode::Create);
        assert_eq!(
            wizard.view().submission,
            SubmissionState::Done {
                property_id: receipt.property_id.clone()
            }
        );
        assert!(matches!(
            wizard.begin_submission(),
            Err(WizardError::AlreadySubmitted)
        ));
        let key = snapshot_key("onboarding", SCOPE, None, Some("cat-plot"));
        assert!(snapshots.get(&key).is_none());
        let record = store.record(&receipt.property_id).unwrap();
        assert_eq!(record.property.name, "Green Acres Plot 14");
        assert_eq!(record.documents.len(), 2);
    }

    #[tokio::test]
    async fn failed_update_resumes_without_duplicate_creates() {
        let store = InMemoryPropertyStore::default();
        let snapshots = MemorySnapshotStore::default();
        seed_hotel(&store, "prop-7");
        let ctx = context(&store, &snapshots);

        let mut wizard = Wizard::open_existing(&ctx, SCOPE, "prop-7").await.unwrap();
        let view = wizard.view();
        assert!(view.edit_mode);
        assert!(!wizard.persistence.is_enabled());
        assert_eq!(view.kind, PropertyKind::Standard(StandardKind::Hotel));
        assert_eq!(view.inventory.len(), 2);

        let b = view
            .inventory
            .iter()
            .find(|item| item.backend_id.as_deref() == Some("B"))
            .map(|item| item.local_id.clone())
            .unwrap();
        wizard.delete_item(&b).unwrap();
        wizard.start_add_item().unwrap();
        wizard
            .patch_item(InventoryPatch {
                name: Some("Garden Suite".into()),
                price_per_night: Some(5400.0),
                ..Default::default()
            })
            .unwrap();
        wizard
            .upload(&*ctx.remotes.assets, UploadSlot::InventoryItem, images("suite", 3))
            .await
            .unwrap();
        wizard.save_item().unwrap();
        let last = wizard.steps.len();
        wizard.go_to(last).unwrap();

        store.clear_calls();
        store.fail_on(CallKind::DeleteItem, 0);
        let err = wizard.submit(&ctx.remotes).await.unwrap_err();
        assert_eq!(err.kind(), WizardErrorKind::Upstream);
        assert!(matches!(wizard.view().submission, SubmissionState::Failed { .. }));
        assert!(
            wizard
                .view()
                .inventory
                .iter()
                .all(|item| item.backend_id.is_some())
        );

        let receipt = wizard.submit(&ctx.remotes).await.unwrap();
        assert_eq!(receipt.property_id, "prop-7");
        assert_eq!(receipt.mode, SubmissionMode::Update);

        let calls = store.calls();
        let creates = calls
            .iter()
            .filter(|c| matches!(c, StoreCall::CreateItem { .. }))
            .count();
        assert_eq!(creates, 1);
        let record = store.record("prop-7").unwrap();
        let names: Vec<_> = record.room_types.iter().map(|rt| rt.item.name.as_str()).collect();
        assert_eq!(names, vec!["Room A", "Garden Suite"]);
    }

    #[tokio::test]
    async fn locate_and_nearby_use_the_geocoder() {
        let store = InMemoryPropertyStore::default();
        let snapshots = MemorySnapshotStore::default();
        let ctx = context(&store, &snapshots);
        let mut wizard =
            Wizard::create(&ctx, SCOPE, Some("cat-tent".into()), "Tent & Camp".into()).await;
        let geocoder = ctx.remotes.geocoder.as_deref();
        let station = NearbyDistance::At(Coordinates {
            lat: 18.5286,
            lng: 73.8743,
        });

        let origin = wizard.nearby_origin().unwrap();
        assert_eq!(origin, None);
        let err = Wizard::measure(geocoder, origin, station).await.unwrap_err();
        assert_eq!(err.kind(), WizardErrorKind::InvalidInput);
        assert!(Wizard::reverse_geocode(geocoder, 91.0, 0.0).await.is_err());

        let resolved = Wizard::reverse_geocode(geocoder, 19.0760, 72.8777).await.unwrap();
        wizard.locate(19.0760, 72.8777, resolved).unwrap();
        let address = wizard.view().draft.address;
        assert_eq!(address.coordinates(), Some((19.0760, 72.8777)));
        assert_eq!(address.full_address, "19.07600, 72.87770");

        let origin = wizard.nearby_origin().unwrap();
        let km = Wizard::measure(geocoder, origin, station).await.unwrap();
        assert!((115.0..125.0).contains(&km), "{km}");
        assert!(Wizard::measure(geocoder, origin, NearbyDistance::Km(-1.0)).await.is_err());
        let place = wizard
            .add_nearby("Pune Station".into(), "transit".into(), km)
            .unwrap();
        assert_eq!(wizard.view().draft.nearby.len(), 1);
        assert!(wizard.remove_nearby(3).is_err());
        assert_eq!(wizard.remove_nearby(0).unwrap(), place);
        assert!(wizard.view().draft.nearby.is_empty());
    }

    #[tokio::test]
    async fn item_photos_stay_with_the_item_they_were_uploaded_for() {
        let store = InMemoryPropertyStore::default();
        let snapshots = MemorySnapshotStore::default();
        let ctx = context(&store, &snapshots);
        let mut wizard =
            Wizard::create(&ctx, SCOPE, Some("cat-hotel".into()), "Hotel / Resort".into()).await;
        let first = wizard.start_add_item().unwrap();

        let ticket = wizard
            .begin_upload(UploadSlot::InventoryItem, images("deluxe", 3))
            .unwrap();
        assert_eq!(ticket.item.as_deref(), Some(first.local_id.as_str()));
        for err in [
            wizard.cancel_item().unwrap_err(),
            wizard.save_item().unwrap_err(),
            wizard.start_add_item().unwrap_err(),
            wizard.start_edit_item(&first.local_id).unwrap_err(),
        ] {
            assert_eq!(err.kind(), WizardErrorKind::Conflict);
        }

        let outcome = ctx.remotes.assets.upload_images(&ticket.files).await;
        let refs = wizard.finish_upload(ticket, outcome).unwrap();
        let editing = wizard.view().editing.unwrap();
        assert_eq!(editing.item.local_id, first.local_id);
        assert_eq!(editing.item.images, refs);

        let mut stale = wizard
            .begin_upload(UploadSlot::InventoryItem, images("twin", 2))
            .unwrap();
        stale.item = Some("gone".into());
        let outcome = ctx.remotes.assets.upload_images(&stale.files).await;
        let err = wizard.finish_upload(stale, outcome).unwrap_err();
        assert_eq!(err.kind(), WizardErrorKind::Conflict);
        assert!(matches!(err, WizardError::UploadTargetGone(ref orphaned) if orphaned.len() == 2));
        assert_eq!(wizard.view().busy_slot, None);
        assert_eq!(wizard.view().editing.unwrap().item.images.len(), 3);
        assert!(wizard.cancel_item().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn exit_drops_pending_snapshot() {
        let store = InMemoryPropertyStore::default();
        let snapshots = MemorySnapshotStore::default();
        let ctx = context(&store, &snapshots);
        let mut wizard =
            Wizard::create(&ctx, SCOPE, Some("cat-hotel".into()), "Hotel / Resort".into()).await;
        wizard.set_field("identity.name", json!("Palm Grove")).unwrap();
        wizard.exit().await;

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(snapshots.writes(), 0);
        let key = snapshot_key("onboarding", SCOPE, None, Some("cat-hotel"));
        assert!(snapshots.get(&key).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn edits_are_snapshotted_after_the_debounce_window() {
        let store = InMemoryPropertyStore::default();
        let snapshots = MemorySnapshotStore::default();
        let ctx = context(&store, &snapshots);
        let mut wizard =
            Wizard::create(&ctx, SCOPE, Some("cat-hotel".into()), "Hotel / Resort".into()).await;
        wizard.set_field("identity.name", json!("Palm Grove")).unwrap();
        wizard.next().unwrap();
        wizard
            .set_field("address.fullAddress", json!("MG Road, Bengaluru"))
            .unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(snapshots.writes(), 1);
        let key = snapshot_key("onboarding", SCOPE, None, Some("cat-hotel"));
        let saved: DraftSnapshot = serde_json::from_str(&snapshots.get(&key).unwrap()).unwrap();
        assert_eq!(saved.step, 2);
        assert_eq!(saved.draft.address.full_address, "MG Road, Bengaluru");
    }
}
