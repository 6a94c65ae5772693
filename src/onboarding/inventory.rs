use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use super::draft::AssetRef;
use super::kind::{PropertyKind, StandardKind};

/// A repeatable child record: room type, tent type or bed type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryItem {
    pub local_id: String,
    #[serde(default)]
    pub backend_id: Option<String>,
    pub name: String,
    pub category: String,
    pub max_adults: u32,
    pub max_children: u32,
    pub total_inventory: u32,
    pub price_per_night: Option<f64>,
    pub extra_adult_price: Option<f64>,
    pub extra_child_price: Option<f64>,
    #[serde(default)]
    pub images: Vec<AssetRef>,
    #[serde(default)]
    pub amenities: BTreeSet<String>,
    pub is_active: bool,
}

impl InventoryItem {
    pub fn with_defaults(kind: PropertyKind) -> Self {
        let (category, max_adults, max_children) = match kind {
            PropertyKind::Standard(StandardKind::Tent) => ("Swiss tent", 2, 1),
            PropertyKind::Standard(StandardKind::Pg) => ("Shared bed", 1, 0),
            PropertyKind::Standard(StandardKind::Hostel) => ("Dorm bed", 1, 0),
            _ => ("Standard room", 2, 1),
        };
        Self {
            local_id: Uuid::new_v4().to_string(),
            backend_id: None,
            name: String::new(),
            category: category.to_string(),
            max_adults,
            max_children,
            total_inventory: 1,
            price_per_night: None,
            extra_adult_price: None,
            extra_child_price: None,
            images: Vec::new(),
            amenities: BTreeSet::new(),
            is_active: true,
        }
    }

    /// First unmet per-item requirement, if any.
    pub fn incomplete_reason(&self, min_images: usize, noun: &str) -> Option<String> {
        if self.name.trim().is_empty() {
            return Some(format!("Enter a name for the {noun}"));
        }
        match self.price_per_night {
            Some(price) if price.is_finite() && price > 0.0 => {}
            _ => return Some(format!("Enter a nightly price for `{}`", self.name)),
        }
        if self.images.len() < min_images {
            return Some(format!(
                "Add at least {min_images} photo(s) of `{}` ({} uploaded)",
                self.name,
                self.images.len()
            ));
        }
        None
    }
}

/// Partial update for the item being edited.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryPatch {
    pub name: Option<String>,
    pub category: Option<String>,
    pub max_adults: Option<u32>,
    pub max_children: Option<u32>,
    pub total_inventory: Option<u32>,
    pub price_per_night: Option<f64>,
    pub extra_adult_price: Option<f64>,
    pub extra_child_price: Option<f64>,
    pub amenities: Option<BTreeSet<String>>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Error, PartialEq)]
pub enum InventoryError {
    #[error("finish or cancel the {0} being edited first")]
    AlreadyEditing(&'static str),
    #[error("no {0} is being edited")]
    NotEditing(&'static str),
    #[error("unknown inventory item `{0}`")]
    UnknownItem(String),
    #[error("{0}")]
    Incomplete(String),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EditingItem {
    pub item: InventoryItem,
    pub is_new: bool,
}

/// Add / edit / delete over the child collection. At most one item is in the
/// editing state at a time.
pub struct InventoryEditor {
    kind: PropertyKind,
    items: Vec<InventoryItem>,
    editing: Option<EditingItem>,
    pending_deletes: Vec<String>,
}

impl InventoryEditor {
    pub fn new(kind: PropertyKind, items: Vec<InventoryItem>) -> Self {
        Self {
            kind,
            items,
            editing: None,
            pending_deletes: Vec::new(),
        }
    }

    /// Rebuild an editor from a snapshot, keeping deletes that were queued
    /// but never sent.
    pub fn restore(kind: PropertyKind, items: Vec<InventoryItem>, pending: Vec<String>) -> Self {
        Self {
            pending_deletes: pending,
            ..Self::new(kind, items)
        }
    }

    pub fn items(&self) -> &[InventoryItem] {
        &self.items
    }

    pub fn editing(&self) -> Option<&EditingItem> {
        self.editing.as_ref()
    }

    /// Backend ids removed locally and not yet deleted remotely.
    pub fn pending_deletes(&self) -> &[String] {
        &self.pending_deletes
    }

    pub fn min_images(&self) -> usize {
        self.kind.min_item_images()
    }

    pub fn start_add(&mut self) -> Result<&InventoryItem, InventoryError> {
        self.ensure_idle()?;
        let editing = self.editing.insert(EditingItem {
            item: InventoryItem::with_defaults(self.kind),
            is_new: true,
        });
        Ok(&editing.item)
    }

    pub fn start_edit(&mut self, local_id: &str) -> Result<&InventoryItem, InventoryError> {
        self.ensure_idle()?;
        let item = self
            .items
            .iter()
            .find(|item| item.local_id == local_id)
            .cloned()
            .ok_or_else(|| InventoryError::UnknownItem(local_id.to_string()))?;
        let editing = self.editing.insert(EditingItem {
            item,
            is_new: false,
        });
        Ok(&editing.item)
    }

    pub fn apply(&mut self, patch: InventoryPatch) -> Result<&InventoryItem, InventoryError> {
        let item = self.editing_item_mut()?;
        if let Some(name) = patch.name {
            item.name = name;
        }
        if let Some(category) = patch.category {
            item.category = category;
        }
        if let Some(value) = patch.max_adults {
            item.max_adults = value;
        }
        if let Some(value) = patch.max_children {
            item.max_children = value;
        }
        if let Some(value) = patch.total_inventory {
            item.total_inventory = value;
        }
        if patch.price_per_night.is_some() {
            item.price_per_night = patch.price_per_night;
        }
        if patch.extra_adult_price.is_some() {
            item.extra_adult_price = patch.extra_adult_price;
        }
        if patch.extra_child_price.is_some() {
            item.extra_child_price = patch.extra_child_price;
        }
        if let Some(amenities) = patch.amenities {
            item.amenities = amenities;
        }
        if let Some(active) = patch.is_active {
            item.is_active = active;
        }
        Ok(item)
    }

    pub fn add_images(&mut self, images: Vec<AssetRef>) -> Result<usize, InventoryError> {
        let item = self.editing_item_mut()?;
        item.images.extend(images);
        Ok(item.images.len())
    }

    /// Drop an image reference from the editing item; returns the removed ref.
    pub fn remove_image(&mut self, url: &str) -> Result<Option<AssetRef>, InventoryError> {
        let item = self.editing_item_mut()?;
        let removed = item
            .images
            .iter()
            .position(|image| image.url == url)
            .map(|pos| item.images.remove(pos));
        Ok(removed)
    }

    pub fn save(&mut self) -> Result<&InventoryItem, InventoryError> {
        let noun = self.kind.inventory_noun();
        let min_images = self.min_images();
        let editing = self.editing.as_ref().ok_or(InventoryError::NotEditing(noun))?;
        if let Some(reason) = editing.item.incomplete_reason(min_images, noun) {
            return Err(InventoryError::Incomplete(reason));
        }
        let Some(EditingItem { item, is_new }) = self.editing.take() else {
            return Err(InventoryError::NotEditing(noun));
        };
        debug!(target = "onboarding.inventory", local_id = %item.local_id, is_new, "inventory_item_saved");
        let position = match self.items.iter().position(|i| i.local_id == item.local_id) {
            Some(pos) => {
                self.items[pos] = item;
                pos
            }
            None => {
                self.items.push(item);
                self.items.len() - 1
            }
        };
        Ok(&self.items[position])
    }

    pub fn cancel(&mut self) -> Option<InventoryItem> {
        self.editing.take().map(|editing| editing.item)
    }

    /// Remove an item immediately. A backend id, if any, is queued for remote
    /// deletion at submission time.
    pub fn delete(&mut self, local_id: &str) -> Result<InventoryItem, InventoryError> {
        let pos = self
            .items
            .iter()
            .position(|item| item.local_id == local_id)
            .ok_or_else(|| InventoryError::UnknownItem(local_id.to_string()))?;
        let removed = self.items.remove(pos);
        if self
            .editing
            .as_ref()
            .is_some_and(|editing| editing.item.local_id == local_id)
        {
            self.editing = None;
        }
        if let Some(backend_id) = &removed.backend_id {
            self.pending_deletes.push(backend_id.clone());
        }
        Ok(removed)
    }

    /// Record a backend id assigned by a remote create.
    pub fn assign_backend_id(&mut self, local_id: &str, backend_id: &str) {
        if let Some(item) = self.items.iter_mut().find(|i| i.local_id == local_id) {
            item.backend_id = Some(backend_id.to_string());
        }
    }

    /// Forget queued deletes that have been applied remotely.
    pub fn confirm_deleted(&mut self, backend_ids: &[String]) {
        self.pending_deletes.retain(|id| !backend_ids.contains(id));
    }

    fn ensure_idle(&self) -> Result<(), InventoryError> {
        if self.editing.is_some() {
            Err(InventoryError::AlreadyEditing(self.kind.inventory_noun()))
        } else {
            Ok(())
        }
    }

    fn editing_item_mut(&mut self) -> Result<&mut InventoryItem, InventoryError> {
        let noun = self.kind.inventory_noun();
        self.editing
            .as_mut()
            .map(|editing| &mut editing.item)
            .ok_or(InventoryError::NotEditing(noun))
    }
}
