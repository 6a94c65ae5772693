use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::onboarding::draft::{
    Address, BuyDetails, NearbyPlace, PlotDetails, Policies, RentDetails,
};
use crate::onboarding::inventory::InventoryItem;
use crate::onboarding::kind::PropertyKind;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: String,
    pub display_name: String,
    pub name: String,
}

impl Category {
    pub fn label(&self) -> &str {
        if self.display_name.trim().is_empty() {
            &self.name
        } else {
            &self.display_name
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ResolvedAddress {
    pub country: String,
    pub state: String,
    pub city: String,
    pub area: String,
    pub full_address: String,
    pub pincode: String,
}

/// A binary asset handed to the asset store. Bytes never enter the draft.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InventoryPayload {
    pub name: String,
    pub category: String,
    pub max_adults: u32,
    pub max_children: u32,
    pub total_inventory: u32,
    pub price_per_night: Option<f64>,
    pub extra_adult_price: Option<f64>,
    pub extra_child_price: Option<f64>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub amenities: Vec<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl From<&InventoryItem> for InventoryPayload {
    fn from(item: &InventoryItem) -> Self {
        Self {
            name: item.name.trim().to_string(),
            category: item.category.clone(),
            max_adults: item.max_adults,
            max_children: item.max_children,
            total_inventory: item.total_inventory,
            price_per_night: item.price_per_night,
            extra_adult_price: item.extra_adult_price,
            extra_child_price: item.extra_child_price,
            images: item.images.iter().map(|image| image.url.clone()).collect(),
            amenities: item.amenities.iter().cloned().collect(),
            is_active: item.is_active,
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentPayload {
    #[serde(rename = "type")]
    pub doc_type: String,
    pub name: String,
    pub file_url: Option<String>,
}

/// Parent record body. Sections that do not apply to the property kind are
/// left out entirely.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PropertyPayload {
    pub kind: PropertyKind,
    pub category_id: Option<String>,
    pub category_label: String,
    pub name: String,
    pub description: String,
    pub short_description: String,
    pub contact_name: String,
    pub contact_phone: String,
    pub contact_email: String,
    pub address: Address,
    pub amenities: Option<Vec<String>>,
    pub nearby_places: Option<Vec<NearbyPlace>>,
    pub cover_image: Option<String>,
    pub gallery: Vec<String>,
    pub policies: Option<Policies>,
    pub documents: Option<Vec<DocumentPayload>>,
    pub rent_details: Option<RentDetails>,
    pub buy_details: Option<BuyDetails>,
    pub plot_details: Option<PlotDetails>,
    pub room_types: Option<Vec<InventoryPayload>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreatedProperty {
    pub id: String,
    /// Ids of embedded room types, in payload order, when the store returns them.
    #[serde(default)]
    pub room_type_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PropertyRecord {
    pub id: String,
    #[serde(default)]
    pub kind: Option<PropertyKind>,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub category_label: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub short_description: String,
    #[serde(default)]
    pub contact_name: String,
    #[serde(default)]
    pub contact_phone: String,
    #[serde(default)]
    pub contact_email: String,
    #[serde(default)]
    pub address: Address,
    #[serde(default)]
    pub amenities: Vec<String>,
    #[serde(default)]
    pub nearby_places: Vec<NearbyPlace>,
    #[serde(default)]
    pub cover_image: Option<String>,
    #[serde(default)]
    pub gallery: Vec<String>,
    #[serde(default)]
    pub policies: Option<Policies>,
    #[serde(default)]
    pub rent_details: Option<RentDetails>,
    #[serde(default)]
    pub buy_details: Option<BuyDetails>,
    #[serde(default)]
    pub plot_details: Option<PlotDetails>,
}

impl PropertyRecord {
    pub fn from_payload(id: String, payload: &PropertyPayload) -> Self {
        Self {
            id,
            kind: Some(payload.kind),
            category_id: payload.category_id.clone(),
            category_label: payload.category_label.clone(),
            name: payload.name.clone(),
            description: payload.description.clone(),
            short_description: payload.short_description.clone(),
            contact_name: payload.contact_name.clone(),
            contact_phone: payload.contact_phone.clone(),
            contact_email: payload.contact_email.clone(),
            address: payload.address.clone(),
            amenities: payload.amenities.clone().unwrap_or_default(),
            nearby_places: payload.nearby_places.clone().unwrap_or_default(),
            cover_image: payload.cover_image.clone(),
            gallery: payload.gallery.clone(),
            policies: payload.policies.clone(),
            rent_details: payload.rent_details.clone(),
            buy_details: payload.buy_details.clone(),
            plot_details: payload.plot_details.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoomTypeRecord {
    pub id: String,
    #[serde(flatten)]
    pub item: InventoryPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDetails {
    pub property: PropertyRecord,
    #[serde(default)]
    pub documents: Vec<DocumentPayload>,
    #[serde(default)]
    pub room_types: Vec<RoomTypeRecord>,
}
