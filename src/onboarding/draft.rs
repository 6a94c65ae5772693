use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::{collections::BTreeSet, sync::Arc};
use thiserror::Error;

use super::kind::PropertyKind;

pub const MAX_NEARBY_PLACES: usize = 5;

/// Reference to an asset held by the external asset store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRef {
    pub url: String,
}

impl AssetRef {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub name: String,
    pub description: String,
    pub short_description: String,
    pub contact_name: String,
    pub contact_phone: String,
    pub contact_email: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RentDetails {
    pub rent_amount: Option<f64>,
    pub unit_type: String,
    pub security_deposit: Option<f64>,
    pub furnishing: String,
    pub lease_months: Option<u32>,
    pub available_from: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuyDetails {
    pub sale_price: Option<f64>,
    pub unit_type: String,
    pub carpet_area_sqft: Option<f64>,
    pub possession_status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlotDetails {
    pub plot_area: Option<f64>,
    pub area_unit: String,
    pub price_per_unit: Option<f64>,
    pub facing: String,
    pub boundary_wall: bool,
}

macro_rules! impl_is_empty {
    ($($ty:ty),*) => {
        $(impl $ty {
            pub fn is_empty(&self) -> bool {
                *self == Self::default()
            }
        })*
    };
}

impl_is_empty!(RentDetails, BuyDetails, PlotDetails);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CategoryDetails {
    #[default]
    None,
    Rent(RentDetails),
    Buy(BuyDetails),
    Plot(PlotDetails),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Address {
    pub full_address: String,
    pub area: String,
    pub city: String,
    pub state: String,
    pub country: String,
    pub pincode: String,
    pub landmark: String,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

impl Address {
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.lat, self.lng) {
            (Some(lat), Some(lng)) if lat.is_finite() && lng.is_finite() => Some((lat, lng)),
            _ => None,
        }
    }

    /// Free-text query used for forward geocoding.
    pub fn query(&self) -> String {
        if !self.full_address.trim().is_empty() {
            return self.full_address.trim().to_string();
        }
        [&self.area, &self.city, &self.state, &self.pincode, &self.country]
            .iter()
            .map(|part| part.trim())
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NearbyPlace {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub distance_km: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Media {
    pub cover: Option<AssetRef>,
    pub gallery: Arc<Vec<AssetRef>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Policies {
    pub check_in: String,
    pub check_out: String,
    pub cancellation: String,
    pub house_rules: Arc<BTreeSet<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSlot {
    #[serde(rename = "type")]
    pub doc_type: String,
    pub name: String,
    pub required: bool,
    pub file_url: Option<String>,
}

/// A draft section addressable by path. Collections nested inside a section
/// sit behind their own `Arc`; `keep_shared` re-links the ones a path write
/// left unchanged.
pub trait Section: Serialize + DeserializeOwned {
    fn keep_shared(&mut self, _before: &Self) {}
}

fn relink<T: PartialEq>(slot: &mut Arc<T>, before: &Arc<T>) {
    if *slot == *before {
        *slot = Arc::clone(before);
    }
}

impl Section for Media {
    fn keep_shared(&mut self, before: &Self) {
        relink(&mut self.gallery, &before.gallery);
    }
}

impl Section for Policies {
    fn keep_shared(&mut self, before: &Self) {
        relink(&mut self.house_rules, &before.house_rules);
    }
}

impl Section for Identity {}
impl Section for CategoryDetails {}
impl Section for Address {}
impl Section for BTreeSet<String> {}
impl Section for Vec<NearbyPlace> {}
impl Section for Vec<DocumentSlot> {}

/// Root aggregate of a draft. Every section sits behind its own `Arc` so a
/// mutation replaces one section and leaves the others shared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDraft {
    pub identity: Arc<Identity>,
    pub details: Arc<CategoryDetails>,
    pub address: Arc<Address>,
    pub amenities: Arc<BTreeSet<String>>,
    pub nearby: Arc<Vec<NearbyPlace>>,
    pub media: Arc<Media>,
    pub policies: Arc<Policies>,
    pub documents: Arc<Vec<DocumentSlot>>,
}

impl PropertyDraft {
    pub fn new(kind: PropertyKind) -> Self {
        let documents = kind
            .document_template()
            .iter()
            .map(|(doc_type, name, required)| DocumentSlot {
                doc_type: doc_type.to_string(),
                name: name.to_string(),
                required: *required,
                file_url: None,
            })
            .collect();
        Self {
            identity: Arc::default(),
            details: Arc::new(kind.empty_details()),
            address: Arc::default(),
            amenities: Arc::default(),
            nearby: Arc::default(),
            media: Arc::default(),
            policies: Arc::default(),
            documents: Arc::new(documents),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum DraftError {
    #[error("unknown draft path `{0}`")]
    UnknownPath(String),
    #[error("invalid value for `{path}`: {reason}")]
    InvalidValue { path: String, reason: String },
    #[error("`{path}` cannot be changed: {reason}")]
    Immutable { path: String, reason: String },
    #[error("at most 5 nearby places are allowed")]
    TooManyNearby,
}

pub struct DraftStore {
    draft: PropertyDraft,
}

impl DraftStore {
    pub fn new(draft: PropertyDraft) -> Self {
        Self { draft }
    }

    pub fn draft(&self) -> &PropertyDraft {
        &self.draft
    }

    /// Read a value by dotted path, e.g. `address.fullAddress` or `media.gallery.2`.
    pub fn get(&self, path: &str) -> Result<Value, DraftError> {
        let (head, rest) = split_path(path)?;
        let section = match head {
            "identity" => to_tree(&*self.draft.identity),
            "details" => to_tree(&*self.draft.details),
            "address" => to_tree(&*self.draft.address),
            "amenities" => to_tree(&*self.draft.amenities),
            "nearby" => to_tree(&*self.draft.nearby),
            "media" => to_tree(&*self.draft.media),
            "policies" => to_tree(&*self.draft.policies),
            "documents" => to_tree(&*self.draft.documents),
            _ => return Err(DraftError::UnknownPath(path.to_string())),
        }?;
        rest.iter()
            .try_fold(&section, |node, segment| child(node, segment))
            .cloned()
            .ok_or_else(|| DraftError::UnknownPath(path.to_string()))
    }

    /// Replace the value at `path`. Only the owning section is copied, and its
    /// untouched collections stay shared; the store is unchanged if the value
    /// does not fit the section's shape.
    pub fn set(&mut self, path: &str, value: Value) -> Result<(), DraftError> {
        let (head, rest) = split_path(path)?;
        let draft = &mut self.draft;
        match head {
            "identity" => replace_in(&mut draft.identity, path, &rest, value, no_check),
            "details" => replace_in(&mut draft.details, path, &rest, value, same_variant),
            "address" => replace_in(&mut draft.address, path, &rest, value, no_check),
            "amenities" => replace_in(&mut draft.amenities, path, &rest, value, no_check),
            "nearby" => replace_in(&mut draft.nearby, path, &rest, value, nearby_limit),
            "media" => replace_in(&mut draft.media, path, &rest, value, no_check),
            "policies" => replace_in(&mut draft.policies, path, &rest, value, no_check),
            "documents" => replace_in(&mut draft.documents, path, &rest, value, fixed_documents),
            _ => Err(DraftError::UnknownPath(path.to_string())),
        }
    }

    /// Apply a typed edit to one section, copying it only if it is shared.
    pub fn edit<T, R>(
        &mut self,
        select: fn(&mut PropertyDraft) -> &mut Arc<T>,
        apply: impl FnOnce(&mut T) -> R,
    ) -> R
    where
        T: Clone,
    {
        apply(Arc::make_mut(select(&mut self.draft)))
    }

    pub fn push_nearby(&mut self, place: NearbyPlace) -> Result<(), DraftError> {
        if self.draft.nearby.len() >= MAX_NEARBY_PLACES {
            return Err(DraftError::TooManyNearby);
        }
        self.edit(|d| &mut d.nearby, |nearby| nearby.push(place));
        Ok(())
    }

    pub fn remove_nearby(&mut self, index: usize) -> Option<NearbyPlace> {
        if index >= self.draft.nearby.len() {
            return None;
        }
        Some(self.edit(|d| &mut d.nearby, |nearby| nearby.remove(index)))
    }
}

fn split_path(path: &str) -> Result<(&str, Vec<&str>), DraftError> {
    let mut segments = path.split('.').map(str::trim);
    let head = segments
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| DraftError::UnknownPath(path.to_string()))?;
    let rest: Vec<&str> = segments.collect();
    if rest.iter().any(|s| s.is_empty()) {
        return Err(DraftError::UnknownPath(path.to_string()));
    }
    Ok((head, rest))
}

fn to_tree<T: Serialize>(section: &T) -> Result<Value, DraftError> {
    serde_json::to_value(section).map_err(|err| DraftError::InvalidValue {
        path: String::new(),
        reason: err.to_string(),
    })
}

fn child<'a>(node: &'a Value, segment: &str) -> Option<&'a Value> {
    match node {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

fn child_mut<'a>(node: &'a mut Value, segment: &str) -> Option<&'a mut Value> {
    match node {
        Value::Object(map) => map.get_mut(segment),
        Value::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(move |i| items.get_mut(i)),
        _ => None,
    }
}

fn replace_in<T>(
    slot: &mut Arc<T>,
    path: &str,
    rest: &[&str],
    value: Value,
    check: fn(&str, &T, &T) -> Result<(), DraftError>,
) -> Result<(), DraftError>
where
    T: Section,
{
    let mut tree = to_tree(&**slot)?;
    let target = rest
        .iter()
        .try_fold(&mut tree, |node, segment| child_mut(node, segment))
        .ok_or_else(|| DraftError::UnknownPath(path.to_string()))?;
    *target = value;
    let mut updated: T = serde_json::from_value(tree).map_err(|err| DraftError::InvalidValue {
        path: path.to_string(),
        reason: err.to_string(),
    })?;
    check(path, slot, &updated)?;
    updated.keep_shared(&**slot);
    *slot = Arc::new(updated);
    Ok(())
}

fn no_check<T>(_: &str, _: &T, _: &T) -> Result<(), DraftError> {
    Ok(())
}

fn same_variant(
    path: &str,
    before: &CategoryDetails,
    after: &CategoryDetails,
) -> Result<(), DraftError> {
    if std::mem::discriminant(before) == std::mem::discriminant(after) {
        Ok(())
    } else {
        Err(DraftError::Immutable {
            path: path.to_string(),
            reason: "the detail type is fixed by the property kind".into(),
        })
    }
}

fn nearby_limit(_: &str, _: &Vec<NearbyPlace>, after: &Vec<NearbyPlace>) -> Result<(), DraftError> {
    if after.len() > MAX_NEARBY_PLACES {
        Err(DraftError::TooManyNearby)
    } else {
        Ok(())
    }
}

fn fixed_documents(
    path: &str,
    before: &Vec<DocumentSlot>,
    after: &Vec<DocumentSlot>,
) -> Result<(), DraftError> {
    let same_shape = before.len() == after.len()
        && before
            .iter()
            .zip(after)
            .all(|(a, b)| a.doc_type == b.doc_type && a.required == b.required);
    if same_shape {
        Ok(())
    } else {
        Err(DraftError::Immutable {
            path: path.to_string(),
            reason: "document slots are fixed by the property kind".into(),
        })
    }
}
