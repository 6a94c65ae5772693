use serde::{Deserialize, Serialize};

use super::draft::CategoryDetails;

/// Inventory-bearing property kinds. These share the room/bed step and differ
/// only in defaults and photo minimums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StandardKind {
    Hotel,
    Tent,
    Pg,
    Hostel,
}

/// The kind of a property, fixed once when the draft is created and carried in
/// every snapshot. Never re-derived from the label after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PropertyKind {
    Rent,
    Buy,
    Plot,
    Standard(StandardKind),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryFlags {
    pub is_rent: bool,
    pub is_buy: bool,
    pub is_plot: bool,
    pub is_tent: bool,
    pub is_pg: bool,
    pub is_hostel: bool,
}

const PLOT_TERMS: &[&str] = &["plot"];
const BUY_TERMS: &[&str] = &["buy", "sale", "sell", "resale"];
const RENT_TERMS: &[&str] = &["rent", "residential", "apartment", "flat", "lease"];
const TENT_TERMS: &[&str] = &["tent", "camp", "glamp"];
const PG_TERMS: &[&str] = &["paying guest", "co-living", "coliving"];
const HOSTEL_TERMS: &[&str] = &["hostel", "dorm"];

impl PropertyKind {
    /// Classify a category label. Unrecognised labels fall back to a hotel,
    /// which yields the most generic step graph.
    pub fn from_label(label: &str) -> Self {
        let lowered = label.to_lowercase();
        let has = |terms: &[&str]| terms.iter().any(|term| lowered.contains(term));
        if has(PLOT_TERMS) || has_word(&lowered, "land") {
            PropertyKind::Plot
        } else if has(BUY_TERMS) {
            PropertyKind::Buy
        } else if has(RENT_TERMS) {
            PropertyKind::Rent
        } else if has(TENT_TERMS) {
            PropertyKind::Standard(StandardKind::Tent)
        } else if has(PG_TERMS) || has_word(&lowered, "pg") {
            PropertyKind::Standard(StandardKind::Pg)
        } else if has(HOSTEL_TERMS) {
            PropertyKind::Standard(StandardKind::Hostel)
        } else {
            PropertyKind::Standard(StandardKind::Hotel)
        }
    }

    /// Classify an existing record. The explicit kind wins, then a non-empty
    /// category detail object, then the label.
    pub fn for_existing(
        explicit: Option<PropertyKind>,
        details: Option<&CategoryDetails>,
        label: &str,
    ) -> Self {
        if let Some(kind) = explicit {
            return kind;
        }
        match details {
            Some(CategoryDetails::Rent(d)) if !d.is_empty() => PropertyKind::Rent,
            Some(CategoryDetails::Buy(d)) if !d.is_empty() => PropertyKind::Buy,
            Some(CategoryDetails::Plot(d)) if !d.is_empty() => PropertyKind::Plot,
            _ => Self::from_label(label),
        }
    }

    pub fn flags(&self) -> CategoryFlags {
        let mut flags = CategoryFlags::default();
        match self {
            PropertyKind::Rent => flags.is_rent = true,
            PropertyKind::Buy => flags.is_buy = true,
            PropertyKind::Plot => flags.is_plot = true,
            PropertyKind::Standard(StandardKind::Tent) => flags.is_tent = true,
            PropertyKind::Standard(StandardKind::Pg) => flags.is_pg = true,
            PropertyKind::Standard(StandardKind::Hostel) => flags.is_hostel = true,
            PropertyKind::Standard(StandardKind::Hotel) => {}
        }
        flags
    }

    /// Minimum photo count for a single inventory item.
    pub fn min_item_images(&self) -> usize {
        match self {
            PropertyKind::Standard(StandardKind::Pg | StandardKind::Hostel) => 1,
            _ => 3,
        }
    }

    pub fn inventory_noun(&self) -> &'static str {
        match self {
            PropertyKind::Standard(StandardKind::Tent) => "tent",
            PropertyKind::Standard(StandardKind::Pg | StandardKind::Hostel) => "bed",
            _ => "room",
        }
    }

    /// Default category details for a fresh draft.
    pub fn empty_details(&self) -> CategoryDetails {
        match self {
            PropertyKind::Rent => CategoryDetails::Rent(Default::default()),
            PropertyKind::Buy => CategoryDetails::Buy(Default::default()),
            PropertyKind::Plot => CategoryDetails::Plot(Default::default()),
            PropertyKind::Standard(_) => CategoryDetails::None,
        }
    }

    /// Document slots for this kind as `(type, label, required)`.
    pub fn document_template(&self) -> &'static [(&'static str, &'static str, bool)] {
        match self {
            PropertyKind::Rent => &[],
            PropertyKind::Buy => &[
                ("title_deed", "Title deed", true),
                ("encumbrance_certificate", "Encumbrance certificate", false),
                ("owner_id", "Owner ID proof", true),
            ],
            PropertyKind::Plot => &[
                ("title_deed", "Title deed", true),
                ("survey_plan", "Survey plan", false),
                ("owner_id", "Owner ID proof", true),
            ],
            PropertyKind::Standard(StandardKind::Hotel) => &[
                ("trade_licence", "Trade licence", true),
                ("gst_certificate", "GST certificate", false),
                ("owner_id", "Owner ID proof", true),
            ],
            PropertyKind::Standard(StandardKind::Tent) => &[
                ("land_use_permit", "Land-use permit", true),
                ("owner_id", "Owner ID proof", true),
            ],
            PropertyKind::Standard(StandardKind::Pg | StandardKind::Hostel) => &[
                ("rental_agreement", "Rental agreement", false),
                ("owner_id", "Owner ID proof", true),
            ],
        }
    }
}

impl PropertyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyKind::Rent => "rent",
            PropertyKind::Buy => "buy",
            PropertyKind::Plot => "plot",
            PropertyKind::Standard(StandardKind::Hotel) => "hotel",
            PropertyKind::Standard(StandardKind::Tent) => "tent",
            PropertyKind::Standard(StandardKind::Pg) => "pg",
            PropertyKind::Standard(StandardKind::Hostel) => "hostel",
        }
    }
}

impl From<PropertyKind> for String {
    fn from(kind: PropertyKind) -> Self {
        kind.as_str().to_string()
    }
}

impl TryFrom<String> for PropertyKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.trim().to_lowercase().as_str() {
            "rent" => Ok(PropertyKind::Rent),
            "buy" => Ok(PropertyKind::Buy),
            "plot" => Ok(PropertyKind::Plot),
            "hotel" => Ok(PropertyKind::Standard(StandardKind::Hotel)),
            "tent" => Ok(PropertyKind::Standard(StandardKind::Tent)),
            "pg" => Ok(PropertyKind::Standard(StandardKind::Pg)),
            "hostel" => Ok(PropertyKind::Standard(StandardKind::Hostel)),
            other => Err(format!("unknown property kind `{other}`")),
        }
    }
}

fn has_word(haystack: &str, word: &str) -> bool {
    haystack
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|token| token == word)
}
