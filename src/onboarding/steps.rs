use serde::Serialize;

use super::kind::CategoryFlags;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKey {
    Basic,
    Details,
    Location,
    Amenities,
    Nearby,
    Images,
    Rooms,
    Rules,
    Docs,
    Review,
}

impl StepKey {
    pub fn label(&self) -> &'static str {
        match self {
            StepKey::Basic => "Basic info",
            StepKey::Details => "Property details",
            StepKey::Location => "Location",
            StepKey::Amenities => "Amenities",
            StepKey::Nearby => "Nearby places",
            StepKey::Images => "Photos",
            StepKey::Rooms => "Rooms & inventory",
            StepKey::Rules => "House rules",
            StepKey::Docs => "Documents",
            StepKey::Review => "Review & submit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepDescriptor {
    /// Dense, 1-based position in the graph.
    pub id: usize,
    pub key: StepKey,
    pub label: &'static str,
}

/// Derive the ordered step graph from capability flags. `basic` is always
/// first and `review` always last.
pub fn build_steps(flags: &CategoryFlags) -> Vec<StepDescriptor> {
    let CategoryFlags {
        is_rent,
        is_buy,
        is_plot,
        ..
    } = *flags;

    let candidates = [
        (StepKey::Basic, true),
        (StepKey::Details, is_rent || is_buy || is_plot),
        (StepKey::Location, true),
        (StepKey::Amenities, !is_plot),
        (StepKey::Nearby, !is_rent && !is_plot),
        (StepKey::Images, true),
        (StepKey::Rooms, !is_rent && !is_buy && !is_plot),
        (StepKey::Rules, !is_plot && !is_buy && !is_rent),
        (StepKey::Docs, !is_rent),
        (StepKey::Review, true),
    ];

    candidates
        .into_iter()
        .filter(|(_, included)| *included)
        .enumerate()
        .map(|(idx, (key, _))| StepDescriptor {
            id: idx + 1,
            key,
            label: key.label(),
        })
        .collect()
}

pub fn contains(steps: &[StepDescriptor], key: StepKey) -> bool {
    steps.iter().any(|step| step.key == key)
}
