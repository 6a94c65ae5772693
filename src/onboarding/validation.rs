use serde::Serialize;
use thiserror::Error;

use super::draft::{CategoryDetails, PropertyDraft};
use super::inventory::InventoryEditor;
use super::kind::PropertyKind;
use super::steps::StepKey;

/// A failed gate. Carries one human-readable reason; the first failing rule
/// wins.
#[derive(Debug, Clone, Error, PartialEq, Serialize)]
#[error("{reason}")]
pub struct ValidationError {
    pub step: StepKey,
    pub reason: String,
}

pub struct GateContext<'a> {
    pub kind: PropertyKind,
    pub draft: &'a PropertyDraft,
    pub inventory: &'a InventoryEditor,
    pub min_gallery: usize,
}

/// Check the section shown by `step`. Sections of other steps are never read.
pub fn check(step: StepKey, ctx: &GateContext<'_>) -> Result<(), ValidationError> {
    let outcome = match step {
        StepKey::Basic => basic(ctx),
        StepKey::Details => details(ctx),
        StepKey::Location => location(ctx),
        StepKey::Amenities => Ok(()),
        StepKey::Nearby => nearby(ctx),
        StepKey::Images => images(ctx),
        StepKey::Rooms => rooms(ctx),
        StepKey::Rules => rules(ctx),
        StepKey::Docs => documents(ctx),
        StepKey::Review => Ok(()),
    };
    outcome.map_err(|reason| ValidationError { step, reason })
}

fn require(condition: bool, reason: impl Into<String>) -> Result<(), String> {
    if condition { Ok(()) } else { Err(reason.into()) }
}

fn positive(value: Option<f64>) -> bool {
    value.is_some_and(|v| v.is_finite() && v > 0.0)
}

fn basic(ctx: &GateContext<'_>) -> Result<(), String> {
    let identity = &ctx.draft.identity;
    require(!identity.name.trim().is_empty(), "Property name is required")?;
    let phone = identity.contact_phone.trim();
    if !phone.is_empty() {
        let digits = phone.chars().filter(char::is_ascii_digit).count();
        require(
            (10..=13).contains(&digits),
            "Contact phone must have 10 to 13 digits",
        )?;
    }
    let email = identity.contact_email.trim();
    if !email.is_empty() {
        require(
            email.contains('@') && !email.starts_with('@') && !email.ends_with('@'),
            "Contact email is not valid",
        )?;
    }
    Ok(())
}

fn details(ctx: &GateContext<'_>) -> Result<(), String> {
    match &*ctx.draft.details {
        CategoryDetails::Rent(rent) => {
            require(positive(rent.rent_amount), "Monthly rent is required")?;
            require(!rent.unit_type.trim().is_empty(), "Unit type is required")
        }
        CategoryDetails::Buy(buy) => {
            require(positive(buy.sale_price), "Sale price is required")?;
            require(!buy.unit_type.trim().is_empty(), "Unit type is required")
        }
        CategoryDetails::Plot(plot) => {
            require(positive(plot.plot_area), "Plot area is required")?;
            require(!plot.area_unit.trim().is_empty(), "Plot area unit is required")?;
            require(positive(plot.price_per_unit), "Price per unit is required")
        }
        CategoryDetails::None => Ok(()),
    }
}

fn location(ctx: &GateContext<'_>) -> Result<(), String> {
    let address = &ctx.draft.address;
    require(
        !address.full_address.trim().is_empty(),
        "Full address is required",
    )?;
    if let (Some(lat), Some(lng)) = (address.lat, address.lng) {
        require(
            (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lng),
            "Coordinates are out of range",
        )?;
    }
    Ok(())
}

fn nearby(ctx: &GateContext<'_>) -> Result<(), String> {
    for place in ctx.draft.nearby.iter() {
        require(!place.name.trim().is_empty(), "Every nearby place needs a name")?;
        require(
            place.distance_km.is_finite() && place.distance_km >= 0.0,
            format!("Distance to `{}` is not valid", place.name),
        )?;
    }
    Ok(())
}

fn images(ctx: &GateContext<'_>) -> Result<(), String> {
    let media = &ctx.draft.media;
    require(media.cover.is_some(), "Upload a cover photo")?;
    require(
        media.gallery.len() >= ctx.min_gallery,
        format!(
            "Upload at least {} gallery photos ({} uploaded)",
            ctx.min_gallery,
            media.gallery.len()
        ),
    )
}

fn rooms(ctx: &GateContext<'_>) -> Result<(), String> {
    let noun = ctx.kind.inventory_noun();
    require(
        ctx.inventory.editing().is_none(),
        format!("Save or cancel the {noun} being edited"),
    )?;
    let items = ctx.inventory.items();
    require(!items.is_empty(), format!("Add at least one {noun} type"))?;
    for item in items {
        if let Some(reason) = item.incomplete_reason(ctx.inventory.min_images(), noun) {
            return Err(reason);
        }
    }
    Ok(())
}

fn rules(ctx: &GateContext<'_>) -> Result<(), String> {
    let policies = &ctx.draft.policies;
    require(!policies.check_in.trim().is_empty(), "Check-in time is required")?;
    require(!policies.check_out.trim().is_empty(), "Check-out time is required")
}

fn documents(ctx: &GateContext<'_>) -> Result<(), String> {
    for slot in ctx.draft.documents.iter().filter(|slot| slot.required) {
        require(
            slot.file_url.as_deref().is_some_and(|url| !url.trim().is_empty()),
            format!("Upload the {}", slot.name),
        )?;
    }
    Ok(())
}
