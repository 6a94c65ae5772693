//! Property onboarding: a step-gated draft editor with snapshot recovery,
//! asset uploads and a resumable submission pass.

pub mod draft;
pub mod inventory;
pub mod kind;
pub mod persistence;
pub mod steps;
pub mod submission;
pub mod upload;
pub mod validation;
pub mod wizard;

pub use wizard::{NearbyDistance, OnboardingContext, Wizard, WizardError, WizardErrorKind, WizardView};
