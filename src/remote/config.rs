use once_cell::sync::Lazy;
use std::env;

fn base_url(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
}

pub static PROPERTY_API_URL: Lazy<Option<String>> = Lazy::new(|| base_url("PROPERTY_API_URL"));

pub static ASSET_API_URL: Lazy<Option<String>> = Lazy::new(|| base_url("ASSET_API_URL"));

pub static GEOCODER_URL: Lazy<Option<String>> = Lazy::new(|| base_url("GEOCODER_URL"));

pub static CATEGORY_API_URL: Lazy<Option<String>> = Lazy::new(|| base_url("CATEGORY_API_URL"));

/// Bearer token sent to every remote collaborator.
pub static REMOTE_API_TOKEN: Lazy<Option<String>> = Lazy::new(|| {
    env::var("REMOTE_API_TOKEN")
        .ok()
        .filter(|value| !value.trim().is_empty())
});
