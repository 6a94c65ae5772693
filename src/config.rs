use serde::Deserialize;
use std::{env, str::FromStr, time::Duration};
use tracing::{info, warn};

use crate::remote::Coordinates;

/// Tunables for the onboarding engine. Loaded from `ONBOARDING_CONFIG` (YAML)
/// when set, then overridden field by field from the environment.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub debounce_ms: u64,
    pub max_upload_bytes: usize,
    pub min_gallery_images: usize,
    pub snapshot_namespace: String,
    pub snapshot_ttl_secs: u64,
    pub fallback_lat: f64,
    pub fallback_lng: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1000,
            max_upload_bytes: 10 * 1024 * 1024,
            min_gallery_images: 4,
            snapshot_namespace: "onboarding".to_string(),
            snapshot_ttl_secs: 7 * 24 * 3600,
            fallback_lat: 20.5937,
            fallback_lng: 78.9629,
        }
    }
}

impl EngineConfig {
    pub fn load() -> Self {
        let mut config = match env::var("ONBOARDING_CONFIG") {
            Ok(path) => Self::from_file(&path),
            Err(_) => Self::default(),
        };
        config.apply_env(|name| env::var(name).ok());
        config
    }

    fn from_file(path: &str) -> Self {
        let parsed = std::fs::read_to_string(path)
            .map_err(|err| err.to_string())
            .and_then(|raw| Self::from_yaml(&raw));
        match parsed {
            Ok(config) => {
                info!(target = "onboarding.api", %path, "loaded engine config");
                config
            }
            Err(err) => {
                warn!(target = "onboarding.api", %path, error = %err, "engine config unreadable; using defaults");
                Self::default()
            }
        }
    }

    pub fn from_yaml(raw: &str) -> Result<Self, String> {
        serde_yaml::from_str(raw).map_err(|err| err.to_string())
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
            lookup(name).and_then(|value| value.trim().parse().ok())
        }
        if let Some(ms) = parsed(&lookup, "DRAFT_DEBOUNCE_MS") {
            self.debounce_ms = ms;
        }
        if let Some(bytes) = parsed::<usize>(&lookup, "MAX_UPLOAD_BYTES").filter(|b| *b > 0) {
            self.max_upload_bytes = bytes;
        }
        if let Some(count) = parsed(&lookup, "MIN_GALLERY_IMAGES") {
            self.min_gallery_images = count;
        }
        if let Some(namespace) = lookup("SNAPSHOT_NAMESPACE").filter(|ns| !ns.trim().is_empty()) {
            self.snapshot_namespace = namespace.trim().to_string();
        }
        if let Some(ttl) = parsed(&lookup, "SNAPSHOT_TTL_SECS") {
            self.snapshot_ttl_secs = ttl;
        }
        if let Some(lat) = parsed::<f64>(&lookup, "FALLBACK_LAT").filter(|v| (-90.0..=90.0).contains(v)) {
            self.fallback_lat = lat;
        }
        if let Some(lng) = parsed::<f64>(&lookup, "FALLBACK_LNG").filter(|v| (-180.0..=180.0).contains(v)) {
            self.fallback_lng = lng;
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn fallback(&self) -> Coordinates {
        Coordinates {
            lat: self.fallback_lat,
            lng: self.fallback_lng,
        }
    }
}
