use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{sync::mpsc, time::timeout};
use tracing::{debug, warn};

use super::draft::PropertyDraft;
use super::inventory::InventoryItem;
use super::kind::PropertyKind;

/// Serialized wizard state written for resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftSnapshot {
    pub kind: PropertyKind,
    pub step: usize,
    #[serde(default)]
    pub furthest_step: usize,
    pub draft: PropertyDraft,
    pub inventory: Vec<InventoryItem>,
    #[serde(default)]
    pub parent_ref: Option<String>,
    #[serde(default)]
    pub known_backend_ids: Vec<String>,
    #[serde(default)]
    pub pending_deletes: Vec<String>,
    pub idempotency_token: String,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub category_label: String,
    pub saved_at: DateTime<Utc>,
}

/// `<namespace>_<scope>_draft_<parentId | dynamic_<categoryId> | new>`
pub fn snapshot_key(
    namespace: &str,
    scope: &str,
    parent_id: Option<&str>,
    category_id: Option<&str>,
) -> String {
    let target = match (parent_id, category_id) {
        (Some(parent), _) => parent.to_string(),
        (None, Some(category)) => format!("dynamic_{category}"),
        (None, None) => "new".to_string(),
    };
    format!("{namespace}_{scope}_draft_{target}")
}

#[derive(Debug, Error)]
pub enum SnapshotStoreError {
    #[error("snapshot backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for SnapshotStoreError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Key-value storage for serialized snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<String>, SnapshotStoreError>;
    async fn save(&self, key: &str, value: String) -> Result<(), SnapshotStoreError>;
    async fn clear(&self, key: &str) -> Result<(), SnapshotStoreError>;
}

#[derive(Clone, Default)]
pub struct MemorySnapshotStore {
    entries: Arc<Mutex<HashMap<String, String>>>,
    writes: Arc<AtomicUsize>,
}

impl MemorySnapshotStore {
    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries().get(key).cloned()
    }

    /// Number of `save` calls that reached the store.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self, key: &str) -> Result<Option<String>, SnapshotStoreError> {
        Ok(self.get(key))
    }

    async fn save(&self, key: &str, value: String) -> Result<(), SnapshotStoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.entries().insert(key.to_string(), value);
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), SnapshotStoreError> {
        self.entries().remove(key);
        Ok(())
    }
}

#[derive(Clone)]
pub struct RedisSnapshotStore {
    client: redis::Client,
    ttl_secs: u64,
}

impl RedisSnapshotStore {
    pub fn new(client: redis::Client, ttl_secs: u64) -> Self {
        Self { client, ttl_secs }
    }
}

#[async_trait]
impl SnapshotStore for RedisSnapshotStore {
    async fn load(&self, key: &str) -> Result<Option<String>, SnapshotStoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        Ok(conn.get(key).await?)
    }

    async fn save(&self, key: &str, value: String) -> Result<(), SnapshotStoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.set_ex(key, value, self.ttl_secs).await?;
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), SnapshotStoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.del(key).await?;
        Ok(())
    }
}

#[derive(Debug)]
pub enum LoadOutcome {
    Fresh,
    Restored(Box<DraftSnapshot>),
    /// An entry exists but could not be parsed. It is left in place.
    Corrupt,
}

struct Shared {
    key: String,
    store: Arc<dyn SnapshotStore>,
    /// Bumped by `clear`; queued snapshots from an older epoch are dropped.
    epoch: AtomicU64,
    write_lock: tokio::sync::Mutex<()>,
}

/// Debounced snapshot writer bound to one key. Disabled instances (edit mode)
/// never read or write.
pub struct DraftPersistence {
    shared: Arc<Shared>,
    tx: Option<mpsc::UnboundedSender<(u64, DraftSnapshot)>>,
}

impl DraftPersistence {
    /// Start the background writer. Must be called inside a tokio runtime.
    pub fn spawn(key: String, store: Arc<dyn SnapshotStore>, window: Duration) -> Self {
        let shared = Arc::new(Shared {
            key,
            store,
            epoch: AtomicU64::new(0),
            write_lock: tokio::sync::Mutex::new(()),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(shared.clone(), rx, window));
        Self {
            shared,
            tx: Some(tx),
        }
    }

    pub fn disabled(key: String, store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            shared: Arc::new(Shared {
                key,
                store,
                epoch: AtomicU64::new(0),
                write_lock: tokio::sync::Mutex::new(()),
            }),
            tx: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.shared.key
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    pub async fn load(&self) -> LoadOutcome {
        if !self.is_enabled() {
            return LoadOutcome::Fresh;
        }
        let raw = match self.shared.store.load(&self.shared.key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return LoadOutcome::Fresh,
            Err(err) => {
                warn!(target = "onboarding.draft", key = %self.shared.key, error = %err, "snapshot_load_failed");
                return LoadOutcome::Fresh;
            }
        };
        match serde_json::from_str::<DraftSnapshot>(&raw) {
            Ok(snapshot) => LoadOutcome::Restored(Box::new(snapshot)),
            Err(err) => {
                warn!(target = "onboarding.draft", key = %self.shared.key, error = %err, "snapshot_corrupt");
                LoadOutcome::Corrupt
            }
        }
    }

    /// Queue a snapshot. Fire-and-forget: the write happens once the window
    /// passes with no newer snapshot.
    pub fn schedule(&self, snapshot: DraftSnapshot) {
        let Some(tx) = &self.tx else {
            return;
        };
        let epoch = self.shared.epoch.load(Ordering::SeqCst);
        if tx.send((epoch, snapshot)).is_err() {
            warn!(target = "onboarding.draft", key = %self.shared.key, "snapshot_writer_gone");
        }
    }

    /// Delete the stored entry and drop anything still queued.
    pub async fn clear(&self) {
        let _guard = self.shared.write_lock.lock().await;
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        if let Err(err) = self.shared.store.clear(&self.shared.key).await {
            warn!(target = "onboarding.draft", key = %self.shared.key, error = %err, "snapshot_clear_failed");
        }
    }
}

async fn run_writer(
    shared: Arc<Shared>,
    mut rx: mpsc::UnboundedReceiver<(u64, DraftSnapshot)>,
    window: Duration,
) {
    while let Some(mut latest) = rx.recv().await {
        let mut coalesced = 1usize;
        loop {
            match timeout(window, rx.recv()).await {
                Ok(Some(next)) => {
                    latest = next;
                    coalesced += 1;
                }
                Ok(None) | Err(_) => break,
            }
        }

        let (epoch, snapshot) = latest;
        let _guard = shared.write_lock.lock().await;
        if epoch != shared.epoch.load(Ordering::SeqCst) {
            continue;
        }
        let body = match serde_json::to_string(&snapshot) {
            Ok(body) => body,
            Err(err) => {
                warn!(target = "onboarding.draft", key = %shared.key, error = %err, "snapshot_encode_failed");
                continue;
            }
        };
        match shared.store.save(&shared.key, body).await {
            Ok(()) => {
                debug!(target = "onboarding.draft", key = %shared.key, step = snapshot.step, coalesced, "snapshot_written")
            }
            Err(err) => {
                warn!(target = "onboarding.draft", key = %shared.key, error = %err, "snapshot_write_failed")
            }
        }
    }
}
