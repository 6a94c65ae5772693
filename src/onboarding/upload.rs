use serde::{Serialize, Serializer};
use std::fmt;
use thiserror::Error;
use tracing::{info, warn};

use super::draft::AssetRef;
use crate::remote::{AssetStore, RemoteError, UploadFile};

/// A named upload target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploadSlot {
    Cover,
    Gallery,
    /// The inventory item currently being edited.
    InventoryItem,
    Document(usize),
}

impl UploadSlot {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "cover" => Some(UploadSlot::Cover),
            "gallery" => Some(UploadSlot::Gallery),
            "inventory" => Some(UploadSlot::InventoryItem),
            other => other
                .strip_prefix("document-")
                .and_then(|idx| idx.parse().ok())
                .map(UploadSlot::Document),
        }
    }

    pub fn accepts_documents(&self) -> bool {
        matches!(self, UploadSlot::Document(_))
    }
}

impl fmt::Display for UploadSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadSlot::Cover => f.write_str("cover"),
            UploadSlot::Gallery => f.write_str("gallery"),
            UploadSlot::InventoryItem => f.write_str("inventory"),
            UploadSlot::Document(idx) => write!(f, "document-{idx}"),
        }
    }
}

impl Serialize for UploadSlot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum UploadError {
    #[error("an upload to `{0}` is already in progress")]
    Busy(UploadSlot),
    #[error("no files were provided")]
    Empty,
    #[error("`{file}` is not an accepted file type ({mime})")]
    UnsupportedType { file: String, mime: String },
    #[error("`{file}` is {size} bytes; the limit is {limit} bytes")]
    TooLarge {
        file: String,
        size: usize,
        limit: usize,
    },
    #[error("{0}")]
    InvalidSlot(String),
    #[error("upload failed: {0}")]
    Remote(RemoteError),
}

/// Validated batch waiting for the asset store. Holding a ticket means the
/// manager has marked its slot busy.
#[derive(Debug)]
pub struct UploadTicket {
    pub slot: UploadSlot,
    pub files: Vec<UploadFile>,
    /// Local id of the inventory item the photos belong to.
    pub item: Option<String>,
}

pub struct UploadManager {
    busy: Option<UploadSlot>,
    max_bytes: usize,
}

impl UploadManager {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            busy: None,
            max_bytes,
        }
    }

    pub fn busy_slot(&self) -> Option<UploadSlot> {
        self.busy
    }

    /// Validate the whole batch and mark the slot busy. Nothing is marked if
    /// any file is rejected.
    pub fn begin(
        &mut self,
        slot: UploadSlot,
        files: Vec<UploadFile>,
    ) -> Result<UploadTicket, UploadError> {
        if let Some(busy) = self.busy {
            return Err(UploadError::Busy(busy));
        }
        if files.is_empty() {
            return Err(UploadError::Empty);
        }
        for file in &files {
            self.check(slot, file)?;
        }
        self.busy = Some(slot);
        Ok(UploadTicket {
            slot,
            files,
            item: None,
        })
    }

    /// Release the slot and surface the stored refs in input order. A remote
    /// failure or a short response surfaces no refs at all.
    pub fn finish(
        &mut self,
        ticket: &UploadTicket,
        outcome: Result<Vec<String>, RemoteError>,
    ) -> Result<Vec<AssetRef>, UploadError> {
        self.busy = None;
        let urls = outcome.map_err(|err| {
            warn!(target = "onboarding.upload", slot = %ticket.slot, error = %err, "upload_failed");
            UploadError::Remote(err)
        })?;
        if urls.len() != ticket.files.len() {
            return Err(UploadError::Remote(RemoteError::Deserialize(format!(
                "expected {} urls, got {}",
                ticket.files.len(),
                urls.len()
            ))));
        }
        info!(target = "onboarding.upload", slot = %ticket.slot, count = urls.len(), "upload_complete");
        Ok(urls.into_iter().map(AssetRef::new).collect())
    }

    pub async fn upload(
        &mut self,
        assets: &dyn AssetStore,
        slot: UploadSlot,
        files: Vec<UploadFile>,
    ) -> Result<Vec<AssetRef>, UploadError> {
        let ticket = self.begin(slot, files)?;
        let outcome = assets.upload_images(&ticket.files).await;
        self.finish(&ticket, outcome)
    }

    /// Best-effort remote delete. The caller drops the local reference
    /// whatever the outcome.
    pub async fn remove(assets: &dyn AssetStore, asset: &AssetRef, slot: UploadSlot) {
        if let Err(err) = assets.delete_image(&asset.url).await {
            warn!(target = "onboarding.upload", %slot, url = %asset.url, error = %err, "asset_delete_failed");
        }
    }

    fn check(&self, slot: UploadSlot, file: &UploadFile) -> Result<(), UploadError> {
        let mime = file.mime_type.trim().to_lowercase();
        let accepted = mime.starts_with("image/")
            || (slot.accepts_documents() && mime == "application/pdf");
        if !accepted {
            return Err(UploadError::UnsupportedType {
                file: file.file_name.clone(),
                mime: file.mime_type.clone(),
            });
        }
        if file.bytes.len() > self.max_bytes {
            return Err(UploadError::TooLarge {
                file: file.file_name.clone(),
                size: file.bytes.len(),
                limit: self.max_bytes,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::InMemoryAssetStore;

    const LIMIT: usize = 10 * 1024 * 1024;

    fn image(name: &str, size: usize) -> UploadFile {
        UploadFile {
            file_name: name.to_string(),
            mime_type: "image/jpeg".to_string(),
            bytes: vec![0u8; size],
        }
    }

    #[tokio::test]
    async fn oversized_file_rejects_whole_batch() {
        let store = InMemoryAssetStore::default();
        let mut manager = UploadManager::new(LIMIT);
        let files = vec![
            image("a.jpg", 1024),
            image("b.jpg", LIMIT + 1),
            image("c.jpg", 2048),
            image("d.jpg", 10),
        ];
        let err = manager
            .upload(&store, UploadSlot::Gallery, files)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::TooLarge { ref file, .. } if file == "b.jpg"));
        assert_eq!(store.upload_calls(), 0);
        assert_eq!(manager.busy_slot(), None);
    }

    #[tokio::test]
    async fn image_slots_reject_non_images() {
        let store = InMemoryAssetStore::default();
        let mut manager = UploadManager::new(LIMIT);
        let pdf = UploadFile {
            file_name: "brochure.pdf".into(),
            mime_type: "application/pdf".into(),
            bytes: vec![1, 2, 3],
        };
        let err = manager
            .upload(&store, UploadSlot::Cover, vec![pdf.clone()])
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::UnsupportedType { .. }));

        let refs = manager
            .upload(&store, UploadSlot::Document(0), vec![pdf])
            .await
            .unwrap();
        assert_eq!(refs.len(), 1);
    }

    #[tokio::test]
    async fn refs_come_back_in_input_order() {
        let store = InMemoryAssetStore::default();
        let mut manager = UploadManager::new(LIMIT);
        let refs = manager
            .upload(
                &store,
                UploadSlot::Gallery,
                vec![image("one.jpg", 1), image("two.jpg", 1), image("three.jpg", 1)],
            )
            .await
            .unwrap();
        let names: Vec<_> = refs
            .iter()
            .map(|r| r.url.rsplit('/').next().unwrap_or_default().to_string())
            .collect();
        assert_eq!(names, vec!["one.jpg", "two.jpg", "three.jpg"]);
    }

    #[test]
    fn second_upload_is_rejected_while_busy() {
        let mut manager = UploadManager::new(LIMIT);
        let ticket = manager
            .begin(UploadSlot::Cover, vec![image("cover.jpg", 5)])
            .unwrap();
        assert_eq!(manager.busy_slot(), Some(UploadSlot::Cover));
        assert_eq!(
            manager
                .begin(UploadSlot::Gallery, vec![image("g.jpg", 5)])
                .unwrap_err(),
            UploadError::Busy(UploadSlot::Cover)
        );
        let refs = manager
            .finish(&ticket, Ok(vec!["https://cdn/cover.jpg".into()]))
            .unwrap();
        assert_eq!(refs, vec![AssetRef::new("https://cdn/cover.jpg")]);
        assert_eq!(manager.busy_slot(), None);
    }

    #[tokio::test]
    async fn remote_failure_surfaces_no_refs_and_frees_slot() {
        let store = InMemoryAssetStore::default();
        store.set_fail_uploads(true);
        let mut manager = UploadManager::new(LIMIT);
        let err = manager
            .upload(&store, UploadSlot::Gallery, vec![image("g.jpg", 5)])
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Remote(_)));
        assert_eq!(manager.busy_slot(), None);
    }

    #[tokio::test]
    async fn failed_remote_delete_is_swallowed() {
        let store = InMemoryAssetStore::default();
        store.set_fail_deletes(true);
        UploadManager::remove(&store, &AssetRef::new("https://cdn/x.jpg"), UploadSlot::Gallery)
            .await;
        assert!(store.deleted().is_empty());
    }

    #[test]
    fn slot_names_round_trip() {
        for slot in [
            UploadSlot::Cover,
            UploadSlot::Gallery,
            UploadSlot::InventoryItem,
            UploadSlot::Document(2),
        ] {
            assert_eq!(UploadSlot::parse(&slot.to_string()), Some(slot));
        }
        assert_eq!(UploadSlot::parse("document-x"), None);
    }
}
