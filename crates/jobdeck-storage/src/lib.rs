//! Persistent merged state for jobdeck: one JSON document pairing remote
//! snapshots with local annotations, written atomically.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use jobdeck_core::{Annotation, Item, Record};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobdeck-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    /// The file exists but could not be parsed. Never auto-erased; the
    /// caller decides what to do with the damaged file.
    #[error("store file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no record for item {0}; annotations attach only to fetched items")]
    UnknownItem(u64),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// On-disk document shape. Fields this version does not know about are kept
/// in `extra` and written back verbatim, so older and newer builds can share
/// one file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    last_synced_at: Option<DateTime<Utc>>,
    #[serde(default)]
    job_order: Vec<u64>,
    #[serde(default)]
    records: BTreeMap<u64, Record>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_json::Value>,
}

/// The single owner of merged local state. Loaded once at session start,
/// mutated through the methods below, persisted explicitly by callers.
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    doc: StoreDocument,
}

impl Store {
    /// Read the document at `path`, or start empty when no file exists yet.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no store file yet, starting empty");
                return Ok(Self {
                    path,
                    doc: StoreDocument::default(),
                });
            }
            Err(err) => return Err(err.into()),
        };

        let doc = serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;
        Ok(Self { path, doc })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, id: u64) -> Option<&Record> {
        self.doc.records.get(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.doc.records.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.doc.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.doc.records.values()
    }

    /// Replace the remote snapshot for `item.id`, creating the record when
    /// absent. The annotation, if any, is left untouched.
    pub fn upsert_item(&mut self, item: Item, fetched_at: DateTime<Utc>) {
        let id = item.id;
        match self.doc.records.get_mut(&id) {
            Some(record) => {
                record.item = item;
                record.fetched_at = fetched_at;
                record.stale = false;
            }
            None => {
                self.doc.records.insert(
                    id,
                    Record {
                        item,
                        annotation: None,
                        fetched_at,
                        stale: false,
                    },
                );
            }
        }
    }

    /// Replace the annotation for an already-fetched item.
    pub fn set_annotation(&mut self, id: u64, annotation: Annotation) -> Result<(), StoreError> {
        let record = self
            .doc
            .records
            .get_mut(&id)
            .ok_or(StoreError::UnknownItem(id))?;
        record.annotation = Some(annotation);
        Ok(())
    }

    /// Flag a record whose ID dropped out of the remote listing. The record
    /// stays visible; listings are a sliding window and a vanished job may
    /// still matter.
    pub fn mark_stale(&mut self, id: u64) {
        if let Some(record) = self.doc.records.get_mut(&id) {
            record.stale = true;
        }
    }

    pub fn set_job_order(&mut self, order: Vec<u64>) {
        self.doc.job_order = order;
    }

    /// Last-recorded top-level listing order, so the UI's list stays stable
    /// within a session even while individual jobs refresh.
    pub fn all_job_ids_in_known_order(&self) -> &[u64] {
        &self.doc.job_order
    }

    pub fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        self.doc.last_synced_at
    }

    pub fn touch_synced(&mut self, at: DateTime<Utc>) {
        self.doc.last_synced_at = Some(at);
    }

    /// Serialize the full document to a temp file and rename it into place.
    /// A crash mid-write leaves the previous file intact.
    pub async fn persist(&self) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(&self.doc)
            .context("serializing store document")
            .map_err(StoreError::Other)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let temp_name = format!(".{}.tmp", Uuid::new_v4());
        let temp_path = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join(&temp_name),
            _ => PathBuf::from(&temp_name),
        };

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        if let Err(err) = write_and_flush(&mut file, &bytes).await {
            drop(file);
            let _ = fs::remove_file(&temp_path).await;
            return Err(err.into());
        }
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err.into());
        }

        debug!(
            path = %self.path.display(),
            records = self.doc.records.len(),
            "store persisted"
        );
        Ok(())
    }
}

async fn write_and_flush(file: &mut fs::File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use jobdeck_core::ItemKind;
    use tempfile::tempdir;

    fn job(id: u64, title: &str) -> Item {
        Item {
            id,
            kind: ItemKind::Job,
            title: Some(title.to_string()),
            text: None,
            url: Some(format!("https://jobs.example/{id}")),
            author: Some("poster".into()),
            created_at: Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap(),
            child_ids: vec![],
            dead: false,
            deleted: false,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).single().unwrap()
    }

    #[tokio::test]
    async fn missing_file_loads_as_empty_store() {
        let dir = tempdir().expect("tempdir");
        let store = Store::load(dir.path().join("deck.json")).await.expect("load");
        assert!(store.is_empty());
        assert!(store.all_job_ids_in_known_order().is_empty());
        assert_eq!(store.last_synced_at(), None);
    }

    #[tokio::test]
    async fn corrupt_file_is_surfaced_not_erased() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("deck.json");
        std::fs::write(&path, b"{ not json").expect("write garbage");

        let err = Store::load(&path).await.expect_err("must fail");
        assert!(matches!(err, StoreError::Corrupt { .. }));
        // The damaged file is still there for the user to inspect.
        assert!(path.exists());
    }

    #[tokio::test]
    async fn persist_then_load_round_trips() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("deck.json");

        let mut store = Store::load(&path).await.expect("load");
        store.upsert_item(job(10, "Rust engineer"), now());
        store.upsert_item(job(11, "Compiler hacker"), now());
        store.set_job_order(vec![10, 11]);
        store.touch_synced(now());
        store
            .set_annotation(
                10,
                Annotation {
                    tags: ["remote".to_string()].into_iter().collect(),
                    rating: Some(4),
                    reviewed_at: now(),
                },
            )
            .expect("annotate");
        store.persist().await.expect("persist");

        let reloaded = Store::load(&path).await.expect("reload");
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.all_job_ids_in_known_order(), &[10, 11]);
        assert_eq!(reloaded.last_synced_at(), Some(now()));
        assert_eq!(reloaded.get(10), store.get(10));
        assert_eq!(reloaded.get(11), store.get(11));
    }

    #[tokio::test]
    async fn upsert_replaces_item_but_never_the_annotation() {
        let dir = tempdir().expect("tempdir");
        let mut store = Store::load(dir.path().join("deck.json")).await.expect("load");

        store.upsert_item(job(10, "Rust engineer"), now());
        let annotation = Annotation {
            tags: ["applied".to_string(), "remote".to_string()].into_iter().collect(),
            rating: Some(5),
            reviewed_at: now(),
        };
        store.set_annotation(10, annotation.clone()).expect("annotate");

        for round in 0..3 {
            store.upsert_item(job(10, &format!("Rust engineer v{round}")), now());
        }

        let record = store.get(10).expect("record");
        assert_eq!(record.item.title.as_deref(), Some("Rust engineer v2"));
        assert_eq!(record.annotation.as_ref(), Some(&annotation));
    }

    #[tokio::test]
    async fn annotating_an_unknown_item_fails() {
        let dir = tempdir().expect("tempdir");
        let mut store = Store::load(dir.path().join("deck.json")).await.expect("load");
        let err = store
            .set_annotation(999, Annotation::empty(now()))
            .expect_err("must fail");
        assert!(matches!(err, StoreError::UnknownItem(999)));
    }

    #[tokio::test]
    async fn unknown_document_fields_survive_a_rewrite() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("deck.json");
        std::fs::write(
            &path,
            br#"{"last_synced_at":null,"job_order":[],"records":{},"schema_hint":"v9"}"#,
        )
        .expect("seed file");

        let mut store = Store::load(&path).await.expect("load");
        store.upsert_item(job(10, "Rust engineer"), now());
        store.persist().await.expect("persist");

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(raw["schema_hint"], "v9");
        assert!(raw["records"]["10"]["item"].is_object());
        assert!(raw["records"]["10"]["annotation"].is_null());
    }

    #[tokio::test]
    async fn mark_stale_keeps_the_record_visible() {
        let dir = tempdir().expect("tempdir");
        let mut store = Store::load(dir.path().join("deck.json")).await.expect("load");
        store.upsert_item(job(10, "Rust engineer"), now());
        store.mark_stale(10);
        let record = store.get(10).expect("record");
        assert!(record.stale);

        // A fresh fetch clears the flag again.
        store.upsert_item(job(10, "Rust engineer"), now());
        assert!(!store.get(10).expect("record").stale);
    }
}
