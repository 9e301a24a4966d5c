//! Remote source contracts + the Hacker News API adapter.
//!
//! The core never talks to a concrete transport: it sees [`RemoteSource`],
//! implemented once over the public item/list JSON API and once in memory
//! for tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobdeck_core::{Item, ItemKind};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "jobdeck-adapters";

pub const DEFAULT_API_BASE_URL: &str = "https://hacker-news.firebaseio.com/v0";

#[derive(Debug, Error)]
pub enum RemoteError {
    /// Network trouble, timeout, or a malformed response. Never cached;
    /// the next refresh retries the ID.
    #[error("transient failure fetching item {id}: {reason}")]
    Fetch { id: u64, reason: String },
    #[error("transient failure listing jobs: {reason}")]
    Listing { reason: String },
    /// The remote confirmed the ID does not exist. Cached as a tombstone
    /// and never asked for again.
    #[error("item {id} confirmed absent on remote")]
    NotFound { id: u64 },
}

impl RemoteError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound { .. })
    }
}

/// Read-only capability over the remote forum: list current job IDs, fetch
/// one item. Idempotent, may fail transiently, carries no retry policy of
/// its own.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn list_job_ids(&self) -> Result<Vec<u64>, RemoteError>;
    async fn fetch_item(&self, id: u64) -> Result<Item, RemoteError>;
}

/// Wire shape of one item as the HN API returns it.
#[derive(Debug, Deserialize)]
struct WireItem {
    id: u64,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    by: Option<String>,
    #[serde(default)]
    time: Option<i64>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    kids: Vec<u64>,
    #[serde(default)]
    dead: bool,
    #[serde(default)]
    deleted: bool,
}

impl From<WireItem> for Item {
    fn from(wire: WireItem) -> Self {
        let kind = match wire.kind.as_deref() {
            Some("job") | Some("story") => ItemKind::Job,
            Some("comment") => ItemKind::Comment,
            _ => ItemKind::Other,
        };
        let created_at = wire
            .time
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        Item {
            id: wire.id,
            kind,
            title: wire.title,
            text: wire.text,
            url: wire.url,
            author: wire.by,
            created_at,
            child_ids: wire.kids,
            dead: wire.dead,
            deleted: wire.deleted,
        }
    }
}

/// Parse one item response body. The API answers `200` with a bare JSON
/// `null` for IDs that do not exist, so absence is a value, not a status.
pub fn parse_item_body(id: u64, body: &[u8]) -> Result<Item, RemoteError> {
    let wire: Option<WireItem> = serde_json::from_slice(body).map_err(|err| RemoteError::Fetch {
        id,
        reason: format!("malformed item body: {err}"),
    })?;
    match wire {
        Some(wire) => Ok(wire.into()),
        None => Err(RemoteError::NotFound { id }),
    }
}

#[derive(Debug, Clone)]
pub struct HnSourceConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HnSourceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE_URL.to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Production adapter over the HN item/list API. Bounds each call with the
/// configured timeout; retry policy lives with the caller.
#[derive(Debug)]
pub struct HnApiSource {
    client: reqwest::Client,
    base_url: String,
}

impl HnApiSource {
    pub fn new(config: HnSourceConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, String> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        let status = resp.status();
        if !status.is_success() {
            return Err(format!("http status {status} for {url}"));
        }
        Ok(resp.bytes().await.map_err(|err| err.to_string())?.to_vec())
    }
}

#[async_trait]
impl RemoteSource for HnApiSource {
    async fn list_job_ids(&self) -> Result<Vec<u64>, RemoteError> {
        let url = format!("{}/jobstories.json", self.base_url);
        async {
            let body = self
                .get_bytes(&url)
                .await
                .map_err(|reason| RemoteError::Listing { reason })?;
            let ids: Option<Vec<u64>> =
                serde_json::from_slice(&body).map_err(|err| RemoteError::Listing {
                    reason: format!("malformed listing body: {err}"),
                })?;
            // A null listing means "nothing posted", not an error.
            let ids = ids.unwrap_or_default();
            debug!(count = ids.len(), "listed job ids");
            Ok(ids)
        }
        .instrument(info_span!("list_job_ids", url))
        .await
    }

    async fn fetch_item(&self, id: u64) -> Result<Item, RemoteError> {
        let url = format!("{}/item/{id}.json", self.base_url);
        async {
            let body = self
                .get_bytes(&url)
                .await
                .map_err(|reason| RemoteError::Fetch { id, reason })?;
            parse_item_body(id, &body)
        }
        .instrument(info_span!("fetch_item", id))
        .await
    }
}

type FetchHook = Box<dyn Fn(u64) + Send + Sync>;

/// In-memory fake for tests: seeded items, injectable failures and
/// absences, per-ID fetch counting.
#[derive(Default)]
pub struct InMemorySource {
    items: Mutex<HashMap<u64, Item>>,
    job_ids: Mutex<Vec<u64>>,
    failing: Mutex<HashSet<u64>>,
    missing: Mutex<HashSet<u64>>,
    fetch_counts: Mutex<HashMap<u64, usize>>,
    fetch_hook: Mutex<Option<FetchHook>>,
    fail_listing: Mutex<bool>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, item: Item) {
        self.items.lock().expect("lock").insert(item.id, item);
    }

    pub fn set_job_ids(&self, ids: Vec<u64>) {
        *self.job_ids.lock().expect("lock") = ids;
    }

    /// Make fetches of `id` fail transiently until cleared.
    pub fn fail_id(&self, id: u64) {
        self.failing.lock().expect("lock").insert(id);
    }

    pub fn clear_failure(&self, id: u64) {
        self.failing.lock().expect("lock").remove(&id);
    }

    /// Make the remote report `id` as confirmed absent.
    pub fn set_missing(&self, id: u64) {
        self.missing.lock().expect("lock").insert(id);
    }

    pub fn fail_listing(&self) {
        *self.fail_listing.lock().expect("lock") = true;
    }

    pub fn fetch_count(&self, id: u64) -> usize {
        self.fetch_counts
            .lock()
            .expect("lock")
            .get(&id)
            .copied()
            .unwrap_or(0)
    }

    /// Observe every fetch as it happens. Used by cancellation tests to
    /// trip a flag after a known number of items.
    pub fn on_fetch(&self, hook: impl Fn(u64) + Send + Sync + 'static) {
        *self.fetch_hook.lock().expect("lock") = Some(Box::new(hook));
    }
}

#[async_trait]
impl RemoteSource for InMemorySource {
    async fn list_job_ids(&self) -> Result<Vec<u64>, RemoteError> {
        if *self.fail_listing.lock().expect("lock") {
            return Err(RemoteError::Listing {
                reason: "injected listing failure".into(),
            });
        }
        Ok(self.job_ids.lock().expect("lock").clone())
    }

    async fn fetch_item(&self, id: u64) -> Result<Item, RemoteError> {
        *self
            .fetch_counts
            .lock()
            .expect("lock")
            .entry(id)
            .or_insert(0) += 1;
        if let Some(hook) = self.fetch_hook.lock().expect("lock").as_ref() {
            hook(id);
        }
        if self.failing.lock().expect("lock").contains(&id) {
            return Err(RemoteError::Fetch {
                id,
                reason: "injected transient failure".into(),
            });
        }
        if self.missing.lock().expect("lock").contains(&id) {
            return Err(RemoteError::NotFound { id });
        }
        self.items
            .lock()
            .expect("lock")
            .get(&id)
            .cloned()
            .ok_or(RemoteError::NotFound { id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn job_item_parses_from_wire_json() {
        let body = br#"{
            "id": 10,
            "type": "job",
            "by": "poster",
            "time": 1767225600,
            "title": "Acme (YC W26) is hiring Rust engineers",
            "url": "https://acme.example/jobs",
            "score": 1
        }"#;
        let item = parse_item_body(10, body).expect("parse");
        assert_eq!(item.id, 10);
        assert_eq!(item.kind, ItemKind::Job);
        assert_eq!(
            item.title.as_deref(),
            Some("Acme (YC W26) is hiring Rust engineers")
        );
        assert_eq!(
            item.created_at,
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap()
        );
        assert!(!item.is_tombstone());
    }

    #[test]
    fn comment_item_keeps_children_in_order() {
        let body = br#"{"id":20,"type":"comment","text":"We are hiring","kids":[30,31,29]}"#;
        let item = parse_item_body(20, body).expect("parse");
        assert_eq!(item.kind, ItemKind::Comment);
        assert_eq!(item.child_ids, vec![30, 31, 29]);
        assert_eq!(item.created_at, DateTime::<Utc>::UNIX_EPOCH);
    }

    #[test]
    fn null_body_is_a_confirmed_absence() {
        let err = parse_item_body(7, b"null").expect_err("must be absent");
        assert!(err.is_not_found());
    }

    #[test]
    fn garbage_body_is_a_transient_failure() {
        let err = parse_item_body(7, b"<html>oops</html>").expect_err("must fail");
        assert!(matches!(err, RemoteError::Fetch { id: 7, .. }));
    }

    #[test]
    fn poll_items_map_to_other() {
        let item = parse_item_body(9, br#"{"id":9,"type":"pollopt"}"#).expect("parse");
        assert_eq!(item.kind, ItemKind::Other);
    }

    #[tokio::test]
    async fn in_memory_source_counts_fetches_and_injects_failures() {
        let source = InMemorySource::new();
        source.insert(Item::tombstone(1, ItemKind::Comment));
        source.fail_id(2);
        source.set_missing(3);

        assert!(source.fetch_item(1).await.is_ok());
        assert!(source.fetch_item(1).await.is_ok());
        assert_eq!(source.fetch_count(1), 2);

        let err = source.fetch_item(2).await.expect_err("injected");
        assert!(matches!(err, RemoteError::Fetch { id: 2, .. }));

        let err = source.fetch_item(3).await.expect_err("missing");
        assert!(err.is_not_found());
        assert_eq!(source.fetch_count(3), 1);
    }
}
