//! Session orchestration for jobdeck: refresh scopes over a remote source,
//! the filtered/sorted read model, and validated annotation edits.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use jobdeck_adapters::{RemoteError, RemoteSource};
use jobdeck_core::{
    Annotation, AnnotationEdit, Item, ItemKind, RatingEdit, Record, RATING_MAX, RATING_MIN,
};
use jobdeck_storage::{Store, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobdeck-sync";

/// Environment-driven configuration for a session.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub store_path: PathBuf,
    pub api_base_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub options: SyncOptions,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            store_path: std::env::var("JOBDECK_STORE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("jobdeck.json")),
            api_base_url: std::env::var("JOBDECK_API_BASE_URL")
                .unwrap_or_else(|_| jobdeck_adapters::DEFAULT_API_BASE_URL.to_string()),
            user_agent: std::env::var("JOBDECK_USER_AGENT")
                .unwrap_or_else(|_| "jobdeck/0.1".to_string()),
            http_timeout_secs: env_parse("JOBDECK_HTTP_TIMEOUT_SECS", 20),
            options: SyncOptions {
                freshness: Duration::from_secs(env_parse("JOBDECK_FRESHNESS_SECS", 3600)),
                fetch_concurrency: env_parse("JOBDECK_FETCH_CONCURRENCY", 8),
                max_thread_items: env_parse("JOBDECK_MAX_THREAD_ITEMS", 500),
                max_thread_depth: env_parse("JOBDECK_MAX_THREAD_DEPTH", 10),
            },
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Tuning knobs for refresh behavior.
#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    /// Job snapshots older than this are refetched on the next listing pass.
    pub freshness: Duration,
    /// Parallel in-flight fetches per batch.
    pub fetch_concurrency: usize,
    /// Cap on fetched items per thread refresh.
    pub max_thread_items: usize,
    /// Cap on comment-tree depth per thread refresh.
    pub max_thread_depth: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            freshness: Duration::from_secs(3600),
            fetch_concurrency: 8,
            max_thread_items: 500,
            max_thread_depth: 10,
        }
    }
}

/// Cooperative cancellation, checked at item-fetch granularity. Clones share
/// one flag; wiring it to Ctrl-C is the caller's business.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshScope {
    /// Sync the top-level job listing.
    JobsOnly,
    /// Sync one job plus its comment tree, breadth-first.
    JobPlusThread(u64),
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshOutcome {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// IDs whose records were created or replaced this run, including
    /// freshly cached tombstones.
    pub merged: Vec<u64>,
    /// IDs that failed transiently; retried on the next refresh.
    pub failed: Vec<u64>,
    pub cancelled: bool,
}

impl RefreshOutcome {
    pub fn merged_count(&self) -> usize {
        self.merged.len()
    }
}

/// Reconciles remote state into the local store: decides what is new or
/// stale, fetches in bounded parallel batches, merges serially, persists
/// once per run. Annotations are never written here.
pub struct Synchronizer {
    source: Arc<dyn RemoteSource>,
    options: SyncOptions,
}

impl Synchronizer {
    pub fn new(source: Arc<dyn RemoteSource>, options: SyncOptions) -> Self {
        Self { source, options }
    }

    pub async fn refresh(
        &self,
        store: &mut Store,
        scope: RefreshScope,
        cancel: &CancelFlag,
    ) -> Result<RefreshOutcome> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        debug!(%run_id, ?scope, "refresh started");

        let (merged, failed) = match scope {
            RefreshScope::JobsOnly => self.refresh_jobs(store, cancel).await?,
            RefreshScope::JobPlusThread(id) => self.refresh_thread(store, id, cancel).await?,
        };

        store.touch_synced(Utc::now());
        // One write per batch, success or partial; a cancelled run still
        // saves whatever was merged.
        store.persist().await.context("persisting store after refresh")?;

        let outcome = RefreshOutcome {
            run_id,
            started_at,
            finished_at: Utc::now(),
            merged,
            failed,
            cancelled: cancel.is_cancelled(),
        };
        debug!(
            %run_id,
            merged = outcome.merged.len(),
            failed = outcome.failed.len(),
            cancelled = outcome.cancelled,
            "refresh finished"
        );
        Ok(outcome)
    }

    async fn refresh_jobs(
        &self,
        store: &mut Store,
        cancel: &CancelFlag,
    ) -> Result<(Vec<u64>, Vec<u64>)> {
        let listing = self
            .source
            .list_job_ids()
            .await
            .context("listing job ids")?;
        let now = Utc::now();
        let cutoff = now
            - chrono::Duration::from_std(self.options.freshness)
                .unwrap_or_else(|_| chrono::Duration::hours(1));

        let mut to_fetch = Vec::new();
        for &id in &listing {
            match store.get(id) {
                None => to_fetch.push(id),
                Some(record) if record.item.is_tombstone() => {}
                Some(record) if record.stale || record.fetched_at < cutoff => to_fetch.push(id),
                Some(_) => {}
            }
        }

        // IDs that dropped out of the listing stay in the store and in the
        // ordering, flagged stale rather than deleted.
        let current: HashSet<u64> = listing.iter().copied().collect();
        let vanished: Vec<u64> = store
            .all_job_ids_in_known_order()
            .iter()
            .copied()
            .filter(|id| !current.contains(id))
            .collect();
        for &id in &vanished {
            store.mark_stale(id);
        }
        let mut order = listing;
        order.extend(vanished);
        store.set_job_order(order);

        let results = self.fetch_batch(&to_fetch, cancel).await;
        Ok(merge_results(store, results, now, ItemKind::Job))
    }

    async fn refresh_thread(
        &self,
        store: &mut Store,
        root: u64,
        cancel: &CancelFlag,
    ) -> Result<(Vec<u64>, Vec<u64>)> {
        let mut merged = Vec::new();
        let mut failed = Vec::new();

        if store.get(root).map(|r| r.item.is_tombstone()) == Some(true) {
            return Ok((merged, failed));
        }

        // The root job is the explicit target, so it is always refetched;
        // its kid list is the one part of a thread that does move.
        let now = Utc::now();
        let root_children = match self.source.fetch_item(root).await {
            Ok(item) => {
                let children = item.child_ids.clone();
                store.upsert_item(item, now);
                merged.push(root);
                children
            }
            Err(RemoteError::NotFound { .. }) => {
                store.upsert_item(Item::tombstone(root, ItemKind::Job), now);
                merged.push(root);
                return Ok((merged, failed));
            }
            Err(err) => {
                warn!(id = root, error = %err, "thread root fetch failed");
                failed.push(root);
                return Ok((merged, failed));
            }
        };

        // Explicit work queue instead of recursion: keeps the depth and
        // size caps enforceable and lets each wave fetch in parallel.
        let mut queue: VecDeque<(u64, usize)> =
            root_children.into_iter().map(|id| (id, 1)).collect();
        let mut seen: HashSet<u64> = HashSet::from([root]);
        let mut fetched = 0usize;

        while !queue.is_empty() && !cancel.is_cancelled() {
            let mut wave = Vec::new();
            while let Some((id, depth)) = queue.pop_front() {
                if !seen.insert(id) || depth > self.options.max_thread_depth {
                    continue;
                }
                if let Some(record) = store.get(id) {
                    // Cached comments are immutable once captured; walk
                    // through them without refetching.
                    if !record.item.is_tombstone() {
                        queue.extend(record.item.child_ids.iter().map(|&c| (c, depth + 1)));
                    }
                    continue;
                }
                if fetched >= self.options.max_thread_items {
                    continue;
                }
                fetched += 1;
                wave.push((id, depth));
                if wave.len() >= self.options.fetch_concurrency.max(1) {
                    break;
                }
            }
            if wave.is_empty() {
                continue;
            }

            let ids: Vec<u64> = wave.iter().map(|(id, _)| *id).collect();
            let results = self.fetch_batch(&ids, cancel).await;
            for (id, result) in results {
                let depth = wave
                    .iter()
                    .find(|(wid, _)| *wid == id)
                    .map(|(_, d)| *d)
                    .unwrap_or(self.options.max_thread_depth);
                match result {
                    Ok(item) => {
                        queue.extend(item.child_ids.iter().map(|&c| (c, depth + 1)));
                        store.upsert_item(item, now);
                        merged.push(id);
                    }
                    Err(RemoteError::NotFound { .. }) => {
                        store.upsert_item(Item::tombstone(id, ItemKind::Comment), now);
                        merged.push(id);
                    }
                    Err(err) => {
                        // Only this subtree is lost; siblings proceed.
                        warn!(id, error = %err, "comment fetch failed");
                        failed.push(id);
                    }
                }
            }
        }

        Ok((merged, failed))
    }

    /// Fetch a batch of IDs with bounded parallelism. Fetches dispatched
    /// after cancellation are abandoned and produce no result, so nothing
    /// half-done ever reaches the merge step.
    async fn fetch_batch(
        &self,
        ids: &[u64],
        cancel: &CancelFlag,
    ) -> Vec<(u64, Result<Item, RemoteError>)> {
        let semaphore = Arc::new(Semaphore::new(self.options.fetch_concurrency.max(1)));
        let mut handles = Vec::with_capacity(ids.len());

        for &id in ids {
            if cancel.is_cancelled() {
                break;
            }
            let source = Arc::clone(&self.source);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore not closed");
                if cancel.is_cancelled() {
                    return None;
                }
                Some((id, source.fetch_item(id).await))
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(Some(result)) = handle.await {
                results.push(result);
            }
        }
        results
    }
}

fn merge_results(
    store: &mut Store,
    results: Vec<(u64, Result<Item, RemoteError>)>,
    fetched_at: DateTime<Utc>,
    tombstone_kind: ItemKind,
) -> (Vec<u64>, Vec<u64>) {
    let mut merged = Vec::new();
    let mut failed = Vec::new();
    for (id, result) in results {
        match result {
            Ok(item) => {
                store.upsert_item(item, fetched_at);
                merged.push(id);
            }
            Err(RemoteError::NotFound { .. }) => {
                store.upsert_item(Item::tombstone(id, tombstone_kind), fetched_at);
                merged.push(id);
            }
            Err(err) => {
                warn!(id, error = %err, "item fetch failed");
                failed.push(id);
            }
        }
    }
    (merged, failed)
}

/// Conjunction of optional filter clauses over records.
#[derive(Debug, Clone, Default)]
pub struct QueryPredicate {
    pub tag: Option<String>,
    pub min_rating: Option<u8>,
    pub rated_only: bool,
    /// Case-insensitive substring over title and text.
    pub keyword: Option<String>,
    pub kind: Option<ItemKind>,
    pub include_tombstones: bool,
    pub exclude_stale: bool,
}

impl QueryPredicate {
    pub fn matches(&self, record: &Record) -> bool {
        if !self.include_tombstones && record.item.is_tombstone() {
            return false;
        }
        if self.exclude_stale && record.stale {
            return false;
        }
        if let Some(kind) = self.kind {
            if record.item.kind != kind {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !record.has_tag(tag) {
                return false;
            }
        }
        if self.rated_only && record.rating().is_none() {
            return false;
        }
        if let Some(min) = self.min_rating {
            if record.rating().map(|r| r >= min) != Some(true) {
                return false;
            }
        }
        if let Some(keyword) = &self.keyword {
            let needle = keyword.to_lowercase();
            let title_hit = record
                .item
                .title
                .as_deref()
                .map(|t| t.to_lowercase().contains(&needle))
                .unwrap_or(false);
            let text_hit = record
                .item
                .text
                .as_deref()
                .map(|t| t.to_lowercase().contains(&needle))
                .unwrap_or(false);
            if !title_hit && !text_hit {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    /// Newest first.
    #[default]
    Recency,
    /// Highest rated first; unrated records sort last.
    Rating,
    /// Alphabetical, case-insensitive; untitled records sort last.
    Title,
}

impl SortKey {
    fn compare(self, a: &Record, b: &Record) -> CmpOrdering {
        let primary = match self {
            SortKey::Recency => b.item.created_at.cmp(&a.item.created_at),
            SortKey::Rating => match (a.rating(), b.rating()) {
                (Some(ra), Some(rb)) => rb.cmp(&ra),
                (Some(_), None) => CmpOrdering::Less,
                (None, Some(_)) => CmpOrdering::Greater,
                (None, None) => CmpOrdering::Equal,
            },
            SortKey::Title => {
                let ta = a.item.title.as_deref().map(str::to_lowercase);
                let tb = b.item.title.as_deref().map(str::to_lowercase);
                match (ta, tb) {
                    (Some(ta), Some(tb)) => ta.cmp(&tb),
                    (Some(_), None) => CmpOrdering::Less,
                    (None, Some(_)) => CmpOrdering::Greater,
                    (None, None) => CmpOrdering::Equal,
                }
            }
        };
        // Deterministic listing regardless of insertion order.
        primary.then_with(|| a.item.id.cmp(&b.item.id))
    }
}

/// Read-only view builder over the store's in-memory snapshot. Each call
/// re-evaluates against current state, so re-querying after an edit is
/// cheap and always fresh.
pub struct QueryEngine;

impl QueryEngine {
    pub fn query<'a>(
        store: &'a Store,
        predicate: &QueryPredicate,
        sort: SortKey,
    ) -> impl Iterator<Item = &'a Record> {
        let mut hits: Vec<&Record> = store.records().filter(|r| predicate.matches(r)).collect();
        hits.sort_by(|a, b| sort.compare(a, b));
        hits.into_iter()
    }
}

#[derive(Debug, Error)]
pub enum EditError {
    #[error("rating {0} is outside {RATING_MIN}..={RATING_MAX}")]
    InvalidRating(u8),
    #[error("tag {0:?} is empty after trimming")]
    InvalidTag(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Applies one validated user edit and saves it immediately. Annotation
/// loss is unacceptable; a refetch is always recoverable, an edit is not.
pub struct AnnotationEditor;

impl AnnotationEditor {
    pub async fn apply(
        store: &mut Store,
        id: u64,
        edit: AnnotationEdit,
    ) -> Result<Record, EditError> {
        // Validate everything before touching the store.
        if let Some(RatingEdit::Set(rating)) = edit.rating {
            if rating > RATING_MAX {
                return Err(EditError::InvalidRating(rating));
            }
        }
        let mut add_tags = Vec::with_capacity(edit.add_tags.len());
        for tag in &edit.add_tags {
            let trimmed = tag.trim();
            if trimmed.is_empty() {
                return Err(EditError::InvalidTag(tag.clone()));
            }
            add_tags.push(trimmed.to_string());
        }

        let existing = store.get(id).ok_or(StoreError::UnknownItem(id))?;
        let now = Utc::now();
        let mut annotation = existing
            .annotation
            .clone()
            .unwrap_or_else(|| Annotation::empty(now));

        for tag in add_tags {
            annotation.tags.insert(tag);
        }
        for tag in &edit.remove_tags {
            annotation.tags.remove(tag.trim());
        }
        match edit.rating {
            Some(RatingEdit::Set(rating)) => annotation.rating = Some(rating),
            Some(RatingEdit::Clear) => annotation.rating = None,
            None => {}
        }
        annotation.reviewed_at = now;

        store.set_annotation(id, annotation)?;
        store.persist().await?;
        Ok(store.get(id).expect("record written above").clone())
    }
}
