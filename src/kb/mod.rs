//! The knowledge base as seen by the planner.
//!
//! A [`KnowledgeBase`] owns both dataset backends and the auxiliary tables:
//!
//! ```text
//!                      ┌───────────────────┐
//!   load_dataset ─────►│   KnowledgeBase   │◄───── store_dataset
//!                      └───────────────────┘
//!                        │               │
//!          safe context  │               │  timed-out statement
//!                        ▼               ▼
//!              ┌──────────────┐   ┌──────────────┐     ┌───────┐
//!              │ Durable store│◄──┤ Dataset cache├────►│ Arena │
//!              │  (journal)   │   │  (snapshot)  │     └───────┘
//!              └──────────────┘   └──────────────┘
//!                 drain_into ▲
//! ```
//!
//! # Lifecycle
//!
//! [`KnowledgeBase::init`] locks the directory, replays the store journal,
//! creates the arena segments and fills the shared tables from their snapshot
//! files. [`KnowledgeBase::shutdown`] writes the snapshots back. Dropping an
//! open knowledge base does the same, logging instead of returning failures.
//! A directory can be opened once per process at a time.
//!
//! # Disabled State
//!
//! When the store reports a missing relation the knowledge base disables
//! itself: lookups report nothing and writes are skipped until
//! [`KnowledgeBase::enable`] finds the relations again.

pub mod inspect;

pub use inspect::{Backend, DatasetRow, StatRow, TextRow};

use crate::arena::SegmentRegistry;
use crate::config::KbConfig;
use crate::error::Result;
use crate::flock::DirLock;
use crate::shared::{DatasetCache, DeactivatedQueries, QueryTexts, StatCache};
use crate::shared::{DEFAULT_QUERY_ID, DEFAULT_QUERY_TEXT};
use crate::store::{Database, Search, Transaction};
use crate::types::{
    FeatureSubspaceKey, OkNNDataset, QueryContext, QueryRegistration, RelationId, StatEntry,
};
use crate::Error;

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

pub const DATA_SEGMENT: &str = "kb_data";
pub const TEXT_SEGMENT: &str = "kb_query_texts";

// Directories with an open knowledge base in this process
static OPEN_DIRS: Mutex<Vec<PathBuf>> = Mutex::new(Vec::new());

pub struct KnowledgeBase {
    config: KbConfig,
    dir: PathBuf,
    lock: Option<DirLock>,
    db: Database,
    segments: SegmentRegistry,
    stats: StatCache,
    texts: QueryTexts,
    data: DatasetCache,
    deactivated: DeactivatedQueries,
    enabled: AtomicBool,
}

impl std::fmt::Debug for KnowledgeBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeBase")
            .field("dir", &self.dir)
            .field("enabled", &self.is_enabled())
            .field("stats", &self.stats)
            .field("texts", &self.texts)
            .field("data", &self.data)
            .finish()
    }
}

impl KnowledgeBase {
    /// Opens the knowledge base in `dir` with default settings
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::init(KbConfig::new(dir))
    }

    /// Opens the knowledge base described by `config`.
    pub fn init(config: KbConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)?;
        let dir = config.dir.canonicalize()?;

        {
            let mut open = OPEN_DIRS.lock();
            if open.contains(&dir) {
                return Err(Error::AlreadyInitialized(dir.display().to_string()));
            }
            open.push(dir.clone());
        }

        match Self::init_locked(config, dir.clone()) {
            Ok(kb) => Ok(kb),
            Err(err) => {
                release_dir(&dir);
                Err(err)
            }
        }
    }

    fn init_locked(config: KbConfig, dir: PathBuf) -> Result<Self> {
        let lock = DirLock::acquire(&dir)?;
        let db = Database::open(&config.journal_path(), config.sync_journal)?;

        let segments = SegmentRegistry::new();
        let (data_arena, data_created) = segments.attach_or_create(
            DATA_SEGMENT,
            config.arena_initial_size,
            config.arena_max_size,
        );
        let (text_arena, texts_created) = segments.attach_or_create(
            TEXT_SEGMENT,
            config.arena_initial_size,
            config.arena_max_size,
        );

        let mut kb = Self {
            stats: StatCache::new(config.stat_path()),
            texts: QueryTexts::new(text_arena, config.text_path()),
            data: DatasetCache::new(data_arena, config.data_path()),
            deactivated: DeactivatedQueries::new(),
            enabled: AtomicBool::new(true),
            config,
            dir,
            lock: Some(lock),
            db,
            segments,
        };

        let (stats, texts, datasets) = match kb.load_tables(texts_created, data_created) {
            Ok(loaded) => loaded,
            Err(err) => {
                // Half-loaded tables must not overwrite anything on drop
                kb.lock = None;
                return Err(err);
            }
        };

        tracing::info!(
            dir = %kb.dir.display(),
            stats,
            texts,
            datasets,
            "Knowledge base initialized"
        );
        Ok(kb)
    }

    fn load_tables(&self, texts_created: bool, data_created: bool) -> Result<(usize, usize, usize)> {
        let stats = self.stats.load()?;
        // Whoever creates a segment fills it
        let texts = if texts_created {
            self.texts.load()?
        } else {
            self.texts.store_text(DEFAULT_QUERY_ID, DEFAULT_QUERY_TEXT)?;
            0
        };
        let datasets = if data_created { self.data.load()? } else { 0 };
        Ok((stats, texts, datasets))
    }

    /// Writes the shared tables to their snapshot files and closes the
    /// knowledge base.
    pub fn shutdown(mut self) -> Result<()> {
        self.close()
    }

    fn close(&mut self) -> Result<()> {
        let Some(lock) = self.lock.take() else {
            return Ok(());
        };

        let flushed = self.flush();
        self.segments.detach(DATA_SEGMENT);
        self.segments.detach(TEXT_SEGMENT);
        self.deactivated.clear();

        drop(lock);
        release_dir(&self.dir);
        flushed
    }

    /// Writes every shared table to its snapshot file. A table that fails
    /// does not keep the others from being written; the first failure is
    /// returned.
    pub fn flush(&self) -> Result<()> {
        let stats = self.stats.flush();
        let texts = self.texts.flush();
        let datasets = self.data.flush();
        tracing::debug!(?stats, ?texts, ?datasets, "Flushed shared tables");
        texts.and(datasets).map(|_| ())
    }

    pub fn config(&self) -> &KbConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn stats(&self) -> &StatCache {
        &self.stats
    }

    pub fn texts(&self) -> &QueryTexts {
        &self.texts
    }

    pub fn data_cache(&self) -> &DatasetCache {
        &self.data
    }

    pub fn deactivated(&self) -> &DeactivatedQueries {
        &self.deactivated
    }

    pub fn segments(&self) -> &SegmentRegistry {
        &self.segments
    }

    pub fn begin(&self) -> Transaction<'_> {
        self.db.begin()
    }

    pub fn begin_read_only(&self) -> Transaction<'_> {
        self.db.begin_read_only()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Re-enables the knowledge base if the store has its relations again.
    pub fn enable(&self) -> bool {
        if self.db.has_relations() {
            self.enabled.store(true, Ordering::Release);
        }
        self.is_enabled()
    }

    // Turns a missing relation into the disabled state and `fallback`.
    fn tolerate<T>(&self, result: Result<T>, fallback: T) -> Result<T> {
        match result {
            Err(Error::RelationMissing(relation)) => {
                if self.enabled.swap(false, Ordering::AcqRel) {
                    tracing::warn!(relation, "Knowledge base relation is missing, disabling");
                }
                Ok(fallback)
            }
            other => other,
        }
    }

    /// Registration of a query class, if known.
    pub fn find_query(&self, txn: &Transaction<'_>, query_hash: u64) -> Result<Option<QueryContext>> {
        if !self.is_enabled() {
            return Ok(None);
        }
        self.tolerate(self.db.find_query(txn, query_hash), None)
    }

    /// Registers or updates a query class. Returns whether the write
    /// happened; concurrent writers and read-only transactions make it skip.
    pub fn update_query(&self, txn: &Transaction<'_>, reg: &QueryRegistration) -> Result<bool> {
        if !self.is_enabled() {
            return Ok(false);
        }
        let outcome = self.db.upsert_query(txn, reg).map(|o| o.is_applied());
        self.tolerate(outcome, false)
    }

    /// Loads the dataset of `key`.
    ///
    /// In a `safe` context the durable store answers, unless the timeout
    /// policy is active and the cache holds a fresher copy of the key. Unsafe
    /// contexts only ever read the cache.
    pub fn load_dataset(
        &self,
        txn: &Transaction<'_>,
        key: FeatureSubspaceKey,
        cols: i32,
        safe: bool,
    ) -> Result<Option<(OkNNDataset, Vec<RelationId>)>> {
        if safe && (!self.config.learn_statement_timeout || !self.data.contains(key)) {
            if !self.is_enabled() {
                return Ok(None);
            }
            let found = self.db.lookup_dataset(txn, key, cols, Search::Exact);
            return self.tolerate(found, None);
        }

        if !self.config.learn_statement_timeout {
            tracing::debug!(key = %key, "Dataset cache read without a timeout policy");
        }
        self.data.lookup(key, cols)
    }

    /// Stores the dataset of `key`. Datasets learned from a timed-out
    /// statement go to the cache, all others to the durable store.
    pub fn store_dataset(
        &self,
        txn: &Transaction<'_>,
        key: FeatureSubspaceKey,
        data: &OkNNDataset,
        relations: &[RelationId],
        timed_out: bool,
    ) -> Result<bool> {
        if timed_out {
            return self.data.upsert(key, data, relations);
        }
        if !self.is_enabled() {
            return Ok(false);
        }
        let outcome = self
            .db
            .upsert_dataset(txn, key, data, relations)
            .map(|o| o.is_applied());
        self.tolerate(outcome, false)
    }

    /// Moves the cached datasets into the durable store within `txn`.
    /// Returns the number of datasets moved.
    pub fn flush_cached_datasets(&self, txn: &Transaction<'_>) -> Result<usize> {
        if !self.is_enabled() {
            return Ok(0);
        }
        let moved = self.data.drain_into(&self.db, txn);
        self.tolerate(moved, 0)
    }

    /// Records an execution of `query_id` and returns its updated statistics.
    pub fn record_execution(
        &self,
        query_id: u64,
        used_model: bool,
        plan_time: f64,
        exec_time: f64,
        est_error: f64,
    ) -> StatEntry {
        self.stats
            .record(query_id, used_model, plan_time, exec_time, est_error)
    }

    /// Remembers the text of `query_id`. The first text stored wins.
    pub fn store_query_text(&self, query_id: u64, text: &str) -> Result<bool> {
        self.texts.store_text(query_id, text)
    }

    /// Empties the statistics, the query texts but the common feature
    /// space's, and the dataset cache. Returns the number of entries removed.
    pub fn reset(&self) -> Result<usize> {
        let stats = self.stats.reset();
        let texts = self.texts.reset()?;
        let datasets = self.data.reset()?;
        tracing::info!(stats, texts, datasets, "Knowledge base reset");
        Ok(stats + texts + datasets)
    }
}

fn release_dir(dir: &Path) {
    OPEN_DIRS.lock().retain(|open| open.as_path() != dir);
}

impl Drop for KnowledgeBase {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(dir = %self.dir.display(), error = %err, "Failed to flush knowledge base on drop");
        }
    }
}
