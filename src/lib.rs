//! Storage and caching layer of a learned-statistics knowledge base.
//!
//! Per feature subspace the knowledge base keeps a small kNN dataset. Two
//! backends hold datasets side by side: a durable, transactional
//! [`store`] and a shared in-memory [`shared::DatasetCache`] whose payloads
//! live in an [`arena`]. Execution statistics and query texts live in shared
//! tables next to the cache. Shared tables survive restarts through
//! [`snapshot`] files, the store through its journal.
//!
//! [`KnowledgeBase`] ties everything together.

pub mod arena;
pub mod config;
pub mod encoding;
pub mod error;
pub mod flock;
pub mod kb;
pub mod shared;
pub mod snapshot;
pub mod store;
pub mod types;

pub use config::KbConfig;
pub use error::{Error, Result};
pub use kb::KnowledgeBase;
pub use store::{Refusal, Search, UpsertOutcome};
pub use types::{
    FeatureSubspaceKey, OkNNDataset, QueryContext, QueryRegistration, RelationId, StatEntry,
};
