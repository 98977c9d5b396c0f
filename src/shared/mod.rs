//! Process-wide caches shared by every session.
//!
//! Each cache guards its table with its own reader/writer lock: lookups and
//! dumps take it shared, every mutation takes it exclusive. The arena has a
//! lock of its own that is only ever taken while a table lock is held, never
//! the other way around.
//!
//! No code path holds two table locks at once. A cross-table operation such
//! as a whole knowledge-base reset visits the tables one after another in the
//! order statistics, texts, datasets.

pub mod data;
pub mod deactivated;
pub mod qtext;
pub mod stat;

pub use data::{CachedDataset, DatasetCache};
pub use deactivated::DeactivatedQueries;
pub use qtext::{QueryTexts, DEFAULT_QUERY_ID, DEFAULT_QUERY_TEXT};
pub use stat::StatCache;
