//! Storage traits and backends.
//!
//! [`InMemoryStore`] is always available; [`PersistentStore`] (feature
//! `persistent`) puts a write-ahead log and snapshots in front of the same
//! in-memory tables.

mod memory;
#[cfg(feature = "persistent")]
pub mod persistent;
mod traits;

pub use memory::{InMemoryStore, StoreStats};
#[cfg(feature = "persistent")]
pub use persistent::{PersistentConfig, PersistentStore};
pub use traits::{
    EntityStore, MentionAssignment, MentionStore, MergeHistoryStore, ResolutionStore, StorageError,
    StoreTransaction,
};

#[cfg(feature = "persistent")]
pub(crate) use memory::{lock_err, Snapshot, StoreState};
