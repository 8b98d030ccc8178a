//! Abstract storage traits for entity resolution.
//!
//! These traits define the contract that storage backends must implement.
//! Reads go through the three table traits; every multi-record write goes
//! through [`ResolutionStore::commit`], which applies a [`StoreTransaction`]
//! all-or-nothing.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entity::Entity;
use crate::history::{MergeRecord, MergeSource};
use crate::ids::{EntityId, MentionId, MergeId, OrgId, UserId};
use crate::mention::Mention;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Entity not found.
    #[error("Entity not found: {0}")]
    EntityNotFound(EntityId),

    /// Mention not found.
    #[error("Mention not found: {0}")]
    MentionNotFound(MentionId),

    /// Merge record not found.
    #[error("Merge record not found: {0}")]
    MergeNotFound(MergeId),

    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// A compare-and-set precondition no longer holds.
    #[error("Write conflict: {0}")]
    Conflict(String),

    /// A write touched a record belonging to another organization.
    #[error("Scope violation: {record} belongs to org {actual}, transaction is scoped to {expected}")]
    ScopeViolation {
        /// Offending record, e.g. `mention 1f0c...`.
        record: String,
        /// Organization the write was scoped to.
        expected: OrgId,
        /// Organization that owns the record.
        actual: OrgId,
    },

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Connection failed.
    #[error("Connection error: {0}")]
    ConnectionError(String),
}

/// Storage trait for mention records.
///
/// Mentions are write-once except for `resolved_entity_id`, which only
/// changes through [`ResolutionStore::commit`]. Mentions are never deleted.
pub trait MentionStore: Send + Sync {
    /// Insert a new mention. Returns error if ID already exists.
    fn insert_mention(&self, mention: Mention) -> Result<(), StorageError>;

    /// Get a mention by ID.
    fn get_mention(&self, id: MentionId) -> Result<Option<Mention>, StorageError>;

    /// Mentions currently resolved to `entity_id`, oldest first.
    fn mentions_for_entity(&self, entity_id: EntityId) -> Result<Vec<Mention>, StorageError>;

    /// All mentions of an organization, oldest first.
    fn mentions_for_org(&self, org_id: OrgId) -> Result<Vec<Mention>, StorageError>;
}

/// Storage trait for entities.
///
/// # Safety Considerations
/// - Entities are never hard-deleted; status changes go through `commit`
/// - Implementations should handle concurrent access safely
pub trait EntityStore: Send + Sync {
    /// Insert a new entity. Returns error if ID already exists.
    fn insert_entity(&self, entity: Entity) -> Result<(), StorageError>;

    /// Get an entity by ID.
    fn get_entity(&self, id: EntityId) -> Result<Option<Entity>, StorageError>;

    /// Trigram search over normalized canonical text.
    ///
    /// Returns active entities of `org_id` whose trigram similarity to
    /// `normalized` is at least `min_similarity`, best first, at most `limit`.
    /// Implementations must answer from an index rather than a full scan.
    fn find_by_text(
        &self,
        org_id: OrgId,
        normalized: &str,
        min_similarity: f32,
        limit: usize,
    ) -> Result<Vec<(Entity, f32)>, StorageError>;

    /// Every entity of an organization in any status.
    fn entities_for_org(&self, org_id: OrgId) -> Result<Vec<Entity>, StorageError>;
}

/// Storage trait for the append-only merge history.
///
/// List methods return records in append order; callers sort for display.
pub trait MergeHistoryStore: Send + Sync {
    /// Append a record. Returns error if the ID exists or if the record
    /// reverses one that was already reversed.
    fn append_merge(&self, record: MergeRecord) -> Result<(), StorageError>;

    /// Get a merge record by ID.
    fn get_merge(&self, id: MergeId) -> Result<Option<MergeRecord>, StorageError>;

    /// Records whose target is `entity_id`.
    fn merges_by_target(
        &self,
        org_id: OrgId,
        entity_id: EntityId,
    ) -> Result<Vec<MergeRecord>, StorageError>;

    /// Records whose source is `source`.
    fn merges_by_source(
        &self,
        org_id: OrgId,
        source: &MergeSource,
    ) -> Result<Vec<MergeRecord>, StorageError>;

    /// Records approved by `user_id`. Automatic merges are never included.
    fn merges_by_user(&self, org_id: OrgId, user_id: &UserId) -> Result<Vec<MergeRecord>, StorageError>;

    /// The record that reverses `merge_id`, if any.
    fn reversal_of(&self, merge_id: MergeId) -> Result<Option<MergeRecord>, StorageError>;
}

/// Ownership change for one mention inside a [`StoreTransaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MentionAssignment {
    /// Mention being reassigned.
    pub mention_id: MentionId,
    /// Owner the writer observed; the commit fails if it changed since.
    pub expected: Option<EntityId>,
    /// Owner after the commit.
    pub new_owner: EntityId,
}

/// A set of writes applied atomically by [`ResolutionStore::commit`].
///
/// Backends validate the whole transaction before applying any part of it:
/// - every record belongs to `org_id`
/// - inserted IDs are new, updated entities exist with a lower stored version
/// - every assignment's `expected` owner matches the stored one
/// - every new owner exists or is inserted by the same transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreTransaction {
    /// Organization every record must belong to.
    pub org_id: OrgId,
    /// New entities.
    pub inserted_entities: Vec<Entity>,
    /// Replacements for existing entities, with bumped versions.
    pub updated_entities: Vec<Entity>,
    /// Mention ownership changes.
    pub assignments: Vec<MentionAssignment>,
    /// History rows to append.
    pub merge_records: Vec<MergeRecord>,
}

impl StoreTransaction {
    /// Creates an empty transaction scoped to `org_id`.
    #[must_use]
    pub fn new(org_id: OrgId) -> Self {
        Self {
            org_id,
            inserted_entities: Vec::new(),
            updated_entities: Vec::new(),
            assignments: Vec::new(),
            merge_records: Vec::new(),
        }
    }

    /// Adds an entity insert.
    #[must_use]
    pub fn insert_entity(mut self, entity: Entity) -> Self {
        self.inserted_entities.push(entity);
        self
    }

    /// Adds an entity update.
    #[must_use]
    pub fn update_entity(mut self, entity: Entity) -> Self {
        self.updated_entities.push(entity);
        self
    }

    /// Adds a compare-and-set ownership change.
    #[must_use]
    pub fn assign(mut self, mention_id: MentionId, expected: Option<EntityId>, new_owner: EntityId) -> Self {
        self.assignments.push(MentionAssignment {
            mention_id,
            expected,
            new_owner,
        });
        self
    }

    /// Adds a merge history row.
    #[must_use]
    pub fn record(mut self, record: MergeRecord) -> Self {
        self.merge_records.push(record);
        self
    }

    /// Returns true if the transaction writes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inserted_entities.is_empty()
            && self.updated_entities.is_empty()
            && self.assignments.is_empty()
            && self.merge_records.is_empty()
    }
}

/// The full store the resolution services run against.
pub trait ResolutionStore: MentionStore + EntityStore + MergeHistoryStore {
    /// Applies `tx` atomically: either every write lands or none does.
    ///
    /// # Errors
    /// - `Conflict`: a stale expected owner or entity version
    /// - `ScopeViolation`: a record outside `tx.org_id`
    /// - `*NotFound` / `DuplicateKey`: referential failures
    fn commit(&self, tx: StoreTransaction) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time test: ensure traits are object-safe
    fn _assert_mention_store_object_safe(_: &dyn MentionStore) {}
    fn _assert_entity_store_object_safe(_: &dyn EntityStore) {}
    fn _assert_merge_store_object_safe(_: &dyn MergeHistoryStore) {}
    fn _assert_resolution_store_object_safe(_: &dyn ResolutionStore) {}

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::EntityNotFound(EntityId::new());
        assert!(err.to_string().contains("Entity not found"));

        let err = StorageError::BackendError("connection refused".to_string());
        assert!(err.to_string().contains("connection refused"));

        let err = StorageError::ScopeViolation {
            record: "mention x".to_string(),
            expected: OrgId::nil(),
            actual: OrgId::nil(),
        };
        assert!(err.to_string().contains("mention x"));
    }

    #[test]
    fn test_transaction_builder() {
        let org = OrgId::new();
        let tx = StoreTransaction::new(org);
        assert!(tx.is_empty());

        let entity = EntityId::new();
        let tx = tx.assign(MentionId::new(), None, entity);
        assert!(!tx.is_empty());
        assert_eq!(tx.assignments[0].new_owner, entity);
        assert_eq!(tx.assignments[0].expected, None);
    }
}
