//! Error types for the resolution engine.
//!
//! All errors are strongly typed using thiserror, one enum per failure kind:
//! candidate search ([`RegistryError`]), per-candidate similarity
//! ([`SimilarityError`]), audit writes ([`MergeError`]), per-mention batch
//! decisions ([`ClusterError`]) and split/unmerge ([`SplitError`]).
//! [`ResolveError`] wraps all of them for callers that do not care which
//! stage failed.

use thiserror::Error;

use crate::ids::{EntityId, MentionId, MergeId, OrgId};
use crate::storage::StorageError;

/// Validation errors that occur during input validation.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Confidence value {value} is out of range [0.0, 1.0]")]
    ConfidenceOutOfRange {
        value: f32,
    },

    #[error("Field '{field}' cannot be empty")]
    EmptyField {
        field: &'static str,
    },

    #[error("Invalid text span: start ({start}) must not exceed end ({end})")]
    InvalidSpan {
        start: usize,
        end: usize,
    },

    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Merge reason '{reason}' requires an approving user")]
    ApproverRequired {
        reason: &'static str,
    },

    #[error("Automatic merge reason '{reason}' cannot carry an approving user")]
    UnexpectedApprover {
        reason: &'static str,
    },
}

/// Errors produced by an embedding provider.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("Embedding service unavailable: {message}")]
    Unavailable {
        message: String,
    },

    #[error("Embedding service returned an invalid vector: {message}")]
    InvalidOutput {
        message: String,
    },
}

/// Similarity could not be computed for one candidate entity.
#[derive(Debug, Error)]
pub enum SimilarityError {
    #[error("Embedding for entity {entity_id} failed: {source}")]
    Embedding {
        entity_id: EntityId,
        #[source]
        source: EmbeddingError,
    },

    #[error("Embedding dimension mismatch for entity {entity_id}: mention={mention_dim} entity={entity_dim}")]
    DimensionMismatch {
        entity_id: EntityId,
        mention_dim: usize,
        entity_dim: usize,
    },
}

impl SimilarityError {
    /// The candidate entity the failure belongs to.
    #[must_use]
    pub const fn entity_id(&self) -> EntityId {
        match self {
            Self::Embedding { entity_id, .. } | Self::DimensionMismatch { entity_id, .. } => {
                *entity_id
            }
        }
    }
}

/// Candidate search failed.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Candidate text search failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Mention embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Candidate ranking aborted: {0}")]
    Similarity(#[from] SimilarityError),
}

/// Writing to the merge history failed.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("Merge history write failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid merge record: {0}")]
    Validation(#[from] ValidationError),
}

/// Resolution of a single mention within a batch failed.
///
/// Every variant names the mention it belongs to so that callers can retry
/// exactly the failed subset.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Candidate search failed for mention {mention_id}: {source}")]
    Search {
        mention_id: MentionId,
        #[source]
        source: RegistryError,
    },

    #[error("Candidate search for mention {mention_id} timed out after {duration_ms}ms")]
    Timeout {
        mention_id: MentionId,
        duration_ms: u64,
    },

    #[error("Search queue is full (capacity {capacity}); mention {mention_id} was not scheduled")]
    QueueFull {
        mention_id: MentionId,
        capacity: usize,
    },

    #[error("Search worker disconnected while resolving mention {mention_id}")]
    Disconnected {
        mention_id: MentionId,
    },

    #[error("Mention {mention_id} belongs to organization {actual}, batch is scoped to {expected}")]
    ScopeMismatch {
        mention_id: MentionId,
        expected: OrgId,
        actual: OrgId,
    },

    #[error("Mention {mention_id} is already resolved to entity {entity_id}")]
    AlreadyResolved {
        mention_id: MentionId,
        entity_id: EntityId,
    },

    #[error("Mention {mention_id} appears more than once in the batch")]
    DuplicateInBatch {
        mention_id: MentionId,
    },

    #[error("Writing the decision for mention {mention_id} failed: {source}")]
    Commit {
        mention_id: MentionId,
        #[source]
        source: StorageError,
    },
}

impl ClusterError {
    /// The mention this failure is attributed to.
    #[must_use]
    pub const fn mention_id(&self) -> MentionId {
        match self {
            Self::Search { mention_id, .. }
            | Self::Timeout { mention_id, .. }
            | Self::QueueFull { mention_id, .. }
            | Self::Disconnected { mention_id }
            | Self::ScopeMismatch { mention_id, .. }
            | Self::AlreadyResolved { mention_id, .. }
            | Self::DuplicateInBatch { mention_id }
            | Self::Commit { mention_id, .. } => *mention_id,
        }
    }

    /// Returns true if re-submitting the mention may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::QueueFull { .. } | Self::Disconnected { .. } => true,
            Self::Search { source, .. } => !matches!(source, RegistryError::Similarity(_)),
            Self::Commit { source, .. } => matches!(source, StorageError::Conflict(_)),
            Self::ScopeMismatch { .. }
            | Self::AlreadyResolved { .. }
            | Self::DuplicateInBatch { .. } => false,
        }
    }
}

/// Split, unmerge or manual merge failed.
#[derive(Debug, Error)]
pub enum SplitError {
    #[error("No mentions were selected")]
    EmptySelection,

    #[error("Mention {mention_id} was selected more than once")]
    DuplicateMention {
        mention_id: MentionId,
    },

    #[error("Entity not found: {entity_id}")]
    EntityNotFound {
        entity_id: EntityId,
    },

    #[error("Entity {entity_id} is not active (merged into {merged_into})")]
    EntityInactive {
        entity_id: EntityId,
        merged_into: EntityId,
    },

    #[error("Mention not found: {mention_id}")]
    MentionNotFound {
        mention_id: MentionId,
    },

    #[error("mention {mention_id} is not currently resolved to entity {entity_id}")]
    MentionNotOwned {
        mention_id: MentionId,
        entity_id: EntityId,
        actual: Option<EntityId>,
    },

    #[error("Splitting every mention off entity {entity_id} would leave it empty")]
    WouldEmptyEntity {
        entity_id: EntityId,
    },

    #[error("Cannot merge entity {entity_id} into itself")]
    SameEntity {
        entity_id: EntityId,
    },

    #[error("Merge record not found: {merge_id}")]
    MergeNotFound {
        merge_id: MergeId,
    },

    #[error("Merge record {merge_id} cannot be reversed: {reason}")]
    NotReversible {
        merge_id: MergeId,
        reason: String,
    },

    #[error("Merge record {merge_id} was already reversed by {reversed_by}")]
    AlreadyReversed {
        merge_id: MergeId,
        reversed_by: MergeId,
    },

    #[error("Merge record {merge_id} has no mentions left on entity {entity_id} to restore")]
    NothingToRestore {
        merge_id: MergeId,
        entity_id: EntityId,
    },

    #[error("Record belongs to organization {actual}, request is scoped to {expected}")]
    ScopeMismatch {
        expected: OrgId,
        actual: OrgId,
    },

    #[error("Invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("Split write failed: {0}")]
    Storage(#[from] StorageError),
}

impl SplitError {
    /// Returns true for caller mistakes (as opposed to storage failures).
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        !matches!(self, Self::Storage(_))
    }
}

/// Configuration could not be loaded or is inconsistent.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for '{field}': {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to read configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Top-level error type.
///
/// This enum encompasses all possible errors that can occur when using the
/// engine through the [`crate::EntityResolver`] façade.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Merge history error: {0}")]
    Merge(#[from] MergeError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Split error: {0}")]
    Split(#[from] SplitError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl ResolveError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error (including split validation).
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        match self {
            Self::Validation(_) | Self::Config(_) => true,
            Self::Split(e) => e.is_validation(),
            _ => false,
        }
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Cluster(e) => e.is_retryable(),
            Self::Registry(e) => matches!(e, RegistryError::Storage(_) | RegistryError::Embedding(_)),
            Self::Storage(e) | Self::Merge(MergeError::Storage(e)) | Self::Split(SplitError::Storage(e)) => {
                matches!(e, StorageError::Conflict(_) | StorageError::ConnectionError(_))
            }
            _ => false,
        }
    }
}

/// Result type alias for engine operations.
pub type ResolveResult<T> = Result<T, ResolveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_confidence() {
        let err = ValidationError::ConfidenceOutOfRange { value: 1.5 };
        let msg = format!("{err}");
        assert!(msg.contains("1.5"));
        assert!(msg.contains("out of range"));
    }

    #[test]
    fn test_split_error_names_mention_and_entity() {
        let mention_id = MentionId::new();
        let entity_id = EntityId::new();
        let err = SplitError::MentionNotOwned {
            mention_id,
            entity_id,
            actual: None,
        };
        assert_eq!(
            err.to_string(),
            format!("mention {mention_id} is not currently resolved to entity {entity_id}")
        );
        assert!(err.is_validation());
    }

    #[test]
    fn test_cluster_error_carries_mention() {
        let mention_id = MentionId::new();
        let err = ClusterError::Timeout {
            mention_id,
            duration_ms: 100,
        };
        assert_eq!(err.mention_id(), mention_id);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("100ms"));
    }

    #[test]
    fn test_cluster_error_scope_not_retryable() {
        let err = ClusterError::ScopeMismatch {
            mention_id: MentionId::new(),
            expected: OrgId::new(),
            actual: OrgId::new(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_resolve_error_from_split() {
        let err: ResolveError = SplitError::EmptySelection.into();
        assert!(err.is_validation());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_resolve_error_storage_conflict_retryable() {
        let err: ResolveError = StorageError::Conflict("stale owner".to_string()).into();
        assert!(err.is_retryable());
        assert!(!err.is_validation());
    }

    #[test]
    fn test_resolve_error_internal() {
        let err = ResolveError::internal("unexpected state");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("unexpected state"));
    }
}
