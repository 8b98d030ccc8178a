//! Append-only merge history.
//!
//! Every ownership change the engine makes (automatic merge, manual merge,
//! split, unmerge) is described by one [`MergeRecord`]. Records are never
//! updated or deleted; a reversal is a new record whose `reverses` field
//! points at the record it undoes.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::confidence::Confidence;
use crate::error::{MergeError, ValidationError};
use crate::ids::{EntityId, MentionId, MergeId, OrgId, UserId};
use crate::storage::ResolutionStore;

/// Why an ownership change happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeReason {
    /// Embedding similarity above the merge threshold.
    EmbeddingSimilarity,
    /// Normalized text identical to the entity's canonical text.
    TextExactMatch,
    /// A user folded one entity into another.
    ManualOverride,
    /// A user split mentions off into a new entity.
    ManualSplit,
    /// Reversal of an earlier merge.
    Unmerge,
}

impl MergeReason {
    /// Wire string, identical to the serde form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EmbeddingSimilarity => "embedding-similarity",
            Self::TextExactMatch => "text-exact-match",
            Self::ManualOverride => "manual-override",
            Self::ManualSplit => "manual-split",
            Self::Unmerge => "unmerge",
        }
    }

    /// True for decisions made by the clusterer without a user.
    #[must_use]
    pub const fn is_automatic(self) -> bool {
        match self {
            Self::EmbeddingSimilarity | Self::TextExactMatch => true,
            Self::ManualOverride | Self::ManualSplit | Self::Unmerge => false,
        }
    }

    /// True if an unmerge may reverse a record with this reason.
    #[must_use]
    pub const fn is_reversible(self) -> bool {
        match self {
            Self::EmbeddingSimilarity | Self::TextExactMatch | Self::ManualOverride => true,
            Self::ManualSplit | Self::Unmerge => false,
        }
    }
}

impl fmt::Display for MergeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What was folded into the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum MergeSource {
    /// A single mention joined the target.
    Mention(MentionId),
    /// A whole entity was involved (manual merge, split, unmerge).
    Entity(EntityId),
}

impl fmt::Display for MergeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mention(id) => write!(f, "mention:{id}"),
            Self::Entity(id) => write!(f, "entity:{id}"),
        }
    }
}

/// One immutable history row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRecord {
    /// Unique id of this row.
    pub id: MergeId,
    /// Owning organization.
    pub org_id: OrgId,
    /// Mention or entity folded into the target.
    pub source: MergeSource,
    /// Entity that received the source.
    pub target: EntityId,
    /// Why the change happened.
    pub reason: MergeReason,
    /// Similarity for automatic merges, user confidence otherwise.
    pub confidence: Confidence,
    /// Approving user; `None` for automatic merges.
    #[serde(default)]
    pub merged_by: Option<UserId>,
    /// Mentions whose owner changed in this event.
    #[serde(default)]
    pub moved_mentions: Vec<MentionId>,
    /// Run whose mention triggered an automatic merge.
    #[serde(default)]
    pub extraction_run_id: Option<String>,
    /// Record this one undoes.
    #[serde(default)]
    pub reverses: Option<MergeId>,
    /// When the row was appended.
    pub recorded_at: DateTime<Utc>,
}

impl MergeRecord {
    /// Returns true if no user approved the change.
    #[must_use]
    pub const fn is_automatic(&self) -> bool {
        self.merged_by.is_none()
    }
}

/// Request to append a history row.
#[derive(Debug, Clone)]
pub struct RecordMerge {
    /// Owning organization.
    pub org_id: OrgId,
    /// Mention or entity folded into the target.
    pub source: MergeSource,
    /// Entity that received the source.
    pub target: EntityId,
    /// Why the change happened; decides whether a user is required.
    pub reason: MergeReason,
    /// Checked against `[0, 1]` by [`RecordMerge::into_record`].
    pub confidence: f32,
    /// Approving user, required exactly for manual reasons.
    pub merged_by: Option<UserId>,
    /// Mentions whose owner changed.
    pub moved_mentions: Vec<MentionId>,
    /// Run whose mention triggered an automatic merge.
    pub extraction_run_id: Option<String>,
    /// Record this one undoes.
    pub reverses: Option<MergeId>,
}

impl RecordMerge {
    /// Creates an automatic-merge request; chain the `with_*` methods for the rest.
    #[must_use]
    pub fn new(
        org_id: OrgId,
        source: MergeSource,
        target: EntityId,
        reason: MergeReason,
        confidence: f32,
    ) -> Self {
        Self {
            org_id,
            source,
            target,
            reason,
            confidence,
            merged_by: None,
            moved_mentions: Vec::new(),
            extraction_run_id: None,
            reverses: None,
        }
    }

    /// Marks the request as approved by `user`.
    #[must_use]
    pub fn with_user(mut self, user: UserId) -> Self {
        self.merged_by = Some(user);
        self
    }

    /// Lists the mentions whose owner changed.
    #[must_use]
    pub fn with_moved_mentions(mut self, mentions: Vec<MentionId>) -> Self {
        self.moved_mentions = mentions;
        self
    }

    /// Names the extraction run behind an automatic merge.
    #[must_use]
    pub fn with_extraction_run(mut self, run_id: impl Into<String>) -> Self {
        self.extraction_run_id = Some(run_id.into());
        self
    }

    /// Marks the request as the reversal of `merge_id`.
    #[must_use]
    pub const fn reversing(mut self, merge_id: MergeId) -> Self {
        self.reverses = Some(merge_id);
        self
    }

    /// Validates the request and stamps a new id and timestamp.
    ///
    /// # Errors
    /// Returns [`ValidationError::ConfidenceOutOfRange`] for a bad confidence,
    /// [`ValidationError::ApproverRequired`] for a manual reason without a
    /// user and [`ValidationError::UnexpectedApprover`] for an automatic
    /// reason with one.
    pub fn into_record(self) -> Result<MergeRecord, ValidationError> {
        match (self.reason.is_automatic(), self.merged_by.is_some()) {
            (false, false) => {
                return Err(ValidationError::ApproverRequired {
                    reason: self.reason.as_str(),
                })
            }
            (true, true) => {
                return Err(ValidationError::UnexpectedApprover {
                    reason: self.reason.as_str(),
                })
            }
            _ => {}
        }
        Ok(MergeRecord {
            id: MergeId::new(),
            org_id: self.org_id,
            source: self.source,
            target: self.target,
            reason: self.reason,
            confidence: Confidence::new(self.confidence)?,
            merged_by: self.merged_by,
            moved_mentions: self.moved_mentions,
            extraction_run_id: self.extraction_run_id,
            reverses: self.reverses,
            recorded_at: Utc::now(),
        })
    }
}

/// Orders records most recent first, newest append winning timestamp ties.
fn newest_first(mut records: Vec<MergeRecord>) -> Vec<MergeRecord> {
    records.reverse();
    records.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
    records
}

/// Read and append access to the merge history.
#[derive(Clone)]
pub struct MergeHistory {
    store: Arc<dyn ResolutionStore>,
}

impl fmt::Debug for MergeHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeHistory").finish_non_exhaustive()
    }
}

impl MergeHistory {
    #[must_use]
    pub fn new(store: Arc<dyn ResolutionStore>) -> Self {
        Self { store }
    }

    /// Appends one record.
    ///
    /// # Errors
    /// `MergeError::Validation` for an out-of-range confidence,
    /// `MergeError::Storage` if the append fails.
    pub fn record_merge(&self, request: RecordMerge) -> Result<MergeRecord, MergeError> {
        let record = request.into_record()?;
        self.store.append_merge(record.clone())?;
        tracing::debug!(
            merge_id = %record.id,
            target = %record.target,
            reason = %record.reason,
            "merge recorded"
        );
        Ok(record)
    }

    /// Records targeting `entity_id`, most recent first.
    ///
    /// # Errors
    /// `MergeError::Storage` on backend failure.
    pub fn get_merge_history(
        &self,
        org_id: OrgId,
        entity_id: EntityId,
    ) -> Result<Vec<MergeRecord>, MergeError> {
        Ok(newest_first(self.store.merges_by_target(org_id, entity_id)?))
    }

    /// Records approved by `user_id`, most recent first.
    ///
    /// # Errors
    /// `MergeError::Storage` on backend failure.
    pub fn get_merges_by_user(
        &self,
        org_id: OrgId,
        user_id: &UserId,
    ) -> Result<Vec<MergeRecord>, MergeError> {
        Ok(newest_first(self.store.merges_by_user(org_id, user_id)?))
    }

    /// Records whose source is `source`, most recent first.
    ///
    /// # Errors
    /// `MergeError::Storage` on backend failure.
    pub fn get_merges_from(
        &self,
        org_id: OrgId,
        source: &MergeSource,
    ) -> Result<Vec<MergeRecord>, MergeError> {
        Ok(newest_first(self.store.merges_by_source(org_id, source)?))
    }

    /// Looks up one record.
    ///
    /// # Errors
    /// `MergeError::Storage` on backend failure.
    pub fn get(&self, merge_id: MergeId) -> Result<Option<MergeRecord>, MergeError> {
        Ok(self.store.get_merge(merge_id)?)
    }

    /// The record that reversed `merge_id`, if any.
    ///
    /// # Errors
    /// `MergeError::Storage` on backend failure.
    pub fn reversal_of(&self, merge_id: MergeId) -> Result<Option<MergeRecord>, MergeError> {
        Ok(self.store.reversal_of(merge_id)?)
    }
}
