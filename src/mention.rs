//! Mention records: the evidence entity resolution consumes.
//!
//! A mention is one occurrence of a candidate entity in a source document,
//! produced by the extraction pipeline. Every field except
//! [`Mention::resolved_entity_id`] is write-once; stores reject writes that
//! would change them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::confidence::Confidence;
use crate::entity::EntityType;
use crate::error::ValidationError;
use crate::ids::{EntityId, MentionId, OrgId};
use crate::normalize::normalize;

/// Character offsets of a mention inside its source document (`start..end`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TextSpan {
    /// Inclusive start offset.
    pub start: usize,
    /// Exclusive end offset.
    pub end: usize,
}

impl TextSpan {
    /// Creates a span.
    ///
    /// # Errors
    /// Returns [`ValidationError::InvalidSpan`] if `start > end`.
    pub fn new(start: usize, end: usize) -> Result<Self, ValidationError> {
        if start > end {
            return Err(ValidationError::InvalidSpan { start, end });
        }
        Ok(Self { start, end })
    }

    /// Length in characters.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.end - self.start
    }

    /// Returns true for a zero-length span.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Where a mention came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Provenance {
    /// Extraction run that produced the mention.
    pub extraction_run_id: String,
    /// Document the mention was found in.
    pub source_document_id: String,
    /// Offsets inside the document.
    pub span: TextSpan,
    /// Hash of the raw model response that produced the mention.
    pub response_hash: String,
}

impl Provenance {
    /// Creates provenance, hashing the raw model response with blake3.
    #[must_use]
    pub fn new(
        extraction_run_id: impl Into<String>,
        source_document_id: impl Into<String>,
        span: TextSpan,
        raw_response: &str,
    ) -> Self {
        Self {
            extraction_run_id: extraction_run_id.into(),
            source_document_id: source_document_id.into(),
            span,
            response_hash: Self::hash_response(raw_response),
        }
    }

    /// Stable hex digest of a raw model response.
    #[must_use]
    pub fn hash_response(raw_response: &str) -> String {
        blake3::hash(raw_response.as_bytes()).to_hex().to_string()
    }
}

/// One extracted occurrence of a candidate entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mention {
    /// Unique identifier.
    pub id: MentionId,
    /// Owning organization.
    pub org_id: OrgId,
    /// Text exactly as extracted.
    pub raw_text: String,
    /// Ontology class or tag assigned by extraction.
    pub mention_type: EntityType,
    /// Extraction confidence.
    pub confidence: Confidence,
    /// Extraction provenance.
    pub provenance: Provenance,
    /// When extraction recorded the mention. Batches resolve in this order.
    pub created_at: DateTime<Utc>,
    /// Entity the mention currently resolves to; the only mutable field.
    #[serde(default)]
    pub resolved_entity_id: Option<EntityId>,
}

impl Mention {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> MentionBuilder {
        MentionBuilder::default()
    }

    /// Normalized form of [`Mention::raw_text`].
    #[must_use]
    pub fn normalized_text(&self) -> String {
        normalize(&self.raw_text)
    }

    /// Returns true once the mention has been assigned to an entity.
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        self.resolved_entity_id.is_some()
    }

    /// Returns true if `other` differs from `self` only in `resolved_entity_id`.
    #[must_use]
    pub fn same_evidence(&self, other: &Self) -> bool {
        self.id == other.id
            && self.org_id == other.org_id
            && self.raw_text == other.raw_text
            && self.mention_type == other.mention_type
            && self.confidence == other.confidence
            && self.provenance == other.provenance
            && self.created_at == other.created_at
    }
}

/// Builder for [`Mention`].
#[derive(Debug, Default)]
pub struct MentionBuilder {
    id: Option<MentionId>,
    org_id: Option<OrgId>,
    raw_text: Option<String>,
    mention_type: Option<EntityType>,
    confidence: Option<f32>,
    provenance: Option<Provenance>,
    created_at: Option<DateTime<Utc>>,
}

impl MentionBuilder {
    /// Sets an explicit id (defaults to a random one).
    #[must_use]
    pub fn id(mut self, id: MentionId) -> Self {
        self.id = Some(id);
        self
    }

    /// Sets the organization scope.
    #[must_use]
    pub fn org(mut self, org_id: OrgId) -> Self {
        self.org_id = Some(org_id);
        self
    }

    /// Sets the extracted text.
    #[must_use]
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.raw_text = Some(text.into());
        self
    }

    /// Sets the mention type.
    #[must_use]
    pub fn mention_type(mut self, mention_type: EntityType) -> Self {
        self.mention_type = Some(mention_type);
        self
    }

    /// Sets the extraction confidence.
    #[must_use]
    pub fn confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// Sets provenance.
    #[must_use]
    pub fn provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = Some(provenance);
        self
    }

    /// Overrides the creation timestamp (defaults to now).
    #[must_use]
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    /// Validates and builds the mention.
    ///
    /// # Errors
    /// - `MissingField` if org, text, type, confidence or provenance is unset
    /// - `EmptyField` if the text normalizes to nothing
    /// - `ConfidenceOutOfRange` for an invalid confidence
    pub fn build(self) -> Result<Mention, ValidationError> {
        let org_id = self.org_id.ok_or(ValidationError::MissingField {
            field: "org_id".to_string(),
        })?;

        let raw_text = self.raw_text.ok_or(ValidationError::MissingField {
            field: "raw_text".to_string(),
        })?;

        if normalize(&raw_text).is_empty() {
            return Err(ValidationError::EmptyField { field: "raw_text" });
        }

        let mention_type = self.mention_type.ok_or(ValidationError::MissingField {
            field: "mention_type".to_string(),
        })?;

        let confidence = Confidence::new(self.confidence.ok_or(ValidationError::MissingField {
            field: "confidence".to_string(),
        })?)?;

        let provenance = self.provenance.ok_or(ValidationError::MissingField {
            field: "provenance".to_string(),
        })?;

        if provenance.extraction_run_id.trim().is_empty() {
            return Err(ValidationError::EmptyField {
                field: "extraction_run_id",
            });
        }

        Ok(Mention {
            id: self.id.unwrap_or_else(MentionId::new),
            org_id,
            raw_text,
            mention_type,
            confidence,
            provenance,
            created_at: self.created_at.unwrap_or_else(Utc::now),
            resolved_entity_id: None,
        })
    }
}
