//! Engine configuration.
//!
//! Every policy knob (merge threshold, bloom false-positive target, search
//! budget) is configuration rather than a constant. Configs deserialize from
//! TOML with per-field defaults, so a file only needs to name what it changes:
//!
//! ```toml
//! merge_threshold = 0.9
//!
//! [bloom]
//! expected_entities = 50000
//!
//! [search]
//! timeout_ms = 250
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default similarity a candidate must strictly exceed to be merged.
pub const DEFAULT_MERGE_THRESHOLD: f32 = 0.85;
/// Default bloom-filter false-positive target.
pub const DEFAULT_FALSE_POSITIVE_RATE: f64 = 0.10;

/// What to do when similarity cannot be computed for one candidate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityFailurePolicy {
    /// Drop the candidate and keep ranking the rest.
    #[default]
    Skip,
    /// Fail the whole candidate search.
    Abort,
}

/// How an entity's representative embedding is chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityEmbeddingPolicy {
    /// Embedding of the founding (canonical) mention.
    #[default]
    Canonical,
    /// Embedding of the most recently merged mention.
    MostRecent,
}

/// Bloom pre-filter sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BloomConfig {
    /// Expected distinct keys per organization at design capacity.
    pub expected_entities: usize,
    /// Target false-positive rate at design capacity.
    pub false_positive_rate: f64,
    /// Capacity multiplier applied when a saturated filter is rebuilt.
    pub rebuild_growth_factor: f64,
}

impl Default for BloomConfig {
    fn default() -> Self {
        Self {
            expected_entities: 10_000,
            false_positive_rate: DEFAULT_FALSE_POSITIVE_RATE,
            rebuild_growth_factor: 2.0,
        }
    }
}

/// Trigram text-match stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TextMatchConfig {
    /// Minimum trigram similarity for a text-match candidate.
    pub min_similarity: f32,
    /// Maximum candidates forwarded to embedding ranking.
    pub max_candidates: usize,
}

impl Default for TextMatchConfig {
    fn default() -> Self {
        Self {
            min_similarity: 0.3,
            max_candidates: 50,
        }
    }
}

/// Candidate-search worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Number of search workers.
    pub workers: usize,
    /// Maximum queued search jobs.
    pub queue_capacity: usize,
    /// Per-mention budget for embedding and candidate search calls.
    pub timeout_ms: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            timeout_ms: 100,
        }
    }
}

impl SearchConfig {
    /// Per-mention budget as a [`Duration`].
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionConfig {
    /// Candidates must have similarity strictly greater than this.
    pub merge_threshold: f32,
    /// Similarity at or above `1 - epsilon` is recorded as an exact text match.
    pub exact_match_epsilon: f32,
    /// Candidate embedding failure handling.
    pub similarity_failure: SimilarityFailurePolicy,
    /// Representative embedding selection.
    pub entity_embedding: EntityEmbeddingPolicy,
    /// Bloom pre-filter.
    pub bloom: BloomConfig,
    /// Trigram text match.
    pub text_match: TextMatchConfig,
    /// Search worker pool.
    pub search: SearchConfig,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            merge_threshold: DEFAULT_MERGE_THRESHOLD,
            exact_match_epsilon: 1e-4,
            similarity_failure: SimilarityFailurePolicy::default(),
            entity_embedding: EntityEmbeddingPolicy::default(),
            bloom: BloomConfig::default(),
            text_match: TextMatchConfig::default(),
            search: SearchConfig::default(),
        }
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

impl ResolutionConfig {
    /// Parses a TOML document; missing fields take their defaults.
    ///
    /// # Errors
    /// Returns [`ConfigError::Parse`] for malformed TOML and
    /// [`ConfigError::Invalid`] if the result fails [`Self::validate`].
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(input)?;
        cfg.validate()
    }

    /// Loads and validates a TOML config file.
    ///
    /// # Errors
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise as
    /// [`Self::from_toml_str`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Checks ranges and returns the config unchanged.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if !self.merge_threshold.is_finite() || !(0.0..1.0).contains(&self.merge_threshold) {
            return Err(invalid(
                "merge_threshold",
                format!("must be in [0.0, 1.0), got {}", self.merge_threshold),
            ));
        }
        if !self.exact_match_epsilon.is_finite() || !(0.0..=0.1).contains(&self.exact_match_epsilon) {
            return Err(invalid(
                "exact_match_epsilon",
                format!("must be in [0.0, 0.1], got {}", self.exact_match_epsilon),
            ));
        }
        if self.bloom.expected_entities == 0 {
            return Err(invalid("bloom.expected_entities", "must be at least 1"));
        }
        let fp = self.bloom.false_positive_rate;
        if !fp.is_finite() || fp <= 0.0 || fp >= 1.0 {
            return Err(invalid(
                "bloom.false_positive_rate",
                format!("must be in (0.0, 1.0), got {fp}"),
            ));
        }
        if !self.bloom.rebuild_growth_factor.is_finite() || self.bloom.rebuild_growth_factor <= 1.0 {
            return Err(invalid(
                "bloom.rebuild_growth_factor",
                format!("must be greater than 1.0, got {}", self.bloom.rebuild_growth_factor),
            ));
        }
        if !(0.0..=1.0).contains(&self.text_match.min_similarity) {
            return Err(invalid(
                "text_match.min_similarity",
                format!("must be in [0.0, 1.0], got {}", self.text_match.min_similarity),
            ));
        }
        if self.text_match.max_candidates == 0 {
            return Err(invalid("text_match.max_candidates", "must be at least 1"));
        }
        if self.search.workers == 0 {
            return Err(invalid("search.workers", "must be at least 1"));
        }
        if self.search.queue_capacity == 0 {
            return Err(invalid("search.queue_capacity", "must be at least 1"));
        }
        if self.search.timeout_ms == 0 {
            return Err(invalid("search.timeout_ms", "must be at least 1"));
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = ResolutionConfig::default().validate().unwrap();
        assert!((cfg.merge_threshold - 0.85).abs() < f32::EPSILON);
        assert!((cfg.bloom.false_positive_rate - 0.10).abs() < f64::EPSILON);
        assert_eq!(cfg.search.timeout(), Duration::from_millis(100));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg = ResolutionConfig::from_toml_str(
            r#"
            merge_threshold = 0.9
            similarity_failure = "abort"
            entity_embedding = "most_recent"

            [bloom]
            expected_entities = 500

            [search]
            timeout_ms = 250
            "#,
        )
        .unwrap();

        assert!((cfg.merge_threshold - 0.9).abs() < f32::EPSILON);
        assert_eq!(cfg.similarity_failure, SimilarityFailurePolicy::Abort);
        assert_eq!(cfg.entity_embedding, EntityEmbeddingPolicy::MostRecent);
        assert_eq!(cfg.bloom.expected_entities, 500);
        assert!((cfg.bloom.false_positive_rate - 0.10).abs() < f64::EPSILON);
        assert_eq!(cfg.search.timeout_ms, 250);
        assert_eq!(cfg.search.workers, 4);
        assert_eq!(cfg.text_match.max_candidates, 50);
    }

    #[test]
    fn test_rejects_bad_threshold() {
        let err = ResolutionConfig::from_toml_str("merge_threshold = 1.5").unwrap_err();
        assert!(err.to_string().contains("merge_threshold"));
    }

    #[test]
    fn test_rejects_bad_false_positive_rate() {
        let err = ResolutionConfig::from_toml_str("[bloom]\nfalse_positive_rate = 0.0").unwrap_err();
        assert!(err.to_string().contains("false_positive_rate"));
    }

    #[test]
    fn test_rejects_malformed_toml() {
        let err = ResolutionConfig::from_toml_str("merge_threshold = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = ResolutionConfig::load("/nonexistent/kyro-resolve.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolve.toml");
        std::fs::write(&path, "[text_match]\nmin_similarity = 0.5\n").unwrap();
        let cfg = ResolutionConfig::load(&path).unwrap();
        assert!((cfg.text_match.min_similarity - 0.5).abs() < f32::EPSILON);
    }
}
