//! Bounded confidence scores.
//!
//! Merge decisions and mention extraction both carry a score in `[0, 1]`.
//! The newtype makes an out-of-range or NaN score unrepresentable once it has
//! passed validation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// A confidence score in the closed interval `[0.0, 1.0]`.
///
/// # Examples
///
/// ```
/// use kyro_resolve::Confidence;
///
/// let c = Confidence::new(0.92).unwrap();
/// assert!((c.value() - 0.92).abs() < f32::EPSILON);
/// assert!(Confidence::new(1.5).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f32", into = "f32")]
pub struct Confidence(f32);

impl Confidence {
    /// Validates and wraps a score.
    ///
    /// # Errors
    /// Returns [`ValidationError::ConfidenceOutOfRange`] for NaN, infinities and
    /// values outside `[0, 1]`.
    pub fn new(value: f32) -> Result<Self, ValidationError> {
        if !value.is_finite() || !(0.0..=1.0).contains(&value) {
            return Err(ValidationError::ConfidenceOutOfRange { value });
        }
        Ok(Self(value))
    }

    /// Full confidence. Used for operator decisions (splits, unmerges).
    #[must_use]
    pub const fn certain() -> Self {
        Self(1.0)
    }

    /// Clamps an arbitrary similarity into range. NaN maps to zero.
    #[must_use]
    pub fn saturating(value: f32) -> Self {
        if value.is_nan() {
            return Self(0.0);
        }
        Self(value.clamp(0.0, 1.0))
    }

    /// Returns the raw score.
    #[must_use]
    pub const fn value(self) -> f32 {
        self.0
    }
}

impl TryFrom<f32> for Confidence {
    type Error = ValidationError;

    fn try_from(value: f32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Confidence> for f32 {
    fn from(value: Confidence) -> Self {
        value.0
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}", self.0)
    }
}
