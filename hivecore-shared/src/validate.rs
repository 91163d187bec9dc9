//! Small payload validators used by protocol parsers.

// Layer 1: Standard library
// (none)

// Layer 2: Third-party
use thiserror::Error;

// Layer 3: Internal
// (none)

/// A payload field failed validation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Require a string field to be non-empty and within `max` bytes.
pub fn require_str(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }
    if value.len() > max {
        return Err(ValidationError::new(
            field,
            format!("exceeds {max} bytes ({} given)", value.len()),
        ));
    }
    Ok(())
}

/// Require a numeric field to sit inside an inclusive range.
pub fn require_range<T: PartialOrd + std::fmt::Display>(
    field: &'static str,
    value: T,
    min: T,
    max: T,
) -> Result<(), ValidationError> {
    if value < min || value > max {
        return Err(ValidationError::new(
            field,
            format!("{value} outside [{min}, {max}]"),
        ));
    }
    Ok(())
}

/// Require a positive (non-zero) amount, the common currency-delta check.
pub fn require_positive(field: &'static str, value: i64) -> Result<(), ValidationError> {
    if value <= 0 {
        return Err(ValidationError::new(field, format!("{value} must be > 0")));
    }
    Ok(())
}
