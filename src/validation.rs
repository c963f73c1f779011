/*!
 * Input Validation Module
 *
 * Centralized validation for everything that crosses into the voiceprint
 * store: user ids, embeddings, enrollment metadata and policy values.
 */
use std::collections::BTreeMap;
use thiserror::Error;

/// Longest accepted user id
pub const MAX_USER_ID_LEN: usize = 64;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Value too long: max {max}, got {actual}")]
    ValueTooLong { max: usize, actual: usize },

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Non-finite value at position {0}")]
    NonFinite(usize),
}

/// Validate user id (alphanumeric plus `_ - . @`, max 64 chars)
pub fn validate_user_id(user_id: &str) -> Result<&str, ValidationError> {
    if user_id.is_empty() {
        return Err(ValidationError::InvalidFormat(
            "User id cannot be empty".to_string(),
        ));
    }

    if user_id.len() > MAX_USER_ID_LEN {
        return Err(ValidationError::ValueTooLong {
            max: MAX_USER_ID_LEN,
            actual: user_id.len(),
        });
    }

    if !user_id
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '@'))
    {
        return Err(ValidationError::InvalidFormat(
            "User id can only contain letters, numbers, and _ - . @".to_string(),
        ));
    }

    Ok(user_id)
}

/// Validate embedding length and that every component is finite
pub fn validate_embedding(embedding: &[f32], dimension: usize) -> Result<(), ValidationError> {
    if embedding.len() != dimension {
        return Err(ValidationError::DimensionMismatch {
            expected: dimension,
            actual: embedding.len(),
        });
    }

    if let Some(position) = embedding.iter().position(|x| !x.is_finite()) {
        return Err(ValidationError::NonFinite(position));
    }

    Ok(())
}

/// Validate enrollment metadata (non-empty keys, finite values)
pub fn validate_metrics(metrics: &BTreeMap<String, f64>) -> Result<(), ValidationError> {
    for (key, value) in metrics {
        if key.is_empty() || key.chars().any(|c| c.is_control()) {
            return Err(ValidationError::InvalidFormat(format!(
                "Invalid metric name {:?}",
                key
            )));
        }
        if !value.is_finite() {
            return Err(ValidationError::InvalidRange(format!(
                "Metric '{}' must be finite, got {}",
                key, value
            )));
        }
    }
    Ok(())
}

/// Validate verification threshold (0.0 to 1.0)
pub fn validate_threshold(threshold: f64) -> Result<f64, ValidationError> {
    if !(0.0..=1.0).contains(&threshold) {
        return Err(ValidationError::InvalidRange(format!(
            "Verification threshold must be between 0.0 and 1.0, got {}",
            threshold
        )));
    }
    Ok(threshold)
}

/// Validate embedding dimension (1 to 4096)
pub fn validate_dimension(dimension: usize) -> Result<usize, ValidationError> {
    if !(1..=4096).contains(&dimension) {
        return Err(ValidationError::InvalidRange(format!(
            "Embedding dimension must be between 1 and 4096, got {}",
            dimension
        )));
    }
    Ok(dimension)
}
