//! Error types for the climate stepper.

use thiserror::Error;

/// Result type for stepper operations.
pub type StepperResult<T> = Result<T, StepperError>;

/// Errors that can occur while correcting or stepping climate states.
#[derive(Debug, Error)]
pub enum StepperError {
    /// Tensor operation failed
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// None of the aliases of a canonical quantity are present
    #[error("Missing field: {field}")]
    MissingField { field: String },

    /// A field exists but has no value at the requested time index
    #[error("tensor \"{name}\" does not have values at t={time_index}")]
    MissingTime { name: String, time_index: usize },

    /// Shape mismatch
    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },

    /// Device mismatch
    #[error("Device mismatch: expected {expected:?}, got {got:?}")]
    DeviceMismatch {
        expected: candle_core::Device,
        got: candle_core::Device,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A field has no normalization statistics
    #[error("No normalization statistics for field: {name}")]
    MissingNormalization { name: String },

    /// Checkpoint could not be written or restored
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration error
    #[error("Invalid config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl StepperError {
    /// Create a missing field error
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    /// Create a shape mismatch error
    pub fn shape_mismatch(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Create an invalid config error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// True if this error means a required field was absent
    pub fn is_missing_field(&self) -> bool {
        matches!(self, Self::MissingField { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_missing_field_message() {
        let error = StepperError::missing_field("surface_pressure");
        assert_eq!(error.to_string(), "Missing field: surface_pressure");
        assert!(error.is_missing_field());
    }

    #[test]
    fn test_missing_time_message() {
        let error = StepperError::MissingTime {
            name: "DSWRFtoa".to_string(),
            time_index: 3,
        };
        assert_eq!(
            error.to_string(),
            "tensor \"DSWRFtoa\" does not have values at t=3"
        );
        assert!(!error.is_missing_field());
    }

    #[test]
    fn test_shape_mismatch_message() {
        let error = StepperError::shape_mismatch("[4, 8]", "[8, 4]");
        assert_eq!(error.to_string(), "Shape mismatch: expected [4, 8], got [8, 4]");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: StepperError = io_error.into();
        assert!(error.to_string().contains("IO error"));
    }

    #[test]
    fn test_yaml_error_conversion() {
        let yaml_error = serde_yaml::from_str::<serde_yaml::Value>("invalid: yaml: :::").unwrap_err();
        let error: StepperError = yaml_error.into();
        assert!(error.to_string().contains("Invalid config file"));
    }
}
