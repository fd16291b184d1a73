use labtrack_protocol::ErrorCode;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabError {
    pub code: ErrorCode,
    pub message: String,
    /// Offending input field, set for validation failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl LabError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            field: None,
        }
    }

    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Validation,
            message: message.into(),
            field: Some(field.to_string()),
        }
    }

    pub fn not_found(what: &str, id: impl fmt::Display) -> Self {
        Self::new(ErrorCode::NotFound, format!("{what} '{id}' not found"))
    }

    pub fn insufficient_volume(container: u64, requested: f64, remaining: f64) -> Self {
        Self::new(
            ErrorCode::InsufficientVolume,
            format!(
                "Container {container} holds {remaining} µL, cannot draw {requested} µL"
            ),
        )
    }

    pub fn state(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::State, message)
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Integrity, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unsupported, message)
    }
}

impl fmt::Display for LabError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{:?} ({field}): {}", self.code, self.message),
            None => write!(f, "{:?}: {}", self.code, self.message),
        }
    }
}

impl Error for LabError {}

impl From<std::io::Error> for LabError {
    fn from(err: std::io::Error) -> Self {
        LabError::new(ErrorCode::Io, err.to_string())
    }
}

impl From<serde_json::Error> for LabError {
    fn from(err: serde_json::Error) -> Self {
        LabError::new(ErrorCode::Validation, format!("Malformed JSON: {err}"))
    }
}

impl From<csv::Error> for LabError {
    fn from(err: csv::Error) -> Self {
        LabError::new(ErrorCode::Io, format!("CSV export failed: {err}"))
    }
}
