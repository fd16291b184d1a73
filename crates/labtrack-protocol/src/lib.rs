//! Machine-readable contracts shared by the labtrack engine and its front ends.
//!
//! Everything here is plain serde data: identifiers, error codes and the
//! capability description a presentation layer can query before it builds
//! operation payloads.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const PROTOCOL_VERSION: &str = "labtrack.v1";

pub type ContainerId = u64;
pub type CompositionId = u64;
pub type ProcessId = u64;
pub type PlateId = u64;
pub type PlateConfigurationId = u64;
pub type EquipmentId = u64;
pub type EquipmentTypeId = u64;
pub type ReagentId = u64;
pub type ReagentTypeId = u64;
pub type UserId = u64;
pub type OpId = String;
pub type RunId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Malformed input shape (percentage sums, matrix shapes, bounds).
    Validation,
    /// A referenced id does not resolve.
    NotFound,
    /// A draw exceeds the container's remaining volume.
    InsufficientVolume,
    /// Out-of-order or immutable-field access.
    State,
    /// A storage constraint was violated at commit time.
    Integrity,
    Io,
    Unsupported,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::InsufficientVolume => "insufficient_volume",
            Self::State => "state",
            Self::Integrity => "integrity",
            Self::Io => "io",
            Self::Unsupported => "unsupported",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub protocol_version: String,
    pub supported_operations: Vec<String>,
    pub pooling_functions: Vec<String>,
    pub sample_sheet_assays: Vec<String>,
    pub transactional_operations: bool,
}
