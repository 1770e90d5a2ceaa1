//! Unified error handling for the territory tracker.
//!
//! Only session start and resume surface these errors to callers. Failures that
//! happen while a session is tracking are recorded as status data instead (see
//! [`crate::session::SessionView`]).

use thiserror::Error;

/// Unified error type for tracker operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrackerError {
    /// The storage collaborator refused to create the session
    #[error("Session start failed: {message}")]
    SessionStart { message: String },
    /// No participant identity could be resolved
    #[error("Missing player profile")]
    MissingIdentity,
    /// No city has been selected
    #[error("No city selected")]
    MissingCity,
    /// Operation is not valid in the current lifecycle state
    #[error("Invalid session state: expected {expected}, was {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
    /// Location provider failure (permission, timeout, unavailable)
    #[error("Location error ({code}): {message}")]
    Provider { code: String, message: String },
    /// Storage collaborator failure
    #[error("Storage error: {message}")]
    Storage { message: String },
    /// HTTP/API error
    #[error("{}", format_http(.message, .status_code))]
    Http {
        message: String,
        status_code: Option<u16>,
    },
    /// Payload could not be decoded
    #[error("Decode error: {message}")]
    Decode { message: String },
    /// Local buffer persistence error
    #[error("Persistence error: {message}")]
    Persistence { message: String },
    /// Configuration error
    #[error("Configuration error: {message}")]
    Config { message: String },
    /// Generic internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

fn format_http(message: &str, status_code: &Option<u16>) -> String {
    match status_code {
        Some(code) => format!("HTTP error ({}): {}", code, message),
        None => format!("HTTP error: {}", message),
    }
}

impl TrackerError {
    /// The collaborator-facing message without the variant prefix.
    ///
    /// Claim rejections are shown to the participant verbatim, so callers use
    /// this rather than `to_string()` when relaying a server message.
    pub fn message(&self) -> String {
        match self {
            TrackerError::SessionStart { message }
            | TrackerError::Storage { message }
            | TrackerError::Http { message, .. }
            | TrackerError::Decode { message }
            | TrackerError::Persistence { message }
            | TrackerError::Config { message }
            | TrackerError::Internal { message }
            | TrackerError::Provider { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Shorthand for hosts implementing their own storage collaborator.
    pub fn storage(message: impl Into<String>) -> Self {
        TrackerError::Storage {
            message: message.into(),
        }
    }

    pub(crate) fn persistence(message: impl Into<String>) -> Self {
        TrackerError::Persistence {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for TrackerError {
    fn from(e: serde_json::Error) -> Self {
        TrackerError::Decode {
            message: e.to_string(),
        }
    }
}

impl From<std::io::Error> for TrackerError {
    fn from(e: std::io::Error) -> Self {
        TrackerError::persistence(e.to_string())
    }
}

/// Result type alias for tracker operations.
pub type Result<T> = std::result::Result<T, TrackerError>;

/// Extension trait for converting Option to TrackerError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a missing identity error.
    fn ok_or_missing_identity(self) -> Result<T>;

    /// Convert Option to Result with generic internal error.
    fn ok_or_internal(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_missing_identity(self) -> Result<T> {
        self.ok_or(TrackerError::MissingIdentity)
    }

    fn ok_or_internal(self, message: &str) -> Result<T> {
        self.ok_or_else(|| TrackerError::Internal {
            message: message.to_string(),
        })
    }
}
