//! Error types for credsync
//!
//! All modules use `CredsyncResult<T>` as their return type.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for credsync operations
pub type CredsyncResult<T> = Result<T, CredsyncError>;

/// All errors that can occur in credsync
#[derive(Error, Debug)]
pub enum CredsyncError {
    // Credential source errors
    #[error("Failed to acquire credential source client: {0}")]
    ClientAcquisition(String),

    #[error("Credential source request failed for {path}: {reason}")]
    Source { path: String, reason: String },

    #[error("Credential source denied access to {path}")]
    Forbidden { path: String },

    #[error("Lease {lease_id} truncated: requested {requested}s, granted {granted}s")]
    LeaseTruncated {
        lease_id: String,
        requested: u64,
        granted: u64,
    },

    #[error("Static credential rotation still in progress for {path}")]
    RotationInProgress { path: String },

    // Task declaration errors
    #[error("Invalid field {field}: {reason}")]
    FieldValidation { field: String, reason: String },

    #[error("Unsupported request method: {0}")]
    UnsupportedMethod(String),

    #[error("Failed to set up transformation for {task}: {reason}")]
    Transformation { task: String, reason: String },

    // Destination and store errors
    #[error("Failed to write destination {destination}: {reason}")]
    DestinationWrite { destination: String, reason: String },

    #[error("Resource store error for {task}: {reason}")]
    Store { task: String, reason: String },

    // Watcher errors
    #[error("Event stream error: {0}")]
    EventStream(String),

    #[error("Failed to decode event message: {0}")]
    EventDecode(String),

    #[error("Timed out after {timeout:?} waiting for watcher of {task} to stop")]
    WatcherStopTimeout { task: String, timeout: Duration },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CredsyncError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a credential source error
    pub fn source(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Source {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a field validation error
    pub fn field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::FieldValidation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Check if error is a transient credential source failure
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ClientAcquisition(_)
                | Self::Source { .. }
                | Self::Forbidden { .. }
                | Self::RotationInProgress { .. }
                | Self::EventStream(_)
        )
    }

    /// Check if the credential source rejected the client's identity
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::Forbidden { .. })
    }

    /// Configuration errors won't resolve without a declaration change
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::FieldValidation { .. } | Self::UnsupportedMethod(_)
        )
    }

    /// Structured reason code recorded in task status conditions
    pub fn reason(&self) -> &'static str {
        match self {
            Self::ClientAcquisition(_) => "ClientError",
            Self::Source { .. } | Self::Forbidden { .. } => "SecretSyncError",
            Self::LeaseTruncated { .. } => "LeaseTruncated",
            Self::RotationInProgress { .. } => "RotationInProgress",
            Self::FieldValidation { .. } | Self::UnsupportedMethod(_) => "FieldValidationError",
            Self::Transformation { .. } => "TransformationError",
            Self::DestinationWrite { .. } => "SecretWriteError",
            Self::Store { .. } => "StatusUpdateError",
            Self::EventStream(_) | Self::EventDecode(_) | Self::WatcherStopTimeout { .. } => {
                "EventWatcherError"
            }
            Self::ConfigInvalid { .. }
            | Self::ConfigDirCreate { .. }
            | Self::TomlParse(_)
            | Self::TomlSerialize(_) => "ConfigError",
            Self::Io { .. } | Self::Json(_) | Self::Internal(_) => "InternalError",
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::ConfigInvalid { .. } => Some("Run: credsync config init --force"),
            Self::Forbidden { .. } => Some("Check the policy attached to the auth role"),
            Self::UnsupportedMethod(_) => Some("Supported request methods: GET, PUT, POST"),
            _ => None,
        }
    }
}

/// A failed sync invocation: the error plus when to try again
#[derive(Error, Debug)]
#[error("{error} (retry in {retry_after:?})")]
pub struct SyncFailure {
    pub retry_after: Duration,
    #[source]
    pub error: CredsyncError,
}
