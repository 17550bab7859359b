use std::fmt::Display;
use thiserror::Error;

pub mod codes;

pub use codes::{describe_error_code, ErrorCode};

/// The unified error type for jobguard
#[derive(Error, Debug)]
pub enum JobGuardError {
    #[error("[E{code:04}] Configuration error: {message}")]
    Config {
        code: u16,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Storage error: {message}")]
    Storage {
        code: u16,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Processing error: {message}")]
    Processing {
        code: u16,
        message: String,
        job_id: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Validation error: {message}")]
    Validation {
        code: u16,
        message: String,
        job_id: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Recovery error: {message}")]
    Recovery {
        code: u16,
        message: String,
        job_id: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl JobGuardError {
    /// Create a configuration error with specific code
    pub fn config_with_code(code: u16, message: impl Into<String>) -> Self {
        Self::Config {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Create a storage error with specific code
    pub fn storage_with_code(code: u16, message: impl Into<String>) -> Self {
        Self::Storage {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Create a processing error for a job
    pub fn processing(code: u16, message: impl Into<String>, job_id: Option<String>) -> Self {
        Self::Processing {
            code,
            message: message.into(),
            job_id,
            source: None,
        }
    }

    /// Create a validation error for a job
    pub fn validation(code: u16, message: impl Into<String>, job_id: Option<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
            job_id,
            source: None,
        }
    }

    /// Create a recovery error for a job
    pub fn recovery(code: u16, message: impl Into<String>, job_id: Option<String>) -> Self {
        Self::Recovery {
            code,
            message: message.into(),
            job_id,
            source: None,
        }
    }

    /// Add a source error to this error
    pub fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        match &mut self {
            Self::Config { source: src, .. }
            | Self::Storage { source: src, .. }
            | Self::Processing { source: src, .. }
            | Self::Validation { source: src, .. }
            | Self::Recovery { source: src, .. } => {
                *src = Some(source.into());
            }
        }
        self
    }

    /// Add context to the error message
    pub fn with_context(mut self, context: impl Display) -> Self {
        match &mut self {
            Self::Config { message, .. }
            | Self::Storage { message, .. }
            | Self::Processing { message, .. }
            | Self::Validation { message, .. }
            | Self::Recovery { message, .. } => {
                *message = format!("{}: {}", message, context);
            }
        }
        self
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } => 2,
            Self::Storage { .. } => 4,
            Self::Processing { .. } => 5,
            Self::Validation { .. } => 8,
            Self::Recovery { .. } => 9,
        }
    }

    /// Get the error code
    pub fn code(&self) -> u16 {
        match self {
            Self::Config { code, .. }
            | Self::Storage { code, .. }
            | Self::Processing { code, .. }
            | Self::Validation { code, .. }
            | Self::Recovery { code, .. } => *code,
        }
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            Self::Config { message, .. } => format!("Configuration problem: {}", message),
            Self::Storage { message, .. } => format!("Storage error: {}", message),
            Self::Processing {
                message, job_id, ..
            }
            | Self::Validation {
                message, job_id, ..
            }
            | Self::Recovery {
                message, job_id, ..
            } => match job_id {
                Some(id) => format!("Job {}: {}", id, message),
                None => message.clone(),
            },
        }
    }

    /// Temporary storage problems are worth retrying
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Storage { code, .. } if *code == ErrorCode::STORAGE_TEMPORARY
        )
    }
}

/// Type alias for Results using JobGuardError
pub type Result<T> = std::result::Result<T, JobGuardError>;

impl From<toml::de::Error> for JobGuardError {
    fn from(err: toml::de::Error) -> Self {
        JobGuardError::config_with_code(ErrorCode::CONFIG_INVALID_TOML, "Invalid TOML syntax")
            .with_source(err)
    }
}

impl From<serde_json::Error> for JobGuardError {
    fn from(err: serde_json::Error) -> Self {
        JobGuardError::storage_with_code(
            ErrorCode::STORAGE_SERIALIZATION_ERROR,
            "Invalid JSON payload",
        )
        .with_source(err)
    }
}

impl From<crate::storage::error::StorageError> for JobGuardError {
    fn from(err: crate::storage::error::StorageError) -> Self {
        use crate::storage::error::StorageError;

        let code = match &err {
            StorageError::Io(_) => ErrorCode::STORAGE_IO_ERROR,
            StorageError::NotFound(_) => ErrorCode::STORAGE_NOT_FOUND,
            StorageError::Conflict(_) => ErrorCode::STORAGE_ALREADY_EXISTS,
            StorageError::Serialization(_) => ErrorCode::STORAGE_SERIALIZATION_ERROR,
            StorageError::Timeout(_) | StorageError::Unavailable(_) => {
                ErrorCode::STORAGE_TEMPORARY
            }
            StorageError::SessionRevoked(_) => ErrorCode::STORAGE_SESSION_REVOKED,
            StorageError::Configuration(msg) => {
                return JobGuardError::config_with_code(ErrorCode::CONFIG_INVALID_VALUE, msg.clone())
            }
            StorageError::Database(_) | StorageError::Connection(_) => {
                ErrorCode::STORAGE_BACKEND_ERROR
            }
            StorageError::Other(_) => ErrorCode::STORAGE_GENERIC,
        };
        let message = err.to_string();
        JobGuardError::storage_with_code(code, message).with_source(err)
    }
}
