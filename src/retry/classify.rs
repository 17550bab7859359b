//! Fault classification
//!
//! A fault is classified by its typed kind first, then by a keyword scan of
//! the message, and falls back to `ProcessingError`. Classification is pure.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::storage::StorageError;

/// Failure taxonomy that drives retry strategy and dead-letter statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FaultCategory {
    TransientNetwork,
    QueueBackendConnection,
    DatabaseConnection,
    ResourceExhaustion,
    TaskValidation,
    ProcessingError,
    SecurityError,
    SystemError,
}

impl FaultCategory {
    pub const ALL: [FaultCategory; 8] = [
        FaultCategory::TransientNetwork,
        FaultCategory::QueueBackendConnection,
        FaultCategory::DatabaseConnection,
        FaultCategory::ResourceExhaustion,
        FaultCategory::TaskValidation,
        FaultCategory::ProcessingError,
        FaultCategory::SecurityError,
        FaultCategory::SystemError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FaultCategory::TransientNetwork => "TransientNetwork",
            FaultCategory::QueueBackendConnection => "QueueBackendConnection",
            FaultCategory::DatabaseConnection => "DatabaseConnection",
            FaultCategory::ResourceExhaustion => "ResourceExhaustion",
            FaultCategory::TaskValidation => "TaskValidation",
            FaultCategory::ProcessingError => "ProcessingError",
            FaultCategory::SecurityError => "SecurityError",
            FaultCategory::SystemError => "SystemError",
        }
    }
}

impl fmt::Display for FaultCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FaultCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FaultCategory::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown fault category '{}'", s))
    }
}

/// Typed origin of a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    ConnectionError,
    Timeout,
    Network,
    BackendConnection,
    DatabaseConnection,
    Memory,
    ResourceLimit,
    Validation,
    /// Integrity-hash mismatch detected mid-processing
    DataIntegrity,
    Permission,
    Unauthorized,
    System,
    /// Anything without a typed mapping; classified by message
    Other,
}

impl FaultKind {
    /// Name recorded as the fault's type when none is supplied
    pub fn type_name(self) -> &'static str {
        match self {
            FaultKind::ConnectionError => "ConnectionError",
            FaultKind::Timeout => "TimeoutError",
            FaultKind::Network => "NetworkError",
            FaultKind::BackendConnection => "QueueBackendConnectionError",
            FaultKind::DatabaseConnection => "DatabaseConnectionError",
            FaultKind::Memory => "MemoryError",
            FaultKind::ResourceLimit => "ResourceLimitError",
            FaultKind::Validation => "ValidationError",
            FaultKind::DataIntegrity => "DataIntegrityViolation",
            FaultKind::Permission => "PermissionError",
            FaultKind::Unauthorized => "UnauthorizedError",
            FaultKind::System => "SystemError",
            FaultKind::Other => "Error",
        }
    }

    /// Map a reported type name onto a kind
    pub fn from_type_name(name: &str) -> FaultKind {
        match name {
            "ConnectionError" | "ConnectionRefusedError" | "ConnectionResetError" => {
                FaultKind::ConnectionError
            }
            "TimeoutError" | "Timeout" => FaultKind::Timeout,
            "NetworkError" => FaultKind::Network,
            "QueueBackendConnectionError" | "RedisConnectionError" | "BrokerConnectionError" => {
                FaultKind::BackendConnection
            }
            "DatabaseConnectionError" | "OperationalError" => FaultKind::DatabaseConnection,
            "MemoryError" | "OutOfMemoryError" => FaultKind::Memory,
            "ResourceLimitError" | "ResourceExhaustedError" => FaultKind::ResourceLimit,
            "ValidationError" | "ValueError" => FaultKind::Validation,
            "DataIntegrityViolation" => FaultKind::DataIntegrity,
            "PermissionError" | "PermissionDenied" => FaultKind::Permission,
            "UnauthorizedError" | "Unauthorized" => FaultKind::Unauthorized,
            "SystemError" | "OSError" => FaultKind::System,
            _ => FaultKind::Other,
        }
    }

    /// Static kind -> category table
    fn category(self) -> Option<FaultCategory> {
        match self {
            FaultKind::ConnectionError | FaultKind::Timeout | FaultKind::Network => {
                Some(FaultCategory::TransientNetwork)
            }
            FaultKind::BackendConnection => Some(FaultCategory::QueueBackendConnection),
            FaultKind::DatabaseConnection => Some(FaultCategory::DatabaseConnection),
            FaultKind::Memory | FaultKind::ResourceLimit => Some(FaultCategory::ResourceExhaustion),
            FaultKind::Validation | FaultKind::DataIntegrity => Some(FaultCategory::TaskValidation),
            FaultKind::Permission | FaultKind::Unauthorized => Some(FaultCategory::SecurityError),
            FaultKind::System => Some(FaultCategory::SystemError),
            FaultKind::Other => None,
        }
    }

    /// Faults that are never retried whatever their category
    pub fn is_permission_or_validation(self) -> bool {
        matches!(
            self,
            FaultKind::Permission
                | FaultKind::Unauthorized
                | FaultKind::Validation
                | FaultKind::DataIntegrity
        )
    }

    pub fn is_resource_exhaustion(self) -> bool {
        matches!(self, FaultKind::Memory | FaultKind::ResourceLimit)
    }
}

/// A structured fault description: type tag plus message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub kind: FaultKind,
    pub type_name: String,
    pub message: String,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            type_name: kind.type_name().to_string(),
            message: message.into(),
        }
    }

    /// Fault reported by type name, e.g. from a foreign worker
    pub fn from_type_name(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        let type_name = type_name.into();
        Self {
            kind: FaultKind::from_type_name(&type_name),
            type_name,
            message: message.into(),
        }
    }

    pub fn with_type_name(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = type_name.into();
        self
    }

    pub fn category(&self) -> FaultCategory {
        classify(self)
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

impl std::error::Error for Fault {}

impl From<&StorageError> for Fault {
    fn from(err: &StorageError) -> Self {
        let kind = match err {
            StorageError::Connection(_) | StorageError::Unavailable(_) => {
                FaultKind::BackendConnection
            }
            StorageError::Timeout(_) => FaultKind::Timeout,
            StorageError::Database(_) => FaultKind::DatabaseConnection,
            StorageError::Serialization(_) => FaultKind::DataIntegrity,
            StorageError::NotFound(_) | StorageError::Conflict(_) => FaultKind::Validation,
            StorageError::Io(_)
            | StorageError::Configuration(_)
            | StorageError::SessionRevoked(_) => FaultKind::System,
            StorageError::Other(_) => FaultKind::Other,
        };
        Fault::new(kind, err.to_string())
    }
}

impl From<StorageError> for Fault {
    fn from(err: StorageError) -> Self {
        Fault::from(&err)
    }
}

impl From<anyhow::Error> for Fault {
    fn from(err: anyhow::Error) -> Self {
        Fault::new(FaultKind::Other, format!("{:#}", err))
    }
}

const KEYWORDS: &[(&[&str], FaultCategory)] = &[
    (
        &["connection", "timeout", "network"],
        FaultCategory::TransientNetwork,
    ),
    (
        &["memory", "resource", "limit"],
        FaultCategory::ResourceExhaustion,
    ),
    (&["permission", "unauthorized"], FaultCategory::SecurityError),
    (&["invalid", "validation"], FaultCategory::TaskValidation),
];

/// Map a fault to its category: typed table, then message keywords, then
/// `ProcessingError`
pub fn classify(fault: &Fault) -> FaultCategory {
    if let Some(category) = fault.kind.category() {
        return category;
    }
    let message = fault.message.to_lowercase();
    KEYWORDS
        .iter()
        .find(|(words, _)| words.iter().any(|w| message.contains(w)))
        .map(|(_, category)| *category)
        .unwrap_or(FaultCategory::ProcessingError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_kind_wins_over_message() {
        let fault = Fault::new(FaultKind::Permission, "connection refused");
        assert_eq!(classify(&fault), FaultCategory::SecurityError);
    }

    #[test]
    fn test_keyword_scan_is_case_insensitive_and_ordered() {
        let cases = [
            ("Upstream Connection reset", FaultCategory::TransientNetwork),
            ("request TIMEOUT after 30s", FaultCategory::TransientNetwork),
            ("rate limit hit", FaultCategory::ResourceExhaustion),
            ("out of memory", FaultCategory::ResourceExhaustion),
            ("Unauthorized token", FaultCategory::SecurityError),
            ("invalid caption length", FaultCategory::TaskValidation),
            ("connection limit reached", FaultCategory::TransientNetwork),
            ("model returned garbage", FaultCategory::ProcessingError),
        ];
        for (message, expected) in cases {
            let fault = Fault::new(FaultKind::Other, message);
            assert_eq!(classify(&fault), expected, "message: {}", message);
        }
    }

    #[test]
    fn test_type_names_map_to_kinds() {
        let fault = Fault::from_type_name("ConnectionError", "boom");
        assert_eq!(fault.kind, FaultKind::ConnectionError);
        assert_eq!(fault.category(), FaultCategory::TransientNetwork);

        let fault = Fault::from_type_name("RedisConnectionError", "boom");
        assert_eq!(fault.category(), FaultCategory::QueueBackendConnection);

        let fault = Fault::from_type_name("KeyError", "missing thing");
        assert_eq!(fault.kind, FaultKind::Other);
        assert_eq!(fault.type_name, "KeyError");
        assert_eq!(fault.category(), FaultCategory::ProcessingError);
    }

    #[test]
    fn test_storage_errors_classify() {
        let fault = Fault::from(&StorageError::unavailable("redis down"));
        assert_eq!(fault.category(), FaultCategory::QueueBackendConnection);
        let fault = Fault::from(&StorageError::database("pool exhausted"));
        assert_eq!(fault.category(), FaultCategory::DatabaseConnection);
    }

    #[test]
    fn test_category_parse_round_trips_display() {
        for category in FaultCategory::ALL {
            assert_eq!(category.to_string().parse::<FaultCategory>(), Ok(category));
        }
    }
}
