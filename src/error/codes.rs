/// Error code registry for jobguard
///
/// Error codes are organized by category:
/// - 1000-1999: Configuration errors
/// - 3000-3999: Storage errors (queue backend and job store)
/// - 4000-4999: Processing errors
/// - 7000-7999: Validation errors
/// - 8000-8999: Recovery errors
pub struct ErrorCode;

impl ErrorCode {
    // Configuration errors (1000-1999)
    pub const CONFIG_NOT_FOUND: u16 = 1001;
    pub const CONFIG_INVALID_TOML: u16 = 1002;
    pub const CONFIG_INVALID_VALUE: u16 = 1005;
    pub const CONFIG_VALIDATION_FAILED: u16 = 1008;

    // Storage errors (3000-3999)
    pub const STORAGE_GENERIC: u16 = 3000;
    pub const STORAGE_IO_ERROR: u16 = 3001;
    pub const STORAGE_NOT_FOUND: u16 = 3004;
    pub const STORAGE_ALREADY_EXISTS: u16 = 3005;
    pub const STORAGE_TEMPORARY: u16 = 3009;
    pub const STORAGE_BACKEND_ERROR: u16 = 3010;
    pub const STORAGE_SERIALIZATION_ERROR: u16 = 3011;
    pub const STORAGE_SESSION_REVOKED: u16 = 3013;

    // Processing errors (4000-4999)
    pub const PROCESSING_JOB_NOT_FOUND: u16 = 4002;

    // Validation errors (7000-7999)
    pub const VALIDATION_REJECTED: u16 = 7001;
    pub const VALIDATION_INTEGRITY_VIOLATION: u16 = 7002;

    // Recovery errors (8000-8999)
    pub const RECOVERY_NOT_RECOVERABLE: u16 = 8001;
    pub const RECOVERY_ACTION_FAILED: u16 = 8002;
}

/// Get a human-readable description for an error code
pub fn describe_error_code(code: u16) -> &'static str {
    match code {
        1001 => "Configuration file not found",
        1002 => "Invalid TOML syntax in configuration",
        1005 => "Invalid value in configuration",
        1008 => "Configuration validation failed",

        3000 => "Generic storage error",
        3001 => "Storage I/O error",
        3004 => "Storage item not found",
        3005 => "Storage item already exists",
        3009 => "Temporary storage error",
        3010 => "Storage backend error",
        3011 => "Storage serialization error",
        3013 => "Store session was revoked",

        4002 => "Job not found",

        7001 => "Job rejected by validation",
        7002 => "Job data integrity violation",

        8001 => "Job is not recoverable",
        8002 => "Recovery action failed",

        _ => "Unknown error code",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_ranges() {
        assert!((1000..2000).contains(&ErrorCode::CONFIG_NOT_FOUND));
        assert!((3000..4000).contains(&ErrorCode::STORAGE_GENERIC));
        assert!((4000..5000).contains(&ErrorCode::PROCESSING_JOB_NOT_FOUND));
        assert!((7000..8000).contains(&ErrorCode::VALIDATION_REJECTED));
        assert!((8000..9000).contains(&ErrorCode::RECOVERY_ACTION_FAILED));
    }

    #[test]
    fn test_error_code_descriptions() {
        assert_eq!(describe_error_code(1001), "Configuration file not found");
        assert_eq!(describe_error_code(7002), "Job data integrity violation");
        assert_eq!(describe_error_code(65535), "Unknown error code");
    }
}
