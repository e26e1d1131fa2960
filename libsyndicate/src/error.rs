//! Error types for Syndicate

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyndicateError>;

#[derive(Error, Debug)]
pub enum SyndicateError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl SyndicateError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            SyndicateError::InvalidInput(_) => 3,
            SyndicateError::Config(_) | SyndicateError::Database(_) => 2,
            SyndicateError::Credential(_) | SyndicateError::NotFound(_) => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt row in {table}: {reason}")]
    InvalidRow { table: &'static str, reason: String },
}

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("No credentials stored for account {0}")]
    Missing(String),

    #[error("Account {0} is disconnected; reconnect required")]
    Inactive(String),

    #[error("Token refresh failed for account {account_id}: {cause}")]
    RefreshFailed {
        account_id: String,
        cause: RefreshError,
    },

    #[error("Master key not configured (set SYNDICATE_MASTER_KEY or credentials.master_key_file)")]
    MasterKeyNotSet,

    #[error("Invalid master key: {0}")]
    InvalidMasterKey(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption failed: ciphertext does not match the master key")]
    DecryptionFailed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CredentialError {
    /// Stable code recorded on jobs that fail because of this error
    pub fn error_code(&self) -> &'static str {
        match self {
            CredentialError::Missing(_) => "credential_missing",
            CredentialError::RefreshFailed {
                cause: RefreshError::Transient(_),
                ..
            } => "transient:refresh",
            CredentialError::Inactive(_) | CredentialError::RefreshFailed { .. } => {
                "reauth_required"
            }
            CredentialError::MasterKeyNotSet
            | CredentialError::InvalidMasterKey(_)
            | CredentialError::Encryption(_)
            | CredentialError::DecryptionFailed
            | CredentialError::Io(_) => "credential_unreadable",
        }
    }

    /// Whether the failure may clear up on its own (so the job is retried)
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CredentialError::RefreshFailed {
                cause: RefreshError::Transient(_),
                ..
            }
        )
    }
}

/// Failure reported by a platform's token endpoint
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("token endpoint unavailable: {0}")]
    Transient(String),

    #[error("grant revoked: {0}")]
    Revoked(String),
}

/// Typed failure returned by a platform adapter's publish call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("Rate limited by platform (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<i64> },

    #[error("Transient failure [{code}]: {message}")]
    Transient {
        code: String,
        message: String,
        retry_after_ms: Option<i64>,
    },

    #[error("Rejected [{code}]: {message}")]
    Permanent { code: String, message: String },

    #[error("Access token rejected: {0}")]
    Unauthorized(String),

    #[error("Adapter call timed out")]
    Timeout,
}

impl AdapterError {
    /// Stable code recorded on the job row for this failure
    pub fn error_code(&self) -> String {
        match self {
            AdapterError::RateLimited { .. } => "rate_limited".to_string(),
            AdapterError::Transient { code, .. } => format!("transient:{}", code),
            AdapterError::Permanent { code, .. } => format!("content_rejected:{}", code),
            AdapterError::Unauthorized(_) => "reauth_required".to_string(),
            AdapterError::Timeout => "timeout".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_invalid_input() {
        let error = SyndicateError::InvalidInput("empty caption".to_string());
        assert_eq!(error.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_config_and_database() {
        let config = SyndicateError::Config(ConfigError::MissingField("database.path".into()));
        assert_eq!(config.exit_code(), 2);

        let db = SyndicateError::Database(DbError::IoError(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "File not found",
        )));
        assert_eq!(db.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_operational_failures() {
        let missing = SyndicateError::Credential(CredentialError::Missing("acct-1".into()));
        assert_eq!(missing.exit_code(), 1);

        let not_found = SyndicateError::NotFound("job abc".into());
        assert_eq!(not_found.exit_code(), 1);
    }

    #[test]
    fn test_error_message_formatting() {
        let error = SyndicateError::Credential(CredentialError::RefreshFailed {
            account_id: "acct-1".into(),
            cause: RefreshError::Revoked("invalid_grant".into()),
        });
        assert_eq!(
            error.to_string(),
            "Credential error: Token refresh failed for account acct-1: grant revoked: invalid_grant"
        );
    }

    #[test]
    fn test_adapter_error_codes() {
        assert_eq!(
            AdapterError::RateLimited { retry_after_ms: None }.error_code(),
            "rate_limited"
        );
        assert_eq!(
            AdapterError::Transient {
                code: "502".into(),
                message: "bad gateway".into(),
                retry_after_ms: None,
            }
            .error_code(),
            "transient:502"
        );
        assert_eq!(
            AdapterError::Permanent {
                code: "policy".into(),
                message: "nudity".into(),
            }
            .error_code(),
            "content_rejected:policy"
        );
        assert_eq!(AdapterError::Unauthorized("401".into()).error_code(), "reauth_required");
        assert_eq!(AdapterError::Timeout.error_code(), "timeout");
    }

    #[test]
    fn test_credential_error_codes() {
        assert_eq!(
            CredentialError::Missing("a".into()).error_code(),
            "credential_missing"
        );
        assert_eq!(
            CredentialError::Inactive("a".into()).error_code(),
            "reauth_required"
        );

        let transient = CredentialError::RefreshFailed {
            account_id: "a".into(),
            cause: RefreshError::Transient("503".into()),
        };
        assert!(transient.is_transient());
        assert_eq!(transient.error_code(), "transient:refresh");

        let revoked = CredentialError::RefreshFailed {
            account_id: "a".into(),
            cause: RefreshError::Revoked("invalid_grant".into()),
        };
        assert!(!revoked.is_transient());
        assert_eq!(revoked.error_code(), "reauth_required");
    }

    #[test]
    fn test_error_conversion_from_credential_error() {
        let error: SyndicateError = CredentialError::DecryptionFailed.into();
        match error {
            SyndicateError::Credential(CredentialError::DecryptionFailed) => {}
            _ => panic!("Expected SyndicateError::Credential"),
        }
    }

    #[test]
    fn test_adapter_error_clone() {
        // Outcomes are cloned into events and job rows
        let original = AdapterError::Timeout;
        assert_eq!(original.clone(), original);
    }
}
