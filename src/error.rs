use serde::Serialize;
use thiserror::Error;

/// What went wrong inside a specific remote file or command operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SftpErrorKind {
    NotFound,
    PermissionDenied,
    /// Remote command exited non-zero and wrote to stderr
    CommandFailed { exit_code: i32, stderr: String },
    Timeout,
    Cancelled,
    Other,
}

/// Engine error types
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("SFTP error: {message}")]
    Sftp { kind: SftpErrorKind, message: String },

    #[error("Keychain error: {0}")]
    Keychain(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl EngineError {
    pub fn sftp(message: impl Into<String>) -> Self {
        EngineError::Sftp {
            kind: SftpErrorKind::Other,
            message: message.into(),
        }
    }

    pub fn not_found(path: &str) -> Self {
        EngineError::Sftp {
            kind: SftpErrorKind::NotFound,
            message: format!("No such file or directory: {}", path),
        }
    }

    pub fn permission_denied(path: &str) -> Self {
        EngineError::Sftp {
            kind: SftpErrorKind::PermissionDenied,
            message: format!("Permission denied: {}", path),
        }
    }

    pub fn command_failed(exit_code: i32, stderr: &str) -> Self {
        let stderr = stderr.trim().to_string();
        EngineError::Sftp {
            message: format!("Command failed with exit code {}: {}", exit_code, stderr),
            kind: SftpErrorKind::CommandFailed { exit_code, stderr },
        }
    }

    pub fn timeout(operation: &str, secs: u64) -> Self {
        EngineError::Sftp {
            kind: SftpErrorKind::Timeout,
            message: format!("{} timed out after {}s", operation, secs),
        }
    }

    pub fn cancelled(operation: &str) -> Self {
        EngineError::Sftp {
            kind: SftpErrorKind::Cancelled,
            message: format!("{} was cancelled", operation),
        }
    }

    /// Classify a transport-level failure message.
    ///
    /// Anything that smells of credentials being rejected becomes
    /// `Authentication`, which makes the caller drop cached secrets.
    pub fn from_transport(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("auth") || lower.contains("permission") || lower.contains("publickey") {
            EngineError::Authentication(message)
        } else {
            EngineError::Connection(message)
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::Sftp {
                kind: SftpErrorKind::NotFound,
                ..
            }
        )
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, EngineError::Authentication(_))
    }

    pub fn sftp_kind(&self) -> Option<&SftpErrorKind> {
        match self {
            EngineError::Sftp { kind, .. } => Some(kind),
            _ => None,
        }
    }
}

/// Serializable error for UI consumers
#[derive(Debug, Serialize)]
pub struct SerializableError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl From<&EngineError> for SerializableError {
    fn from(err: &EngineError) -> Self {
        let (code, message, details) = match err {
            EngineError::Connection(msg) => ("CONNECTION_ERROR", msg.clone(), None),
            EngineError::Authentication(msg) => (
                "AUTH_ERROR",
                "Authentication failed".to_string(),
                Some(msg.clone()),
            ),
            EngineError::Sftp { kind, message } => {
                let code = match kind {
                    SftpErrorKind::NotFound => "NOT_FOUND",
                    SftpErrorKind::PermissionDenied => "PERMISSION_DENIED",
                    SftpErrorKind::CommandFailed { .. } => "COMMAND_FAILED",
                    SftpErrorKind::Timeout => "TIMEOUT",
                    SftpErrorKind::Cancelled => "CANCELLED",
                    SftpErrorKind::Other => "SFTP_ERROR",
                };
                let details = match kind {
                    SftpErrorKind::CommandFailed { exit_code, .. } => {
                        Some(format!("exit code {}", exit_code))
                    }
                    _ => None,
                };
                (code, message.clone(), details)
            }
            EngineError::Keychain(msg) => ("KEYCHAIN_ERROR", msg.clone(), None),
            EngineError::Config(msg) => ("CONFIG_ERROR", msg.clone(), None),
            EngineError::Io(e) => ("IO_ERROR", e.to_string(), None),
            EngineError::Serialization(msg) => ("SERIALIZATION_ERROR", msg.clone(), None),
        };

        SerializableError {
            code: code.to_string(),
            message,
            details,
        }
    }
}

impl Serialize for EngineError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        SerializableError::from(self).serialize(serializer)
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(err: toml::de::Error) -> Self {
        EngineError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for EngineError {
    fn from(err: toml::ser::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<keyring::Error> for EngineError {
    fn from(err: keyring::Error) -> Self {
        EngineError::Keychain(err.to_string())
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Connection(err.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(EngineError::from_transport("Authentication failed (password)").is_authentication());
        assert!(EngineError::from_transport("Permission denied (publickey)").is_authentication());
        assert!(EngineError::from_transport("Username/PublicKey combination invalid").is_authentication());
        assert!(matches!(
            EngineError::from_transport("Connection reset by peer"),
            EngineError::Connection(_)
        ));
    }

    #[test]
    fn test_not_found_is_distinguishable() {
        let err = EngineError::not_found("/tmp/missing");
        assert!(err.is_not_found());
        assert!(!EngineError::sftp("boom").is_not_found());
        assert!(!EngineError::Connection("gone".into()).is_not_found());
    }

    #[test]
    fn test_serializable_codes() {
        let json = serde_json::to_value(EngineError::not_found("/x")).unwrap();
        assert_eq!(json["code"], "NOT_FOUND");

        let json = serde_json::to_value(EngineError::Authentication("bad key".into())).unwrap();
        assert_eq!(json["code"], "AUTH_ERROR");
        assert_eq!(json["details"], "bad key");

        let json = serde_json::to_value(EngineError::command_failed(2, "grep: oops\n")).unwrap();
        assert_eq!(json["code"], "COMMAND_FAILED");
        assert_eq!(json["details"], "exit code 2");
    }
}
