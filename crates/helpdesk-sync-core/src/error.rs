//! Error types for the helpdesk sync engine

use thiserror::Error;

/// Result type alias using the engine's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// How far an error is allowed to travel before it must be contained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// Contained inside one iteration of the per-message loop
    Message,
    /// Contained inside one department's pass
    Department,
    /// Allowed to stop the worker process
    Worker,
}

/// Main error type for the sync engine
#[derive(Error, Debug)]
pub enum Error {
    // Mailbox errors
    #[error("Connection failed to {host}: {reason}")]
    Connection { host: String, reason: String },

    #[error("Login rejected by {host} for {username}: {reason}")]
    AuthenticationFailed {
        host: String,
        username: String,
        reason: String,
    },

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    #[error("Failed to fetch message UID {uid}: {reason}")]
    Fetch { uid: u32, reason: String },

    #[error("Failed to parse message: {0}")]
    Parse(String),

    #[error("IMAP error: {0}")]
    Imap(String),

    // Store errors
    #[error("Ticket already exists for department {department_id}, UID {uid}")]
    DuplicateTicket { department_id: String, uid: u32 },

    #[error("Department registry unavailable: {0}")]
    Registry(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Department not found: {0}")]
    DepartmentNotFound(String),

    // Credential errors
    #[error("Credential error: {0}")]
    Credentials(String),

    // Collaborator errors
    #[error("Notification failed: {0}")]
    Notification(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    // Generic errors
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Build a connection error for a host
    pub fn connection(host: impl Into<String>, reason: impl ToString) -> Self {
        Error::Connection {
            host: host.into(),
            reason: reason.to_string(),
        }
    }

    /// Build a timeout error for a named operation
    pub fn timeout(operation: impl Into<String>, secs: u64) -> Self {
        Error::Timeout {
            operation: operation.into(),
            secs,
        }
    }

    /// Build a fetch error for a message UID
    pub fn fetch(uid: u32, reason: impl ToString) -> Self {
        Error::Fetch {
            uid,
            reason: reason.to_string(),
        }
    }

    /// Containment scope of this error
    pub fn scope(&self) -> ErrorScope {
        match self {
            Error::Fetch { .. } | Error::Parse(_) | Error::DuplicateTicket { .. } => {
                ErrorScope::Message
            }
            Error::Registry(_) | Error::Config(_) | Error::InvalidConfig { .. } => {
                ErrorScope::Worker
            }
            _ => ErrorScope::Department,
        }
    }

    /// Returns true for a unique-constraint rejection, which callers treat as "already done"
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Error::DuplicateTicket { .. })
    }

    /// Returns true if the mailbox connection itself dropped and a reconnect may succeed.
    /// Rejected logins and protocol errors are not retried.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            Error::Connection { .. } | Error::Timeout { .. } | Error::Io(_)
        )
    }

    /// Returns a stable error code for logs, summaries and the control surface
    pub fn code(&self) -> &'static str {
        match self {
            Error::Connection { .. } | Error::AuthenticationFailed { .. } => "CONNECTION_ERROR",
            Error::Timeout { .. } => "TIMEOUT",
            Error::Fetch { .. } => "FETCH_ERROR",
            Error::Parse(_) => "PARSE_ERROR",
            Error::Imap(_) => "IMAP_ERROR",
            Error::DuplicateTicket { .. } => "DUPLICATE_TICKET",
            Error::Registry(_) => "REGISTRY_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::DepartmentNotFound(_) => "DEPARTMENT_NOT_FOUND",
            Error::Credentials(_) => "CREDENTIALS_ERROR",
            Error::Notification(_) => "NOTIFICATION_ERROR",
            Error::Config(_) | Error::InvalidConfig { .. } => "CONFIG_ERROR",
            _ => "INTERNAL_ERROR",
        }
    }

    /// Returns an operator-facing hint for recoverable errors
    pub fn action_hint(&self) -> Option<&'static str> {
        match self {
            Error::Connection { .. } => Some("Check the department's IMAP host and port"),
            Error::AuthenticationFailed { .. } => {
                Some("Check the department's mailbox username and password; login is not retried")
            }
            Error::Timeout { .. } => Some("The mailbox server is slow or unreachable; the next tick retries"),
            Error::Credentials(_) => Some("Re-enter the department password or check the encryption key"),
            Error::Registry(_) | Error::Database(_) => Some("Check database connectivity"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scopes_follow_containment_rules() {
        assert_eq!(Error::fetch(7, "gone").scope(), ErrorScope::Message);
        assert_eq!(Error::Parse("bad mime".into()).scope(), ErrorScope::Message);
        assert_eq!(
            Error::connection("imap.example.com", "refused").scope(),
            ErrorScope::Department
        );
        assert_eq!(Error::timeout("connect", 20).scope(), ErrorScope::Department);
        assert_eq!(Error::Registry("down".into()).scope(), ErrorScope::Worker);
    }

    #[test]
    fn test_duplicate_is_not_connection_loss() {
        let err = Error::DuplicateTicket {
            department_id: "support".into(),
            uid: 101,
        };
        assert!(err.is_duplicate());
        assert!(!err.is_connection_loss());
        assert_eq!(err.code(), "DUPLICATE_TICKET");
    }

    #[test]
    fn test_rejected_login_is_not_retried() {
        let err = Error::AuthenticationFailed {
            host: "imap.example.com".into(),
            username: "support@example.com".into(),
            reason: "invalid credentials".into(),
        };
        assert_eq!(err.code(), "CONNECTION_ERROR");
        assert_eq!(err.scope(), ErrorScope::Department);
        assert!(!err.is_connection_loss());
        assert!(!Error::Imap("BAD command".into()).is_connection_loss());
    }

    #[test]
    fn test_timeout_treated_as_connection_failure() {
        let err = Error::timeout("greeting", 15);
        assert!(err.is_connection_loss());
        assert_eq!(err.to_string(), "greeting timed out after 15s");
        assert!(err.action_hint().is_some());
    }
}
