//! Error handling for the sync engine

/// Result type alias for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Error type spanning every subsystem of the engine.
///
/// Workers classify errors by kind: transient network failures are retried
/// with backoff, parse errors are retried once, auth failures stop the
/// account after a bounded number of attempts, and rejected mutations are
/// surfaced to the originating task without retry.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IMAP protocol errors
    #[error("IMAP error: {0}")]
    Imap(String),

    /// SMTP sending errors
    #[error("SMTP error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection-level failures (DNS, refused, timeout, TLS, partial read)
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Wire-protocol parse failures, usually from an abrupt disconnect
    #[error("Parse error: {message}")]
    Parse { message: String },

    /// Credential rejection; terminal for the account after bounded retries
    #[error("Authentication error: {message}")]
    Authentication { message: String },

    /// The server rejected a mutation (403, 412, 507 outside pagination)
    #[error("Server rejected mutation: status {status}: {message}")]
    Rejected { status: u16, message: String },

    /// An etag precondition failed (HTTP 412 on a DAV write)
    #[error("Etag conflict writing {href}")]
    EtagConflict { href: String },

    /// The DAV sync token was invalidated by the server
    #[error("Sync token rejected: {message}")]
    StaleSyncToken { message: String },

    /// A cached DAV collection URL stopped resolving
    #[error("Collection URL invalid: {url}")]
    CollectionVanished { url: String },

    /// Gmail account without IMAP enabled; terminal
    #[error("Gmail IMAP is not enabled for this account")]
    GmailImapDisabled,

    /// Resource not found
    #[error("Not found: {resource} with ID {id}")]
    NotFound { resource: String, id: String },

    /// Generic error with context
    #[error("Error: {message}")]
    Other { message: String },
}

impl SyncError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
        }
    }

    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// Whether a worker should sleep and retry rather than stop the account.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Connection { .. }
            | SyncError::Parse { .. }
            | SyncError::Io(_)
            | SyncError::StaleSyncToken { .. } => true,
            SyncError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            SyncError::Imap(_) => true,
            _ => false,
        }
    }

    /// Whether this failure indicates the machine is likely offline. The
    /// connection-error state is published so the UI can show an indicator.
    pub fn is_offline(&self) -> bool {
        match self {
            SyncError::Connection { .. } => true,
            SyncError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Terminal credential failures stop the worker for the account.
    pub fn requires_reauth(&self) -> bool {
        matches!(
            self,
            SyncError::Authentication { .. } | SyncError::GmailImapDisabled
        )
    }

    /// Error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            SyncError::Database(_) => "database",
            SyncError::Http(_) => "http",
            SyncError::Imap(_) => "imap",
            SyncError::Smtp(_) => "smtp",
            SyncError::Json(_) => "json",
            SyncError::Io(_) => "io",
            SyncError::Connection { .. } => "connection",
            SyncError::Parse { .. } => "parse",
            SyncError::Authentication { .. } => "auth",
            SyncError::Rejected { .. } => "rejected",
            SyncError::EtagConflict { .. } => "etag_conflict",
            SyncError::StaleSyncToken { .. } => "stale_sync_token",
            SyncError::CollectionVanished { .. } => "collection_vanished",
            SyncError::GmailImapDisabled => "gmail_imap_disabled",
            SyncError::NotFound { .. } => "not_found",
            SyncError::Other { .. } => "other",
        }
    }

    /// JSON form attached to a failed task so the client can inspect it.
    pub fn to_task_error_json(&self) -> serde_json::Value {
        serde_json::json!({
            "key": self.category(),
            "debuginfo": self.to_string(),
            "retryable": self.is_retryable(),
        })
    }
}

impl From<async_imap::error::Error> for SyncError {
    fn from(error: async_imap::error::Error) -> Self {
        use async_imap::error::Error;
        match &error {
            Error::Io(_) | Error::ConnectionLost => SyncError::Connection {
                message: error.to_string(),
            },
            Error::Parse(_) => SyncError::Parse {
                message: error.to_string(),
            },
            _ => SyncError::Imap(error.to_string()),
        }
    }
}

impl From<mailparse::MailParseError> for SyncError {
    fn from(error: mailparse::MailParseError) -> Self {
        SyncError::Parse {
            message: error.to_string(),
        }
    }
}

impl From<url::ParseError> for SyncError {
    fn from(error: url::ParseError) -> Self {
        SyncError::Other {
            message: format!("URL parsing error: {}", error),
        }
    }
}

impl From<quick_xml::Error> for SyncError {
    fn from(error: quick_xml::Error) -> Self {
        SyncError::Parse {
            message: format!("XML: {}", error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_errors_are_retryable_and_offline() {
        let err = SyncError::connection("ECONNREFUSED");
        assert!(err.is_retryable());
        assert!(err.is_offline());
        assert!(!err.requires_reauth());
    }

    #[test]
    fn auth_errors_are_terminal() {
        let err = SyncError::authentication("LOGIN failed");
        assert!(!err.is_retryable());
        assert!(err.requires_reauth());
    }

    #[test]
    fn rejected_mutations_are_not_retryable() {
        let err = SyncError::rejected(412, "precondition failed");
        assert!(!err.is_retryable());
        assert_eq!(err.category(), "rejected");
    }
}
