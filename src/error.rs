//! Error types shared by the connection layer and the sync engine.
//!
//! Both enums are `Clone` because the same error is handed to the event
//! listener and logged by the component that hit it.

use thiserror::Error;

/// Failure reported by an [`ImapConnection`](crate::mail::imap::ImapConnection).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ImapError {
    #[error("failed to connect to {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("authentication failed for {user}: {reason}")]
    Auth { user: String, reason: String },

    #[error("IMAP protocol error: {0}")]
    Protocol(String),

    #[error("mailbox not found: {0}")]
    MailboxNotFound(String),

    #[error("connection closed")]
    Closed,
}

impl ImapError {
    /// Whether another attempt on a fresh connection may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ImapError::Auth { .. } | ImapError::MailboxNotFound(_))
    }
}

impl From<async_imap::error::Error> for ImapError {
    fn from(err: async_imap::error::Error) -> Self {
        match err {
            async_imap::error::Error::ConnectionLost => ImapError::Closed,
            other => ImapError::Protocol(other.to_string()),
        }
    }
}

impl From<std::io::Error> for ImapError {
    fn from(err: std::io::Error) -> Self {
        ImapError::Protocol(format!("I/O error: {}", err))
    }
}

/// Errors surfaced to a [`SyncEventListener`](crate::sync::SyncEventListener).
///
/// None of them halts the session; they describe one mailbox or message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("mailbox discovery failed: {0}")]
    Discovery(#[source] ImapError),

    #[error("connection for mailbox {mailbox} failed: {source}")]
    Connection { mailbox: String, source: ImapError },

    #[error("fetching from mailbox {mailbox} failed: {source}")]
    Fetch { mailbox: String, source: ImapError },

    #[error("message {uid} in {mailbox} was returned without its source")]
    MissingSource { mailbox: String, uid: u32 },

    #[error("import of message {uid} from {mailbox} failed: {reason}")]
    Import {
        mailbox: String,
        uid: u32,
        reason: String,
    },
}

impl SyncError {
    /// Mailbox the error belongs to, if any.
    pub fn mailbox(&self) -> Option<&str> {
        match self {
            SyncError::Discovery(_) => None,
            SyncError::Connection { mailbox, .. }
            | SyncError::Fetch { mailbox, .. }
            | SyncError::MissingSource { mailbox, .. }
            | SyncError::Import { mailbox, .. } => Some(mailbox),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_errors_are_not_transient() {
        let auth = ImapError::Auth {
            user: "a@example.com".to_string(),
            reason: "bad password".to_string(),
        };
        assert!(!auth.is_transient());
        assert!(ImapError::Closed.is_transient());
        assert!(ImapError::Protocol("BYE".to_string()).is_transient());
    }

    #[test]
    fn test_sync_error_mailbox() {
        let err = SyncError::Fetch {
            mailbox: "INBOX".to_string(),
            source: ImapError::Closed,
        };
        assert_eq!(err.mailbox(), Some("INBOX"));
        assert_eq!(
            err.to_string(),
            "fetching from mailbox INBOX failed: connection closed"
        );
        assert_eq!(SyncError::Discovery(ImapError::Closed).mailbox(), None);
    }
}
