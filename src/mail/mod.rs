pub mod imap;
pub mod parser;
pub mod types;

pub use imap::{AsyncImapConnector, ImapConnection, ImapConnector, UidRange};
pub use types::{ImapMail, ImapMailbox, ImapMailboxStatus};
