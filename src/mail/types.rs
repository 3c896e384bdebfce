use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct MailFlags: u32 {
        const SEEN = 0b00000001;
        const ANSWERED = 0b00000010;
        const FLAGGED = 0b00000100;
        const DELETED = 0b00001000;
        const DRAFT = 0b00010000;
        const RECENT = 0b00100000;
    }
}

/// RFC 6154 special-use role of a mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpecialUse {
    Inbox,
    Sent,
    Drafts,
    Trash,
    Archive,
    Junk,
    All,
    Flagged,
}

impl SpecialUse {
    /// Parse a LIST attribute such as `\Sent`. Matching is case-insensitive.
    pub fn from_attribute(attribute: &str) -> Option<Self> {
        let name = attribute.trim_start_matches('\\');
        let special_use = match name.to_ascii_lowercase().as_str() {
            "inbox" => SpecialUse::Inbox,
            "sent" => SpecialUse::Sent,
            "drafts" => SpecialUse::Drafts,
            "trash" => SpecialUse::Trash,
            "archive" => SpecialUse::Archive,
            "junk" => SpecialUse::Junk,
            "all" => SpecialUse::All,
            "flagged" => SpecialUse::Flagged,
            _ => return None,
        };
        Some(special_use)
    }
}

/// One node of the server's mailbox tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImapMailbox {
    pub name: String,
    pub path: String,
    pub delimiter: Option<String>,
    pub special_use: Option<SpecialUse>,
    /// False for `\Noselect` / `\NonExistent` container nodes.
    pub selectable: bool,
    pub children: Vec<ImapMailbox>,
}

impl ImapMailbox {
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            name: path.clone(),
            path,
            delimiter: None,
            special_use: None,
            selectable: true,
            children: Vec::new(),
        }
    }

    /// Depth-first walk over this node and all of its descendants.
    pub fn walk(&self) -> Vec<&ImapMailbox> {
        let mut nodes = vec![self];
        for child in &self.children {
            nodes.extend(child.walk());
        }
        nodes
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImapMailboxStatus {
    pub path: String,
    pub message_count: Option<u32>,
    pub uid_validity: Option<u32>,
    pub uid_next: Option<u32>,
    /// Only present when the server advertises CONDSTORE.
    pub highest_mod_seq: Option<u64>,
}

/// Raw message as returned by a UID FETCH, before parsing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedMessage {
    pub seq: u32,
    pub uid: u32,
    pub size: Option<u32>,
    pub mod_seq: Option<u64>,
    pub flags: MailFlags,
    /// Non-system flags and keywords, e.g. `$Forwarded` or server labels.
    pub keywords: Vec<String>,
    pub internal_date: Option<DateTime<Utc>>,
    pub source: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailAddress {
    pub name: Option<String>,
    pub address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailEnvelope {
    pub date: Option<DateTime<Utc>>,
    pub subject: Option<String>,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub from: Vec<MailAddress>,
    pub sender: Vec<MailAddress>,
    pub to: Vec<MailAddress>,
    pub cc: Vec<MailAddress>,
    pub bcc: Vec<MailAddress>,
    pub reply_to: Vec<MailAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailAttachment {
    pub filename: Option<String>,
    pub content_type: String,
    pub charset: Option<String>,
    pub content_id: Option<String>,
    pub size: usize,
    pub data: Vec<u8>,
}

/// A downloaded and parsed message, handed to the importer and listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImapMail {
    /// Path of the mailbox the mail was fetched from.
    pub mailbox: String,
    pub uid: u32,
    pub mod_seq: Option<u64>,
    /// Size of the raw source in bytes.
    pub size: u64,
    pub internal_date: Option<DateTime<Utc>>,
    pub flags: MailFlags,
    pub labels: Vec<String>,
    /// `None` when the source could not be parsed as RFC 822.
    pub envelope: Option<MailEnvelope>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub attachments: Vec<MailAttachment>,
    pub headers: Vec<(String, String)>,
    pub source: Vec<u8>,
}

impl ImapMail {
    pub fn subject(&self) -> &str {
        self.envelope
            .as_ref()
            .and_then(|e| e.subject.as_deref())
            .unwrap_or("")
    }

    /// Plain text if available, otherwise the HTML body rendered as text.
    pub fn display_text(&self) -> String {
        if let Some(ref text) = self.body_text {
            text.clone()
        } else if let Some(ref html) = self.body_html {
            html_to_text(html)
        } else {
            String::new()
        }
    }
}

fn html_to_text(html: &str) -> String {
    html2text::from_read(html.as_bytes(), 80).unwrap_or_default()
}
