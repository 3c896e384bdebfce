use chrono::{DateTime, Utc};
use mail_parser::{Address, Message, MessageParser, MimeHeaders, PartType};

use super::types::{
    FetchedMessage, ImapMail, MailAddress, MailAttachment, MailEnvelope, MailFlags,
};
use crate::error::SyncError;

/// Turn a fetched message into an [`ImapMail`].
///
/// Fails only when the server omitted the message source. A source that is
/// not valid RFC 822 still yields a mail, without envelope or bodies.
pub fn parse_mail(mailbox: &str, fetched: FetchedMessage) -> Result<ImapMail, SyncError> {
    let FetchedMessage {
        uid,
        mod_seq,
        size,
        flags,
        keywords,
        internal_date,
        source,
        ..
    } = fetched;

    let source = source.ok_or_else(|| SyncError::MissingSource {
        mailbox: mailbox.to_string(),
        uid,
    })?;

    let mut mail = ImapMail {
        mailbox: mailbox.to_string(),
        uid,
        mod_seq,
        size: size.map(u64::from).unwrap_or(source.len() as u64),
        internal_date,
        flags,
        labels: keywords,
        envelope: None,
        body_text: None,
        body_html: None,
        attachments: Vec::new(),
        headers: Vec::new(),
        source: Vec::new(),
    };

    if let Some(message) = MessageParser::default().parse(&source[..]) {
        mail.envelope = Some(parse_envelope(&message));
        mail.body_text = extract_text_body(&message);
        mail.body_html = extract_html_body(&message);
        mail.attachments = extract_attachments(&message);
        mail.headers = extract_headers(&message);
    } else {
        tracing::debug!("Message {} in {} is not valid RFC 822", uid, mailbox);
    }

    mail.source = source;
    Ok(mail)
}

fn parse_envelope(message: &Message) -> MailEnvelope {
    let in_reply_to = message
        .in_reply_to()
        .as_text_list()
        .and_then(|ids| ids.first().map(|s| s.to_string()));

    let references: Vec<String> = message
        .references()
        .as_text_list()
        .map(|ids| ids.iter().map(|s| s.to_string()).collect())
        .unwrap_or_default();

    MailEnvelope {
        date: message
            .date()
            .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0)),
        subject: message.subject().map(|s| s.to_string()),
        message_id: message.message_id().map(|s| s.to_string()),
        in_reply_to,
        references,
        from: addresses(message.from()),
        sender: addresses(message.sender()),
        to: addresses(message.to()),
        cc: addresses(message.cc()),
        bcc: addresses(message.bcc()),
        reply_to: addresses(message.reply_to()),
    }
}

fn addresses(header: Option<&Address>) -> Vec<MailAddress> {
    header
        .map(|addrs| {
            addrs
                .iter()
                .filter_map(|addr| {
                    Some(MailAddress {
                        name: addr.name().map(|s| s.to_string()),
                        address: addr.address()?.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn extract_text_body(message: &Message) -> Option<String> {
    for part in message.text_bodies() {
        if let PartType::Text(text) = &part.body {
            return Some(text.to_string());
        }
    }
    None
}

fn extract_html_body(message: &Message) -> Option<String> {
    for part in message.html_bodies() {
        if let PartType::Html(html) = &part.body {
            return Some(html.to_string());
        }
    }
    None
}

fn extract_attachments(message: &Message) -> Vec<MailAttachment> {
    message
        .attachments()
        .map(|part| {
            let content_type = part.content_type();
            let mime = content_type
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string());
            let data = part.contents().to_vec();

            MailAttachment {
                filename: part.attachment_name().map(|s| s.to_string()),
                content_type: mime,
                charset: content_type
                    .and_then(|ct| ct.attribute("charset"))
                    .map(|s| s.to_string()),
                content_id: part.content_id().map(|s| s.to_string()),
                size: data.len(),
                data,
            }
        })
        .collect()
}

fn extract_headers(message: &Message) -> Vec<(String, String)> {
    let raw = message.raw_message();
    message
        .headers()
        .iter()
        .filter_map(|header| {
            let value = raw.get(header.offset_start as usize..header.offset_end as usize)?;
            Some((
                header.name().to_string(),
                String::from_utf8_lossy(value).trim().to_string(),
            ))
        })
        .collect()
}

/// Split IMAP flags into system flags and keywords.
pub fn parse_flags_from_imap(flags: &[async_imap::types::Flag<'_>]) -> (MailFlags, Vec<String>) {
    use async_imap::types::Flag;

    let mut result = MailFlags::empty();
    let mut keywords = Vec::new();

    for flag in flags {
        match flag {
            Flag::Seen => result |= MailFlags::SEEN,
            Flag::Answered => result |= MailFlags::ANSWERED,
            Flag::Flagged => result |= MailFlags::FLAGGED,
            Flag::Deleted => result |= MailFlags::DELETED,
            Flag::Draft => result |= MailFlags::DRAFT,
            Flag::Recent => result |= MailFlags::RECENT,
            Flag::Custom(name) => keywords.push(name.to_string()),
            _ => {}
        }
    }

    (result, keywords)
}
