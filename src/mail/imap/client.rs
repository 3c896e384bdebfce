//! async-imap implementation of the connection traits.

use async_imap::types::{Fetch, Flag, Name, NameAttribute};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

use super::{
    ImapConnection, ImapConnector, MessagePosition, UidRange, XOAuth2Authenticator,
    build_mailbox_tree,
};
use crate::error::ImapError;
use crate::mail::parser::parse_flags_from_imap;
use crate::mail::types::{FetchedMessage, ImapMailbox, ImapMailboxStatus, SpecialUse};
use crate::sync::state::{Credentials, ImapAccount};

type ImapSession = async_imap::Session<Compat<TlsStream<TcpStream>>>;

/// Opens TLS connections (implicit TLS, port 993) with the webpki roots.
#[derive(Clone)]
pub struct AsyncImapConnector {
    tls: TlsConnector,
}

impl AsyncImapConnector {
    pub fn new() -> Result<Self, ImapError> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ImapError::Protocol(format!("TLS setup failed: {}", e)))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            tls: TlsConnector::from(Arc::new(config)),
        })
    }
}

#[async_trait]
impl ImapConnector for AsyncImapConnector {
    async fn connect(&self, account: &ImapAccount) -> Result<Box<dyn ImapConnection>, ImapError> {
        let connect_err = |reason: String| ImapError::Connect {
            host: account.host.clone(),
            reason,
        };

        let tcp = TcpStream::connect((account.host.as_str(), account.port))
            .await
            .map_err(|e| connect_err(e.to_string()))?;

        let server_name = ServerName::try_from(account.host.clone())
            .map_err(|_| connect_err("invalid server name".to_string()))?;
        let tls_stream = self
            .tls
            .connect(server_name, tcp)
            .await
            .map_err(|e| connect_err(format!("TLS handshake failed: {}", e)))?;

        let client = async_imap::Client::new(tls_stream.compat());

        let auth_err = |e: async_imap::error::Error| ImapError::Auth {
            user: account.username.clone(),
            reason: e.to_string(),
        };
        let mut session = match &account.credentials {
            Credentials::Password(password) => client
                .login(&account.username, password)
                .await
                .map_err(|(e, _)| auth_err(e))?,
            Credentials::AccessToken(token) => {
                let authenticator = XOAuth2Authenticator {
                    user: account.username.clone(),
                    access_token: token.clone(),
                };
                client
                    .authenticate("XOAUTH2", authenticator)
                    .await
                    .map_err(|(e, _)| auth_err(e))?
            }
        };

        // CONDSTORE (RFC 7162) gives us HIGHESTMODSEQ and CHANGEDSINCE
        let condstore = match session.capabilities().await {
            Ok(caps) => caps.has_str("CONDSTORE"),
            Err(e) => {
                tracing::warn!("CAPABILITY failed on {}: {}", account.host, e);
                false
            }
        };
        if condstore {
            tracing::debug!("Server {} supports CONDSTORE", account.host);
        }

        tracing::debug!("Connected to IMAP server {}", account.host);
        Ok(Box::new(AsyncImapConnection {
            session,
            condstore,
            selected_exists: None,
        }))
    }
}

struct AsyncImapConnection {
    session: ImapSession,
    condstore: bool,
    /// Message count of the mailbox opened by EXAMINE.
    selected_exists: Option<u32>,
}

impl AsyncImapConnection {
    async fn uid_of_seq(&mut self, seq: u32) -> Result<Option<MessagePosition>, ImapError> {
        let fetches: Vec<Fetch> = self
            .session
            .fetch(seq.to_string(), "UID")
            .await?
            .try_collect()
            .await?;
        Ok(fetches.iter().find_map(|f| {
            f.uid.map(|uid| MessagePosition {
                seq: f.message,
                uid,
            })
        }))
    }

    fn fetch_query(&self, changed_since: Option<u64>) -> String {
        let items = if self.condstore {
            "(UID FLAGS INTERNALDATE RFC822.SIZE MODSEQ BODY.PEEK[])"
        } else {
            "(UID FLAGS INTERNALDATE RFC822.SIZE BODY.PEEK[])"
        };
        match changed_since {
            Some(mod_seq) if self.condstore => format!("{} (CHANGEDSINCE {})", items, mod_seq),
            _ => items.to_string(),
        }
    }
}

#[async_trait]
impl ImapConnection for AsyncImapConnection {
    async fn list_tree(&mut self) -> Result<Vec<ImapMailbox>, ImapError> {
        let names: Vec<Name> = self
            .session
            .list(Some(""), Some("*"))
            .await?
            .try_collect()
            .await?;

        let flat = names.iter().map(mailbox_from_name).collect();
        Ok(build_mailbox_tree(flat))
    }

    async fn status(&mut self, path: &str) -> Result<ImapMailboxStatus, ImapError> {
        let items = if self.condstore {
            "(MESSAGES UIDNEXT UIDVALIDITY HIGHESTMODSEQ)"
        } else {
            "(MESSAGES UIDNEXT UIDVALIDITY)"
        };
        let mailbox = self
            .session
            .status(path, items)
            .await
            .map_err(|e| match e {
                async_imap::error::Error::No(_) => ImapError::MailboxNotFound(path.to_string()),
                other => other.into(),
            })?;

        Ok(ImapMailboxStatus {
            path: path.to_string(),
            message_count: Some(mailbox.exists),
            uid_validity: mailbox.uid_validity,
            uid_next: mailbox.uid_next,
            highest_mod_seq: mailbox.highest_modseq,
        })
    }

    async fn lock_mailbox(&mut self, path: &str) -> Result<(), ImapError> {
        let mailbox = self
            .session
            .examine(path)
            .await
            .map_err(|e| match e {
                async_imap::error::Error::No(_) => ImapError::MailboxNotFound(path.to_string()),
                other => other.into(),
            })?;
        self.selected_exists = Some(mailbox.exists);
        Ok(())
    }

    async fn release_lock(&mut self) -> Result<(), ImapError> {
        if self.selected_exists.take().is_some() {
            self.session.close().await?;
        }
        Ok(())
    }

    async fn message_at(&mut self, seq: u32) -> Result<Option<MessagePosition>, ImapError> {
        match self.selected_exists {
            Some(exists) if seq >= 1 && seq <= exists => self.uid_of_seq(seq).await,
            Some(_) => Ok(None),
            None => Err(ImapError::Protocol("no mailbox selected".to_string())),
        }
    }

    async fn first_message_from_uid(
        &mut self,
        uid: u32,
    ) -> Result<Option<MessagePosition>, ImapError> {
        // "n:*" always matches the highest UID, even when it is below n
        let uids = self.session.uid_search(format!("UID {}:*", uid)).await?;
        let Some(first) = uids.into_iter().filter(|u| *u >= uid).min() else {
            return Ok(None);
        };

        let fetches: Vec<Fetch> = self
            .session
            .uid_fetch(first.to_string(), "UID")
            .await?
            .try_collect()
            .await?;
        Ok(fetches
            .iter()
            .find(|f| f.uid == Some(first))
            .map(|f| MessagePosition {
                seq: f.message,
                uid: first,
            }))
    }

    async fn fetch(
        &mut self,
        range: UidRange,
        changed_since: Option<u64>,
    ) -> Result<BoxStream<'_, Result<FetchedMessage, ImapError>>, ImapError> {
        let query = self.fetch_query(changed_since);
        let stream = self.session.uid_fetch(range.to_string(), query).await?;

        Ok(stream
            .filter_map(move |item| async move {
                match item {
                    // Unsolicited FETCH responses carry no UID
                    Ok(fetch) => fetched_message(&fetch).map(Ok),
                    Err(e) => Some(Err(e.into())),
                }
            })
            .boxed())
    }

    async fn logout(&mut self) -> Result<(), ImapError> {
        self.session.logout().await?;
        Ok(())
    }
}

fn fetched_message(fetch: &Fetch) -> Option<FetchedMessage> {
    let uid = fetch.uid?;
    let flags: Vec<Flag> = fetch.flags().collect();
    let (flags, keywords) = parse_flags_from_imap(&flags);

    Some(FetchedMessage {
        seq: fetch.message,
        uid,
        size: fetch.size,
        mod_seq: fetch.modseq,
        flags,
        keywords,
        internal_date: fetch.internal_date().map(|d| d.with_timezone(&Utc)),
        source: fetch.body().map(|b| b.to_vec()),
    })
}

fn mailbox_from_name(name: &Name) -> ImapMailbox {
    let path = name.name().to_string();
    let delimiter = name.delimiter().map(|d| d.to_string());
    let short_name = match delimiter.as_deref() {
        Some(d) if !d.is_empty() => path.rsplit(d).next().unwrap_or(&path).to_string(),
        _ => path.clone(),
    };

    let mut mailbox = ImapMailbox {
        name: short_name,
        path,
        delimiter,
        special_use: None,
        selectable: true,
        children: Vec::new(),
    };
    apply_attributes(&mut mailbox, name.attributes());
    mailbox
}

/// Selectability and special use from the LIST attributes. INBOX is
/// recognised by name.
fn apply_attributes(mailbox: &mut ImapMailbox, attributes: &[NameAttribute<'_>]) {
    let mut special_use = None;
    for attr in attributes {
        let found = match attr {
            NameAttribute::NoSelect => {
                mailbox.selectable = false;
                None
            }
            NameAttribute::All => Some(SpecialUse::All),
            NameAttribute::Archive => Some(SpecialUse::Archive),
            NameAttribute::Drafts => Some(SpecialUse::Drafts),
            NameAttribute::Flagged => Some(SpecialUse::Flagged),
            NameAttribute::Junk => Some(SpecialUse::Junk),
            NameAttribute::Sent => Some(SpecialUse::Sent),
            NameAttribute::Trash => Some(SpecialUse::Trash),
            NameAttribute::Extension(label) => match &**label {
                l if l.eq_ignore_ascii_case("\\NonExistent") => {
                    mailbox.selectable = false;
                    None
                }
                l if l.eq_ignore_ascii_case("\\Spam") => Some(SpecialUse::Junk),
                l => SpecialUse::from_attribute(l),
            },
            _ => None,
        };
        special_use = special_use.or(found);
    }

    mailbox.special_use = if mailbox.path.eq_ignore_ascii_case("INBOX") {
        Some(SpecialUse::Inbox)
    } else {
        special_use
    };
}
