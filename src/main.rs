use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::env;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use imap_adsync::cache::StateStore;
use imap_adsync::config::{AccountConfig, Config};
use imap_adsync::credentials::CredentialStore;
use imap_adsync::error::SyncError;
use imap_adsync::importer::{ImapImporter, ImportState};
use imap_adsync::mail::types::{ImapMail, ImapMailbox, ImapMailboxStatus};
use imap_adsync::mail::AsyncImapConnector;
use imap_adsync::sync::state::{ImportedMailId, MailboxState};
use imap_adsync::sync::{
    Credentials, ImapAccount, MailImporter, SyncEventListener, SyncEventType,
};

/// Print a progress line every this many mails.
const PROGRESS_EVERY: usize = 100;

fn setup_logging() {
    use std::fs::OpenOptions;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,imap_adsync=debug"));

    let log_file = Config::config_dir()
        .ok()
        .and_then(|dir| std::fs::create_dir_all(&dir).ok().map(|_| dir))
        .map(|dir| dir.join("imap-adsync.log"))
        .and_then(|path| {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)
                .ok()
        });

    if let Some(file) = log_file {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_usage() {
    eprintln!(
        r#"imap-adsync - Adaptive IMAP import

Usage: imap-adsync [command]

Commands:
    run         Import the default account (default)
    status      Show credential storage and stored mailbox cursors
    reset       Delete the stored import state and, optionally, credentials
    login       Store the account password in the keyring
    help        Show this help message

Configuration file: ~/.config/imap-adsync/config.toml
Press Ctrl-C during an import to pause it; 'run' continues where it stopped.
"#
    );
}

fn default_account(config: &Config) -> Result<&AccountConfig> {
    config
        .default_account()
        .context("No accounts configured. Add an [[accounts]] section to the config file.")
}

fn imap_account(account: &AccountConfig, credentials: Credentials) -> ImapAccount {
    ImapAccount {
        host: account.imap.server.clone(),
        port: account.imap.port,
        username: account.username().to_string(),
        credentials,
    }
}

/// Stored state is keyed by user, host and port only.
fn state_key(account: &AccountConfig) -> ImapAccount {
    imap_account(account, Credentials::Password(String::new()))
}

async fn open_store() -> Result<StateStore> {
    let path = Config::state_db_path()?;
    StateStore::open(&path)
        .await
        .with_context(|| format!("Failed to open state database {}", path.display()))
}

/// Stand-in target store: assigns ids without persisting the mail.
struct LoggingImporter;

#[async_trait]
impl MailImporter for LoggingImporter {
    async fn import_mail(&self, mail: &ImapMail, mailbox: &MailboxState) -> Result<ImportedMailId> {
        let message_id = mail
            .envelope
            .as_ref()
            .and_then(|envelope| envelope.message_id.clone());
        let preview: String = mail.display_text().chars().take(60).collect();
        tracing::debug!(
            "Importing {} uid {} ({} bytes, message-id {:?}): {:?} {:?}",
            mailbox.path,
            mail.uid,
            mail.size,
            message_id,
            mail.subject(),
            preview.trim()
        );
        Ok(ImportedMailId(
            message_id.unwrap_or_else(|| format!("{}/{}", mailbox.path, mail.uid)),
        ))
    }
}

#[derive(Default)]
struct ProgressListener {
    mails: AtomicUsize,
    updates: AtomicUsize,
    bytes: AtomicU64,
    errors: AtomicUsize,
}

impl SyncEventListener for ProgressListener {
    fn on_mailbox(&self, mailbox: &ImapMailbox, event: SyncEventType) {
        match event {
            SyncEventType::Create => println!("  + {}", mailbox.path),
            SyncEventType::Delete => println!("  - {}", mailbox.path),
            SyncEventType::Update => {}
        }
    }

    fn on_mailbox_status(&self, status: &ImapMailboxStatus) {
        tracing::debug!(
            "{}: {:?} messages, UIDNEXT {:?}",
            status.path,
            status.message_count,
            status.uid_next
        );
    }

    fn on_mail(&self, mail: &ImapMail, event: SyncEventType) {
        if event == SyncEventType::Update {
            self.updates.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let bytes = self.bytes.fetch_add(mail.size, Ordering::Relaxed) + mail.size;
        let count = self.mails.fetch_add(1, Ordering::Relaxed) + 1;
        if count.is_multiple_of(PROGRESS_EVERY) {
            println!("  {} mails imported ({} KiB)", count, bytes / 1024);
        }
    }

    fn on_postpone(&self, resume_at: DateTime<Utc>) {
        println!("Download quota reached, continue after {}", resume_at);
    }

    fn on_finish(&self, downloaded_bytes: u64) {
        println!(
            "Import finished: {} new, {} updated, {} KiB downloaded",
            self.mails.load(Ordering::Relaxed),
            self.updates.load(Ordering::Relaxed),
            downloaded_bytes / 1024
        );
    }

    fn on_error(&self, error: &SyncError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        eprintln!("  error: {}", error);
    }
}

async fn run_import(config: &Config) -> Result<()> {
    let account = default_account(config)?;
    let credentials = CredentialStore::credentials_for(account)?;
    let store = Arc::new(open_store().await?);
    let connector = Arc::new(AsyncImapConnector::new()?);
    let listener = Arc::new(ProgressListener::default());

    let mut importer = ImapImporter::new(
        store,
        imap_account(account, credentials),
        account.max_quota,
        connector,
        Arc::new(LoggingImporter),
        config.sync.clone(),
        listener.clone(),
    )
    .await?;

    println!("Importing {} from {}", account.email, account.imap.server);
    match importer.continue_import().await? {
        ImportState::Postponed => {
            if let Some(until) = importer.postponed_until() {
                println!("Import is postponed until {}", until);
            }
            return Ok(());
        }
        ImportState::Paused => return Ok(()),
        ImportState::Running => {}
    }

    let finished = tokio::select! {
        result = importer.wait_for_completion() => Some(result?),
        _ = tokio::signal::ctrl_c() => None,
    };
    let state = match finished {
        Some(state) => state,
        None => {
            println!("\nPausing import...");
            importer.pause_import().await?
        }
    };

    tracing::info!("Import ended in state {:?}", state);
    println!(
        "{} mails stored in checkpoint ({} errors)",
        importer.imported_count(),
        listener.errors.load(Ordering::Relaxed)
    );
    Ok(())
}

async fn run_status(config: &Config) -> Result<()> {
    let account = default_account(config)?;
    let key = state_key(account);
    let store = open_store().await?;
    let state = store.load(&key, account.max_quota).await?;

    print!("{}", CredentialStore::new(&account.email).debug_info());
    println!("Import state of {}", key.id());
    if let Some(run) = store.stored_import(&key.id()).await? {
        println!("  Last update: {}", run.updated_at);
        if let Some(until) = run.postponed_until {
            println!("  Postponed until: {}", until);
        }
        if run.downloaded_bytes > 0 {
            println!("  Downloaded in last finished run: {} KiB", run.downloaded_bytes / 1024);
        }
    }
    if state.mailbox_states.is_empty() {
        println!("  Nothing imported yet.");
        return Ok(());
    }

    println!(
        "  {:<32} {:>12} {:>10} {:>14} {:>10}",
        "Mailbox", "UIDVALIDITY", "UIDNEXT", "HIGHESTMODSEQ", "Imported"
    );
    let fmt = |v: Option<String>| v.unwrap_or_else(|| "-".to_string());
    for mailbox in state.mailbox_states.values() {
        println!(
            "  {:<32} {:>12} {:>10} {:>14} {:>10}",
            mailbox.path,
            fmt(mailbox.uid_validity.map(|v| v.to_string())),
            fmt(mailbox.uid_next.map(|v| v.to_string())),
            fmt(mailbox.highest_mod_seq.map(|v| v.to_string())),
            mailbox.imported_count()
        );
    }
    println!("  Total: {} mails", state.imported_count());
    Ok(())
}

fn confirm(question: &str) -> Result<bool> {
    use std::io::{self, Write};

    print!("{} [y/N]: ", question);
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

async fn run_reset(config: &Config) -> Result<()> {
    let account = default_account(config)?;
    let key = state_key(account).id();

    if !confirm(&format!("Delete the stored import state of {}?", key))? {
        println!("Reset cancelled.");
        return Ok(());
    }

    open_store().await?.delete_account(&key).await?;
    println!("Import state deleted. The next run imports everything again.");

    if confirm(&format!("Also remove the stored credentials of {}?", account.email))? {
        CredentialStore::new(&account.email).delete_all()?;
        println!("Credentials removed. Run 'imap-adsync login' before the next import.");
    }
    Ok(())
}

fn run_login(config: &Config) -> Result<()> {
    use std::io::{self, Write};

    let account = default_account(config)?;
    print!("Password for {}: ", account.email);
    io::stdout().flush()?;
    let password = rpassword_read()?;
    println!();

    let creds = CredentialStore::new(&account.email);
    creds.set_password(&password)?;
    if !creds.has_credentials() {
        anyhow::bail!("Credential storage failed");
    }
    println!("Password stored.");
    Ok(())
}

fn rpassword_read() -> Result<String> {
    use std::io;

    let _guard = DisableEcho::new()?;

    let mut password = String::new();
    io::stdin().read_line(&mut password)?;
    Ok(password.trim().to_string())
}

struct DisableEcho {
    #[cfg(unix)]
    original: libc::termios,
}

impl DisableEcho {
    #[cfg(unix)]
    fn new() -> Result<Self> {
        use std::mem::MaybeUninit;
        use std::os::unix::io::AsRawFd;

        let fd = std::io::stdin().as_raw_fd();
        let mut termios = MaybeUninit::<libc::termios>::uninit();

        unsafe {
            if libc::tcgetattr(fd, termios.as_mut_ptr()) != 0 {
                anyhow::bail!("Failed to get terminal attributes");
            }
            let original = termios.assume_init();
            let mut new = original;
            new.c_lflag &= !libc::ECHO;
            if libc::tcsetattr(fd, libc::TCSANOW, &new) != 0 {
                anyhow::bail!("Failed to set terminal attributes");
            }
            Ok(Self { original })
        }
    }

    #[cfg(not(unix))]
    fn new() -> Result<Self> {
        Ok(Self {})
    }
}

#[cfg(unix)]
impl Drop for DisableEcho {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;
        let fd = std::io::stdin().as_raw_fd();
        unsafe {
            libc::tcsetattr(fd, libc::TCSANOW, &self.original);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(|s| s.as_str());

    if matches!(command, Some("help") | Some("--help") | Some("-h")) {
        print_usage();
        return Ok(());
    }

    setup_logging();
    let config = Config::load()?;
    config.ensure_dirs()?;

    match command {
        None | Some("run") => run_import(&config).await,
        Some("status") => run_status(&config).await,
        Some("reset") => run_reset(&config).await,
        Some("login") => run_login(&config),
        Some(cmd) => {
            eprintln!("Unknown command: {}", cmd);
            print_usage();
            std::process::exit(1);
        }
    }
}
