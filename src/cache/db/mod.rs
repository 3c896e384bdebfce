//! SQLite storage of import checkpoints.
//!
//! - `mod.rs` - StateStore, connection pool, checkpoint load/save
//! - `schema.rs` - Database schema initialization

mod schema;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::sync::state::{ImapAccount, ImapSyncState, ImportedMailId, MailboxState};

/// Checkpoints are written by one importer at a time; a few connections
/// let `status` read while a run is saving.
const POOL_SIZE: u32 = 4;

/// Account-level bookkeeping next to the mailbox cursors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredImport {
    pub postponed_until: Option<DateTime<Utc>>,
    pub downloaded_bytes: u64,
    pub updated_at: DateTime<Utc>,
}

pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let db_url = format!("sqlite:{}?mode=rwc", path.display());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(POOL_SIZE)
            .connect_with(options)
            .await
            .context("Failed to create connection pool")?;

        schema::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to create in-memory connection pool")?;

        schema::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    /// Load the checkpoint of an account. Unknown accounts load as an
    /// empty state, which makes the next run a full import.
    pub async fn load(&self, account: &ImapAccount, max_quota: u64) -> Result<ImapSyncState> {
        let account_id = account.id();

        let rows = sqlx::query(
            "SELECT path, uid_validity, uid_next, highest_mod_seq FROM mailbox_states WHERE account_id = ?",
        )
        .bind(&account_id)
        .fetch_all(&self.pool)
        .await?;

        let mut states: BTreeMap<String, MailboxState> = BTreeMap::new();
        for row in rows {
            let path: String = row.get("path");
            let mut state = MailboxState::new(path.clone());
            state.uid_validity = row.get::<Option<i64>, _>("uid_validity").map(|v| v as u32);
            state.uid_next = row.get::<Option<i64>, _>("uid_next").map(|v| v as u32);
            state.highest_mod_seq = row
                .get::<Option<i64>, _>("highest_mod_seq")
                .map(|v| v as u64);
            states.insert(path, state);
        }

        let imported = sqlx::query(
            "SELECT path, uid, mail_id FROM imported_mails WHERE account_id = ? ORDER BY path, uid",
        )
        .bind(&account_id)
        .fetch_all(&self.pool)
        .await?;

        for row in imported {
            let path: String = row.get("path");
            let Some(state) = states.get_mut(&path) else {
                continue;
            };
            let uid = row.get::<i64, _>("uid") as u32;
            state.record_import(uid, ImportedMailId(row.get("mail_id")));
        }

        let failed = sqlx::query("SELECT path, uid FROM failed_mails WHERE account_id = ?")
            .bind(&account_id)
            .fetch_all(&self.pool)
            .await?;

        for row in failed {
            let path: String = row.get("path");
            if let Some(state) = states.get_mut(&path) {
                state.record_failure(row.get::<i64, _>("uid") as u32);
            }
        }

        tracing::debug!(
            "Loaded {} mailbox states for {}",
            states.len(),
            account_id
        );

        Ok(ImapSyncState::new(account.clone(), max_quota).with_mailbox_states(states.into_values()))
    }

    /// Write a checkpoint of an account in one transaction.
    ///
    /// Cursors are upserted and new imported UIDs added. Failed UIDs are
    /// replaced per mailbox. A mailbox whose UIDVALIDITY changed loses its
    /// stored imports, and mailboxes missing from `state` are removed.
    pub async fn save(&self, state: &ImapSyncState) -> Result<()> {
        let account_id = state.account.id();
        let mut tx = self.pool.begin().await?;

        let stored = sqlx::query("SELECT path, uid_validity FROM mailbox_states WHERE account_id = ?")
            .bind(&account_id)
            .fetch_all(&mut *tx)
            .await?;

        let mut stored_paths = HashSet::new();
        for row in stored {
            let path: String = row.get("path");
            let uid_validity = row.get::<Option<i64>, _>("uid_validity").map(|v| v as u32);

            match state.mailbox_state(&path) {
                None => {
                    sqlx::query("DELETE FROM mailbox_states WHERE account_id = ? AND path = ?")
                        .bind(&account_id)
                        .bind(&path)
                        .execute(&mut *tx)
                        .await?;
                    sqlx::query("DELETE FROM imported_mails WHERE account_id = ? AND path = ?")
                        .bind(&account_id)
                        .bind(&path)
                        .execute(&mut *tx)
                        .await?;
                    sqlx::query("DELETE FROM failed_mails WHERE account_id = ? AND path = ?")
                        .bind(&account_id)
                        .bind(&path)
                        .execute(&mut *tx)
                        .await?;
                }
                Some(current) if uid_validity.is_some() && current.uid_validity != uid_validity => {
                    sqlx::query("DELETE FROM imported_mails WHERE account_id = ? AND path = ?")
                        .bind(&account_id)
                        .bind(&path)
                        .execute(&mut *tx)
                        .await?;
                }
                Some(_) => {}
            }
            stored_paths.insert(path);
        }

        for mailbox in state.mailbox_states.values() {
            sqlx::query(
                "INSERT OR REPLACE INTO mailbox_states (account_id, path, uid_validity, uid_next, highest_mod_seq) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&account_id)
            .bind(&mailbox.path)
            .bind(mailbox.uid_validity.map(|v| v as i64))
            .bind(mailbox.uid_next.map(|v| v as i64))
            .bind(mailbox.highest_mod_seq.map(|v| v as i64))
            .execute(&mut *tx)
            .await?;

            for (uid, mail_id) in mailbox.imported() {
                sqlx::query(
                    "INSERT OR IGNORE INTO imported_mails (account_id, path, uid, mail_id) VALUES (?, ?, ?, ?)",
                )
                .bind(&account_id)
                .bind(&mailbox.path)
                .bind(*uid as i64)
                .bind(&mail_id.0)
                .execute(&mut *tx)
                .await?;
            }

            sqlx::query("DELETE FROM failed_mails WHERE account_id = ? AND path = ?")
                .bind(&account_id)
                .bind(&mailbox.path)
                .execute(&mut *tx)
                .await?;
            for uid in mailbox.failed_uids() {
                sqlx::query("INSERT INTO failed_mails (account_id, path, uid) VALUES (?, ?, ?)")
                    .bind(&account_id)
                    .bind(&mailbox.path)
                    .bind(*uid as i64)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        sqlx::query(
            "INSERT INTO import_accounts (account_id, updated_at) VALUES (?, ?) \
             ON CONFLICT(account_id) DO UPDATE SET updated_at = excluded.updated_at",
        )
        .bind(&account_id)
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await?;

        tx.commit().await.context("Failed to commit checkpoint")?;

        tracing::debug!(
            "Saved {} mailbox states ({} known before) for {}",
            state.mailbox_states.len(),
            stored_paths.len(),
            account_id
        );
        Ok(())
    }

    /// Record where the last run of an account ended.
    pub async fn set_run_outcome(
        &self,
        account_id: &str,
        postponed_until: Option<DateTime<Utc>>,
        downloaded_bytes: u64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO import_accounts (account_id, postponed_until, downloaded_bytes, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(account_id) DO UPDATE SET postponed_until = excluded.postponed_until, \
             downloaded_bytes = excluded.downloaded_bytes, updated_at = excluded.updated_at",
        )
        .bind(account_id)
        .bind(postponed_until.map(|t| t.timestamp()))
        .bind(downloaded_bytes as i64)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn stored_import(&self, account_id: &str) -> Result<Option<StoredImport>> {
        let row = sqlx::query(
            "SELECT postponed_until, downloaded_bytes, updated_at FROM import_accounts WHERE account_id = ?",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| StoredImport {
            postponed_until: row
                .get::<Option<i64>, _>("postponed_until")
                .and_then(|secs| DateTime::from_timestamp(secs, 0)),
            downloaded_bytes: row.get::<i64, _>("downloaded_bytes") as u64,
            updated_at: DateTime::from_timestamp(row.get::<i64, _>("updated_at"), 0)
                .unwrap_or_default(),
        }))
    }

    /// Forget everything stored for an account.
    pub async fn delete_account(&self, account_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM imported_mails WHERE account_id = ?")
            .bind(account_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM failed_mails WHERE account_id = ?")
            .bind(account_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM mailbox_states WHERE account_id = ?")
            .bind(account_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM import_accounts WHERE account_id = ?")
            .bind(account_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
