//! Database schema initialization.

use anyhow::Result;
use sqlx::SqlitePool;

/// Create the checkpoint tables if they do not exist yet.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        -- One row per imported account
        CREATE TABLE IF NOT EXISTS import_accounts (
            account_id TEXT PRIMARY KEY,
            postponed_until INTEGER,
            downloaded_bytes INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL
        );

        -- Per-mailbox cursors
        CREATE TABLE IF NOT EXISTS mailbox_states (
            account_id TEXT NOT NULL,
            path TEXT NOT NULL,
            uid_validity INTEGER,
            uid_next INTEGER,
            highest_mod_seq INTEGER,
            PRIMARY KEY (account_id, path)
        );

        -- UID -> imported mail id, per mailbox
        CREATE TABLE IF NOT EXISTS imported_mails (
            account_id TEXT NOT NULL,
            path TEXT NOT NULL,
            uid INTEGER NOT NULL,
            mail_id TEXT NOT NULL,
            PRIMARY KEY (account_id, path, uid)
        );

        CREATE INDEX IF NOT EXISTS idx_imported_mails_mailbox ON imported_mails(account_id, path);

        -- UIDs whose import failed and is retried on the next walk
        CREATE TABLE IF NOT EXISTS failed_mails (
            account_id TEXT NOT NULL,
            path TEXT NOT NULL,
            uid INTEGER NOT NULL,
            PRIMARY KEY (account_id, path, uid)
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (1)")
        .execute(pool)
        .await?;

    Ok(())
}
