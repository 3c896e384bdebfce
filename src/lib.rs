//! Adaptive IMAP import engine.
//!
//! Discovers the mailbox tree of a remote IMAP account and downloads its
//! mail with a pool of per-mailbox workers. Two feedback loops tune the
//! download: the parallel process optimizer decides how many workers run,
//! and a per-mailbox optimizer sizes every UID FETCH batch.
//!
//! - `sync` - session, workers, optimizers and sync state
//! - `mail` - IMAP connection layer, mail types and parsing
//! - `importer` - pause/continue/delete surface with persisted checkpoints
//! - `cache` - SQLite storage of mailbox cursors

pub mod actor;
pub mod cache;
pub mod config;
pub mod constants;
pub mod credentials;
pub mod error;
pub mod importer;
pub mod mail;
pub mod sync;
