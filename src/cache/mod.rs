//! Durable storage of import checkpoints.

mod db;

pub use db::{StateStore, StoredImport};
