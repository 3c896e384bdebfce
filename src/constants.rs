//! Engine-wide constants for tuning and defaults
//!
//! Centralizes magic numbers to make them discoverable. Most of them are
//! only defaults; the `[sync]` section of the config file overrides them.

/// Interval in seconds between two runs of the parallel process optimizer.
pub const OPTIMIZATION_INTERVAL_SECS: u64 = 5;

/// Number of worker processes the parallel optimizer starts per increase.
pub const PARALLEL_OPTIMIZATION_DIFFERENCE: usize = 3;

/// Throughput (bytes/ms) the current interval may fall short of the
/// previous one and still count as "not worse".
pub const THROUGHPUT_THRESHOLD: f64 = 0.0;

/// Step in messages by which the block size optimizer grows or shrinks.
pub const BLOCK_SIZE_OPTIMIZATION_DIFFERENCE: u32 = 10;

/// Number of messages requested per UID FETCH when a mailbox starts.
pub const DEFAULT_DOWNLOAD_BLOCK_SIZE: u32 = 200;

/// Number of history samples averaged into the normalized efficiency score.
pub const NORMALIZATION_WINDOW: usize = 50;

/// Seconds a throughput measurement window lasts before it rotates into
/// history. Also the minimum age before a worker may be evicted.
pub const TIME_TO_LIVE_SECS: u64 = 60;

/// Throughput (bytes/ms) a fresh mailbox is assumed to have.
pub const INITIAL_THROUGHPUT: f64 = 0.1;

/// Bytes kept in reserve below the download quota before postponing.
pub const DOWNLOADED_QUOTA_SAFETY_THRESHOLD: u64 = 50_000;

/// Default quota in bytes for a single import session (1 GiB).
pub const DEFAULT_MAX_QUOTA: u64 = 1024 * 1024 * 1024;

/// Delay in seconds before a postponed import may continue (24 hours).
pub const POSTPONE_DELAY_SECS: u64 = 24 * 60 * 60;

/// Number of failed workers a mailbox tolerates before it is dropped from
/// the current session.
pub const MAX_MAILBOX_FAILURES: u32 = 3;

/// Maximum retry delay in seconds for the discovery connection.
pub const MAX_RETRY_DELAY_SECS: u64 = 30;

/// Maximum number of retries for the discovery connection.
pub const MAX_RETRIES: u32 = 3;

/// Capacity of the session command channel.
pub const SESSION_COMMAND_CAPACITY: usize = 16;

/// Seconds between two checkpoints of a running import.
pub const CHECKPOINT_INTERVAL_SECS: u64 = 30;
