//! Building blocks shared by the session actor and its workers.

pub mod retry;
pub mod ticker;

pub use retry::{RetryConfig, with_retry};
pub use ticker::Ticker;
