//! Dashcache cache layer.
//!
//! - [`CacheStore`] keeps the last good result of every registered query and
//!   is changed only through compare-and-swap.
//! - [`RefreshScheduler`] runs at most one refresh per query name, retries
//!   transient failures with backoff, and sweeps for stale entries on a timer.
//!
//! ## Configuration
//!
//! ```toml
//! [refresh]
//! tick_seconds = 15
//! max_attempts = 3
//! backoff_base_ms = 500
//! backoff_max_ms = 10000
//! jitter = 0.2
//! ```

mod backoff;
mod clock;
mod config;
mod entry;
mod error;
mod lock;
mod scheduler;
mod store;

pub use backoff::RetryPolicy;
pub use clock::{Clock, SystemClock};
pub use config::RefreshConfig;
pub use entry::{CacheEntry, EntryState, RefreshFailure};
pub use error::RefreshError;
pub use scheduler::{RefreshHandle, RefreshOutcome, RefreshScheduler};
pub use store::CacheStore;

pub(crate) use lock::mutex_lock;
