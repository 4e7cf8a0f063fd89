//! Query cache.
//!
//! Results of backend reads are stored under structured [`QueryKey`]s with a
//! per-namespace staleness window:
//!
//! - **Reads** go through [`QueryCache::get`], which serves fresh data or
//!   starts a single shared fetch per key.
//! - **Writes** from mutations go through the crate-private `set_data` /
//!   `update_matching` / `restore` trio, so every out-of-band change can be
//!   snapshotted and rolled back.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! capacity = 512
//! retry_count = 1
//!
//! [cache.stale_seconds]
//! books_detail = 600
//! recommendations = 300
//! ```

mod config;
mod entry;
mod events;
mod keys;
pub(crate) mod lock;
mod store;

pub use config::{CacheConfig, QueryOptions};
pub use entry::{CacheEntry, Cacheable, QueryData, QuerySnapshot, QueryStatus};
pub use events::{CacheEvent, Epoch, EventKind};
pub use keys::{IntoParam, KeyMatcher, KeyPattern, Namespace, ParamValue, QueryKey, op};
pub use store::{Baseline, QueryCache, QueryError};
