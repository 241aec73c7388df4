//! `dpfm-core`
//! ============================================================================
//! Directory listing cache engine for a dual-pane file manager.
//!
//! The centerpiece is [`DirListingCache`]: a byte-budgeted, LRU-evicting
//! cache of immutable folder listing snapshots fed by pluggable
//! file-system backends ([`FsPlugin`]). Callers take short read leases
//! ([`Borrowed`]) or long keep-warm leases with change subscriptions
//! ([`Pinned`]); native change notifications flow through a bounded pool
//! of folder watchers into dirty-marks and subscriber callbacks.
//!
//! The cache is an explicit, dependency-injected instance: construct one
//! with [`DirListingCache::new`] inside a tokio runtime and hand it to
//! whoever needs it.

pub mod cache;
pub mod config;
pub mod error;
pub mod fs;
pub mod logging;

pub use cache::entry::{ChangeCallback, SubscriberId};
pub use cache::handle::{Borrowed, Pinned};
pub use cache::key::CacheKey;
pub use cache::stats::CacheStatsSnapshot;
pub use cache::store::{DirListingCache, LoadMode};
pub use config::{CacheConfig, CacheLimits, Config};
pub use error::{CacheError, CoreResult};
pub use fs::listing::{EntryKind, ListingEntry, ListingSnapshot};
pub use fs::plugin::{DirChange, FsHandle, FsId, FsPlugin, PluginError, WatchCallback};
pub use logging::Logger;
