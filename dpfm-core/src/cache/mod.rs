//! Directory listing cache: store, keys, entries, leases, watchers, stats.

pub mod entry;
pub mod handle;
pub mod key;
pub mod stats;
pub mod store;

pub(crate) mod watcher;
