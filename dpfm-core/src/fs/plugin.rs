//! `src/fs/plugin.rs`
//! ============================================================
//! File-system plugin boundary.
//!
//! The cache consumes backends (local disk, archive VFS, remote mounts)
//! through the [`FsPlugin`] trait: a synchronous, possibly slow enumeration
//! call plus an optional directory-watch capability. The cache never calls
//! `read_directory_info` while holding its lock.
//!
//! Identity is interned: every [`FsHandle`] carries a process-unique
//! [`FsId`] allocated from an atomic counter. Ids are never reused, so a
//! torn-down backend can never alias the cache key of a newer one.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use compact_str::CompactString;
use thiserror::Error;

use super::listing::ListingSnapshot;

/// Errors surfaced by a file-system backend.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("path not found: {0}")]
    NotFound(CompactString),

    #[error("access denied: {0}")]
    AccessDenied(CompactString),

    #[error("watch capability not supported")]
    WatchUnsupported,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(CompactString),
}

impl PluginError {
    #[inline]
    #[must_use]
    pub fn not_found(path: &str) -> Self {
        Self::NotFound(CompactString::new(path))
    }

    #[inline]
    #[must_use]
    pub fn other(message: &str) -> Self {
        Self::Other(CompactString::new(message))
    }
}

/// A native change notification for one watched folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirChange {
    /// The underlying mechanism dropped or coalesced events; the folder
    /// must be treated as changed regardless.
    pub overflow: bool,
}

/// Callback handed to [`FsPlugin::watch`]. Implementations may invoke it
/// from any thread; the cache guarantees it only forwards into a queue.
pub type WatchCallback = Box<dyn Fn(DirChange) + Send + Sync>;

/// Behavior contract for a file-system backend instance.
pub trait FsPlugin: Send + Sync {
    /// Short backend name for logs ("local", "sevenzip", ...).
    fn name(&self) -> &str;

    /// Enumerate one folder and publish an immutable snapshot.
    ///
    /// Synchronous and potentially slow; invoked on the blocking pool,
    /// strictly outside the cache lock.
    fn read_directory_info(&self, path: &str) -> Result<Arc<ListingSnapshot>, PluginError>;

    /// Whether this backend can deliver native change notifications.
    fn supports_watch(&self) -> bool {
        false
    }

    /// Register a change watch on `path`. Default backends have none.
    fn watch(&self, _path: &str, _callback: WatchCallback) -> Result<(), PluginError> {
        Err(PluginError::WatchUnsupported)
    }

    /// Remove a previously registered watch. Must tolerate unknown paths.
    fn unwatch(&self, _path: &str) {}
}

/// Interned file-system instance identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FsId(u64);

impl std::fmt::Display for FsId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fs#{}", self.0)
    }
}

impl FsId {
    #[cfg(test)]
    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

static NEXT_FS_ID: AtomicU64 = AtomicU64::new(1);

/// A registered file-system instance: plugin + interned identity.
///
/// Cloning shares the same instance; two handles compare equal iff they
/// refer to the same registration.
#[derive(Clone)]
pub struct FsHandle {
    id: FsId,
    plugin: Arc<dyn FsPlugin>,
}

impl FsHandle {
    /// Register a backend instance, assigning a fresh identity.
    #[must_use]
    pub fn new(plugin: Arc<dyn FsPlugin>) -> Self {
        Self {
            id: FsId(NEXT_FS_ID.fetch_add(1, Ordering::Relaxed)),
            plugin,
        }
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> FsId {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn plugin(&self) -> Arc<dyn FsPlugin> {
        self.plugin.clone()
    }
}

impl PartialEq for FsHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for FsHandle {}

impl std::fmt::Debug for FsHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsHandle")
            .field("id", &self.id)
            .field("plugin", &self.plugin.name())
            .finish()
    }
}
