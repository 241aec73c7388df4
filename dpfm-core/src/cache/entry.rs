//! `src/cache/entry.rs`
//! ============================================================
//! Per-entry cache record.
//!
//! All fields are guarded by the store's single mutex; the snapshot itself
//! is an `Arc` published copy-on-replace, so readers holding a clone need
//! no lock. The per-entry `Notify` is the wait condition that serializes
//! concurrent loaders for the same key.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use smallvec::SmallVec;
use tokio::sync::Notify;

use crate::cache::key::CacheKey;
use crate::cache::watcher::FolderWatcher;
use crate::fs::listing::ListingSnapshot;
use crate::fs::plugin::FsHandle;

/// Token identifying one dirty-notification subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

impl SubscriberId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Invoked (off the cache lock) when a pinned folder goes dirty.
pub type ChangeCallback = Arc<dyn Fn(&CacheKey) + Send + Sync>;

pub(crate) struct EntryState {
    /// Backend that owns this folder; needed for reloads and watch start.
    pub fs: FsHandle,

    /// Published listing; absent until the first successful load.
    pub snapshot: Option<Arc<ListingSnapshot>>,

    /// Byte weight currently charged to the aggregate counter.
    pub bytes: u64,

    /// Snapshot (if any) is known-stale; refresh on next Refresh borrow.
    pub dirty: bool,

    /// An enumeration is in flight for this key.
    pub loading: bool,

    /// Ticket of the in-flight load's owner. A result is only applied when
    /// the entry still carries the matching ticket, so a load that outlived
    /// a forced removal (and a re-creation of the same key) cannot touch
    /// the fresh entry.
    pub load_ticket: u64,

    /// One notification burst already posted for the current dirty cycle.
    pub notify_posted: bool,

    pub pin_count: u32,
    pub borrow_count: u32,

    /// (token, callback) pairs registered by pins.
    pub subscribers: SmallVec<[(SubscriberId, ChangeCallback); 2]>,

    /// Active change-watch registration, if the budget allocator granted one.
    pub watcher: Option<FolderWatcher>,

    /// Wait condition for same-key loaders.
    pub loaded: Arc<Notify>,
}

impl EntryState {
    pub fn new(fs: FsHandle) -> Self {
        Self {
            fs,
            snapshot: None,
            bytes: 0,
            dirty: false,
            loading: false,
            load_ticket: 0,
            notify_posted: false,
            pin_count: 0,
            borrow_count: 0,
            subscribers: SmallVec::new(),
            watcher: None,
            loaded: Arc::new(Notify::new()),
        }
    }

    /// An entry with an outstanding lease or an in-flight load never leaves
    /// via the eviction pass.
    #[inline]
    pub const fn evictable(&self) -> bool {
        self.pin_count == 0 && self.borrow_count == 0 && !self.loading
    }

    /// Eligible for an MRU watcher slot: loaded, settled, not pinned
    /// (pinned entries are allocated in their own earlier pass).
    #[inline]
    pub fn wants_mru_watcher(&self) -> bool {
        self.pin_count == 0 && self.snapshot.is_some() && !self.loading
    }
}
