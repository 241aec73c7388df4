//! `src/cache/handle.rs`
//! ============================================================
//! Move-only lease handles.
//!
//! Both handles release their lease exactly once, on drop. Neither is
//! clonable: duplicating a lease would desynchronize the store's
//! reference counts, so sharing goes through a fresh `borrow`/`pin`
//! call instead.

use std::fmt;
use std::sync::Arc;

use crate::cache::entry::SubscriberId;
use crate::cache::key::CacheKey;
use crate::cache::store::DirListingCache;
use crate::fs::listing::{ListingEntry, ListingSnapshot};

/// A short-lived read lease on one folder's listing.
///
/// While alive, the entry cannot be evicted. The snapshot is immutable
/// and already resolved, so all accessors are lock-free.
#[must_use = "dropping immediately releases the read lease"]
pub struct Borrowed {
    cache: Arc<DirListingCache>,
    key: CacheKey,
    snapshot: Arc<ListingSnapshot>,
    stale: bool,
}

impl Borrowed {
    pub(crate) fn new(
        cache: Arc<DirListingCache>,
        key: CacheKey,
        snapshot: Arc<ListingSnapshot>,
        stale: bool,
    ) -> Self {
        Self {
            cache,
            key,
            snapshot,
            stale,
        }
    }

    #[inline]
    #[must_use]
    pub fn snapshot(&self) -> &Arc<ListingSnapshot> {
        &self.snapshot
    }

    #[inline]
    #[must_use]
    pub fn entries(&self) -> &[ListingEntry] {
        self.snapshot.entries()
    }

    /// True when the refresh failed and this lease carries the retained
    /// previous snapshot instead of a fresh one.
    #[inline]
    #[must_use]
    pub const fn is_stale(&self) -> bool {
        self.stale
    }

    #[inline]
    #[must_use]
    pub const fn key(&self) -> &CacheKey {
        &self.key
    }
}

impl Drop for Borrowed {
    fn drop(&mut self) {
        self.cache.release_borrow(&self.key);
    }
}

impl fmt::Debug for Borrowed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Borrowed")
            .field("key", &self.key)
            .field("entries", &self.snapshot.len())
            .field("stale", &self.stale)
            .finish()
    }
}

/// A long-lived keep-warm lease with a change subscription.
///
/// While alive, the entry cannot be evicted and competes for a watcher
/// slot with pinned priority. Dropping unsubscribes the callback and
/// releases the pin.
#[must_use = "dropping immediately unpins the folder"]
pub struct Pinned {
    cache: Arc<DirListingCache>,
    key: CacheKey,
    id: SubscriberId,
}

impl Pinned {
    pub(crate) fn new(cache: Arc<DirListingCache>, key: CacheKey, id: SubscriberId) -> Self {
        Self { cache, key, id }
    }

    #[inline]
    #[must_use]
    pub const fn key(&self) -> &CacheKey {
        &self.key
    }
}

impl Drop for Pinned {
    fn drop(&mut self) {
        self.cache.release_pin(&self.key, self.id);
    }
}

impl fmt::Debug for Pinned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pinned")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}
