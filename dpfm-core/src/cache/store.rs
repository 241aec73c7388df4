//! `src/cache/store.rs`
//! ============================================================================
//! # Directory Listing Cache
//!
//! A thread-safe cache for directory listing snapshots with the following
//! features:
//! - Byte-budget LRU eviction that skips pinned/borrowed/loading entries
//! - Single-flight load coordination (one enumeration per key)
//! - Cooperative cancellation of waits and owned loads
//! - Bounded change-watcher pool reallocated on every mutation
//! - Cache statistics and monitoring
//!
//! One mutex guards the map, the recency order, and per-entry metadata.
//! Snapshots are `Arc`-published and immutable, so they are read without
//! the lock; plugin enumeration runs on the blocking pool strictly outside
//! the lock so one slow folder never stalls unrelated cache traffic.

use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use lru::LruCache;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tokio::sync::Notify;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cache::entry::{ChangeCallback, EntryState, SubscriberId};
use crate::cache::handle::{Borrowed, Pinned};
use crate::cache::key::CacheKey;
use crate::cache::stats::{CacheStats, CacheStatsSnapshot};
use crate::cache::watcher::{
    ChangeEvent, FolderWatcher, OverflowLog, run_dispatcher, select_watched,
};
use crate::config::CacheLimits;
use crate::error::{CacheError, CoreResult};
use crate::fs::listing::ListingSnapshot;
use crate::fs::plugin::{FsHandle, PluginError};

/// How a borrow treats a missing or stale snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Serve whatever is cached (possibly stale); never enumerate.
    CacheOnly,
    /// Enumerate if the snapshot is absent or dirty.
    Refresh,
}

/// Result of a completed load path.
pub(crate) struct Loaded {
    pub snapshot: Arc<ListingSnapshot>,
    pub stale: bool,
}

/// Tickets identify one load ownership across lock releases. Never reused.
static NEXT_LOAD_TICKET: AtomicU64 = AtomicU64::new(1);

/// Outcome of one locked pass over an entry's load state.
enum LoadStep {
    /// A usable snapshot is present.
    Ready(Loaded),
    /// This caller owns the enumeration now.
    Own { fs: FsHandle, ticket: u64 },
    /// Another caller owns it; wait on the entry's notifier.
    Wait(Arc<Notify>),
}

/// Releases a provisional borrow count when the calling future is dropped
/// before the lease is handed to a `Borrowed`.
struct BorrowReservation<'a> {
    cache: &'a DirListingCache,
    key: &'a CacheKey,
    armed: bool,
}

impl Drop for BorrowReservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.cache.release_borrow(self.key);
        }
    }
}

/// Clears the `loading` flag and wakes waiters when the owning future is
/// dropped (timeout, `select!`) before the load settles, so an abandoned
/// load never wedges the entry.
struct LoadOwnership<'a> {
    cache: &'a DirListingCache,
    key: &'a CacheKey,
    ticket: u64,
    armed: bool,
}

impl Drop for LoadOwnership<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.cache.abort_load(self.key, self.ticket);
        }
    }
}

struct CacheInner {
    /// Map and recency list in one structure; the head is most recent.
    entries: LruCache<CacheKey, EntryState>,
    limits: CacheLimits,
    /// Sum of `snapshot.byte_size()` over entries holding a snapshot.
    current_bytes: u64,
}

/// Process-wide directory listing cache.
///
/// Explicitly constructed and dependency-injected; create with
/// [`DirListingCache::new`] (inside a tokio runtime; the notification
/// dispatcher is spawned there) and tear down with
/// [`DirListingCache::shutdown`].
pub struct DirListingCache {
    inner: Mutex<CacheInner>,
    stats: CacheStats,
    overflow_log: OverflowLog,
    events: UnboundedSender<ChangeEvent>,
    shutdown: CancellationToken,
    weak_self: Weak<DirListingCache>,
}

impl DirListingCache {
    /// Create a cache with the given limits and spawn its dispatcher task.
    #[must_use]
    pub fn new(limits: CacheLimits) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let cache = Arc::new_cyclic(|weak: &Weak<Self>| Self {
            inner: Mutex::new(CacheInner {
                entries: LruCache::unbounded(),
                limits,
                current_bytes: 0,
            }),
            stats: CacheStats::default(),
            overflow_log: OverflowLog::new(),
            events: events_tx,
            shutdown: shutdown.clone(),
            weak_self: weak.clone(),
        });

        tokio::spawn(run_dispatcher(Arc::downgrade(&cache), events_rx, shutdown));

        info!(
            marker = "CACHE_OPERATION",
            operation_type = "cache_init",
            max_bytes = limits.max_bytes,
            max_watchers = limits.max_watchers,
            mru_watched = limits.mru_watched,
            "Listing cache initialized"
        );

        cache
    }

    /// Stop the notification dispatcher. Outstanding handles stay valid;
    /// change events arriving afterwards are applied synchronously by the
    /// watcher fallback path.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    // ────────────────────────────────────────────────────────────
    // Public operations
    // ────────────────────────────────────────────────────────────

    /// Acquire a short-lived read lease on one folder's listing.
    ///
    /// Creates the entry if needed, ensures the snapshot is present and
    /// fresh per `mode`, and returns a move-only handle whose drop
    /// releases the lease. A failed refresh with a retained previous
    /// snapshot degrades to `Ok` with [`Borrowed::is_stale`] set.
    #[instrument(skip(self, fs, token), fields(fs = %fs.id(), mode = ?mode))]
    pub async fn borrow(
        self: &Arc<Self>,
        fs: &FsHandle,
        path: &str,
        mode: LoadMode,
        token: Option<&CancellationToken>,
    ) -> CoreResult<Borrowed> {
        let key = CacheKey::new(fs.id(), path)?;

        {
            let mut inner = self.inner.lock();
            let state = inner
                .entries
                .get_or_insert_mut(key.clone(), || EntryState::new(fs.clone()));
            state.borrow_count += 1;
        }
        // The provisional lease dies on every exit path, including a
        // dropped future.
        let mut reservation = BorrowReservation {
            cache: self,
            key: &key,
            armed: true,
        };

        let loaded = match self.ensure_loaded(&key, mode, token).await {
            Ok(loaded) => loaded,
            Err(err) => {
                debug!(
                    marker = "CACHE_OPERATION",
                    operation_type = err.operation_type(),
                    key = %key,
                    error = %err,
                    "Borrow failed"
                );
                return Err(err);
            }
        };

        // The lease transfers to the handle.
        reservation.armed = false;
        drop(reservation);
        Ok(Borrowed::new(
            Arc::clone(self),
            key,
            loaded.snapshot,
            loaded.stale,
        ))
    }

    /// Register a long-lived keep-warm lease on one folder.
    ///
    /// Bumps the pin count and subscribes `on_change` to dirty
    /// notifications. Does not load; obtain the snapshot with a
    /// separate [`borrow`](Self::borrow).
    pub fn pin(
        self: &Arc<Self>,
        fs: &FsHandle,
        path: &str,
        on_change: ChangeCallback,
    ) -> CoreResult<Pinned> {
        let key = CacheKey::new(fs.id(), path)?;
        let id = SubscriberId::next();

        let mut inner = self.inner.lock();
        let state = inner
            .entries
            .get_or_insert_mut(key.clone(), || EntryState::new(fs.clone()));
        state.pin_count += 1;
        state.subscribers.push((id, on_change));
        self.rebalance_watchers_locked(&mut inner);
        drop(inner);

        debug!(
            marker = "CACHE_OPERATION",
            operation_type = "pin",
            key = %key,
            "Folder pinned"
        );

        Ok(Pinned::new(Arc::clone(self), key, id))
    }

    /// Mark a folder stale and fire subscriber notifications, if any are
    /// registered. Unknown paths are a no-op.
    pub fn invalidate(&self, fs: &FsHandle, path: &str) {
        let Ok(key) = CacheKey::new(fs.id(), path) else {
            return;
        };
        let event = ChangeEvent {
            key,
            overflow: false,
        };
        if let Err(send_err) = self.events.send(event) {
            // Dispatcher gone; apply in place so the change is not lost.
            self.apply_change(send_err.0);
        }
    }

    /// Whether the folder currently holds an active change-watcher.
    #[must_use]
    pub fn is_watched(&self, fs: &FsHandle, path: &str) -> bool {
        let Ok(key) = CacheKey::new(fs.id(), path) else {
            return false;
        };
        let inner = self.inner.lock();
        inner
            .entries
            .peek(&key)
            .is_some_and(|state| state.watcher.is_some())
    }

    /// Forcibly remove every entry belonging to `fs`, regardless of
    /// pin/borrow state. Used when a file-system instance is torn down;
    /// waiters on in-flight loads are woken and observe the removal.
    pub fn clear_for_filesystem(&self, fs: &FsHandle) {
        let mut inner = self.inner.lock();

        let doomed: Vec<CacheKey> = inner
            .entries
            .iter()
            .filter(|(key, _)| key.fs() == fs.id())
            .map(|(key, _)| key.clone())
            .collect();

        for key in &doomed {
            if let Some(mut state) = inner.entries.pop(key) {
                if let Some(mut watcher) = state.watcher.take() {
                    watcher.stop();
                }
                inner.current_bytes -= state.bytes;
                state.loaded.notify_waiters();
            }
        }
        self.rebalance_watchers_locked(&mut inner);
        drop(inner);

        if !doomed.is_empty() {
            info!(
                marker = "CACHE_OPERATION",
                operation_type = "clear_filesystem",
                fs = %fs.id(),
                removed = doomed.len(),
                "Cleared cache for filesystem"
            );
        }
    }

    /// Reconfigure the store and immediately re-run eviction and watcher
    /// rebalancing under the new limits.
    pub fn set_limits(&self, limits: CacheLimits) {
        let mut inner = self.inner.lock();
        inner.limits = limits;
        self.evict_to_budget_locked(&mut inner);
        self.rebalance_watchers_locked(&mut inner);
        drop(inner);

        info!(
            marker = "CACHE_OPERATION",
            operation_type = "set_limits",
            max_bytes = limits.max_bytes,
            max_watchers = limits.max_watchers,
            mru_watched = limits.mru_watched,
            "Cache limits updated"
        );
    }

    /// Point-in-time statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> CacheStatsSnapshot {
        let mut snapshot = CacheStatsSnapshot::default();
        self.stats.fill(&mut snapshot);

        let inner = self.inner.lock();
        snapshot.max_bytes = inner.limits.max_bytes;
        snapshot.current_bytes = inner.current_bytes;
        snapshot.entry_count = inner.entries.len();
        for (_, state) in inner.entries.iter() {
            if state.watcher.is_some() {
                snapshot.active_watchers += 1;
            }
            if state.pin_count > 0 {
                snapshot.pinned_entries += 1;
            }
        }
        snapshot
    }

    // ────────────────────────────────────────────────────────────
    // Single-flight loader
    // ────────────────────────────────────────────────────────────

    /// Ensure the entry's snapshot is present and fresh.
    ///
    /// At most one enumeration is in flight per key: the first caller to
    /// find the entry unloaded (or dirty) becomes the loading owner, all
    /// others wait on the entry's `Notify`. The owner runs the plugin call
    /// on the blocking pool with no lock held, applies the result, wakes
    /// the waiters, and re-runs eviction + watcher rebalancing. All lock
    /// acquisition happens in synchronous helpers so no guard ever spans
    /// an await point.
    async fn ensure_loaded(
        &self,
        key: &CacheKey,
        mode: LoadMode,
        token: Option<&CancellationToken>,
    ) -> CoreResult<Loaded> {
        let (fs, ticket) = loop {
            match self.next_load_step(key, mode)? {
                LoadStep::Ready(loaded) => return Ok(loaded),
                LoadStep::Own { fs, ticket } => break (fs, ticket),
                LoadStep::Wait(notify) => {
                    let mut waiter = pin!(notify.notified());
                    waiter.as_mut().enable();
                    // The load may have settled between the step decision
                    // and arming the waiter; re-check before sleeping so
                    // that wakeup is not missed.
                    if !self.is_loading(key) {
                        continue;
                    }
                    match token {
                        Some(token) => tokio::select! {
                            () = waiter => {}
                            () = token.cancelled() => return Err(CacheError::Cancelled),
                        },
                        None => waiter.await,
                    }
                }
            }
        };

        // Ownership is relinquished on every exit path: cancellation or a
        // dropped future clears `loading` and wakes waiters so one of them
        // takes over; the in-flight result is discarded when it lands.
        let mut ownership = LoadOwnership {
            cache: self,
            key,
            ticket,
            armed: true,
        };

        let path = key.path().to_owned();
        let plugin = fs.plugin();
        let load = tokio::task::spawn_blocking(move || plugin.read_directory_info(&path));

        let result = match token {
            Some(token) => tokio::select! {
                joined = load => Self::flatten_join(joined),
                () = token.cancelled() => return Err(CacheError::Cancelled),
            },
            None => Self::flatten_join(load.await),
        };

        ownership.armed = false;
        drop(ownership);
        self.finish_load(key, ticket, result, token)
    }

    /// One locked pass over the entry: hit fast-path, CacheOnly
    /// short-circuit, or claim/queue on the in-flight load.
    fn next_load_step(&self, key: &CacheKey, mode: LoadMode) -> CoreResult<LoadStep> {
        let mut inner = self.inner.lock();
        let Some(state) = inner.entries.get_mut(key) else {
            // Removed by clear_for_filesystem while we were queued.
            return Err(CacheError::FileSystemDetached(key.path().into()));
        };

        if let Some(snapshot) = &state.snapshot
            && !state.dirty
        {
            self.stats.record_hit();
            return Ok(LoadStep::Ready(Loaded {
                snapshot: snapshot.clone(),
                stale: false,
            }));
        }

        if mode == LoadMode::CacheOnly {
            return match &state.snapshot {
                Some(snapshot) => Ok(LoadStep::Ready(Loaded {
                    snapshot: snapshot.clone(),
                    stale: true,
                })),
                None => Err(CacheError::NoSnapshotYet(key.path().into())),
            };
        }

        if state.loading {
            return Ok(LoadStep::Wait(state.loaded.clone()));
        }

        state.loading = true;
        state.load_ticket = NEXT_LOAD_TICKET.fetch_add(1, Ordering::Relaxed);
        self.stats.record_miss();
        Ok(LoadStep::Own {
            fs: state.fs.clone(),
            ticket: state.load_ticket,
        })
    }

    fn is_loading(&self, key: &CacheKey) -> bool {
        let inner = self.inner.lock();
        inner.entries.peek(key).is_some_and(|state| state.loading)
    }

    fn flatten_join(
        joined: Result<Result<Arc<ListingSnapshot>, PluginError>, JoinError>,
    ) -> Result<Arc<ListingSnapshot>, PluginError> {
        joined.unwrap_or_else(|_| Err(PluginError::other("enumeration task panicked")))
    }

    /// Apply a finished load under the lock, wake waiters, rebalance.
    ///
    /// The result only lands when the entry still carries this owner's
    /// ticket; a load that outlived `clear_for_filesystem` (even if the
    /// key was recreated meanwhile) is handed to its caller uncached.
    fn finish_load(
        &self,
        key: &CacheKey,
        ticket: u64,
        result: Result<Arc<ListingSnapshot>, PluginError>,
        token: Option<&CancellationToken>,
    ) -> CoreResult<Loaded> {
        let mut inner = self.inner.lock();
        let CacheInner {
            entries,
            current_bytes,
            ..
        } = &mut *inner;

        let owned = match entries.get_mut(key) {
            Some(state) if state.loading && state.load_ticket == ticket => Some(state),
            _ => None,
        };

        let outcome = if let Some(state) = owned {
            state.loading = false;
            let outcome = match result {
                Ok(snapshot) => {
                    *current_bytes -= state.bytes;
                    state.bytes = snapshot.byte_size();
                    *current_bytes += state.bytes;
                    state.snapshot = Some(snapshot.clone());
                    state.dirty = false;
                    state.notify_posted = false;
                    self.stats.record_enumeration();

                    debug!(
                        marker = "CACHE_OPERATION",
                        operation_type = "load_complete",
                        key = %key,
                        bytes = state.bytes,
                        entries = snapshot.len(),
                        "Listing loaded"
                    );

                    Ok(Loaded {
                        snapshot,
                        stale: false,
                    })
                }
                Err(err) => {
                    // Keep the previous snapshot; dirty stays set so a
                    // future borrow retries.
                    state.dirty = true;
                    match &state.snapshot {
                        Some(stale) => {
                            warn!(
                                marker = "CACHE_OPERATION",
                                operation_type = "load_failed_stale",
                                key = %key,
                                error = %err,
                                "Enumeration failed; serving stale snapshot"
                            );
                            Ok(Loaded {
                                snapshot: stale.clone(),
                                stale: true,
                            })
                        }
                        None => Err(CacheError::from_plugin(key.path(), err)),
                    }
                }
            };
            state.loaded.notify_waiters();
            outcome
        } else {
            // Superseded: torn down mid-load, possibly recreated since.
            // Hand the fresh value (an immutable snapshot) to this one
            // caller; nothing is cached and no entry state is touched.
            match result {
                Ok(snapshot) => Ok(Loaded {
                    snapshot,
                    stale: false,
                }),
                Err(err) => Err(CacheError::from_plugin(key.path(), err)),
            }
        };

        self.evict_to_budget_locked(&mut inner);
        self.rebalance_watchers_locked(&mut inner);
        drop(inner);

        if token.is_some_and(CancellationToken::is_cancelled) {
            return Err(CacheError::Cancelled);
        }
        outcome
    }

    /// An owned load was abandoned: release the flag and wake waiters so
    /// one of them can take over. No-op when the ownership has already
    /// been superseded.
    fn abort_load(&self, key: &CacheKey, ticket: u64) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.entries.peek_mut(key)
            && state.loading
            && state.load_ticket == ticket
        {
            state.loading = false;
            state.loaded.notify_waiters();
        }
        self.evict_to_budget_locked(&mut inner);
        self.rebalance_watchers_locked(&mut inner);
    }

    // ────────────────────────────────────────────────────────────
    // Lease release (called from handle drops)
    // ────────────────────────────────────────────────────────────

    pub(crate) fn release_borrow(&self, key: &CacheKey) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.entries.peek_mut(key) {
            state.borrow_count = state.borrow_count.saturating_sub(1);
        }
        self.evict_to_budget_locked(&mut inner);
        self.rebalance_watchers_locked(&mut inner);
    }

    pub(crate) fn release_pin(&self, key: &CacheKey, id: SubscriberId) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.entries.peek_mut(key) {
            state.pin_count = state.pin_count.saturating_sub(1);
            state.subscribers.retain(|(sid, _)| *sid != id);
        }
        self.evict_to_budget_locked(&mut inner);
        self.rebalance_watchers_locked(&mut inner);
    }

    // ────────────────────────────────────────────────────────────
    // Dirty marking (dispatcher + synchronous fallback)
    // ────────────────────────────────────────────────────────────

    /// Mark an entry stale and collect one notification burst per dirty
    /// cycle. Callbacks run after the lock is released.
    pub(crate) fn apply_change(&self, event: ChangeEvent) {
        if event.overflow {
            let total = self.stats.record_overflow();
            self.overflow_log.log(&event.key, total);
        }

        let callbacks = {
            let mut inner = self.inner.lock();
            let Some(state) = inner.entries.peek_mut(&event.key) else {
                return;
            };
            state.dirty = true;
            self.stats.record_dirty_mark();

            if !state.notify_posted && !state.subscribers.is_empty() {
                state.notify_posted = true;
                state.subscribers.clone()
            } else {
                SmallVec::new()
            }
        };

        for (_, callback) in &callbacks {
            callback(&event.key);
        }
    }

    // ────────────────────────────────────────────────────────────
    // Eviction & watcher rebalancing (lock held)
    // ────────────────────────────────────────────────────────────

    /// Evict least-recently-used, unreferenced entries until the byte
    /// budget holds. Ineligible entries are relocated to the recent end;
    /// the pass stops once every remaining entry proved ineligible, so a
    /// fully pinned cache cannot spin the scan forever.
    fn evict_to_budget_locked(&self, inner: &mut CacheInner) {
        if inner.limits.max_bytes == 0 {
            return;
        }

        let mut ineligible = 0usize;
        while inner.current_bytes > inner.limits.max_bytes && ineligible < inner.entries.len() {
            let Some((key, mut state)) = inner.entries.pop_lru() else {
                break;
            };

            if state.evictable() {
                if let Some(mut watcher) = state.watcher.take() {
                    watcher.stop();
                }
                inner.current_bytes -= state.bytes;
                self.stats.record_eviction();
                ineligible = 0;

                debug!(
                    marker = "CACHE_OPERATION",
                    operation_type = "evict",
                    key = %key,
                    freed_bytes = state.bytes,
                    "Entry evicted"
                );
            } else {
                let _ = inner.entries.push(key, state);
                ineligible += 1;
            }
        }
    }

    /// Re-run the watcher budget allocation: stop watchers that lost
    /// their slot, start watchers for newly selected entries. A failed
    /// start is logged and the entry simply stays unwatched.
    fn rebalance_watchers_locked(&self, inner: &mut CacheInner) {
        if inner.limits.max_watchers == 0 {
            for (_, state) in inner.entries.iter_mut() {
                if let Some(mut watcher) = state.watcher.take() {
                    watcher.stop();
                }
            }
            return;
        }

        let wanted = select_watched(&inner.entries, &inner.limits);

        for (key, state) in inner.entries.iter_mut() {
            if state.watcher.is_some() && !wanted.contains(key) {
                if let Some(mut watcher) = state.watcher.take() {
                    watcher.stop();
                }
            }
        }

        for key in wanted {
            let Some(state) = inner.entries.peek_mut(&key) else {
                continue;
            };
            if state.watcher.is_some() || !state.fs.plugin().supports_watch() {
                continue;
            }
            match FolderWatcher::start(
                &key,
                state.fs.clone(),
                self.events.clone(),
                self.weak_self.clone(),
            ) {
                Ok(watcher) => state.watcher = Some(watcher),
                Err(err) => debug!(
                    marker = "CACHE_OPERATION",
                    operation_type = "watch_start_failed",
                    key = %key,
                    error = %err,
                    "Could not start watcher; folder stays unwatched"
                ),
            }
        }
    }
}

impl std::fmt::Debug for DirListingCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("DirListingCache")
            .field("entries", &inner.entries.len())
            .field("current_bytes", &inner.current_bytes)
            .field("limits", &inner.limits)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::time::{sleep, timeout};

    use super::*;
    use crate::fs::mock::MockFs;

    fn assert_send<F: std::future::Future + Send>(fut: F) -> F {
        fut
    }

    const NO_EVICTION: CacheLimits = CacheLimits {
        max_bytes: 0,
        max_watchers: 0,
        mru_watched: 0,
    };

    const fn limits(max_bytes: u64, max_watchers: usize, mru_watched: usize) -> CacheLimits {
        CacheLimits {
            max_bytes,
            max_watchers,
            mru_watched,
        }
    }

    async fn settle() {
        sleep(Duration::from_millis(20)).await;
    }

    async fn wait_until(what: &str, cond: impl Fn() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_borrows_share_one_enumeration() {
        let mock = MockFs::new();
        mock.put_listing("/big", 10);
        let fs = FsHandle::new(mock.clone());
        let cache = DirListingCache::new(NO_EVICTION);

        mock.hold();
        let (c1, f1) = (cache.clone(), fs.clone());
        let first =
            tokio::spawn(async move { c1.borrow(&f1, "/big", LoadMode::Refresh, None).await });
        wait_until("owner inside plugin call", || mock.calls() == 1).await;

        let (c2, f2) = (cache.clone(), fs.clone());
        let second =
            tokio::spawn(async move { c2.borrow(&f2, "/big", LoadMode::Refresh, None).await });
        settle().await;
        mock.release();

        let b1 = first.await.unwrap().unwrap();
        let b2 = second.await.unwrap().unwrap();

        assert_eq!(mock.calls(), 1);
        assert!(Arc::ptr_eq(b1.snapshot(), b2.snapshot()));

        let stats = cache.stats();
        assert_eq!(stats.enumerations, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn repeat_borrow_is_a_hit() {
        let mock = MockFs::new();
        mock.put_listing("/d", 3);
        let fs = FsHandle::new(mock.clone());
        let cache = DirListingCache::new(NO_EVICTION);

        drop(cache.borrow(&fs, "/d", LoadMode::Refresh, None).await.unwrap());
        let b = cache.borrow(&fs, "/d", LoadMode::Refresh, None).await.unwrap();

        assert_eq!(mock.calls(), 1);
        assert_eq!(b.entries().len(), 3);
        assert!(!b.is_stale());
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cache_only_never_enumerates() {
        let mock = MockFs::new();
        mock.put_listing("/x", 4);
        let fs = FsHandle::new(mock.clone());
        let cache = DirListingCache::new(NO_EVICTION);

        let err = cache
            .borrow(&fs, "/x", LoadMode::CacheOnly, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::NoSnapshotYet(_)));
        assert_eq!(mock.calls(), 0);

        drop(cache.borrow(&fs, "/x", LoadMode::Refresh, None).await.unwrap());
        cache.invalidate(&fs, "/x");
        wait_until("dirty mark applied", || cache.stats().dirty_marks == 1).await;

        // Dirty entry: CacheOnly serves the retained snapshot, marked stale.
        let b = cache
            .borrow(&fs, "/x", LoadMode::CacheOnly, None)
            .await
            .unwrap();
        assert!(b.is_stale());
        assert_eq!(b.entries().len(), 4);
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn eviction_reclaims_lru_unreferenced_entry() {
        let mock = MockFs::new();
        mock.put_listing("/a", 50);
        mock.put_listing("/b", 50);
        let fs = FsHandle::new(mock.clone());
        let cache = DirListingCache::new(NO_EVICTION);

        drop(cache.borrow(&fs, "/a", LoadMode::Refresh, None).await.unwrap());
        let one = cache.stats().current_bytes;
        assert!(one > 0);

        // Room for one and a half listings: loading /b must push /a out.
        cache.set_limits(limits(one + one / 2, 0, 0));
        drop(cache.borrow(&fs, "/b", LoadMode::Refresh, None).await.unwrap());

        let stats = cache.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.entry_count, 1);
        assert!(stats.current_bytes <= one + one / 2);

        let err = cache
            .borrow(&fs, "/a", LoadMode::CacheOnly, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::NoSnapshotYet(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn borrowed_entry_not_evicted_while_lease_held() {
        let mock = MockFs::new();
        mock.put_listing("/held", 20);
        let fs = FsHandle::new(mock.clone());
        let cache = DirListingCache::new(NO_EVICTION);

        let b = cache
            .borrow(&fs, "/held", LoadMode::Refresh, None)
            .await
            .unwrap();
        cache.set_limits(limits(1, 0, 0));

        let stats = cache.stats();
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.evictions, 0);

        // Releasing the lease makes the entry reclaimable at once.
        drop(b);
        let stats = cache.stats();
        assert_eq!(stats.entry_count, 0);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.current_bytes, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pinned_entry_survives_eviction_pressure() {
        let mock = MockFs::new();
        mock.put_listing("/keep", 30);
        mock.put_listing("/other", 30);
        let fs = FsHandle::new(mock.clone());
        let cache = DirListingCache::new(NO_EVICTION);

        let pin = cache.pin(&fs, "/keep", Arc::new(|_| {})).unwrap();
        drop(
            cache
                .borrow(&fs, "/keep", LoadMode::Refresh, None)
                .await
                .unwrap(),
        );
        drop(
            cache
                .borrow(&fs, "/other", LoadMode::Refresh, None)
                .await
                .unwrap(),
        );

        cache.set_limits(limits(1, 0, 0));

        let stats = cache.stats();
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.pinned_entries, 1);
        assert_eq!(stats.evictions, 1);

        let b = cache
            .borrow(&fs, "/keep", LoadMode::CacheOnly, None)
            .await
            .unwrap();
        assert!(!b.is_stale());
        drop(b);
        drop(pin);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn eviction_pass_terminates_with_everything_pinned() {
        let mock = MockFs::new();
        mock.put_listing("/p1", 30);
        mock.put_listing("/p2", 30);
        let fs = FsHandle::new(mock.clone());
        let cache = DirListingCache::new(NO_EVICTION);

        let pin1 = cache.pin(&fs, "/p1", Arc::new(|_| {})).unwrap();
        let pin2 = cache.pin(&fs, "/p2", Arc::new(|_| {})).unwrap();
        drop(cache.borrow(&fs, "/p1", LoadMode::Refresh, None).await.unwrap());
        drop(cache.borrow(&fs, "/p2", LoadMode::Refresh, None).await.unwrap());

        // Budget far below occupancy; the scan must give up, not spin.
        cache.set_limits(limits(1, 0, 0));

        let stats = cache.stats();
        assert_eq!(stats.entry_count, 2);
        assert_eq!(stats.evictions, 0);
        drop(pin1);
        drop(pin2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancelled_owner_recovers_for_next_borrow() {
        let mock = MockFs::new();
        mock.put_listing("/slow", 5);
        let fs = FsHandle::new(mock.clone());
        let cache = DirListingCache::new(NO_EVICTION);

        mock.hold();
        let token = CancellationToken::new();
        let (c, f, tok) = (cache.clone(), fs.clone(), token.clone());
        let task =
            tokio::spawn(
                async move { c.borrow(&f, "/slow", LoadMode::Refresh, Some(&tok)).await },
            );
        wait_until("owner inside plugin call", || mock.calls() == 1).await;

        token.cancel();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, CacheError::Cancelled));
        assert!(err.is_recoverable());

        mock.release();
        let b = cache
            .borrow(&fs, "/slow", LoadMode::Refresh, None)
            .await
            .unwrap();
        assert_eq!(b.entries().len(), 5);
        assert!(!b.is_stale());
        assert_eq!(mock.calls(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancelled_waiter_leaves_owner_running() {
        let mock = MockFs::new();
        mock.put_listing("/slow", 5);
        let fs = FsHandle::new(mock.clone());
        let cache = DirListingCache::new(NO_EVICTION);

        mock.hold();
        let (c1, f1) = (cache.clone(), fs.clone());
        let owner =
            tokio::spawn(async move { c1.borrow(&f1, "/slow", LoadMode::Refresh, None).await });
        wait_until("owner inside plugin call", || mock.calls() == 1).await;

        let token = CancellationToken::new();
        let (c2, f2, tok) = (cache.clone(), fs.clone(), token.clone());
        let waiter =
            tokio::spawn(
                async move { c2.borrow(&f2, "/slow", LoadMode::Refresh, Some(&tok)).await },
            );
        settle().await;

        token.cancel();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, CacheError::Cancelled));

        mock.release();
        let b = owner.await.unwrap().unwrap();
        assert_eq!(b.entries().len(), 5);
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn borrow_future_is_send_across_threads() {
        let mock = MockFs::new();
        mock.put_listing("/s", 2);
        let fs = FsHandle::new(mock.clone());
        let cache = DirListingCache::new(NO_EVICTION);

        let b = assert_send(cache.borrow(&fs, "/s", LoadMode::Refresh, None))
            .await
            .unwrap();
        assert_eq!(b.entries().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn dropped_borrow_future_releases_lease_and_load() {
        let mock = MockFs::new();
        mock.put_listing("/slow", 5);
        let fs = FsHandle::new(mock.clone());
        let cache = DirListingCache::new(NO_EVICTION);

        // The borrow future is dropped at its await while the plugin call
        // is still blocked.
        mock.hold();
        let attempt = timeout(
            Duration::from_millis(50),
            cache.borrow(&fs, "/slow", LoadMode::Refresh, None),
        )
        .await;
        assert!(attempt.is_err());
        wait_until("abandoned enumeration started", || mock.calls() == 1).await;
        mock.release();

        // The abandoned load must not wedge the entry: a retry becomes
        // the new owner instead of waiting forever.
        let b = timeout(
            Duration::from_secs(2),
            cache.borrow(&fs, "/slow", LoadMode::Refresh, None),
        )
        .await
        .expect("retry blocked on an abandoned load")
        .unwrap();
        assert_eq!(b.entries().len(), 5);
        assert_eq!(mock.calls(), 2);
        drop(b);

        // The provisional lease died with the future: nothing holds the
        // entry, so it evicts under pressure.
        cache.set_limits(limits(1, 0, 0));
        let stats = cache.stats();
        assert_eq!(stats.entry_count, 0);
        assert_eq!(stats.evictions, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn load_surviving_forced_clear_cannot_touch_recreated_entry() {
        let mock = MockFs::new();
        mock.put_listing("/d", 3);
        let fs = FsHandle::new(mock.clone());
        let cache = DirListingCache::new(NO_EVICTION);

        mock.hold();
        let (c1, f1) = (cache.clone(), fs.clone());
        let old = tokio::spawn(async move { c1.borrow(&f1, "/d", LoadMode::Refresh, None).await });
        wait_until("first enumeration started", || mock.calls() == 1).await;

        // Tear the key down mid-load, then recreate it with a second load
        // in flight.
        cache.clear_for_filesystem(&fs);
        let (c2, f2) = (cache.clone(), fs.clone());
        let fresh =
            tokio::spawn(async move { c2.borrow(&f2, "/d", LoadMode::Refresh, None).await });
        wait_until("second enumeration started", || mock.calls() == 2).await;
        mock.release();

        let b_old = old.await.unwrap().unwrap();
        let b_fresh = fresh.await.unwrap().unwrap();
        assert_eq!(b_old.entries().len(), 3);
        assert_eq!(b_fresh.entries().len(), 3);
        drop(b_old);

        // Only the load owned by the recreated entry was applied.
        let stats = cache.stats();
        assert_eq!(stats.enumerations, 1);
        assert_eq!(stats.entry_count, 1);

        // The superseded result left the fresh entry settled: a repeat
        // borrow is a plain hit, not a second concurrent enumeration.
        let b = cache.borrow(&fs, "/d", LoadMode::Refresh, None).await.unwrap();
        assert!(!b.is_stale());
        assert_eq!(mock.calls(), 2);
        drop(b);
        drop(b_fresh);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_refresh_serves_stale_and_retries_later() {
        let mock = MockFs::new();
        mock.put_listing("/d", 5);
        let fs = FsHandle::new(mock.clone());
        let cache = DirListingCache::new(NO_EVICTION);

        drop(cache.borrow(&fs, "/d", LoadMode::Refresh, None).await.unwrap());
        cache.invalidate(&fs, "/d");
        wait_until("dirty mark applied", || cache.stats().dirty_marks == 1).await;

        mock.set_failing(true);
        let b = cache.borrow(&fs, "/d", LoadMode::Refresh, None).await.unwrap();
        assert!(b.is_stale());
        assert_eq!(b.entries().len(), 5);
        drop(b);

        // Dirty stayed set, so the next refresh re-enumerates.
        mock.set_failing(false);
        let b = cache.borrow(&fs, "/d", LoadMode::Refresh, None).await.unwrap();
        assert!(!b.is_stale());
        assert_eq!(mock.calls(), 3);
        drop(b);

        // With nothing retained the failure surfaces as an error.
        let err = cache
            .borrow(&fs, "/missing", LoadMode::Refresh, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::PathNotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn change_notifications_dedup_until_refresh() {
        let mock = MockFs::watchable();
        mock.put_listing("/w", 3);
        let fs = FsHandle::new(mock.clone());
        let cache = DirListingCache::new(limits(0, 4, 2));

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let pin = cache
            .pin(
                &fs,
                "/w",
                Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        assert!(cache.is_watched(&fs, "/w"));

        assert!(mock.fire_change("/w", false));
        wait_until("first notification", || fired.load(Ordering::SeqCst) == 1).await;

        // Second change in the same dirty cycle: mark counted, burst not.
        assert!(mock.fire_change("/w", false));
        wait_until("second dirty mark", || cache.stats().dirty_marks == 2).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // A successful refresh re-arms the notification latch.
        drop(cache.borrow(&fs, "/w", LoadMode::Refresh, None).await.unwrap());
        assert!(mock.fire_change("/w", false));
        wait_until("post-refresh notification", || {
            fired.load(Ordering::SeqCst) == 2
        })
        .await;
        drop(pin);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn watcher_budget_prefers_pinned_then_mru() {
        let mock = MockFs::watchable();
        mock.put_listing("/a", 2);
        mock.put_listing("/b", 2);
        mock.put_listing("/c", 2);
        let fs = FsHandle::new(mock.clone());
        let cache = DirListingCache::new(limits(0, 2, 2));

        for path in ["/a", "/b", "/c"] {
            drop(cache.borrow(&fs, path, LoadMode::Refresh, None).await.unwrap());
        }

        let stats = cache.stats();
        assert_eq!(stats.active_watchers, 2);
        assert!(cache.is_watched(&fs, "/c"));
        assert!(cache.is_watched(&fs, "/b"));
        assert!(!cache.is_watched(&fs, "/a"));

        // Pinning the coldest folder steals a slot from the MRU pool.
        let pin = cache.pin(&fs, "/a", Arc::new(|_| {})).unwrap();
        assert!(cache.is_watched(&fs, "/a"));
        assert_eq!(cache.stats().active_watchers, 2);
        assert_eq!(mock.watch_count(), 2);
        drop(pin);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn zero_watcher_budget_stops_everything() {
        let mock = MockFs::watchable();
        mock.put_listing("/a", 2);
        let fs = FsHandle::new(mock.clone());
        let cache = DirListingCache::new(limits(0, 2, 2));

        drop(cache.borrow(&fs, "/a", LoadMode::Refresh, None).await.unwrap());
        assert!(cache.is_watched(&fs, "/a"));

        cache.set_limits(limits(0, 0, 0));
        assert_eq!(cache.stats().active_watchers, 0);
        assert_eq!(mock.watch_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn clear_for_filesystem_removes_even_pinned_entries() {
        let mock1 = MockFs::new();
        let mock2 = MockFs::new();
        mock1.put_listing("/one", 3);
        mock2.put_listing("/two", 3);
        let fs1 = FsHandle::new(mock1.clone());
        let fs2 = FsHandle::new(mock2.clone());
        let cache = DirListingCache::new(NO_EVICTION);

        let pin = cache.pin(&fs1, "/one", Arc::new(|_| {})).unwrap();
        drop(cache.borrow(&fs1, "/one", LoadMode::Refresh, None).await.unwrap());
        drop(cache.borrow(&fs2, "/two", LoadMode::Refresh, None).await.unwrap());

        cache.clear_for_filesystem(&fs1);

        let stats = cache.stats();
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.pinned_entries, 0);

        // The surviving backend is untouched.
        let b = cache
            .borrow(&fs2, "/two", LoadMode::CacheOnly, None)
            .await
            .unwrap();
        assert_eq!(b.entries().len(), 3);
        drop(b);

        // A forcibly cleared pin must release without effect.
        drop(pin);
        assert_eq!(cache.stats().entry_count, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalidate_unknown_path_is_a_noop() {
        let mock = MockFs::new();
        let fs = FsHandle::new(mock.clone());
        let cache = DirListingCache::new(NO_EVICTION);

        cache.invalidate(&fs, "/never-seen");
        settle().await;

        let stats = cache.stats();
        assert_eq!(stats.dirty_marks, 0);
        assert_eq!(stats.entry_count, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reload_byte_accounting_is_idempotent() {
        let mock = MockFs::new();
        mock.put_listing("/a", 25);
        let fs = FsHandle::new(mock.clone());
        let cache = DirListingCache::new(NO_EVICTION);

        drop(cache.borrow(&fs, "/a", LoadMode::Refresh, None).await.unwrap());
        let first = cache.stats().current_bytes;

        cache.invalidate(&fs, "/a");
        wait_until("dirty mark applied", || cache.stats().dirty_marks == 1).await;
        drop(cache.borrow(&fs, "/a", LoadMode::Refresh, None).await.unwrap());

        let stats = cache.stats();
        assert_eq!(stats.current_bytes, first);
        assert_eq!(stats.enumerations, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn overflow_changes_are_counted() {
        let mock = MockFs::watchable();
        mock.put_listing("/w", 2);
        let fs = FsHandle::new(mock.clone());
        let cache = DirListingCache::new(limits(0, 2, 2));

        let pin = cache.pin(&fs, "/w", Arc::new(|_| {})).unwrap();
        assert!(mock.fire_change("/w", true));
        assert!(mock.fire_change("/w", true));
        wait_until("dirty marks recorded", || cache.stats().dirty_marks == 2).await;
        assert_eq!(cache.stats().overflows, 2);
        drop(pin);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_falls_back_to_synchronous_dirty_marks() {
        let mock = MockFs::new();
        mock.put_listing("/a", 2);
        let fs = FsHandle::new(mock.clone());
        let cache = DirListingCache::new(NO_EVICTION);

        drop(cache.borrow(&fs, "/a", LoadMode::Refresh, None).await.unwrap());

        cache.shutdown();
        sleep(Duration::from_millis(50)).await;

        // With the dispatcher gone the send fails and the change is
        // applied in place instead of being lost.
        cache.invalidate(&fs, "/a");
        wait_until("fallback dirty mark", || cache.stats().dirty_marks == 1).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn case_insensitive_paths_share_one_entry() {
        let mock = MockFs::new();
        mock.put_listing("/Docs", 3);
        let fs = FsHandle::new(mock.clone());
        let cache = DirListingCache::new(NO_EVICTION);

        drop(cache.borrow(&fs, "/Docs", LoadMode::Refresh, None).await.unwrap());
        let b = cache
            .borrow(&fs, "/docs", LoadMode::Refresh, None)
            .await
            .unwrap();

        assert_eq!(mock.calls(), 1);
        assert_eq!(cache.stats().entry_count, 1);
        assert_eq!(b.entries().len(), 3);
    }
}
