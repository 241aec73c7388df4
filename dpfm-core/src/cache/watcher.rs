//! `src/cache/watcher.rs`
//! ============================================================
//! Change-watcher plumbing.
//!
//! Three pieces live here:
//! - the budget allocator's selection pass ([`select_watched`]): which
//!   entries deserve one of the bounded watcher slots;
//! - the [`FolderWatcher`] bridge: adapts a plugin's native notification
//!   into a queued [`ChangeEvent`] without ever taking the cache lock in
//!   the plugin's callback;
//! - the dispatcher task ([`run_dispatcher`]): drains the queue and applies
//!   dirty-marks + subscriber bursts on its own task.

use std::sync::Weak;
use std::time::{Duration, Instant};

use compact_str::CompactString;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::cache::entry::EntryState;
use crate::cache::key::CacheKey;
use crate::cache::store::DirListingCache;
use crate::config::CacheLimits;
use crate::fs::plugin::{DirChange, FsHandle, PluginError, WatchCallback};

/// One change notification on its way from a plugin to the cache.
#[derive(Debug, Clone)]
pub(crate) struct ChangeEvent {
    pub key: CacheKey,
    pub overflow: bool,
}

/// Decide which entries should hold a watcher, in priority order.
///
/// Pinned entries first (most-recently-used first), then up to
/// `mru_watched` additional loaded, settled entries, all within
/// `max_watchers`. Returns an empty list when the budget is zero.
pub(crate) fn select_watched(
    entries: &LruCache<CacheKey, EntryState>,
    limits: &CacheLimits,
) -> Vec<CacheKey> {
    let budget = limits.max_watchers;
    let mut wanted = Vec::with_capacity(budget.min(entries.len()));
    if budget == 0 {
        return wanted;
    }

    // iter() walks MRU → LRU.
    for (key, state) in entries.iter() {
        if wanted.len() >= budget {
            return wanted;
        }
        if state.pin_count > 0 {
            wanted.push(key.clone());
        }
    }

    let mut extra = 0;
    for (key, state) in entries.iter() {
        if wanted.len() >= budget || extra >= limits.mru_watched {
            break;
        }
        if state.wants_mru_watcher() {
            wanted.push(key.clone());
            extra += 1;
        }
    }

    wanted
}

/// One active watch registration on one folder.
///
/// The callback handed to the plugin only forwards into the unbounded
/// event queue. If the queue is gone (cache shutting down between the
/// send and the callback firing), the change is applied synchronously
/// through a weak cache reference so it is never silently lost.
pub(crate) struct FolderWatcher {
    fs: FsHandle,
    path: CompactString,
    stopped: bool,
}

impl FolderWatcher {
    pub fn start(
        key: &CacheKey,
        fs: FsHandle,
        events: UnboundedSender<ChangeEvent>,
        cache: Weak<DirListingCache>,
    ) -> Result<Self, PluginError> {
        let cb_key = key.clone();
        let callback: WatchCallback = Box::new(move |change: DirChange| {
            let event = ChangeEvent {
                key: cb_key.clone(),
                overflow: change.overflow,
            };
            if let Err(send_err) = events.send(event) {
                if let Some(cache) = cache.upgrade() {
                    cache.apply_change(send_err.0);
                }
            }
        });

        fs.plugin().watch(key.path(), callback)?;
        trace!(key = %key, "watcher started");

        Ok(Self {
            fs,
            path: CompactString::new(key.path()),
            stopped: false,
        })
    }

    /// Unregister the native watch. Idempotent.
    pub fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.fs.plugin().unwatch(&self.path);
            trace!(path = %self.path, "watcher stopped");
        }
    }
}

impl Drop for FolderWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Rate limiter for overflow warnings: at most one log line per cool-down.
pub(crate) struct OverflowLog {
    last: Mutex<Option<Instant>>,
    cooldown: Duration,
}

impl OverflowLog {
    pub const COOLDOWN: Duration = Duration::from_secs(30);

    pub fn new() -> Self {
        Self {
            last: Mutex::new(None),
            cooldown: Self::COOLDOWN,
        }
    }

    pub fn log(&self, key: &CacheKey, total: u64) {
        let mut last = self.last.lock();
        let due = last.is_none_or(|at| at.elapsed() >= self.cooldown);
        if due {
            *last = Some(Instant::now());
            warn!(
                marker = "CACHE_OPERATION",
                operation_type = "watch_overflow",
                key = %key,
                total_overflows = total,
                "Native watch overflowed; treating folder as changed"
            );
        }
    }
}

/// Background queue drain. Exits on shutdown, on queue closure, or once
/// the cache itself has been dropped.
pub(crate) async fn run_dispatcher(
    cache: Weak<DirListingCache>,
    mut events: UnboundedReceiver<ChangeEvent>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                let Some(cache) = cache.upgrade() else { break };
                cache.apply_change(event);
            }
        }
    }
    trace!("notification dispatcher stopped");
}
