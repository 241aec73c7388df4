//! `src/fs/mock.rs`
//! ============================================================
//! Test-only in-memory backend.
//!
//! Enumeration can be gated (held open so concurrent callers pile up on
//! the single-flight path), made to fail on demand, and counted. Watch
//! registrations are recorded so tests can fire change notifications by
//! hand.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::SystemTime;

use parking_lot::{Condvar, Mutex};

use crate::fs::listing::{EntryKind, ListingEntry, ListingSnapshot};
use crate::fs::plugin::{DirChange, FsPlugin, PluginError, WatchCallback};

pub(crate) struct MockFs {
    watchable: bool,
    listings: Mutex<HashMap<String, Vec<ListingEntry>>>,
    calls: AtomicUsize,
    fail: AtomicBool,
    gate_held: Mutex<bool>,
    gate_cv: Condvar,
    watches: Mutex<HashMap<String, WatchCallback>>,
}

impl MockFs {
    pub fn new() -> Arc<Self> {
        Self::build(false)
    }

    pub fn watchable() -> Arc<Self> {
        Self::build(true)
    }

    fn build(watchable: bool) -> Arc<Self> {
        Arc::new(Self {
            watchable,
            listings: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            gate_held: Mutex::new(false),
            gate_cv: Condvar::new(),
            watches: Mutex::new(HashMap::new()),
        })
    }

    /// Populate a folder with `files` synthetic entries.
    pub fn put_listing(&self, path: &str, files: usize) {
        let entries = (0..files)
            .map(|i| {
                ListingEntry::new(
                    &format!("file-{i:04}.txt"),
                    EntryKind::File,
                    42,
                    SystemTime::UNIX_EPOCH,
                )
            })
            .collect();
        self.listings.lock().insert(path.to_owned(), entries);
    }

    /// Total `read_directory_info` invocations so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    /// Block all enumerations until [`release`](Self::release).
    pub fn hold(&self) {
        *self.gate_held.lock() = true;
    }

    pub fn release(&self) {
        let mut held = self.gate_held.lock();
        *held = false;
        self.gate_cv.notify_all();
    }

    /// Deliver a native change notification through the registered watch.
    /// Returns false when the folder is not watched.
    pub fn fire_change(&self, path: &str, overflow: bool) -> bool {
        let watches = self.watches.lock();
        match watches.get(path) {
            Some(callback) => {
                callback(DirChange { overflow });
                true
            }
            None => false,
        }
    }

    pub fn watch_count(&self) -> usize {
        self.watches.lock().len()
    }
}

impl FsPlugin for MockFs {
    fn name(&self) -> &str {
        "mock"
    }

    fn read_directory_info(&self, path: &str) -> Result<Arc<ListingSnapshot>, PluginError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        {
            let mut held = self.gate_held.lock();
            while *held {
                self.gate_cv.wait(&mut held);
            }
        }

        if self.fail.load(Ordering::SeqCst) {
            return Err(PluginError::other("injected enumeration failure"));
        }

        let listings = self.listings.lock();
        match listings.get(path) {
            Some(entries) => Ok(Arc::new(ListingSnapshot::new(entries.clone()))),
            None => Err(PluginError::not_found(path)),
        }
    }

    fn supports_watch(&self) -> bool {
        self.watchable
    }

    fn watch(&self, path: &str, callback: WatchCallback) -> Result<(), PluginError> {
        if !self.watchable {
            return Err(PluginError::WatchUnsupported);
        }
        self.watches.lock().insert(path.to_owned(), callback);
        Ok(())
    }

    fn unwatch(&self, path: &str) {
        self.watches.lock().remove(path);
    }
}
