//! `src/fs/listing.rs`
//! ============================================================
//! Immutable directory listing snapshots.
//!
//! A `ListingSnapshot` is the unit published by a file-system plugin and
//! cached by the store. It is constructed once, shared as
//! `Arc<ListingSnapshot>`, and never mutated afterwards; replacing a
//! snapshot is a copy-on-replace swap under the cache lock, so concurrent
//! readers of a published snapshot need no synchronization.

use std::mem;
use std::time::SystemTime;

use bytesize::ByteSize;
use compact_str::CompactString;

/// Entry classification: file, directory, or symlink target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
    Symlink,
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dir => write!(f, "Dir"),
            Self::File => write!(f, "File"),
            Self::Symlink => write!(f, "Symlink"),
        }
    }
}

/// One row of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    /// Byte length - sorting hot path
    pub size: u64,

    /// Last-modification timestamp - sorting hot path
    pub modified: SystemTime,

    /// File or directory name - rendering hot path
    pub name: CompactString,

    /// Lower-case extension (files only) - occasional access
    pub extension: Option<CompactString>,

    pub kind: EntryKind,
}

impl ListingEntry {
    #[must_use]
    pub fn new(name: &str, kind: EntryKind, size: u64, modified: SystemTime) -> Self {
        let extension = if kind == EntryKind::File {
            name.rsplit_once('.')
                .map(|(_, ext)| CompactString::new(ext.to_lowercase()))
        } else {
            None
        };

        Self {
            size,
            modified,
            name: CompactString::new(name),
            extension,
            kind,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_dir(&self) -> bool {
        matches!(self.kind, EntryKind::Dir)
    }

    /// Human-readable size string.
    #[inline]
    #[must_use]
    pub fn size_human(&self) -> String {
        ByteSize::b(self.size).to_string()
    }

    /// Approximate heap + inline footprint of this entry, used for the
    /// cache byte budget.
    fn weight(&self) -> u64 {
        let name_heap = if self.name.is_heap_allocated() {
            self.name.len()
        } else {
            0
        };
        let ext_heap = self
            .extension
            .as_ref()
            .filter(|e| e.is_heap_allocated())
            .map_or(0, |e| e.len());

        (mem::size_of::<Self>() + name_heap + ext_heap) as u64
    }
}

/// An immutable listing of one folder, plus its byte weight.
///
/// The byte size is fixed at construction so the store's aggregate counter
/// stays exact across replace/evict without re-measuring.
#[derive(Debug, Clone)]
pub struct ListingSnapshot {
    entries: Vec<ListingEntry>,
    byte_size: u64,
    captured_at: SystemTime,
}

impl ListingSnapshot {
    #[must_use]
    pub fn new(entries: Vec<ListingEntry>) -> Self {
        let byte_size = mem::size_of::<Self>() as u64
            + entries.iter().map(ListingEntry::weight).sum::<u64>();

        Self {
            entries,
            byte_size,
            captured_at: SystemTime::now(),
        }
    }

    #[must_use]
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    #[inline]
    #[must_use]
    pub fn entries(&self) -> &[ListingEntry] {
        &self.entries
    }

    #[inline]
    #[must_use]
    pub const fn byte_size(&self) -> u64 {
        self.byte_size
    }

    #[inline]
    #[must_use]
    pub const fn captured_at(&self) -> SystemTime {
        self.captured_at
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
