//! `src/cache/key.rs`
//! ============================================================
//! Cache key: (file-system identity, normalized path).
//!
//! Two keys are equal iff the file-system identities match and the
//! case-folded paths match exactly. The original-case path is kept for
//! plugin calls and logs; only the folded form participates in
//! hashing/equality, so `/Docs` and `/docs` share one entry per backend.

use std::hash::{Hash, Hasher};

use compact_str::CompactString;

use crate::error::CacheError;
use crate::fs::plugin::FsId;

#[derive(Debug, Clone)]
pub struct CacheKey {
    fs: FsId,
    path: CompactString,
    folded: CompactString,
}

impl CacheKey {
    /// Build a key from an already-normalized path string.
    ///
    /// Path normalization (separator canonicalization, dot-segment
    /// resolution) is the path-helper collaborator's job; this layer only
    /// rejects the degenerate empty path.
    pub fn new(fs: FsId, path: &str) -> Result<Self, CacheError> {
        if path.is_empty() {
            return Err(CacheError::invalid_argument("path", "must not be empty"));
        }

        Ok(Self {
            fs,
            path: CompactString::new(path),
            folded: CompactString::new(path.to_lowercase()),
        })
    }

    #[inline]
    #[must_use]
    pub const fn fs(&self) -> FsId {
        self.fs
    }

    /// Original-case path, as handed to the plugin.
    #[inline]
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.fs == other.fs && self.folded == other.folded
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fs.hash(state);
        self.folded.hash(state);
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.fs, self.path)
    }
}
