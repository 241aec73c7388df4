//! Core error handling module
//!
//! • Stack-friendly payloads (`CompactString`)
//! • Status-value propagation: the cache never panics on enumeration
//!   failure, it degrades to "stale but available" where possible
//! • `#[non_exhaustive]` for forward-compatible extension

use compact_str::CompactString;
use thiserror::Error;

use crate::fs::plugin::PluginError;

/// Convenient alias carrying our unified error type
pub type CoreResult<T> = Result<T, CacheError>;

/// Primary error enumeration for the listing cache.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum CacheError {
    // ────────────────────────────────────────────────────────────
    // Input validation, rejected before touching the cache
    // ────────────────────────────────────────────────────────────
    #[error("Invalid argument: {field} - {message}")]
    InvalidArgument {
        field: CompactString,
        message: CompactString,
    },

    // ────────────────────────────────────────────────────────────
    // Path-related failures surfaced from the plugin
    // ────────────────────────────────────────────────────────────
    #[error("Path not found: {0}")]
    PathNotFound(CompactString),

    #[error("Path access denied: {0}")]
    PathAccessDenied(CompactString),

    // ────────────────────────────────────────────────────────────
    // Load coordination
    // ────────────────────────────────────────────────────────────
    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Enumeration failed: {path}")]
    EnumerationFailed {
        path: CompactString,
        #[source]
        source: PluginError,
    },

    /// CacheOnly mode requested before any successful load.
    #[error("No snapshot loaded yet: {0}")]
    NoSnapshotYet(CompactString),

    /// The owning file system was torn down while the operation ran.
    #[error("File system detached: {0}")]
    FileSystemDetached(CompactString),
}

impl CacheError {
    /// Determine whether downstream logic may safely retry the operation.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Cancelled
                | Self::EnumerationFailed { .. }
                | Self::NoSnapshotYet(_)
        )
    }

    /// Stable marker for structured log grouping.
    #[inline]
    #[must_use]
    pub const fn operation_type(&self) -> &'static str {
        match self {
            Self::InvalidArgument { .. } => "input_validation",
            Self::PathNotFound(_) | Self::PathAccessDenied(_) => "path_access",
            Self::Cancelled => "cancellation",
            Self::EnumerationFailed { .. } => "enumeration",
            Self::NoSnapshotYet(_) => "cache_only_miss",
            Self::FileSystemDetached(_) => "filesystem_teardown",
        }
    }

    // ────────────────────────────────────────────────────────────
    // Lightweight smart-constructors
    // ────────────────────────────────────────────────────────────
    #[inline]
    #[must_use]
    pub fn invalid_argument(field: &str, message: &str) -> Self {
        Self::InvalidArgument {
            field: CompactString::new(field),
            message: CompactString::new(message),
        }
    }

    /// Map a plugin failure onto the cache taxonomy. `NotFound` and
    /// `AccessDenied` pass through; everything else is an enumeration
    /// failure that retains the path for diagnostics.
    #[must_use]
    pub fn from_plugin(path: &str, source: PluginError) -> Self {
        match source {
            PluginError::NotFound(p) => Self::PathNotFound(p),
            PluginError::AccessDenied(p) => Self::PathAccessDenied(p),
            other => Self::EnumerationFailed {
                path: CompactString::new(path),
                source: other,
            },
        }
    }
}
