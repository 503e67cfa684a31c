#![forbid(unsafe_code)]
//! Error types for the BlackHole fixture filesystem.
//!
//! # Error Taxonomy
//!
//! The handler has exactly one failure mode: the requested entry does not
//! exist. Everything the handler cannot answer with attributes or a listing
//! becomes [`BhError::NotFound`], which the FUSE adapter turns into `ENOENT`.
//!
//! The permanent block on `/hang` is not an error. It is a response that
//! never completes, and nothing in this workspace converts it into one.
//!
//! | Variant | errno | Constant |
//! |---------|-------|----------|
//! | `NotFound` | `ENOENT` | 2 |
//!
//! Mount-time failures (bad mountpoint, `fusermount` errors) live in
//! `bh-fuse` as `FuseError`; they never cross the request dispatch boundary.

use thiserror::Error;

/// Error returned by the request handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BhError {
    /// No entry exists at the given path.
    #[error("not found: {0}")]
    NotFound(String),
}

impl BhError {
    /// Convert this error into a POSIX errno suitable for FUSE replies.
    ///
    /// The match is exhaustive so a new variant cannot ship without an errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::NotFound(_) => libc::ENOENT,
        }
    }

    /// Shorthand for a not-found error naming `path`.
    #[must_use]
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }
}

/// Result alias using `BhError`.
pub type Result<T> = std::result::Result<T, BhError>;
