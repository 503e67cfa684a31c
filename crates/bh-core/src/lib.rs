#![forbid(unsafe_code)]
//! Request handler for the BlackHole fixture filesystem.
//!
//! BlackHole reproduces a dead network mount on demand. Every request is
//! answered by classifying its path:
//!
//! | Path | Class | Response |
//! |------|-------|----------|
//! | `/` | [`EntryClass::Root`] | synthetic directory attributes, listing `.`, `..`, `hang` |
//! | `/hang` | [`EntryClass::HangTrigger`] | `getattr` never returns |
//! | anything else | [`EntryClass::Unknown`] | [`BhError::NotFound`] |
//!
//! The handler is path-based and framework-free. The FUSE adapter in
//! `bh-fuse` resolves inode numbers to paths and calls into [`PathOps`].
//!
//! # Concurrency
//!
//! [`BlackHoleFs`] holds only immutable configuration. A hung call parks its
//! own thread (see [`hang`]) and touches no shared state, so other requests
//! keep completing while it is stuck.

pub mod hang;

pub use bh_error::{BhError, Result};
pub use hang::{DEFAULT_WAKE_INTERVAL, HangOptions, hang_forever};

use std::time::SystemTime;
use tracing::info;

/// The mount root.
pub const ROOT_PATH: &str = "/";
/// The entry whose attribute lookup never returns.
pub const HANG_PATH: &str = "/hang";
/// Name of the hang entry inside the root directory.
pub const HANG_NAME: &str = "hang";
/// Listing of the root directory, in order.
pub const ROOT_LISTING: [&str; 3] = [".", "..", HANG_NAME];

/// Permission bits reported for the root directory.
pub const ROOT_PERM: u16 = 0o755;
/// Link count reported for the root directory.
pub const ROOT_NLINK: u32 = 2;
/// Size in bytes reported for the root directory.
pub const ROOT_SIZE: u64 = 4096;

/// Response policy for a path. Exact string match, no normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryClass {
    Root,
    HangTrigger,
    Unknown,
}

/// Classify `path`.
///
/// `"/"` and `"/hang"` are the only recognized entries. `"//"`, `"/hang/"`
/// and `"hang"` are all [`EntryClass::Unknown`].
#[must_use]
pub fn classify(path: &str) -> EntryClass {
    match path {
        ROOT_PATH => EntryClass::Root,
        HANG_PATH => EntryClass::HangTrigger,
        _ => EntryClass::Unknown,
    }
}

/// File type carried in [`EntryAttr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Directory,
    RegularFile,
}

/// Kind of an entry named in a [`PathOps::list_directory`] result.
///
/// `.` and `..` are directories. `hang` is a regular file as far as
/// listings go; its `stat` never returns, so no other kind is ever observed.
#[must_use]
pub fn listed_kind(name: &str) -> FileKind {
    match name {
        "." | ".." => FileKind::Directory,
        _ => FileKind::RegularFile,
    }
}

/// Attributes returned by [`PathOps::get_attributes`].
///
/// Ownership, inode number and block counts are the adapter's business.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryAttr {
    pub kind: FileKind,
    /// POSIX permission bits (lower 12 bits of mode).
    pub perm: u16,
    pub nlink: u32,
    pub size: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl EntryAttr {
    /// Attributes of the root directory, stamped with `now`.
    #[must_use]
    pub fn synthetic_root(now: SystemTime) -> Self {
        Self {
            kind: FileKind::Directory,
            perm: ROOT_PERM,
            nlink: ROOT_NLINK,
            size: ROOT_SIZE,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

/// Path-based dispatch contract consumed by the mount adapter.
///
/// Implementations must be callable concurrently from many threads. A call
/// that blocks must not hold anything another call needs.
pub trait PathOps: Send + Sync {
    /// Attributes of the entry at `path`.
    ///
    /// Returns `BhError::NotFound` for unknown entries. May never return.
    fn get_attributes(&self, path: &str) -> Result<EntryAttr>;

    /// Names in the directory at `path`, including `.` and `..`.
    ///
    /// `offset` is the continuation cookie from the kernel. Implementations
    /// that return the whole directory in one batch may ignore it.
    fn list_directory(&self, path: &str, offset: u64) -> Result<Vec<String>>;
}

/// The toxic filesystem: one healthy directory, one entry that hangs.
#[derive(Debug, Clone, Default)]
pub struct BlackHoleFs {
    hang: HangOptions,
}

impl BlackHoleFs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a handler with explicit hang diagnostics.
    #[must_use]
    pub fn with_hang_options(hang: HangOptions) -> Self {
        Self { hang }
    }

    #[cfg(test)]
    fn hang_options(&self) -> &HangOptions {
        &self.hang
    }
}

impl PathOps for BlackHoleFs {
    fn get_attributes(&self, path: &str) -> Result<EntryAttr> {
        match classify(path) {
            EntryClass::HangTrigger => {
                info!(path, branch = "hang", "getattr");
                hang_forever(path, &self.hang)
            }
            EntryClass::Root => {
                info!(path, branch = "root", "getattr");
                Ok(EntryAttr::synthetic_root(SystemTime::now()))
            }
            EntryClass::Unknown => {
                info!(path, branch = "enoent", "getattr");
                Err(BhError::not_found(path))
            }
        }
    }

    fn list_directory(&self, path: &str, _offset: u64) -> Result<Vec<String>> {
        if classify(path) == EntryClass::Root {
            info!(path, branch = "root", "readdir");
            Ok(ROOT_LISTING.iter().map(|&name| name.to_owned()).collect())
        } else {
            info!(path, branch = "enoent", "readdir");
            Err(BhError::not_found(path))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::{Duration, Instant};

    const UNKNOWN_PATHS: &[&str] = &[
        "",
        "//",
        "/missing",
        "/hang/",
        "/hang/child",
        "hang",
        "/HANG",
        "/./hang",
        "/ hang",
        "/hangs",
        "/.",
        "/..",
    ];

    fn assert_within(t: SystemTime, before: SystemTime, after: SystemTime) {
        let slack = Duration::from_secs(1);
        assert!(t + slack >= before, "timestamp {t:?} earlier than {before:?}");
        assert!(t <= after + slack, "timestamp {t:?} later than {after:?}");
    }

    /// Run `get_attributes` on its own thread and report whether it returned
    /// within `window`. The thread is leaked if it did not.
    fn returns_within(fs: &Arc<BlackHoleFs>, path: &str, window: Duration) -> bool {
        let (tx, rx) = mpsc::channel();
        let fs = Arc::clone(fs);
        let path = path.to_owned();
        thread::spawn(move || {
            let result = fs.get_attributes(&path);
            let _ = tx.send(result);
        });
        rx.recv_timeout(window).is_ok()
    }

    #[test]
    fn classify_recognizes_root_and_hang_only() {
        assert_eq!(classify("/"), EntryClass::Root);
        assert_eq!(classify("/hang"), EntryClass::HangTrigger);
        for path in UNKNOWN_PATHS {
            assert_eq!(classify(path), EntryClass::Unknown, "path {path:?}");
        }
    }

    #[test]
    fn getattr_unknown_paths_is_not_found() {
        let fs = BlackHoleFs::new();
        for path in UNKNOWN_PATHS {
            let err = fs.get_attributes(path).unwrap_err();
            assert_eq!(err, BhError::not_found(*path));
            assert_eq!(err.to_errno(), libc::ENOENT);
        }
    }

    #[test]
    fn getattr_root_is_synthetic_directory() {
        let fs = BlackHoleFs::new();
        let before = SystemTime::now();
        let attr = fs.get_attributes("/").unwrap();
        let after = SystemTime::now();

        assert_eq!(attr.kind, FileKind::Directory);
        assert!(attr.is_dir());
        assert_eq!(attr.perm, 0o755);
        assert_eq!(attr.nlink, 2);
        assert_eq!(attr.size, 4096);
        assert_within(attr.atime, before, after);
        assert_within(attr.mtime, before, after);
        assert_within(attr.ctime, before, after);
    }

    #[test]
    fn getattr_root_timestamps_are_not_cached() {
        let fs = BlackHoleFs::new();
        let first = fs.get_attributes("/").unwrap();
        thread::sleep(Duration::from_millis(20));
        let second = fs.get_attributes("/").unwrap();
        assert!(second.mtime > first.mtime);
    }

    #[test]
    fn getattr_hang_never_returns() {
        let fs = Arc::new(BlackHoleFs::with_hang_options(HangOptions::silent()));
        assert!(!returns_within(&fs, "/hang", Duration::from_millis(1500)));
    }

    #[test]
    fn root_stays_prompt_while_hang_is_pending() {
        let fs = Arc::new(BlackHoleFs::with_hang_options(HangOptions::silent()));
        assert!(!returns_within(&fs, "/hang", Duration::from_millis(200)));

        let start = Instant::now();
        let attr = fs.get_attributes("/").unwrap();
        assert!(attr.is_dir());
        assert!(start.elapsed() < Duration::from_secs(1));

        let err = fs.get_attributes("/missing").unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOENT);
    }

    #[test]
    fn many_hangs_do_not_block_concurrent_lookups() {
        let fs = Arc::new(BlackHoleFs::with_hang_options(
            HangOptions::with_wake_interval(Duration::from_millis(10)),
        ));
        for _ in 0..8 {
            let fs = Arc::clone(&fs);
            thread::spawn(move || fs.get_attributes("/hang"));
        }

        let barrier = Arc::new(Barrier::new(4));
        let start = Instant::now();
        thread::scope(|s| {
            for _ in 0..4 {
                let fs = Arc::clone(&fs);
                let barrier = Arc::clone(&barrier);
                s.spawn(move || {
                    barrier.wait();
                    for _ in 0..100 {
                        assert!(fs.get_attributes("/").unwrap().is_dir());
                        assert_eq!(fs.list_directory("/", 0).unwrap().len(), 3);
                    }
                });
            }
        });
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn readdir_root_lists_fixed_entries_in_order() {
        let fs = BlackHoleFs::new();
        let first = fs.list_directory("/", 0).unwrap();
        assert_eq!(first, vec![".", "..", "hang"]);
        for offset in [0, 1, 3, u64::MAX] {
            assert_eq!(fs.list_directory("/", offset).unwrap(), first);
        }
    }

    #[test]
    fn readdir_elsewhere_is_not_found() {
        let fs = BlackHoleFs::new();
        for path in ["/hang", "/missing", "", "//", "/hang/"] {
            let err = fs.list_directory(path, 0).unwrap_err();
            assert_eq!(err.to_errno(), libc::ENOENT, "path {path:?}");
        }
    }

    #[test]
    fn handler_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<BlackHoleFs>();
        let _: Arc<dyn PathOps> = Arc::new(BlackHoleFs::new());
    }

    #[test]
    fn listing_kinds_cover_root_listing() {
        let fs = BlackHoleFs::new();
        let kinds: Vec<FileKind> = fs
            .list_directory("/", 0)
            .unwrap()
            .iter()
            .map(|name| listed_kind(name))
            .collect();
        assert_eq!(
            kinds,
            [FileKind::Directory, FileKind::Directory, FileKind::RegularFile]
        );
    }

    #[test]
    fn hang_options_are_carried() {
        let fs = BlackHoleFs::with_hang_options(HangOptions::silent());
        assert_eq!(fs.hang_options().wake_interval, None);
        assert_eq!(
            BlackHoleFs::new().hang_options().wake_interval,
            Some(DEFAULT_WAKE_INTERVAL)
        );
    }
}
