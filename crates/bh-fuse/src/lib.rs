#![forbid(unsafe_code)]
//! FUSE adapter for BlackHole.
//!
//! This crate is a thin translation layer: kernel FUSE requests arrive via the
//! `fuser` crate, inode numbers are resolved to paths through a [`NodeTable`],
//! the path is handed to a [`PathOps`] implementation (from `bh-core`), and
//! errors are mapped through [`BhError::to_errno()`].
//!
//! # Dispatch
//!
//! `fuser` delivers requests one at a time on its session thread. With
//! [`DispatchMode::PerRequestThread`] (the default) every `lookup`, `getattr`
//! and `readdir` is moved onto its own thread together with its reply, so a
//! request that never completes only costs that thread. `stat /hang` stays
//! stuck while `stat /` keeps answering. [`DispatchMode::Inline`] runs the
//! handler on the session thread instead, which turns a single hang into a
//! fully wedged mount.

mod nodes;

pub use nodes::{NodeTable, child_path, parent_path};

use bh_core::{EntryAttr, FileKind, PathOps, listed_kind};
use bh_error::BhError;
use fuser::{
    FUSE_ROOT_ID, FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr,
    ReplyDirectory, ReplyEntry, Request,
};
use std::ffi::OsStr;
use std::os::raw::c_int;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// TTL for attributes and entries handed to the kernel.
///
/// Zero: every `stat` must reach the handler so timestamps stay fresh and
/// `/hang` hangs every time.
const ATTR_TTL: Duration = Duration::ZERO;

/// Preferred I/O size reported in every `FileAttr`.
const BLKSIZE: u32 = 4096;

// ── Error type ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FuseError {
    #[error("invalid mountpoint: {0}")]
    InvalidMountpoint(String),
    #[error("mount I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ── FUSE error context ─────────────────────────────────────────────────────

/// Structured error context for FUSE operation failures.
pub struct FuseErrorContext<'a> {
    pub error: &'a BhError,
    pub operation: &'static str,
    pub ino: u64,
    pub offset: Option<u64>,
}

impl FuseErrorContext<'_> {
    /// Log this error context via tracing and return the errno for the reply.
    pub fn log_and_errno(&self) -> c_int {
        let errno = self.error.to_errno();
        // ENOENT is the fixture's normal answer for anything but `/`.
        if errno == libc::ENOENT {
            trace!(
                op = self.operation,
                ino = self.ino,
                errno,
                error = %self.error,
                "FUSE op returned ENOENT"
            );
        } else {
            warn!(
                op = self.operation,
                ino = self.ino,
                offset = self.offset,
                errno,
                error = %self.error,
                "FUSE op failed"
            );
        }
        errno
    }
}

// ── Type conversions ────────────────────────────────────────────────────────

fn to_fuser_file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::Directory => FileType::Directory,
        FileKind::RegularFile => FileType::RegularFile,
    }
}

/// Convert handler attributes into a `fuser::FileAttr` for inode `ino`.
fn to_file_attr(ino: u64, attr: &EntryAttr) -> FileAttr {
    FileAttr {
        ino,
        size: attr.size,
        blocks: attr.size.div_ceil(512),
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.ctime,
        kind: to_fuser_file_type(attr.kind),
        perm: attr.perm,
        nlink: attr.nlink,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: BLKSIZE,
        flags: 0,
    }
}

/// Directory entry as handed to `ReplyDirectory::add`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedEntry {
    pub ino: u64,
    /// Offset of the *next* entry, as the kernel expects.
    pub offset: i64,
    pub kind: FileType,
    pub name: String,
}

// ── Mount options ───────────────────────────────────────────────────────────

/// Where handler calls run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// One thread per request. A hung request blocks only its own thread.
    #[default]
    PerRequestThread,
    /// Run on the FUSE session thread. One hang stalls every later request.
    Inline,
}

/// Options for a BlackHole mount. The mount itself is always read-only.
#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    pub allow_other: bool,
    /// Let the `fusermount` helper unmount when the process dies. `fuser`
    /// pairs this with `allow_other`, which unprivileged users can only use
    /// when `/etc/fuse.conf` has `user_allow_other`.
    pub auto_unmount: bool,
    pub dispatch: DispatchMode,
}

// ── Atomic metrics ──────────────────────────────────────────────────────────

/// Lock-free per-mount request counters.
///
/// A request is in flight from dispatch until its reply is sent. Requests
/// stuck on `/hang` stay in flight for the life of the mount.
#[derive(Default)]
pub struct AtomicMetrics {
    requests_total: AtomicU64,
    requests_ok: AtomicU64,
    requests_err: AtomicU64,
    in_flight: AtomicU64,
}

impl AtomicMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn record_begin(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    fn record_ok(&self) {
        self.requests_ok.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    fn record_err(&self) {
        self.requests_err.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    /// Snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_ok: self.requests_ok.load(Ordering::Relaxed),
            requests_err: self.requests_err.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for AtomicMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.snapshot(), f)
    }
}

/// Point-in-time snapshot of metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_ok: u64,
    pub requests_err: u64,
    pub in_flight: u64,
}

// ── Shared FUSE inner state ─────────────────────────────────────────────────

/// State shared by the session thread and every request thread.
///
/// `nodes` is the only mutable part. Its lock is released before any
/// handler call, so a hung call never holds it.
struct FuseInner {
    ops: Arc<dyn PathOps>,
    nodes: NodeTable,
    metrics: Arc<AtomicMetrics>,
    dispatch: DispatchMode,
    next_request: AtomicU64,
}

impl std::fmt::Debug for FuseInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuseInner")
            .field("nodes", &self.nodes.len())
            .field("metrics", &self.metrics)
            .field("dispatch", &self.dispatch)
            .finish_non_exhaustive()
    }
}

impl FuseInner {
    fn resolve(&self, ino: u64) -> bh_error::Result<String> {
        self.nodes
            .path_of(ino)
            .ok_or_else(|| BhError::not_found(format!("inode {ino}")))
    }

    fn getattr(&self, ino: u64) -> bh_error::Result<FileAttr> {
        let path = self.resolve(ino)?;
        let attr = self.ops.get_attributes(&path)?;
        Ok(to_file_attr(ino, &attr))
    }

    fn lookup(&self, parent: u64, name: &str) -> bh_error::Result<FileAttr> {
        let parent_path = self.resolve(parent)?;
        let path = child_path(&parent_path, name);
        let attr = self.ops.get_attributes(&path)?;
        let ino = self.nodes.ino_for(&path);
        Ok(to_file_attr(ino, &attr))
    }

    /// List `ino` and drop the first `offset` entries the kernel already has.
    fn readdir(&self, ino: u64, offset: u64) -> bh_error::Result<Vec<ListedEntry>> {
        let path = self.resolve(ino)?;
        let names = self.ops.list_directory(&path, offset)?;
        let skip = usize::try_from(offset).unwrap_or(usize::MAX);
        Ok(names
            .into_iter()
            .enumerate()
            .skip(skip)
            .map(|(index, name)| ListedEntry {
                ino: self.entry_ino(ino, &path, &name),
                offset: i64::try_from(index + 1).unwrap_or(i64::MAX),
                kind: to_fuser_file_type(listed_kind(&name)),
                name,
            })
            .collect())
    }

    fn entry_ino(&self, dir_ino: u64, dir_path: &str, name: &str) -> u64 {
        match name {
            "." => dir_ino,
            ".." => parent_path(dir_path).map_or(FUSE_ROOT_ID, |p| self.nodes.ino_for(p)),
            _ => self.nodes.ino_for(&child_path(dir_path, name)),
        }
    }

    /// Count the outcome of a finished request.
    fn record<T>(&self, result: bh_error::Result<T>) -> bh_error::Result<T> {
        match &result {
            Ok(_) => self.metrics.record_ok(),
            Err(_) => self.metrics.record_err(),
        }
        result
    }
}

// ── FUSE filesystem adapter ─────────────────────────────────────────────────

/// FUSE adapter that delegates all operations to a [`PathOps`] implementation.
pub struct BlackHoleFuse {
    inner: Arc<FuseInner>,
}

// Compile-time assertion: request threads need Send + Sync.
const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    let _ = assert_send_sync::<BlackHoleFuse>;
};

impl BlackHoleFuse {
    /// Create a FUSE adapter with default options.
    #[must_use]
    pub fn new(ops: Box<dyn PathOps>) -> Self {
        Self::with_options(ops, &MountOptions::default())
    }

    #[must_use]
    pub fn with_options(ops: Box<dyn PathOps>, options: &MountOptions) -> Self {
        info!(dispatch = ?options.dispatch, "BlackHoleFuse initialized");
        Self {
            inner: Arc::new(FuseInner {
                ops: Arc::from(ops),
                nodes: NodeTable::new(),
                metrics: Arc::new(AtomicMetrics::new()),
                dispatch: options.dispatch,
                next_request: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn metrics(&self) -> &AtomicMetrics {
        &self.inner.metrics
    }

    #[must_use]
    pub fn dispatch_mode(&self) -> DispatchMode {
        self.inner.dispatch
    }

    /// Run `job` according to the dispatch mode.
    ///
    /// If a request thread cannot be spawned the job is dropped with its
    /// reply still unsent, and `fuser` answers the kernel with `EIO`.
    fn dispatch<F>(&self, op: &'static str, job: F)
    where
        F: FnOnce(&FuseInner) + Send + 'static,
    {
        self.inner.metrics.record_begin();
        match self.inner.dispatch {
            DispatchMode::Inline => job(&self.inner),
            DispatchMode::PerRequestThread => {
                let inner = Arc::clone(&self.inner);
                let id = inner.next_request.fetch_add(1, Ordering::Relaxed);
                let spawned = thread::Builder::new()
                    .name(format!("bh-{op}-{id}"))
                    .spawn(move || job(&inner));
                match spawned {
                    Ok(_) => debug!(op, id, "request dispatched"),
                    Err(error) => {
                        self.inner.metrics.record_err();
                        warn!(op, id, %error, "failed to spawn request thread");
                    }
                }
            }
        }
    }
}

impl Filesystem for BlackHoleFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        info!(dispatch = ?self.inner.dispatch, "FUSE session initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        let snap = self.inner.metrics.snapshot();
        info!(
            requests_total = snap.requests_total,
            requests_ok = snap.requests_ok,
            requests_err = snap.requests_err,
            in_flight = snap.in_flight,
            "FUSE session destroyed"
        );
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = name.to_string_lossy().into_owned();
        self.dispatch("lookup", move |inner| {
            match inner.record(inner.lookup(parent, &name)) {
                Ok(attr) => reply.entry(&ATTR_TTL, &attr, 0),
                Err(e) => reply.error(
                    FuseErrorContext {
                        error: &e,
                        operation: "lookup",
                        ino: parent,
                        offset: None,
                    }
                    .log_and_errno(),
                ),
            }
        });
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        self.dispatch("getattr", move |inner| {
            match inner.record(inner.getattr(ino)) {
                Ok(attr) => reply.attr(&ATTR_TTL, &attr),
                Err(e) => reply.error(
                    FuseErrorContext {
                        error: &e,
                        operation: "getattr",
                        ino,
                        offset: None,
                    }
                    .log_and_errno(),
                ),
            }
        });
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let fs_offset = u64::try_from(offset).unwrap_or(0);
        self.dispatch("readdir", move |inner| {
            match inner.record(inner.readdir(ino, fs_offset)) {
                Ok(entries) => {
                    for entry in &entries {
                        let full = reply.add(entry.ino, entry.offset, entry.kind, &entry.name);
                        if full {
                            break;
                        }
                    }
                    reply.ok();
                }
                Err(e) => reply.error(
                    FuseErrorContext {
                        error: &e,
                        operation: "readdir",
                        ino,
                        offset: Some(fs_offset),
                    }
                    .log_and_errno(),
                ),
            }
        });
    }
}

// ── Mount entrypoint ────────────────────────────────────────────────────────

fn build_mount_options(options: &MountOptions) -> Vec<MountOption> {
    let mut opts = vec![
        MountOption::FSName("blackhole".to_owned()),
        MountOption::Subtype("blackhole".to_owned()),
        MountOption::RO,
        MountOption::DefaultPermissions,
        MountOption::NoAtime,
    ];
    if options.allow_other {
        opts.push(MountOption::AllowOther);
    }
    if options.auto_unmount {
        opts.push(MountOption::AutoUnmount);
    }
    opts
}

fn validate_mountpoint(mountpoint: &Path) -> Result<(), FuseError> {
    if mountpoint.as_os_str().is_empty() {
        return Err(FuseError::InvalidMountpoint(
            "mountpoint cannot be empty".to_owned(),
        ));
    }
    if !mountpoint.is_dir() {
        return Err(FuseError::InvalidMountpoint(format!(
            "mountpoint does not exist or is not a directory: {}",
            mountpoint.display()
        )));
    }
    Ok(())
}

/// Mount at `mountpoint` and serve in the foreground.
///
/// Blocks until the filesystem is unmounted or the process is killed.
pub fn mount(
    ops: Box<dyn PathOps>,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<(), FuseError> {
    let mountpoint = mountpoint.as_ref();
    validate_mountpoint(mountpoint)?;
    info!(
        mountpoint = %mountpoint.display(),
        dispatch = ?options.dispatch,
        "mounting BlackHole"
    );
    let fs = BlackHoleFuse::with_options(ops, options);
    fuser::mount2(fs, mountpoint, &build_mount_options(options))?;
    info!(mountpoint = %mountpoint.display(), "BlackHole unmounted");
    Ok(())
}

// ── Mount lifecycle ─────────────────────────────────────────────────────────

/// Handle for a background mount with access to its metrics.
///
/// Dropping the handle unmounts. While a request is stuck on `/hang` the
/// mount is busy and `fuser` falls back to a lazy detach.
pub struct MountHandle {
    session: Option<fuser::BackgroundSession>,
    mountpoint: PathBuf,
    metrics: Arc<AtomicMetrics>,
}

impl MountHandle {
    #[must_use]
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    #[must_use]
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Unmount and return the final metrics snapshot.
    #[must_use]
    pub fn unmount(mut self) -> MetricsSnapshot {
        self.do_unmount()
    }

    fn do_unmount(&mut self) -> MetricsSnapshot {
        let snap = self.metrics.snapshot();
        if let Some(session) = self.session.take() {
            info!(
                mountpoint = %self.mountpoint.display(),
                requests_total = snap.requests_total,
                requests_ok = snap.requests_ok,
                requests_err = snap.requests_err,
                in_flight = snap.in_flight,
                "unmounting BlackHole"
            );
            drop(session);
        }
        snap
    }
}

impl Drop for MountHandle {
    fn drop(&mut self) {
        if self.session.is_some() {
            self.do_unmount();
        }
    }
}

impl std::fmt::Debug for MountHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountHandle")
            .field("mountpoint", &self.mountpoint)
            .field("active", &self.session.is_some())
            .field("metrics", &self.metrics.snapshot())
            .finish()
    }
}

/// Mount in the background and return a [`MountHandle`].
pub fn mount_managed(
    ops: Box<dyn PathOps>,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<MountHandle, FuseError> {
    let mountpoint = mountpoint.as_ref();
    validate_mountpoint(mountpoint)?;
    info!(
        mountpoint = %mountpoint.display(),
        dispatch = ?options.dispatch,
        allow_other = options.allow_other,
        "mounting BlackHole in background"
    );

    let fs = BlackHoleFuse::with_options(ops, options);
    let metrics = Arc::clone(&fs.inner.metrics);
    let session = fuser::spawn_mount2(fs, mountpoint, &build_mount_options(options))?;
    info!(mountpoint = %mountpoint.display(), "FUSE mount active");

    Ok(MountHandle {
        session: Some(session),
        mountpoint: mountpoint.to_owned(),
        metrics,
    })
}
