//! Inode ↔ path bookkeeping.
//!
//! The kernel speaks inode numbers, the handler speaks paths. Inode 1 is
//! always `/`; every other path gets the next free number the first time the
//! adapter hands it to the kernel and keeps it for the life of the mount.

use fuser::FUSE_ROOT_ID;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug)]
struct NodeMaps {
    by_ino: HashMap<u64, String>,
    by_path: HashMap<String, u64>,
    next_ino: u64,
}

/// Thread-safe inode table.
///
/// Every method takes and releases the lock internally. Callers never hold
/// it across a handler call.
#[derive(Debug)]
pub struct NodeTable {
    maps: RwLock<NodeMaps>,
}

impl Default for NodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeTable {
    /// Create a table containing only the root.
    #[must_use]
    pub fn new() -> Self {
        let mut by_ino = HashMap::new();
        let mut by_path = HashMap::new();
        by_ino.insert(FUSE_ROOT_ID, "/".to_owned());
        by_path.insert("/".to_owned(), FUSE_ROOT_ID);
        Self {
            maps: RwLock::new(NodeMaps {
                by_ino,
                by_path,
                next_ino: FUSE_ROOT_ID + 1,
            }),
        }
    }

    /// Path registered for `ino`, if any.
    #[must_use]
    pub fn path_of(&self, ino: u64) -> Option<String> {
        self.maps.read().by_ino.get(&ino).cloned()
    }

    /// Inode for `path`, allocating one on first use.
    pub fn ino_for(&self, path: &str) -> u64 {
        if let Some(&ino) = self.maps.read().by_path.get(path) {
            return ino;
        }
        let mut maps = self.maps.write();
        // Another thread may have registered it between the two locks.
        if let Some(&ino) = maps.by_path.get(path) {
            return ino;
        }
        let ino = maps.next_ino;
        maps.next_ino += 1;
        maps.by_ino.insert(ino, path.to_owned());
        maps.by_path.insert(path.to_owned(), ino);
        ino
    }

    /// Number of registered inodes, root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.maps.read().by_ino.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Join a directory path and an entry name.
#[must_use]
pub fn child_path(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Parent directory of `path`, or `None` for the root.
#[must_use]
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}
