//! Inode table: the bijection between kernel-visible inode numbers and
//! absolute paths on the underlying filesystem.
//!
//! Identifiers are allocated from a monotonic counter with a path index for
//! deduplication, so `register` is idempotent per path and two distinct live
//! paths can never share an inode. Entries handed to the kernel inside an
//! entry reply carry a lookup count; `forget` drops references and retires
//! the record once none remain. The root is pinned at inode 1 and survives
//! every `remove`/`forget`.

use crate::error::{FsError, FsResult};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Inode number of the filesystem root, fixed by the FUSE protocol.
pub const ROOT_INODE: u64 = 1;

#[derive(Debug)]
struct InodeEntry {
    path: PathBuf,
    /// Outstanding kernel lookup references (incremented by entry replies,
    /// decremented by forget).
    lookups: u64,
}

#[derive(Debug)]
struct TableInner {
    by_ino: HashMap<u64, InodeEntry>,
    by_path: HashMap<PathBuf, u64>,
    next_ino: u64,
}

/// Shared inode-to-path mapping. Interior mutex: every access is atomic,
/// concurrent handlers are not otherwise serialized.
#[derive(Debug)]
pub struct InodeTable {
    inner: Mutex<TableInner>,
}

impl InodeTable {
    /// Create a table with the root path pre-registered at [`ROOT_INODE`].
    pub fn new(root: &Path) -> Self {
        let mut by_ino = HashMap::new();
        let mut by_path = HashMap::new();
        by_ino.insert(
            ROOT_INODE,
            InodeEntry {
                path: root.to_path_buf(),
                lookups: 0,
            },
        );
        by_path.insert(root.to_path_buf(), ROOT_INODE);
        Self {
            inner: Mutex::new(TableInner {
                by_ino,
                by_path,
                next_ino: ROOT_INODE + 1,
            }),
        }
    }

    /// Resolve an inode number to its path, or fail with a stale-handle
    /// condition.
    pub fn resolve(&self, ino: u64) -> FsResult<PathBuf> {
        self.inner
            .lock()
            .unwrap()
            .by_ino
            .get(&ino)
            .map(|e| e.path.clone())
            .ok_or(FsError::NotFound)
    }

    /// Insert or look up a mapping without taking a kernel reference.
    /// Used by directory enumeration, which allocates inodes as a side
    /// effect but does not hand out entry records.
    pub fn register(&self, path: &Path) -> u64 {
        self.insert(path, 0)
    }

    /// Insert or look up a mapping and take one kernel lookup reference.
    /// Used by every handler that replies with an entry record.
    pub fn remember(&self, path: &Path) -> u64 {
        self.insert(path, 1)
    }

    fn insert(&self, path: &Path, refs: u64) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&ino) = inner.by_path.get(path) {
            if let Some(entry) = inner.by_ino.get_mut(&ino) {
                entry.lookups += refs;
            }
            return ino;
        }
        let ino = inner.next_ino;
        inner.next_ino += 1;
        inner.by_ino.insert(
            ino,
            InodeEntry {
                path: path.to_path_buf(),
                lookups: refs,
            },
        );
        inner.by_path.insert(path.to_path_buf(), ino);
        ino
    }

    /// Retire a mapping by inode number. Subsequent `resolve` for the id
    /// fails. The root is never retired.
    pub fn remove(&self, ino: u64) {
        if ino == ROOT_INODE {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.by_ino.remove(&ino) {
            inner.by_path.remove(&entry.path);
        }
    }

    /// Retire a mapping by path (unlink/rmdir handlers know the child path,
    /// not its inode number).
    pub fn remove_path(&self, path: &Path) {
        let mut inner = self.inner.lock().unwrap();
        match inner.by_path.get(path) {
            Some(&ino) if ino != ROOT_INODE => {
                inner.by_path.remove(path);
                inner.by_ino.remove(&ino);
            }
            _ => {}
        }
    }

    /// Re-point the mapping for a renamed node at its destination path,
    /// keeping the inode number stable. A pre-existing mapping for the
    /// destination is retired (the rename replaced that node). Returns the
    /// inode now bound to `new_path`.
    pub fn rename(&self, old_path: &Path, new_path: &Path) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        match inner.by_path.get(new_path) {
            Some(&existing) if existing != ROOT_INODE => {
                inner.by_path.remove(new_path);
                inner.by_ino.remove(&existing);
            }
            _ => {}
        }
        match inner.by_path.remove(old_path) {
            Some(ino) if ino != ROOT_INODE => {
                if let Some(entry) = inner.by_ino.get_mut(&ino) {
                    entry.path = new_path.to_path_buf();
                }
                inner.by_path.insert(new_path.to_path_buf(), ino);
                ino
            }
            _ => {
                // Source was never observed; allocate a fresh id for the
                // destination.
                let ino = inner.next_ino;
                inner.next_ino += 1;
                inner.by_ino.insert(
                    ino,
                    InodeEntry {
                        path: new_path.to_path_buf(),
                        lookups: 0,
                    },
                );
                inner.by_path.insert(new_path.to_path_buf(), ino);
                ino
            }
        }
    }

    /// Kernel dropped `nlookup` references for an inode; retire the record
    /// once none remain. A later lookup of the same path allocates a fresh
    /// id.
    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INODE {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let retire = match inner.by_ino.get_mut(&ino) {
            Some(entry) => {
                entry.lookups = entry.lookups.saturating_sub(nlookup);
                entry.lookups == 0
            }
            None => false,
        };
        if retire {
            if let Some(entry) = inner.by_ino.remove(&ino) {
                inner.by_path.remove(&entry.path);
            }
        }
    }

    /// Number of live mappings, root included.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().by_ino.len()
    }

    pub fn is_empty(&self) -> bool {
        // The root entry is permanent, so a live table is never empty.
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> InodeTable {
        InodeTable::new(Path::new("/tmp/fsroot"))
    }

    #[test]
    fn register_is_deterministic() {
        let t = table();
        let a = t.register(Path::new("/tmp/fsroot/a.txt"));
        let b = t.register(Path::new("/tmp/fsroot/a.txt"));
        assert_eq!(a, b);
        let c = t.register(Path::new("/tmp/fsroot/b.txt"));
        assert_ne!(a, c);
    }

    #[test]
    fn resolve_round_trip() {
        let t = table();
        let path = Path::new("/tmp/fsroot/dir/file");
        let ino = t.register(path);
        assert_eq!(t.resolve(ino).unwrap(), path);
        t.remove(ino);
        assert_eq!(t.resolve(ino), Err(FsError::NotFound));
    }

    #[test]
    fn root_is_stable() {
        let t = table();
        t.remove(ROOT_INODE);
        t.remove_path(Path::new("/tmp/fsroot"));
        t.forget(ROOT_INODE, u64::MAX);
        assert_eq!(t.resolve(ROOT_INODE).unwrap(), Path::new("/tmp/fsroot"));
    }

    #[test]
    fn forget_retires_at_zero_references() {
        let t = table();
        let path = Path::new("/tmp/fsroot/ref");
        let ino = t.remember(path);
        assert_eq!(t.remember(path), ino);
        t.forget(ino, 1);
        assert!(t.resolve(ino).is_ok());
        t.forget(ino, 1);
        assert_eq!(t.resolve(ino), Err(FsError::NotFound));
    }

    #[test]
    fn remove_path_retires_mapping() {
        let t = table();
        let path = Path::new("/tmp/fsroot/gone");
        let ino = t.register(path);
        t.remove_path(path);
        assert_eq!(t.resolve(ino), Err(FsError::NotFound));
        // Retired paths get a fresh id on re-registration.
        assert_ne!(t.register(path), ino);
    }

    #[test]
    fn rename_keeps_inode_stable() {
        let t = table();
        let old = Path::new("/tmp/fsroot/old");
        let new = Path::new("/tmp/fsroot/new");
        let ino = t.remember(old);
        let moved = t.rename(old, new);
        assert_eq!(moved, ino);
        assert_eq!(t.resolve(ino).unwrap(), new);
        assert_eq!(t.resolve(ino).unwrap(), new);
        // No stale source mapping survives.
        assert_ne!(t.register(old), ino);
    }

    #[test]
    fn rename_retires_replaced_destination() {
        let t = table();
        let old = Path::new("/tmp/fsroot/src");
        let new = Path::new("/tmp/fsroot/dst");
        let victim = t.register(new);
        let ino = t.register(old);
        assert_eq!(t.rename(old, new), ino);
        assert_eq!(t.resolve(victim), Err(FsError::NotFound));
    }

    #[test]
    fn rename_of_unobserved_source_allocates() {
        let t = table();
        let ino = t.rename(Path::new("/tmp/fsroot/x"), Path::new("/tmp/fsroot/y"));
        assert_eq!(t.resolve(ino).unwrap(), Path::new("/tmp/fsroot/y"));
    }
}
