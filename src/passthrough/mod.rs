//! Pass-through backend: every operation is delegated to a real directory
//! tree on the already-mounted underlying filesystem.
//!
//! This module holds the filesystem value and the path-level operations;
//! the FUSE protocol glue (the `rfuse3::raw::Filesystem` impl) lives in
//! [`crate::fuse`]. All IO is performed with `tokio::fs` and blocks the
//! request until completion; there is no per-inode serialization, only the
//! inode table's own locking.

use crate::error::FsResult;
use crate::inode::InodeTable;
use std::ffi::{OsStr, OsString};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// One enumerated directory entry, synthetic `..`/`.` included.
#[derive(Debug)]
pub struct DirItem {
    pub name: OsString,
    pub path: PathBuf,
    pub ino: u64,
    pub metadata: Metadata,
}

/// Pass-through filesystem rooted at a directory of the underlying tree.
pub struct PassthroughFs {
    table: InodeTable,
    root: PathBuf,
    generation: u64,
    attr_timeout: Duration,
    entry_timeout: Duration,
}

impl PassthroughFs {
    /// Create a filesystem mirroring `root`. The root directory is
    /// pre-registered at inode 1; timeouts default to zero (no kernel-side
    /// caching) and the generation is constant for the instance lifetime.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            table: InodeTable::new(&root),
            root,
            generation: 1,
            attr_timeout: Duration::ZERO,
            entry_timeout: Duration::ZERO,
        }
    }

    /// Override the attribute/entry cache windows advertised to the kernel.
    pub fn with_timeouts(mut self, attr_timeout: Duration, entry_timeout: Duration) -> Self {
        self.attr_timeout = attr_timeout;
        self.entry_timeout = entry_timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn table(&self) -> &InodeTable {
        &self.table
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn attr_timeout(&self) -> Duration {
        self.attr_timeout
    }

    pub(crate) fn entry_timeout(&self) -> Duration {
        self.entry_timeout
    }

    /// Compose the path of `name` under the directory mapped to `parent`.
    pub(crate) fn child_path(&self, parent: u64, name: &OsStr) -> FsResult<PathBuf> {
        Ok(self.table.resolve(parent)?.join(name))
    }

    /// stat following symlinks.
    pub(crate) async fn stat(&self, path: &Path) -> FsResult<Metadata> {
        Ok(fs::metadata(path).await?)
    }

    /// lstat: attributes of the node itself, symlinks not followed.
    pub(crate) async fn lstat(&self, path: &Path) -> FsResult<Metadata> {
        Ok(fs::symlink_metadata(path).await?)
    }

    /// Create a directory with the requested mode bits.
    pub(crate) async fn make_dir(&self, path: &Path, mode: u32) -> FsResult<()> {
        let mut builder = fs::DirBuilder::new();
        builder.mode(mode);
        Ok(builder.create(path).await?)
    }

    /// Create (or truncate) a file with the requested mode, original
    /// open-with-create semantics.
    pub(crate) async fn open_create(&self, path: &Path, mode: u32) -> FsResult<()> {
        fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(path)
            .await?;
        Ok(())
    }

    /// Read the whole file and return the requested `[offset, offset+size)`
    /// slice, clamped to the content length.
    pub(crate) async fn read_slice(&self, ino: u64, offset: u64, size: usize) -> FsResult<Vec<u8>> {
        let path = self.table.resolve(ino)?;
        let content = fs::read(&path).await?;
        let start = (offset as usize).min(content.len());
        let end = start.saturating_add(size).min(content.len());
        Ok(content[start..end].to_vec())
    }

    /// Splice write: keep the file content up to `offset`, append the
    /// buffer, write the whole file back. Content past the spliced region
    /// is truncated. Returns the number of buffer bytes written.
    pub(crate) async fn write_splice(&self, ino: u64, offset: u64, data: &[u8]) -> FsResult<u32> {
        let path = self.table.resolve(ino)?;
        let mut content = fs::read(&path).await?;
        content.truncate(offset as usize);
        content.extend_from_slice(data);
        fs::write(&path, &content).await?;
        Ok(data.len() as u32)
    }

    /// Read a symlink's target.
    pub(crate) async fn read_link(&self, ino: u64) -> FsResult<OsString> {
        let path = self.table.resolve(ino)?;
        Ok(fs::read_link(&path).await?.into_os_string())
    }

    /// Remove a file and retire its mapping.
    pub(crate) async fn remove_file(&self, path: &Path) -> FsResult<()> {
        fs::remove_file(path).await?;
        self.table.remove_path(path);
        Ok(())
    }

    /// Remove a directory and retire its mapping. Mappings of entries the
    /// directory once contained are not purged here; the underlying rmdir
    /// only succeeds on an empty directory.
    pub(crate) async fn remove_dir(&self, path: &Path) -> FsResult<()> {
        fs::remove_dir(path).await?;
        self.table.remove_path(path);
        Ok(())
    }

    /// Hard-link the node mapped to `src_ino` at `dst`.
    pub(crate) async fn hard_link(&self, src_ino: u64, dst: &Path) -> FsResult<()> {
        let src = self.table.resolve(src_ino)?;
        fs::hard_link(&src, dst).await?;
        Ok(())
    }

    /// Create a symlink at `dst` pointing at `target` (taken verbatim, may
    /// be relative or dangling).
    pub(crate) async fn sym_link(&self, target: &OsStr, dst: &Path) -> FsResult<()> {
        fs::symlink(target, dst).await?;
        Ok(())
    }

    /// Rename a node and re-point its mapping at the destination.
    pub(crate) async fn rename_path(&self, old: &Path, new: &Path) -> FsResult<()> {
        fs::rename(old, new).await?;
        self.table.rename(old, new);
        Ok(())
    }

    /// Enumerate a directory as `['..', '.'] + listing`, in stable name
    /// order. Every listed child is registered in the inode table as a side
    /// effect; enumeration is itself an inode-allocating operation.
    pub(crate) async fn list_dir(&self, ino: u64) -> FsResult<Vec<DirItem>> {
        let dir = self.table.resolve(ino)?;
        let parent = self.parent_path(&dir);

        let mut items = Vec::new();
        for (name, path) in [
            (OsString::from(".."), parent),
            (OsString::from("."), dir.clone()),
        ] {
            let metadata = self.lstat(&path).await?;
            let ino = self.table.register(&path);
            items.push(DirItem {
                name,
                path,
                ino,
                metadata,
            });
        }

        let mut names = Vec::new();
        let mut rd = fs::read_dir(&dir).await?;
        while let Some(entry) = rd.next_entry().await? {
            names.push(entry.file_name());
        }
        names.sort();

        for name in names {
            let path = dir.join(&name);
            let metadata = self.lstat(&path).await?;
            let ino = self.table.register(&path);
            items.push(DirItem {
                name,
                path,
                ino,
                metadata,
            });
        }
        Ok(items)
    }

    /// Parent of a mirrored directory, clamped so `..` at the root points
    /// back at the root instead of escaping the mirrored tree.
    fn parent_path(&self, dir: &Path) -> PathBuf {
        if dir == self.root {
            self.root.clone()
        } else {
            dir.parent().unwrap_or(&self.root).to_path_buf()
        }
    }
}

impl std::fmt::Debug for PassthroughFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassthroughFs")
            .field("root", &self.root)
            .field("mappings", &self.table.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FsError;
    use crate::inode::ROOT_INODE;

    fn fixture() -> (tempfile::TempDir, PassthroughFs) {
        let dir = tempfile::tempdir().expect("tmp root");
        let fs = PassthroughFs::new(dir.path());
        (dir, fs)
    }

    #[tokio::test]
    async fn write_splice_truncates_tail() {
        let (dir, fs) = fixture();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();
        let ino = fs.table().register(&file);

        let written = fs.write_splice(ino, 2, b"X").await.unwrap();
        assert_eq!(written, 1);
        assert_eq!(std::fs::read(&file).unwrap(), b"heX");
    }

    #[tokio::test]
    async fn write_splice_past_end_appends() {
        let (dir, fs) = fixture();
        let file = dir.path().join("b.txt");
        std::fs::write(&file, b"ab").unwrap();
        let ino = fs.table().register(&file);

        fs.write_splice(ino, 10, b"cd").await.unwrap();
        assert_eq!(std::fs::read(&file).unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn read_slice_clamps_to_content() {
        let (dir, fs) = fixture();
        let file = dir.path().join("c.txt");
        std::fs::write(&file, b"0123456789").unwrap();
        let ino = fs.table().register(&file);

        assert_eq!(fs.read_slice(ino, 0, 1024).await.unwrap(), b"0123456789");
        assert_eq!(fs.read_slice(ino, 4, 3).await.unwrap(), b"456");
        assert_eq!(fs.read_slice(ino, 100, 10).await.unwrap(), b"");
    }

    #[tokio::test]
    async fn read_of_stale_inode_fails() {
        let (_dir, fs) = fixture();
        assert_eq!(
            fs.read_slice(999, 0, 16).await.unwrap_err(),
            FsError::NotFound
        );
    }

    #[tokio::test]
    async fn list_dir_prepends_dot_entries_and_registers() {
        let (dir, fs) = fixture();
        std::fs::write(dir.path().join("one"), b"1").unwrap();
        std::fs::create_dir(dir.path().join("two")).unwrap();

        let before = fs.table().len();
        let items = fs.list_dir(ROOT_INODE).await.unwrap();
        let names: Vec<_> = items
            .iter()
            .map(|i| i.name.to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["..", ".", "one", "two"]);
        // ".." at the root stays inside the mirrored tree.
        assert_eq!(items[0].ino, ROOT_INODE);
        assert_eq!(items[1].ino, ROOT_INODE);
        // The two children were registered as a side effect.
        assert_eq!(fs.table().len(), before + 2);
        for item in &items[2..] {
            assert_eq!(fs.table().resolve(item.ino).unwrap(), item.path);
        }
    }
}
