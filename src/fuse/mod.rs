//! FUSE adapter: translates kernel requests into pass-through operations.
//!
//! The capability set is the `rfuse3::raw::Filesystem` trait; [`PassthroughFs`]
//! is one concrete backend. Each handler resolves the involved inode(s)
//! through the inode table, performs the underlying filesystem call, updates
//! the table, and returns exactly one reply value (or errno).
pub mod mount;

use crate::error::{FsError, FsResult};
use crate::passthrough::PassthroughFs;
use bytes::Bytes;
use futures_util::stream::{self, Stream};
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, FileAttr, ReplyAttr, ReplyBmap, ReplyCreated, ReplyData,
    ReplyDirectory, ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyLock, ReplyOpen, ReplyStatFs,
    ReplyWrite, ReplyXAttr,
};
use rfuse3::raw::{Filesystem, Request};
use rfuse3::{FileType, Result as FuseResult, SetAttr, Timestamp};
use std::ffi::OsStr;
use std::fs::Metadata;
use std::num::NonZeroU32;
use std::os::unix::ffi::OsStringExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::pin::Pin;

/// Fixed block index reported by bmap; block mapping is not meaningful for a
/// pass-through tree.
const BMAP_SENTINEL_BLOCK: u64 = 12344;

impl PassthroughFs {
    /// Stat `path`, register it in the inode table with a kernel lookup
    /// reference, and build the entry record. `follow` selects stat vs
    /// lstat (symlink entries describe the link itself, not its target).
    async fn entry_reply(&self, path: &Path, follow: bool) -> FsResult<ReplyEntry> {
        let metadata = if follow {
            self.stat(path).await?
        } else {
            self.lstat(path).await?
        };
        let ino = self.table().remember(path);
        Ok(ReplyEntry {
            ttl: self.entry_timeout(),
            attr: attr_from_metadata(ino, &metadata),
            generation: self.generation(),
        })
    }
}

impl Filesystem for PassthroughFs {
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        info!("init: mirroring {}", self.root().display());
        // Conservative write ceiling; the whole file is rewritten per write
        // anyway.
        let max_write = NonZeroU32::new(1024 * 1024).unwrap();
        Ok(ReplyInit { max_write })
    }

    async fn destroy(&self, _req: Request) {
        info!("destroy: unmounting mirror of {}", self.root().display());
    }

    async fn lookup(&self, req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        debug!("lookup: parent={} name={:?} pid={}", parent, name, req.pid);
        let path = self.child_path(parent, name)?;
        // Any stat failure surfaces as a missing entry.
        Ok(self
            .entry_reply(&path, false)
            .await
            .map_err(|_| FsError::NotFound)?)
    }

    async fn forget(&self, _req: Request, inode: u64, nlookup: u64) {
        debug!("forget: ino={} nlookup={}", inode, nlookup);
        self.table().forget(inode, nlookup);
    }

    async fn batch_forget(&self, _req: Request, inodes: &[(u64, u64)]) {
        for &(inode, nlookup) in inodes {
            self.table().forget(inode, nlookup);
        }
    }

    async fn getattr(
        &self,
        req: Request,
        inode: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        debug!("getattr: ino={} pid={}", inode, req.pid);
        let path = self.table().resolve(inode)?;
        let metadata = self.lstat(&path).await.map_err(|_| FsError::NotFound)?;
        // The table id is stamped onto the result, not the underlying ino.
        Ok(ReplyAttr {
            ttl: self.attr_timeout(),
            attr: attr_from_metadata(inode, &metadata),
        })
    }

    // Attribute changes are not part of the pass-through surface.
    async fn setattr(
        &self,
        _req: Request,
        inode: u64,
        _fh: Option<u64>,
        _set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        debug!("setattr: ino={} (unsupported)", inode);
        Err(libc::EIO.into())
    }

    async fn readlink(&self, _req: Request, inode: u64) -> FuseResult<ReplyData> {
        debug!("readlink: ino={}", inode);
        let target = self.read_link(inode).await?;
        Ok(ReplyData {
            data: Bytes::from(target.into_vec()),
        })
    }

    // Device nodes are not part of the pass-through surface.
    async fn mknod(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _rdev: u32,
    ) -> FuseResult<ReplyEntry> {
        debug!("mknod: parent={} name={:?} (unsupported)", parent, name);
        Err(libc::ENOENT.into())
    }

    async fn mkdir(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
    ) -> FuseResult<ReplyEntry> {
        debug!("mkdir: parent={} name={:?} pid={}", parent, name, req.pid);
        let path = self.child_path(parent, name)?;
        self.make_dir(&path, mode).await?;
        Ok(self.entry_reply(&path, true).await?)
    }

    async fn unlink(&self, req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        debug!("unlink: parent={} name={:?} pid={}", parent, name, req.pid);
        let path = self.child_path(parent, name)?;
        self.remove_file(&path).await?;
        Ok(())
    }

    async fn rmdir(&self, req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        debug!("rmdir: parent={} name={:?} pid={}", parent, name, req.pid);
        let path = self.child_path(parent, name)?;
        self.remove_dir(&path).await?;
        Ok(())
    }

    async fn symlink(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        link: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        debug!(
            "symlink: parent={} name={:?} target={:?}",
            parent, name, link
        );
        let path = self.child_path(parent, name)?;
        self.sym_link(link, &path).await?;
        Ok(self.entry_reply(&path, false).await?)
    }

    async fn rename(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
    ) -> FuseResult<()> {
        debug!(
            "rename: {}/{:?} -> {}/{:?}",
            parent, name, new_parent, new_name
        );
        let old = self.child_path(parent, name)?;
        let new = self.child_path(new_parent, new_name)?;
        self.rename_path(&old, &new).await?;
        Ok(())
    }

    async fn link(
        &self,
        _req: Request,
        inode: u64,
        new_parent: u64,
        new_name: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        debug!(
            "link: ino={} new_parent={} name={:?}",
            inode, new_parent, new_name
        );
        let path = self.child_path(new_parent, new_name)?;
        self.hard_link(inode, &path).await?;
        Ok(self.entry_reply(&path, true).await?)
    }

    // Stateless IO: no handle is allocated, open flags pass through
    // unchanged, and read/write resolve the inode themselves.
    async fn open(&self, req: Request, inode: u64, flags: u32) -> FuseResult<ReplyOpen> {
        debug!("open: ino={} flags={:#o} pid={}", inode, flags, req.pid);
        self.table().resolve(inode)?;
        Ok(ReplyOpen { fh: 0, flags })
    }

    async fn read(
        &self,
        req: Request,
        inode: u64,
        _fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        debug!(
            "read: ino={} offset={} size={} pid={}",
            inode, offset, size, req.pid
        );
        let data = self.read_slice(inode, offset, size as usize).await?;
        Ok(ReplyData {
            data: Bytes::from(data),
        })
    }

    async fn write(
        &self,
        req: Request,
        inode: u64,
        _fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        debug!(
            "write: ino={} offset={} len={} pid={}",
            inode,
            offset,
            data.len(),
            req.pid
        );
        let written = self.write_splice(inode, offset, data).await?;
        Ok(ReplyWrite { written })
    }

    async fn statfs(&self, _req: Request, inode: u64) -> FuseResult<ReplyStatFs> {
        debug!("statfs: ino={}", inode);
        // Static statistics; the mirrored tree has no capacity of its own to
        // report.
        Ok(ReplyStatFs {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: 5,
            ffree: 2,
            bsize: 1024,
            namelen: 255,
            frsize: 0,
        })
    }

    async fn release(
        &self,
        _req: Request,
        inode: u64,
        _fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        debug!("release: ino={}", inode);
        Ok(())
    }

    async fn flush(&self, _req: Request, inode: u64, _fh: u64, _lock_owner: u64) -> FuseResult<()> {
        debug!("flush: ino={}", inode);
        Ok(())
    }

    // Writes are already durable when the write reply goes out.
    async fn fsync(&self, _req: Request, inode: u64, _fh: u64, _datasync: bool) -> FuseResult<()> {
        debug!("fsync: ino={}", inode);
        Ok(())
    }

    async fn setxattr(
        &self,
        _req: Request,
        inode: u64,
        name: &OsStr,
        _value: &[u8],
        _flags: u32,
        _position: u32,
    ) -> FuseResult<()> {
        debug!("setxattr: ino={} name={:?}", inode, name);
        Ok(())
    }

    async fn getxattr(
        &self,
        _req: Request,
        inode: u64,
        name: &OsStr,
        size: u32,
    ) -> FuseResult<ReplyXAttr> {
        debug!("getxattr: ino={} name={:?} size={}", inode, name, size);
        // The requested size is echoed back as the attribute length.
        Ok(ReplyXAttr::Size(size))
    }

    async fn listxattr(&self, _req: Request, inode: u64, size: u32) -> FuseResult<ReplyXAttr> {
        debug!("listxattr: ino={} size={}", inode, size);
        Ok(ReplyXAttr::Size(0))
    }

    async fn removexattr(&self, _req: Request, inode: u64, name: &OsStr) -> FuseResult<()> {
        debug!("removexattr: ino={} name={:?}", inode, name);
        Ok(())
    }

    async fn opendir(&self, req: Request, inode: u64, flags: u32) -> FuseResult<ReplyOpen> {
        debug!("opendir: ino={} pid={}", inode, req.pid);
        self.table().resolve(inode)?;
        Ok(ReplyOpen { fh: 0, flags })
    }

    async fn readdir<'a>(
        &'a self,
        req: Request,
        inode: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        debug!("readdir: ino={} offset={} pid={}", inode, offset, req.pid);
        let items = self.list_dir(inode).await?;

        // Once the offset has consumed the listing only the empty terminator
        // goes out.
        if offset + 1 >= items.len() as i64 {
            let empty: Self::DirEntryStream<'a> = Box::pin(stream::empty());
            return Ok(ReplyDirectory { entries: empty });
        }

        let entries: Vec<FuseResult<DirectoryEntry>> = items
            .iter()
            .enumerate()
            .skip(offset.max(0) as usize)
            .map(|(i, item)| {
                Ok(DirectoryEntry {
                    inode: item.ino,
                    kind: kind_from_metadata(&item.metadata),
                    name: item.name.clone(),
                    offset: i as i64,
                })
            })
            .collect();
        let entries: Self::DirEntryStream<'a> = Box::pin(stream::iter(entries));
        Ok(ReplyDirectory { entries })
    }

    async fn readdirplus<'a>(
        &'a self,
        req: Request,
        inode: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        debug!(
            "readdirplus: ino={} offset={} pid={}",
            inode, offset, req.pid
        );
        let items = self.list_dir(inode).await?;

        if offset + 1 >= items.len() as u64 {
            let empty: Self::DirEntryPlusStream<'a> = Box::pin(stream::empty());
            return Ok(ReplyDirectoryPlus { entries: empty });
        }

        let mut entries = Vec::with_capacity(items.len() - offset as usize);
        for (i, item) in items.iter().enumerate().skip(offset as usize) {
            // Entries other than the synthetic pair hand an id to the
            // kernel, which releases it later through forget.
            let ino = if item.name == "." || item.name == ".." {
                item.ino
            } else {
                self.table().remember(&item.path)
            };
            entries.push(Ok(DirectoryEntryPlus {
                inode: ino,
                generation: self.generation(),
                kind: kind_from_metadata(&item.metadata),
                name: item.name.clone(),
                offset: i as i64,
                attr: attr_from_metadata(ino, &item.metadata),
                entry_ttl: self.entry_timeout(),
                attr_ttl: self.attr_timeout(),
            }));
        }
        let entries: Self::DirEntryPlusStream<'a> = Box::pin(stream::iter(entries));
        Ok(ReplyDirectoryPlus { entries })
    }

    async fn releasedir(&self, _req: Request, inode: u64, _fh: u64, _flags: u32) -> FuseResult<()> {
        debug!("releasedir: ino={}", inode);
        Ok(())
    }

    async fn fsyncdir(
        &self,
        _req: Request,
        inode: u64,
        _fh: u64,
        _datasync: bool,
    ) -> FuseResult<()> {
        debug!("fsyncdir: ino={}", inode);
        Ok(())
    }

    async fn access(&self, req: Request, inode: u64, mask: u32) -> FuseResult<()> {
        debug!("access: ino={} mask={:#o} pid={}", inode, mask, req.pid);
        Ok(())
    }

    async fn create(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        flags: u32,
    ) -> FuseResult<ReplyCreated> {
        debug!(
            "create: parent={} name={:?} mode={:#o} pid={}",
            parent, name, mode, req.pid
        );
        let path = self.child_path(parent, name)?;
        self.open_create(&path, mode).await?;
        let entry = self.entry_reply(&path, true).await?;
        Ok(ReplyCreated {
            ttl: entry.ttl,
            attr: entry.attr,
            generation: entry.generation,
            fh: 0,
            flags,
        })
    }

    // Locking is unenforced: queries report no conflicting lock and lock
    // requests succeed without taking anything.
    async fn getlk(
        &self,
        _req: Request,
        inode: u64,
        _fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        _type: u32,
        _pid: u32,
    ) -> FuseResult<ReplyLock> {
        debug!("getlk: ino={}", inode);
        Ok(ReplyLock {
            start,
            end,
            r#type: libc::F_UNLCK as u32,
            pid: 0,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn setlk(
        &self,
        _req: Request,
        inode: u64,
        _fh: u64,
        _lock_owner: u64,
        _start: u64,
        _end: u64,
        _type: u32,
        _pid: u32,
        _block: bool,
    ) -> FuseResult<()> {
        debug!("setlk: ino={}", inode);
        Ok(())
    }

    async fn bmap(
        &self,
        _req: Request,
        inode: u64,
        blocksize: u32,
        idx: u64,
    ) -> FuseResult<ReplyBmap> {
        debug!("bmap: ino={} blocksize={} idx={}", inode, blocksize, idx);
        Ok(ReplyBmap {
            block: BMAP_SENTINEL_BLOCK,
        })
    }

    async fn interrupt(&self, _req: Request, _unique: u64) -> FuseResult<()> {
        Ok(())
    }
}

fn kind_from_mode(mode: u32) -> FileType {
    match mode & (libc::S_IFMT as u32) {
        m if m == libc::S_IFDIR as u32 => FileType::Directory,
        m if m == libc::S_IFLNK as u32 => FileType::Symlink,
        m if m == libc::S_IFCHR as u32 => FileType::CharDevice,
        m if m == libc::S_IFBLK as u32 => FileType::BlockDevice,
        m if m == libc::S_IFIFO as u32 => FileType::NamedPipe,
        m if m == libc::S_IFSOCK as u32 => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn kind_from_metadata(metadata: &Metadata) -> FileType {
    kind_from_mode(metadata.mode())
}

/// Map underlying stat data to a FUSE attribute block, stamped with the
/// table's inode number rather than the underlying filesystem's.
fn attr_from_metadata(ino: u64, metadata: &Metadata) -> FileAttr {
    FileAttr {
        ino,
        size: metadata.size(),
        blocks: metadata.blocks(),
        atime: Timestamp::new(metadata.atime(), metadata.atime_nsec() as u32),
        mtime: Timestamp::new(metadata.mtime(), metadata.mtime_nsec() as u32),
        ctime: Timestamp::new(metadata.ctime(), metadata.ctime_nsec() as u32),
        #[cfg(target_os = "macos")]
        crtime: Timestamp::new(metadata.ctime(), metadata.ctime_nsec() as u32),
        kind: kind_from_metadata(metadata),
        perm: (metadata.mode() & 0o7777) as u16,
        nlink: metadata.nlink() as u32,
        uid: metadata.uid(),
        gid: metadata.gid(),
        rdev: metadata.rdev() as u32,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: metadata.blksize() as u32,
    }
}


#[cfg(all(test, target_os = "linux"))]
mod mount_tests {
    use crate::fuse::mount::mount_unprivileged;
    use crate::passthrough::PassthroughFs;
    use std::io::Write;
    use std::time::Duration;

    // Mount smoke test, gated: set MIRRORFS_FUSE_TEST=1 to enable (needs
    // fusermount3 and /dev/fuse access).
    #[tokio::test]
    async fn smoke_mount_and_basic_ops() {
        if std::env::var("MIRRORFS_FUSE_TEST").ok().as_deref() != Some("1") {
            eprintln!("skip fuse mount test: set MIRRORFS_FUSE_TEST=1 to enable");
            return;
        }

        let source = tempfile::tempdir().expect("tmp source");
        std::fs::write(source.path().join("seed.txt"), b"abc").unwrap();
        let fs = PassthroughFs::new(source.path());

        let mnt = tempfile::tempdir().expect("tmp mount");
        let handle = match mount_unprivileged(fs, mnt.path()).await {
            Ok(h) => h,
            Err(e) => {
                eprintln!("skip fuse test: mount failed: {e}");
                return;
            }
        };

        tokio::time::sleep(Duration::from_millis(500)).await;

        let content = std::fs::read(mnt.path().join("seed.txt")).expect("read through mount");
        assert_eq!(content, b"abc");

        {
            let mut f = std::fs::OpenOptions::new()
                .write(true)
                .open(mnt.path().join("seed.txt"))
                .expect("open through mount");
            f.write_all(b"xyz").expect("write");
        }

        if let Err(e) = handle.unmount().await {
            eprintln!("unmount error: {e}");
        }
    }
}
