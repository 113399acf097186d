//! FUSE adapter: translates the kernel's inode-based requests into the
//! path-based operation layer and back. The adapter owns nothing but the
//! inode table; every answer comes out of [`RepoFs`].

pub mod mount;

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use librepo::Error;
use rfuse3::Result as FuseResult;
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, FileAttr, ReplyAttr, ReplyCreated, ReplyData,
    ReplyDirectory, ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite,
};
use rfuse3::raw::{Filesystem, Request};
use rfuse3::{FileType, SetAttr, Timestamp};

use crate::cache::{Lookup, NodeMeta};
use crate::fsops::RepoFs;
use crate::pathutil;
use crate::remote::RemoteRepo;

const ROOT_INO: u64 = 1;

/// Inode numbers handed to the kernel, mapped both ways. Numbers are stable
/// for the life of the mount and never reused; the table only grows with
/// paths the kernel actually looked up.
struct InodeTable {
    inner: Mutex<InodeMaps>,
}

#[derive(Default)]
struct InodeMaps {
    by_ino: HashMap<u64, String>,
    by_path: HashMap<String, u64>,
    next: u64,
}

impl InodeTable {
    fn new() -> Self {
        let mut maps = InodeMaps {
            next: ROOT_INO + 1,
            ..Default::default()
        };
        maps.by_ino.insert(ROOT_INO, "/".to_string());
        maps.by_path.insert("/".to_string(), ROOT_INO);
        Self {
            inner: Mutex::new(maps),
        }
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.inner.lock().unwrap().by_ino.get(&ino).cloned()
    }

    fn ino_for(&self, path: &str) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        if let Some(ino) = inner.by_path.get(path) {
            return *ino;
        }
        let ino = inner.next;
        inner.next += 1;
        inner.by_ino.insert(ino, path.to_string());
        inner.by_path.insert(path.to_string(), ino);
        ino
    }

    /// Re-points inodes at a renamed path, descendants included, keeping
    /// handles the kernel already holds valid across the rename.
    fn rename(&self, old: &str, new: &str) {
        let mut inner = self.inner.lock().unwrap();
        let moved: Vec<(String, u64)> = inner
            .by_path
            .iter()
            .filter(|(p, _)| p.as_str() == old || pathutil::is_descendant(old, p))
            .map(|(p, i)| (p.clone(), *i))
            .collect();
        for (path, ino) in moved {
            inner.by_path.remove(&path);
            let renamed = format!("{new}{}", &path[old.len()..]);
            inner.by_ino.insert(ino, renamed.clone());
            inner.by_path.insert(renamed, ino);
        }
    }

    fn drop_path(&self, path: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(ino) = inner.by_path.remove(path) {
            inner.by_ino.remove(&ino);
        }
    }
}

/// The rfuse3 filesystem over a shared [`RepoFs`].
pub struct RepoFuse<R: RemoteRepo> {
    fs: Arc<RepoFs<R>>,
    inodes: InodeTable,
}

impl<R: RemoteRepo> RepoFuse<R> {
    pub fn new(fs: Arc<RepoFs<R>>) -> Self {
        Self {
            fs,
            inodes: InodeTable::new(),
        }
    }

    fn require_path(&self, ino: u64) -> FuseResult<String> {
        self.inodes.path_of(ino).ok_or_else(|| libc::ENOENT.into())
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> FuseResult<String> {
        let dir = self.require_path(parent)?;
        Ok(pathutil::join(&dir, &name.to_string_lossy()))
    }
}

fn errno(e: &Error) -> rfuse3::Errno {
    match e {
        Error::NotFound => libc::ENOENT.into(),
        Error::OpNotAllowed(_) => libc::EPERM.into(),
        _ => libc::EIO.into(),
    }
}

fn meta_to_attr(meta: &NodeMeta, ino: u64) -> FileAttr {
    let kind = if meta.is_dir {
        FileType::Directory
    } else {
        FileType::RegularFile
    };
    let perm = match kind {
        FileType::Directory => 0o755,
        _ => 0o644,
    } as u16;
    let ts = Timestamp::from(meta.modified);
    FileAttr {
        ino,
        size: meta.size,
        blocks: meta.size.div_ceil(512),
        atime: ts,
        mtime: ts,
        ctime: ts,
        #[cfg(target_os = "macos")]
        crtime: ts,
        kind,
        perm,
        nlink: 1,
        uid: meta.uid,
        gid: meta.gid,
        rdev: 0,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: 4096,
    }
}

impl<R: RemoteRepo> Filesystem for RepoFuse<R> {
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        Ok(ReplyInit {
            max_write: NonZeroU32::new(1024 * 1024).unwrap(),
        })
    }

    async fn destroy(&self, _req: Request) {}

    async fn lookup(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let path = self.child_path(parent, name)?;
        let meta = self.fs.stat(&path).await.map_err(|e| errno(&e))?;
        let ino = self.inodes.ino_for(&path);
        Ok(ReplyEntry {
            ttl: Duration::from_secs(1),
            attr: meta_to_attr(&meta, ino),
            generation: 0,
        })
    }

    async fn getattr(
        &self,
        _req: Request,
        ino: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let path = self.require_path(ino)?;
        let meta = self.fs.stat(&path).await.map_err(|e| errno(&e))?;
        Ok(ReplyAttr {
            ttl: Duration::from_secs(1),
            attr: meta_to_attr(&meta, ino),
        })
    }

    /// Only size changes are meaningful here; the repository tracks nothing
    /// else we could set.
    async fn setattr(
        &self,
        _req: Request,
        ino: u64,
        _fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        let path = self.require_path(ino)?;
        let meta = if let Some(size) = set_attr.size {
            self.fs
                .truncate(&path, size)
                .await
                .map_err(|e| errno(&e))?
        } else {
            self.fs.stat(&path).await.map_err(|e| errno(&e))?
        };
        Ok(ReplyAttr {
            ttl: Duration::from_secs(1),
            attr: meta_to_attr(&meta, ino),
        })
    }

    async fn open(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let path = self.require_path(ino)?;
        let meta = self.fs.stat(&path).await.map_err(|e| errno(&e))?;
        if meta.is_dir {
            return Err(libc::EISDIR.into());
        }
        self.fs.open_path(&path).await.map_err(|e| errno(&e))?;
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn opendir(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let path = self.require_path(ino)?;
        let meta = self.fs.stat(&path).await.map_err(|e| errno(&e))?;
        if !meta.is_dir {
            return Err(libc::ENOTDIR.into());
        }
        self.fs.open_path(&path).await.map_err(|e| errno(&e))?;
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    /// The repository serves whole files only, so every read fetches the
    /// full content and slices the requested window out of it.
    async fn read(
        &self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let path = self.require_path(ino)?;
        let content = self.fs.read_file(&path).await.map_err(|e| errno(&e))?;
        let start = (offset as usize).min(content.len());
        let end = start.saturating_add(size as usize).min(content.len());
        Ok(ReplyData {
            data: Bytes::from(content[start..end].to_vec()),
        })
    }

    async fn write(
        &self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        let path = self.require_path(ino)?;
        let written = self
            .fs
            .write(&path, offset, data)
            .await
            .map_err(|e| errno(&e))?;
        Ok(ReplyWrite {
            written: written as u32,
        })
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let path = self.require_path(ino)?;
        let children = self.fs.list_dir(&path).await.map_err(|e| -> rfuse3::Errno {
            match e {
                Error::NotFound => libc::ENOENT.into(),
                Error::OpNotAllowed(_) => libc::ENOTDIR.into(),
                _ => libc::EIO.into(),
            }
        })?;

        let mut all: Vec<DirectoryEntry> = Vec::with_capacity(children.len() + 2);
        all.push(DirectoryEntry {
            inode: ino,
            kind: FileType::Directory,
            name: OsString::from("."),
            offset: 1,
        });
        let parent_ino = self.inodes.ino_for(pathutil::parent(&path));
        all.push(DirectoryEntry {
            inode: parent_ino,
            kind: FileType::Directory,
            name: OsString::from(".."),
            offset: 2,
        });
        for (i, child) in children.iter().enumerate() {
            all.push(DirectoryEntry {
                inode: self.inodes.ino_for(&child.path),
                kind: if child.is_dir {
                    FileType::Directory
                } else {
                    FileType::RegularFile
                },
                name: OsString::from(pathutil::file_name(&child.path)),
                offset: (i as i64) + 3,
            });
        }

        let start = if offset <= 0 { 0 } else { offset as usize };
        let slice = if start >= all.len() {
            Vec::new()
        } else {
            all[start..].to_vec()
        };
        let entries: Self::DirEntryStream<'a> = Box::pin(stream::iter(slice.into_iter().map(Ok)));
        Ok(ReplyDirectory { entries })
    }

    async fn readdirplus<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let path = self.require_path(ino)?;
        let children = self.fs.list_dir(&path).await.map_err(|e| -> rfuse3::Errno {
            match e {
                Error::NotFound => libc::ENOENT.into(),
                Error::OpNotAllowed(_) => libc::ENOTDIR.into(),
                _ => libc::EIO.into(),
            }
        })?;
        let ttl = Duration::from_secs(1);

        let self_meta = self.fs.stat(&path).await.map_err(|e| errno(&e))?;
        let mut all: Vec<DirectoryEntryPlus> = Vec::with_capacity(children.len() + 2);
        all.push(DirectoryEntryPlus {
            inode: ino,
            generation: 0,
            kind: FileType::Directory,
            name: OsString::from("."),
            offset: 1,
            attr: meta_to_attr(&self_meta, ino),
            entry_ttl: ttl,
            attr_ttl: ttl,
        });
        let parent_path = pathutil::parent(&path).to_string();
        let parent_ino = self.inodes.ino_for(&parent_path);
        // The parent may be outside anything we have cached (mounting a
        // subdirectory puts the root's parent out of reach); fall back to
        // the directory's own attributes rather than failing the listing.
        let parent_meta = self.fs.stat(&parent_path).await.unwrap_or(self_meta);
        all.push(DirectoryEntryPlus {
            inode: parent_ino,
            generation: 0,
            kind: FileType::Directory,
            name: OsString::from(".."),
            offset: 2,
            attr: meta_to_attr(&parent_meta, parent_ino),
            entry_ttl: ttl,
            attr_ttl: ttl,
        });
        for (i, child) in children.iter().enumerate() {
            let child_ino = self.inodes.ino_for(&child.path);
            all.push(DirectoryEntryPlus {
                inode: child_ino,
                generation: 0,
                kind: if child.is_dir {
                    FileType::Directory
                } else {
                    FileType::RegularFile
                },
                name: OsString::from(pathutil::file_name(&child.path)),
                offset: (i as i64) + 3,
                attr: meta_to_attr(child, child_ino),
                entry_ttl: ttl,
                attr_ttl: ttl,
            });
        }

        let start = if offset == 0 { 0 } else { offset as usize };
        let slice = if start >= all.len() {
            Vec::new()
        } else {
            all[start..].to_vec()
        };
        let entries: Self::DirEntryPlusStream<'a> =
            Box::pin(stream::iter(slice.into_iter().map(Ok)));
        Ok(ReplyDirectoryPlus { entries })
    }

    async fn mkdir(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
    ) -> FuseResult<ReplyEntry> {
        let path = self.child_path(parent, name)?;
        if matches!(self.fs.cache().lookup(&path), Lookup::Hit(_)) {
            return Err(libc::EEXIST.into());
        }
        let meta = self.fs.create(&path, true).await.map_err(|e| errno(&e))?;
        let ino = self.inodes.ino_for(&path);
        Ok(ReplyEntry {
            ttl: Duration::from_secs(1),
            attr: meta_to_attr(&meta, ino),
            generation: 0,
        })
    }

    async fn create(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _flags: u32,
    ) -> FuseResult<ReplyCreated> {
        let path = self.child_path(parent, name)?;
        if matches!(self.fs.cache().lookup(&path), Lookup::Hit(_)) {
            return Err(libc::EEXIST.into());
        }
        let meta = self.fs.create(&path, false).await.map_err(|e| errno(&e))?;
        self.fs.open_path(&path).await.map_err(|e| errno(&e))?;
        let ino = self.inodes.ino_for(&path);
        Ok(ReplyCreated {
            ttl: Duration::from_secs(1),
            attr: meta_to_attr(&meta, ino),
            generation: 0,
            fh: 0,
            flags: 0,
        })
    }

    async fn unlink(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let path = self.child_path(parent, name)?;
        if let Lookup::Hit(meta) = self.fs.cache().lookup(&path) {
            if meta.is_dir {
                return Err(libc::EISDIR.into());
            }
        }
        self.fs.delete(&path).await.map_err(|e| errno(&e))?;
        self.inodes.drop_path(&path);
        Ok(())
    }

    async fn rmdir(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let path = self.child_path(parent, name)?;
        match self.fs.cache().lookup(&path) {
            Lookup::Hit(meta) if !meta.is_dir => return Err(libc::ENOTDIR.into()),
            Lookup::Hit(_) if !self.fs.cache().children_of(&path).is_empty() => {
                return Err(libc::ENOTEMPTY.into());
            }
            _ => {}
        }
        self.fs.delete(&path).await.map_err(|e| errno(&e))?;
        self.inodes.drop_path(&path);
        Ok(())
    }

    async fn rename(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
    ) -> FuseResult<()> {
        let old = self.child_path(parent, name)?;
        let new = self.child_path(new_parent, new_name)?;
        // The repository cannot move entries between directories. EXDEV
        // makes mv fall back to its own copy-and-delete.
        if parent != new_parent {
            return Err(libc::EXDEV.into());
        }
        self.fs.rename(&old, &new).await.map_err(|e| errno(&e))?;
        self.inodes.rename(&old, &new);
        Ok(())
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
        if let Some(path) = self.inodes.path_of(inode) {
            self.fs.release_path(&path);
        }
        Ok(())
    }

    async fn releasedir(&self, _req: Request, inode: u64, _fh: u64, _flags: u32) -> FuseResult<()> {
        if let Some(path) = self.inodes.path_of(inode) {
            self.fs.release_path(&path);
        }
        Ok(())
    }

    async fn statfs(&self, _req: Request, _ino: u64) -> FuseResult<ReplyStatFs> {
        Ok(ReplyStatFs {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: 0,
            ffree: u64::MAX,
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
        })
    }

    async fn flush(&self, _req: Request, _inode: u64, _fh: u64, _lock_owner: u64) -> FuseResult<()> {
        Ok(())
    }

    async fn fsync(&self, _req: Request, _inode: u64, _fh: u64, _datasync: bool) -> FuseResult<()> {
        Ok(())
    }

    async fn fsyncdir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _datasync: bool,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn forget(&self, _req: Request, _inode: u64, _nlookup: u64) {}

    async fn batch_forget(&self, _req: Request, _inodes: &[(u64, u64)]) {}

    async fn interrupt(&self, _req: Request, _unique: u64) -> FuseResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inode_table_allocates_and_remaps() {
        let table = InodeTable::new();
        assert_eq!(table.path_of(ROOT_INO).as_deref(), Some("/"));
        let a = table.ino_for("/a");
        let b = table.ino_for("/a/b");
        assert_eq!(table.ino_for("/a"), a);

        table.rename("/a", "/z");
        assert_eq!(table.path_of(a).as_deref(), Some("/z"));
        assert_eq!(table.path_of(b).as_deref(), Some("/z/b"));
        assert_eq!(table.ino_for("/z"), a);

        table.drop_path("/z/b");
        assert_eq!(table.path_of(b), None);
        // Numbers are never reused.
        assert!(table.ino_for("/fresh") > b);
    }
}
