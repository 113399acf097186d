//! The operation layer: every filesystem call lands here and is answered
//! from the metadata cache plus the minimum number of remote round trips.
//! Mutations update the remote first and fold the outcome into the cache in
//! the same call, so a following lookup never sees the pre-mutation world.

use std::sync::Arc;
use std::time::SystemTime;

use librepo::{Error, Result};
use tokio::sync::{Mutex, Semaphore};
use tracing::warn;

use crate::cache::{Lookup, MetaCache, NodeMeta, OpenSet};
use crate::config::MountConfig;
use crate::pathutil;
use crate::remote::{RemoteRepo, RemoteStat};

/// A mounted repository: cache, open-set bookkeeping and the remote behind
/// them. Shared between the FUSE adapter and the background refresher.
pub struct RepoFs<R: RemoteRepo> {
    pub(crate) remote: R,
    pub(crate) cache: MetaCache,
    pub(crate) open: OpenSet,
    pub(crate) cfg: MountConfig,
    /// Serializes refresh passes; a tick that finds it held is skipped.
    pub(crate) refresh_gate: Mutex<()>,
    /// Caps simultaneous remote requests during refresh fan-out.
    pub(crate) refresh_pool: Arc<Semaphore>,
}

impl<R: RemoteRepo> RepoFs<R> {
    pub fn new(remote: R, cfg: MountConfig) -> Arc<Self> {
        Arc::new(Self {
            remote,
            cache: MetaCache::new(),
            open: OpenSet::new(),
            refresh_gate: Mutex::new(()),
            refresh_pool: Arc::new(Semaphore::new(cfg.refresh_workers)),
            cfg,
        })
    }

    /// The metadata cache, exposed read-only for diagnostics and tests.
    pub fn cache(&self) -> &MetaCache {
        &self.cache
    }

    pub fn config(&self) -> &MountConfig {
        &self.cfg
    }

    /// Serves a stat. A committed not-found answers locally; a miss fetches
    /// from the remote but does not install negative state (only refresh
    /// observations and deletes commit absence).
    pub async fn stat(&self, path: &str) -> Result<NodeMeta> {
        let path = pathutil::normalize(path);
        match self.cache.lookup(&path) {
            Lookup::Hit(meta) => Ok(meta),
            Lookup::Negative => Err(Error::NotFound),
            Lookup::Miss => self.stat_remote(&path).await,
        }
    }

    /// Fetches a stat from the remote and installs it.
    pub(crate) async fn stat_remote(&self, path: &str) -> Result<NodeMeta> {
        let rs = self.remote.stat(path).await?;
        let meta = self.build_meta(path, rs, true).await;
        self.cache.insert(meta.clone());
        Ok(meta)
    }

    /// Lists a directory. Served from the cache when the directory's own
    /// entry is warm (the open protocol fills children in before the kernel
    /// asks); a cold directory costs one listing fetch that is folded in.
    pub async fn list_dir(&self, path: &str) -> Result<Vec<NodeMeta>> {
        let path = pathutil::normalize(path);
        match self.cache.lookup(&path) {
            Lookup::Negative => Err(Error::NotFound),
            Lookup::Hit(meta) if !meta.is_dir => {
                Err(Error::OpNotAllowed(format!("{path} is not a directory")))
            }
            Lookup::Hit(_) => Ok(self.cache.children_of(&path)),
            Lookup::Miss => {
                let meta = self.stat_remote(&path).await?;
                if !meta.is_dir {
                    return Err(Error::OpNotAllowed(format!("{path} is not a directory")));
                }
                self.refresh_dir(&path, self.cfg.max_depth).await?;
                Ok(self.cache.children_of(&path))
            }
        }
    }

    /// Registers an open. The first open of a path warms its neighborhood so
    /// the stats and listings the kernel asks for next are already local.
    /// Re-opening an already open path is a no-op.
    pub async fn open_path(&self, path: &str) -> Result<()> {
        let path = pathutil::normalize(path);
        if !self.open.acquire(&path) {
            return Ok(());
        }
        match self.warm(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                self.open.release(&path);
                Err(e)
            }
            Err(e) => {
                warn!(path = %path, error = %e, "neighborhood warm failed, serving cached state");
                Ok(())
            }
        }
    }

    /// Balances one [`Self::open_path`]; at zero references the path leaves
    /// the refresher's working set.
    pub fn release_path(&self, path: &str) {
        self.open.release(path);
    }

    /// Creates a file or directory, then primes the cache so the lookup the
    /// kernel issues right afterwards is answered locally.
    pub async fn create(&self, path: &str, directory: bool) -> Result<NodeMeta> {
        let path = pathutil::normalize(path);
        if path == "/" {
            return Err(Error::OpNotAllowed("cannot create the mount root".into()));
        }
        let dir = pathutil::parent(&path);
        let name = pathutil::file_name(&path);
        self.remote.create(dir, name, directory).await?;
        self.cache.mark_exists(&path);
        match self.stat_remote(&path).await {
            Ok(meta) => Ok(meta),
            Err(e) => {
                // The entry exists remotely; synthesize its metadata rather
                // than failing the create the kernel already observed.
                warn!(path = %path, error = %e, "stat after create failed, synthesizing entry");
                let meta = NodeMeta {
                    path: path.clone(),
                    is_dir: directory,
                    size: 0,
                    modified: SystemTime::now(),
                    uid: self.cfg.uid,
                    gid: self.cfg.gid,
                };
                self.cache.insert(meta.clone());
                Ok(meta)
            }
        }
    }

    /// Deletes on the remote, then commits the absence locally so later
    /// stats answer not-found without a round trip.
    pub async fn delete(&self, path: &str) -> Result<()> {
        let path = pathutil::normalize(path);
        if path == "/" {
            return Err(Error::OpNotAllowed("cannot delete the mount root".into()));
        }
        if matches!(self.cache.lookup(&path), Lookup::Negative) {
            return Err(Error::NotFound);
        }
        self.remote.delete(&path).await?;
        self.cache.evict_subtree(&path);
        self.cache.mark_missing(&path);
        self.open.forget(&path);
        Ok(())
    }

    /// Reads full file content. Content itself is never cached, but its
    /// measured length updates the cached size so a following stat agrees
    /// with what was just read.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let path = pathutil::normalize(path);
        if matches!(self.cache.lookup(&path), Lookup::Negative) {
            return Err(Error::NotFound);
        }
        let content = self.remote.read_file(&path).await?;
        if let Lookup::Hit(mut meta) = self.cache.lookup(&path) {
            if !meta.is_dir && meta.size != content.len() as u64 {
                meta.size = content.len() as u64;
                self.cache.insert(meta);
            }
        }
        Ok(content)
    }

    /// Writes file content. The remote only replaces whole files, so a
    /// non-zero offset reads the current content back, cuts or pads it to
    /// `offset` and appends the new bytes before uploading the full buffer.
    /// Returns the number of bytes accepted from `data`.
    pub async fn write(&self, path: &str, offset: u64, data: &[u8]) -> Result<u64> {
        let path = pathutil::normalize(path);
        let meta = self.stat(&path).await?;
        if meta.is_dir {
            return Err(Error::OpNotAllowed(format!("{path} is a directory")));
        }
        let content = if offset == 0 {
            data.to_vec()
        } else {
            let mut existing = self.remote.read_file(&path).await?;
            existing.resize(offset as usize, 0);
            existing.extend_from_slice(data);
            existing
        };
        self.remote.write_file(&path, &content).await?;
        // One stat for the new server timestamp; the size is known from the
        // buffer just uploaded, no read-back.
        let modified = match self.remote.stat(&path).await {
            Ok(rs) => rs.modified,
            Err(e) => {
                warn!(path = %path, error = %e, "stat after write failed, stamping local time");
                SystemTime::now()
            }
        };
        self.cache.insert(NodeMeta {
            path: path.clone(),
            is_dir: false,
            size: content.len() as u64,
            modified,
            uid: self.cfg.uid,
            gid: self.cfg.gid,
        });
        Ok(data.len() as u64)
    }

    /// Renames within one directory; the repository cannot move entries
    /// between directories, so that case fails before any state changes.
    pub async fn rename(&self, old: &str, new: &str) -> Result<()> {
        let old = pathutil::normalize(old);
        let new = pathutil::normalize(new);
        if pathutil::parent(&old) != pathutil::parent(&new) {
            return Err(Error::OpNotAllowed(format!(
                "rename must stay within one directory ({old} -> {new})"
            )));
        }
        if old == new {
            return Ok(());
        }
        if matches!(self.cache.lookup(&old), Lookup::Negative) {
            return Err(Error::NotFound);
        }
        self.remote.rename(&old, &new).await?;
        self.cache.evict_subtree(&old);
        self.cache.mark_exists(&new);
        self.open.transfer(&old, &new);
        Ok(())
    }

    /// Truncate adjusts only the cached size; the next write uploads the
    /// authoritative bytes. The remote has no truncate call.
    pub async fn truncate(&self, path: &str, size: u64) -> Result<NodeMeta> {
        let path = pathutil::normalize(path);
        let mut meta = self.stat(&path).await?;
        if meta.is_dir {
            return Err(Error::OpNotAllowed(format!("{path} is a directory")));
        }
        meta.size = size;
        self.cache.insert(meta.clone());
        Ok(meta)
    }

    /// Applies the size-resolution rule to freshly fetched metadata: carry a
    /// previously resolved size while the timestamp stands still, spend a
    /// content read when it changed, when an open file still reads zero, or
    /// (`resolve_unknown`, the direct-stat case) when nothing was known.
    pub(crate) async fn build_meta(
        &self,
        path: &str,
        rs: RemoteStat,
        resolve_unknown: bool,
    ) -> NodeMeta {
        let mut size = 0u64;
        if !rs.is_dir {
            let prior = match self.cache.lookup(path) {
                Lookup::Hit(m) if !m.is_dir => Some(m),
                _ => None,
            };
            let open = self.open.contains(path);
            size = match prior {
                Some(prev) => {
                    if prev.modified != rs.modified || (open && prev.size == 0) {
                        self.resolve_size(path).await
                    } else {
                        prev.size
                    }
                }
                None => {
                    if resolve_unknown || open {
                        self.resolve_size(path).await
                    } else {
                        0
                    }
                }
            };
        }
        NodeMeta {
            path: path.to_string(),
            is_dir: rs.is_dir,
            size,
            modified: rs.modified,
            uid: self.cfg.uid,
            gid: self.cfg.gid,
        }
    }

    /// Resolves a file's size the only way the protocol offers: read the
    /// whole content and measure it. A failed read resolves to zero instead
    /// of failing the metadata path.
    async fn resolve_size(&self, path: &str) -> u64 {
        match self.remote.read_file(path).await {
            Ok(content) => content.len() as u64,
            Err(e) => {
                warn!(path = %path, error = %e, "size resolution read failed, reporting zero");
                0
            }
        }
    }
}
