//! Background consistency: a periodic task re-lists the directories the user
//! is working in and reconciles the cache against what the repository
//! reports, and the warm sequence primes a neighborhood when a path is first
//! opened. All remote fan-out shares one bounded worker pool.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use librepo::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::fsops::RepoFs;
use crate::pathutil;
use crate::remote::{RemoteRepo, RemoteStat};

impl<R: RemoteRepo> RepoFs<R> {
    /// One refresh pass: pick targets, deep-list them in parallel, reconcile
    /// and prune. Passes never overlap; a tick that arrives while one is
    /// running is dropped.
    pub async fn refresh_pass(&self) {
        let Ok(_gate) = self.refresh_gate.try_lock() else {
            debug!("refresh pass still in flight, skipping tick");
            return;
        };
        let targets = self.refresh_targets();
        if targets.is_empty() {
            return;
        }
        debug!(targets = targets.len(), "refresh pass starting");
        let depth = self.cfg.deep_depth();
        let jobs = targets.iter().map(|dir| self.refresh_target(dir, depth));
        join_all(jobs).await;
        debug!(cached = self.cache.len(), "refresh pass finished");
    }

    /// Cached directories worth refreshing: the ones the user holds open and
    /// the immediate children of open directories. Unopened subtrees keep
    /// whatever state they have until someone opens them.
    fn refresh_targets(&self) -> Vec<String> {
        let mut dirs: Vec<String> = self
            .cache
            .dir_paths()
            .into_iter()
            .filter(|d| self.open.contains(d) || self.open.parent_open(d))
            .collect();
        dirs.sort();
        dirs.dedup();
        dirs
    }

    /// Refreshes one directory under a pool permit. A vanished directory is
    /// committed as absent together with its subtree; any other failure
    /// keeps the cached state for another pass.
    async fn refresh_target(&self, dir: &str, depth: u32) {
        let _permit = self.refresh_pool.acquire().await.unwrap();
        match self.refresh_dir(dir, depth).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(dir = %dir, "directory vanished remotely, committing absence");
                self.cache.evict_subtree(dir);
                self.cache.mark_missing(dir);
            }
            Err(e) => {
                warn!(dir = %dir, error = %e, "refresh failed, keeping cached state");
            }
        }
    }

    /// Fetches one listing expanded `depth` levels and folds it in: every
    /// reported entry is reconciled, then cached descendants inside the
    /// listed window that the listing no longer reports are dropped.
    pub(crate) async fn refresh_dir(&self, dir: &str, depth: u32) -> Result<()> {
        let entries = self.remote.list_tree(dir, depth).await?;
        let mut seen: HashSet<String> = HashSet::with_capacity(entries.len());
        for (path, rs) in entries {
            let path = pathutil::normalize(&path);
            self.reconcile_entry(&path, rs).await;
            seen.insert(path);
        }
        self.cache.prune_absent(dir, depth, &seen);
        Ok(())
    }

    /// Folds one freshly listed entry into the cache. Directories overwrite;
    /// file sizes follow the carry rule in [`RepoFs::build_meta`], so no
    /// content read is spent on files nobody opened.
    pub(crate) async fn reconcile_entry(&self, path: &str, rs: RemoteStat) {
        let meta = self.build_meta(path, rs, false).await;
        self.cache.insert(meta);
    }

    /// First-open warm: the path's own stat, its immediate listing if it is
    /// a directory, then one listing or stat per child through the worker
    /// pool. When this returns, the burst of lookups the kernel sends right
    /// after an open is answered locally.
    pub(crate) async fn warm(&self, path: &str) -> Result<()> {
        let meta = match self.stat_remote(path).await {
            Ok(meta) => meta,
            Err(e) => {
                if e.is_not_found() {
                    self.cache.mark_missing(path);
                }
                return Err(e);
            }
        };
        if !meta.is_dir {
            return Ok(());
        }
        self.refresh_dir(path, 1).await?;
        let children = self.cache.children_of(path);
        let jobs = children.into_iter().map(|child| async move {
            if child.is_dir {
                self.refresh_target(&child.path, 1).await;
            } else {
                self.warm_file_stat(&child.path).await;
            }
        });
        join_all(jobs).await;
        Ok(())
    }

    /// Stat refresh of one file during warm, under a pool permit.
    async fn warm_file_stat(&self, path: &str) {
        let _permit = self.refresh_pool.acquire().await.unwrap();
        match self.remote.stat(path).await {
            Ok(rs) => self.reconcile_entry(path, rs).await,
            Err(e) if e.is_not_found() => {
                self.cache.mark_missing(path);
            }
            Err(e) => {
                warn!(path = %path, error = %e, "stat failed during warm, keeping cached state");
            }
        }
    }
}

/// Handle of the background refresh loop. Dropping it does not stop the
/// task; call [`RefreshTask::stop`] on unmount so an in-flight pass finishes
/// before the process exits.
pub struct RefreshTask {
    shutdown: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl RefreshTask {
    /// Spawns the periodic loop over a shared filesystem handle.
    pub fn spawn<R: RemoteRepo>(fs: Arc<RepoFs<R>>) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let interval = fs.config().refresh_interval;
        let handle = tokio::spawn(run_loop(fs, shutdown_rx, interval));
        Self {
            shutdown: shutdown_tx,
            handle,
        }
    }

    /// Signals the loop and waits for it, including any in-flight pass.
    pub async fn stop(self) {
        let _ = self.shutdown.send(()).await;
        let _ = self.handle.await;
    }
}

async fn run_loop<R: RemoteRepo>(
    fs: Arc<RepoFs<R>>,
    mut shutdown_rx: mpsc::Receiver<()>,
    interval: Duration,
) {
    info!(interval_secs = interval.as_secs(), "refresh loop started");
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("refresh loop shutting down");
                break;
            }
            _ = sleep(interval) => {
                fs.refresh_pass().await;
            }
        }
    }
}
