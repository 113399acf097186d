//! In-memory metadata cache: a flat normalized-path map with an explicit
//! negative side, plus the reference-counted set of open paths. This layer is
//! passive storage; deciding when to fill, refresh or evict is the job of the
//! orchestrator and the refresher.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::SystemTime;

use tracing::debug;

use crate::pathutil;

/// Cached metadata of one repository entry.
#[derive(Debug, Clone)]
pub struct NodeMeta {
    pub path: String,
    pub is_dir: bool,
    /// Bytes for files, 0 for directories. File sizes start unresolved (0)
    /// because the listing endpoint does not report them; the refresh rules
    /// decide when a content read is spent to resolve one.
    pub size: u64,
    /// Remote modification instant, the only staleness signal available.
    pub modified: SystemTime,
    pub uid: u32,
    pub gid: u32,
}

/// Outcome of a cache lookup. `Negative` is a committed not-found: the
/// caller must answer from it without touching the network.
#[derive(Debug, Clone)]
pub enum Lookup {
    Hit(NodeMeta),
    Negative,
    Miss,
}

#[derive(Default)]
struct CacheInner {
    nodes: HashMap<String, NodeMeta>,
    missing: HashSet<String>,
}

/// Flat path-keyed metadata cache.
///
/// A path is never present on both the positive and the negative side; the
/// mutating methods maintain that exclusivity. Every method takes a brief
/// internal lock and performs no I/O, so callers may hold nothing while
/// calling in and must not expect cross-call atomicity.
pub struct MetaCache {
    inner: RwLock<CacheInner>,
}

impl MetaCache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(CacheInner::default()),
        }
    }

    pub fn lookup(&self, path: &str) -> Lookup {
        let path = pathutil::normalize(path);
        let inner = self.inner.read().unwrap();
        if let Some(meta) = inner.nodes.get(&path) {
            return Lookup::Hit(meta.clone());
        }
        if inner.missing.contains(&path) {
            return Lookup::Negative;
        }
        Lookup::Miss
    }

    /// Stores metadata, displacing any negative record of the path.
    pub fn insert(&self, meta: NodeMeta) {
        let path = pathutil::normalize(&meta.path);
        let mut inner = self.inner.write().unwrap();
        inner.missing.remove(&path);
        inner.nodes.insert(path.clone(), NodeMeta { path, ..meta });
    }

    /// Records a committed not-found, displacing any positive entry.
    pub fn mark_missing(&self, path: &str) {
        let path = pathutil::normalize(path);
        let mut inner = self.inner.write().unwrap();
        inner.nodes.remove(&path);
        inner.missing.insert(path);
    }

    /// Clears a negative record without asserting existence; the next lookup
    /// misses and goes to the remote for fresh metadata.
    pub fn mark_exists(&self, path: &str) {
        let path = pathutil::normalize(path);
        self.inner.write().unwrap().missing.remove(&path);
    }

    /// Drops both records of a path.
    pub fn evict(&self, path: &str) {
        let path = pathutil::normalize(path);
        let mut inner = self.inner.write().unwrap();
        inner.nodes.remove(&path);
        inner.missing.remove(&path);
    }

    /// Drops a path together with every cached descendant, for a directory
    /// that was deleted or renamed away.
    pub fn evict_subtree(&self, path: &str) {
        let path = pathutil::normalize(path);
        let mut inner = self.inner.write().unwrap();
        inner
            .nodes
            .retain(|p, _| p != &path && !pathutil::is_descendant(&path, p));
        inner
            .missing
            .retain(|p| p != &path && !pathutil::is_descendant(&path, p));
    }

    /// Immediate children of a directory, derived by scanning the flat map.
    /// The scan is O(cache size), which stays negligible next to any remote
    /// round trip. Sorted by path so directory offsets are stable across
    /// repeated reads.
    pub fn children_of(&self, dir: &str) -> Vec<NodeMeta> {
        let dir = pathutil::normalize(dir);
        let inner = self.inner.read().unwrap();
        let mut out: Vec<NodeMeta> = inner
            .nodes
            .values()
            .filter(|m| pathutil::depth_below(&dir, &m.path) == Some(1))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.path.cmp(&b.path));
        out
    }

    /// Paths of all cached directories, for refresh target selection.
    pub fn dir_paths(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        inner
            .nodes
            .values()
            .filter(|m| m.is_dir)
            .map(|m| m.path.clone())
            .collect()
    }

    /// Evicts cached entries below `dir`, up to `depth` levels, that a fresh
    /// listing of `dir` did not report. Returns how many were dropped.
    pub fn prune_absent(&self, dir: &str, depth: u32, seen: &HashSet<String>) -> usize {
        let dir = pathutil::normalize(dir);
        let mut inner = self.inner.write().unwrap();
        let before = inner.nodes.len();
        inner.nodes.retain(|p, _| match pathutil::depth_below(&dir, p) {
            Some(d) if d <= depth => seen.contains(p),
            _ => true,
        });
        let dropped = before - inner.nodes.len();
        if dropped > 0 {
            debug!(dir = %dir, dropped, "pruned entries absent from fresh listing");
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MetaCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Paths the kernel currently holds open, reference counted so overlapping
/// opens of the same path survive a single release.
pub struct OpenSet {
    inner: RwLock<HashMap<String, u32>>,
}

impl OpenSet {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Registers an open. True when this was the first open of the path,
    /// which is the only transition that triggers neighborhood warming.
    pub fn acquire(&self, path: &str) -> bool {
        let path = pathutil::normalize(path);
        let mut inner = self.inner.write().unwrap();
        let count = inner.entry(path).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Drops one open reference; membership ends at count zero.
    pub fn release(&self, path: &str) {
        let path = pathutil::normalize(path);
        let mut inner = self.inner.write().unwrap();
        if let Some(count) = inner.get_mut(&path) {
            *count -= 1;
            if *count == 0 {
                inner.remove(&path);
            }
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        let path = pathutil::normalize(path);
        self.inner.read().unwrap().contains_key(&path)
    }

    /// True when the parent directory of `path` is open, which makes `path`
    /// part of the actively watched neighborhood.
    pub fn parent_open(&self, path: &str) -> bool {
        let path = pathutil::normalize(path);
        if path == "/" {
            return false;
        }
        self.inner
            .read()
            .unwrap()
            .contains_key(pathutil::parent(&path))
    }

    /// Moves open references from a renamed path to its new name so later
    /// releases balance out.
    pub fn transfer(&self, old: &str, new: &str) {
        let old = pathutil::normalize(old);
        let new = pathutil::normalize(new);
        let mut inner = self.inner.write().unwrap();
        if let Some(count) = inner.remove(&old) {
            *inner.entry(new).or_insert(0) += count;
        }
    }

    /// Drops all references of a deleted path.
    pub fn forget(&self, path: &str) {
        let path = pathutil::normalize(path);
        self.inner.write().unwrap().remove(&path);
    }
}

impl Default for OpenSet {
    fn default() -> Self {
        Self::new()
    }
}
