//! The remote side as seen by the filesystem layers: a narrow async trait
//! over the repository, plus the HTTP-backed implementation that flattens
//! the client's recursive listing documents into normalized paths. Tests
//! substitute an in-memory tree behind the same trait.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use librepo::RepoClient;
use librepo::Result;
use librepo::types::ChildEntry;

use crate::pathutil;

/// Metadata the remote reports for one entry. Size is absent on purpose: the
/// stat and listing endpoints do not carry it, so the cache layer resolves
/// file sizes separately by reading content.
#[derive(Debug, Clone, Copy)]
pub struct RemoteStat {
    pub is_dir: bool,
    pub modified: SystemTime,
}

/// What the filesystem needs from the repository.
#[async_trait]
pub trait RemoteRepo: Send + Sync + 'static {
    async fn stat(&self, path: &str) -> Result<RemoteStat>;

    /// Flat listing of everything under `dir`, up to `depth` levels deep,
    /// with normalized mount-relative paths. The listed directory itself is
    /// not part of the result.
    async fn list_tree(&self, dir: &str, depth: u32) -> Result<Vec<(String, RemoteStat)>>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<()>;

    async fn create(&self, dir: &str, name: &str, directory: bool) -> Result<()>;

    async fn delete(&self, path: &str) -> Result<()>;

    async fn rename(&self, old: &str, new: &str) -> Result<()>;
}

/// HTTP-backed repository access via [`RepoClient`].
pub struct HttpRepo {
    client: RepoClient,
}

impl HttpRepo {
    pub fn new(client: RepoClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RemoteRepo for HttpRepo {
    async fn stat(&self, path: &str) -> Result<RemoteStat> {
        let doc = self.client.stat(path).await?;
        Ok(RemoteStat {
            is_dir: doc.directory,
            modified: from_millis(doc.modified_at),
        })
    }

    async fn list_tree(&self, dir: &str, depth: u32) -> Result<Vec<(String, RemoteStat)>> {
        let listing = self.client.list_directory(dir, depth).await?;
        let dir = pathutil::normalize(dir);
        let mut out = Vec::new();
        collect(self.client.base(), &dir, &listing.children, &mut out);
        Ok(out)
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.client.read_file(path).await
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        self.client.write_file(path, content).await
    }

    async fn create(&self, dir: &str, name: &str, directory: bool) -> Result<()> {
        self.client.create(dir, name, directory).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.client.delete(path).await
    }

    async fn rename(&self, old: &str, new: &str) -> Result<()> {
        self.client.rename(old, new).await
    }
}

/// Converts the wire's millisecond timestamp; entries without one (typically
/// directories) fall back to the epoch, which the reconcile rules read as
/// "unchanged".
fn from_millis(ms: Option<i64>) -> SystemTime {
    match ms {
        Some(ms) if ms > 0 => SystemTime::UNIX_EPOCH + Duration::from_millis(ms as u64),
        _ => SystemTime::UNIX_EPOCH,
    }
}

/// Walks a listing document depth-first, emitting `(path, stat)` tuples.
/// Listing entries name repository-absolute locations, so the configured
/// base directory is stripped to recover mount-relative paths; entries
/// without a location fall back to joining onto their parent.
fn collect(base: &str, dir: &str, children: &[ChildEntry], out: &mut Vec<(String, RemoteStat)>) {
    for child in children {
        let path = if child.location.is_empty() {
            pathutil::join(dir, &child.name)
        } else {
            mount_relative(base, &child.location)
        };
        out.push((
            path.clone(),
            RemoteStat {
                is_dir: child.directory,
                modified: from_millis(child.modified_at),
            },
        ));
        collect(base, &path, &child.children, out);
    }
}

fn mount_relative(base: &str, location: &str) -> String {
    let loc = pathutil::normalize(location);
    if base.is_empty() {
        return loc;
    }
    match loc.strip_prefix(base) {
        Some("") => "/".to_string(),
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        _ => loc,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn child(name: &str, dir: bool, location: &str, children: Vec<ChildEntry>) -> ChildEntry {
        ChildEntry {
            name: name.to_string(),
            directory: dir,
            location: location.to_string(),
            modified_at: Some(1_700_000_000_000),
            children,
        }
    }

    #[test]
    fn mount_relative_strips_base() {
        assert_eq!(mount_relative("/proj", "/proj/a/b"), "/a/b");
        assert_eq!(mount_relative("/proj", "/proj"), "/");
        assert_eq!(mount_relative("", "/a"), "/a");
        // Locations outside the base pass through normalized.
        assert_eq!(mount_relative("/proj", "/other/a"), "/other/a");
    }

    #[test]
    fn collect_flattens_nested_listings() {
        let tree = vec![
            child(
                "sub",
                true,
                "/proj/d/sub",
                vec![child("inner.txt", false, "/proj/d/sub/inner.txt", vec![])],
            ),
            child("top.txt", false, "/proj/d/top.txt", vec![]),
        ];
        let mut out = Vec::new();
        collect("/proj", "/d", &tree, &mut out);
        let paths: Vec<_> = out.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec!["/d/sub", "/d/sub/inner.txt", "/d/top.txt"]);
        assert!(out[0].1.is_dir);
        assert!(!out[1].1.is_dir);
    }

    #[test]
    fn collect_joins_when_location_missing() {
        let tree = vec![child("a", true, "", vec![child("b.txt", false, "", vec![])])];
        let mut out = Vec::new();
        collect("", "/", &tree, &mut out);
        let paths: Vec<_> = out.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec!["/a", "/a/b.txt"]);
    }

    #[test]
    fn epoch_for_missing_timestamps() {
        assert_eq!(from_millis(None), SystemTime::UNIX_EPOCH);
        assert_eq!(from_millis(Some(0)), SystemTime::UNIX_EPOCH);
        assert!(from_millis(Some(1)) > SystemTime::UNIX_EPOCH);
    }
}
