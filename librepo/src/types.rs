//! Wire documents of the repository file API. Field names on the wire are
//! PascalCase; everything not consumed by the filesystem layer is ignored.

use serde::{Deserialize, Serialize};

/// Metadata document returned by `GET <path>?depth=0&parts=meta`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatDocument {
    pub name: String,
    #[serde(default)]
    pub directory: bool,
    #[serde(default)]
    pub attributes: Attributes,
    /// Server-side modification instant in milliseconds since the epoch.
    /// Directories usually omit it.
    #[serde(default)]
    pub modified_at: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Attributes {
    pub read_only: bool,
    pub executable: bool,
    pub hidden: bool,
    pub archive: bool,
    pub symbolic_link: bool,
}

/// Listing returned by `GET <dir>?depth=N`. `children` nests up to the
/// requested depth; a child's `location` is repository-absolute, so callers
/// must strip the mounted base directory before using it as a cache key.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DirListing {
    pub name: String,
    #[serde(default)]
    pub directory: bool,
    #[serde(default)]
    pub children: Vec<ChildEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChildEntry {
    pub name: String,
    #[serde(default)]
    pub directory: bool,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub modified_at: Option<i64>,
    #[serde(default)]
    pub children: Vec<ChildEntry>,
}

/// Body of a create request, POSTed to the parent directory.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateRequest<'a> {
    pub name: &'a str,
    pub directory: bool,
}

/// Body of a move request, POSTed to the parent directory together with the
/// `X-Create-Options: move,no-overwrite` header.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MoveRequest<'a> {
    /// Source path, repository-absolute.
    pub location: &'a str,
    /// New name of the entry inside the same directory.
    pub target: &'a str,
}
