//! Path helpers for the normalized form used as cache keys: forward slashes
//! only, exactly one leading slash, no trailing slash except the root. The
//! kernel and the remote both produce messier forms (relative fragments,
//! backslashes from repository tooling), so every entry point normalizes.

/// Normalizes a path into cache-key form.
pub fn normalize(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    out.push('/');
    for part in path.split(['/', '\\']).filter(|p| !p.is_empty()) {
        if !out.ends_with('/') {
            out.push('/');
        }
        out.push_str(part);
    }
    out
}

/// Parent directory of a normalized path. The root is its own parent.
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(i) => &path[..i],
        None => "/",
    }
}

/// Final component of a normalized path, empty for the root.
pub fn file_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

/// Joins a normalized directory and a child name.
pub fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// True when `path` lies strictly below `dir`.
pub fn is_descendant(dir: &str, path: &str) -> bool {
    if dir == "/" {
        return path != "/";
    }
    path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
}

/// How many levels `path` sits below `dir` (1 for an immediate child), or
/// `None` when `path` is not a descendant.
pub fn depth_below(dir: &str, path: &str) -> Option<u32> {
    if !is_descendant(dir, path) {
        return None;
    }
    let rest = if dir == "/" {
        &path[1..]
    } else {
        &path[dir.len() + 1..]
    };
    Some(rest.split('/').count() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_variants() {
        assert_eq!(normalize("a/b"), "/a/b");
        assert_eq!(normalize("/a/b/"), "/a/b");
        assert_eq!(normalize("a\\b\\c"), "/a/b/c");
        assert_eq!(normalize("//a///b"), "/a/b");
        assert_eq!(normalize(""), "/");
        assert_eq!(normalize("/"), "/");
    }

    #[test]
    fn parent_and_name() {
        assert_eq!(parent("/a/b"), "/a");
        assert_eq!(parent("/a"), "/");
        assert_eq!(parent("/"), "/");
        assert_eq!(file_name("/a/b"), "b");
        assert_eq!(file_name("/"), "");
    }

    #[test]
    fn join_roundtrips_with_split() {
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
        let p = join("/x/y", "z");
        assert_eq!(parent(&p), "/x/y");
        assert_eq!(file_name(&p), "z");
    }

    #[test]
    fn descendant_checks() {
        assert!(is_descendant("/", "/a"));
        assert!(is_descendant("/a", "/a/b/c"));
        assert!(!is_descendant("/a", "/a"));
        assert!(!is_descendant("/a", "/ab"));
        assert_eq!(depth_below("/a", "/a/b"), Some(1));
        assert_eq!(depth_below("/a", "/a/b/c"), Some(2));
        assert_eq!(depth_below("/", "/a/b"), Some(2));
        assert_eq!(depth_below("/a", "/b"), None);
    }
}
