//! Mount helpers for starting/stopping FUSE
//!
//! Notes:
//! - Only supported on Unix-like systems. On Linux we support unprivileged mount via fusermount3.
//! - These helpers are thin wrappers over rfuse3 raw Session APIs.

use std::path::Path;

use rfuse3::MountOptions;

use crate::config::MountConfig;
use crate::fuse::RepoFuse;
use crate::remote::RemoteRepo;

/// Build default mount options for a repository mount.
fn default_mount_options(cfg: &MountConfig) -> MountOptions {
    let mut mo = MountOptions::default();
    mo.fs_name("repofs")
        .uid(cfg.uid)
        .gid(cfg.gid)
        .force_readdir_plus(true);
    // Keep defaults conservative: no allow_other, require empty mountpoint.
    mo
}

/// Mount the adapter at the given empty directory using unprivileged mode when available.
#[cfg(target_os = "linux")]
pub async fn mount_unprivileged<R: RemoteRepo>(
    fs: RepoFuse<R>,
    cfg: &MountConfig,
    mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle> {
    let opts = default_mount_options(cfg);
    let session = rfuse3::raw::Session::new(opts);
    // Prefer unprivileged mount on Linux (requires fusermount3 in PATH)
    session.mount_with_unprivileged(fs, mount_point).await
}

/// Fallback stub for non-Linux targets.
#[cfg(not(target_os = "linux"))]
pub async fn mount_unprivileged<R: RemoteRepo>(
    _fs: RepoFuse<R>,
    _cfg: &MountConfig,
    _mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    ))
}
