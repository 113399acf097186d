use std::time::Duration;

/// Tunables of one mount. [`Default`] gives the values the CLI starts from.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Pause between background refresh passes.
    pub refresh_interval: Duration,
    /// How many directory levels a plain listing request expands.
    pub max_depth: u32,
    /// Cap on simultaneous remote requests during refresh fan-out.
    pub refresh_workers: usize,
    /// Identity stamped into every attribute; the remote has no ownership
    /// model, so everything belongs to the mounting process.
    pub uid: u32,
    pub gid: u32,
}

impl MountConfig {
    /// Depth used by deep refreshes: the configured depth plus a lookahead
    /// margin, so the cache reaches slightly past what the user has browsed.
    pub fn deep_depth(&self) -> u32 {
        self.max_depth + 2
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(10),
            max_depth: 1,
            refresh_workers: 30,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }
}
