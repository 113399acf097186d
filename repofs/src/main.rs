use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use librepo::{ClientOptions, RepoClient};
use tokio::signal;
use tracing::info;

use repofs::config::MountConfig;
use repofs::fsops::RepoFs;
use repofs::fuse::RepoFuse;
use repofs::fuse::mount::mount_unprivileged;
use repofs::refresh::RefreshTask;
use repofs::remote::HttpRepo;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Repository server URL
    #[arg(long, env = "REPOFS_HOST")]
    host: String,

    /// Account for basic authentication
    #[arg(long, env = "REPOFS_USER")]
    user: String,

    /// Password for the account
    #[arg(long, env = "REPOFS_PASSWORD")]
    password: String,

    /// Repository directory exposed as the mount root
    #[arg(long, env = "REPOFS_BASE", default_value = "/")]
    base: String,

    /// Empty directory to mount on; derived from the server name when omitted
    #[arg(long, env = "REPOFS_MOUNTPOINT")]
    mountpoint: Option<String>,

    /// Seconds between background refresh passes
    #[arg(long, env = "REPOFS_REFRESH_SECS", default_value_t = 10)]
    refresh_secs: u64,

    /// Directory levels fetched per listing request
    #[arg(long, env = "REPOFS_DEPTH", default_value_t = 1)]
    depth: u32,

    /// Skip TLS certificate verification
    #[arg(long, env = "REPOFS_INSECURE")]
    insecure: bool,
}

/// Mountpoint fallback: the first DNS label of the server name, so
/// `https://docs.example.com` mounts at `./docs`.
fn default_mountpoint(host: &str) -> String {
    let name = host
        .rsplit("://")
        .next()
        .unwrap_or(host)
        .split(['/', ':'])
        .next()
        .unwrap_or_default()
        .split('.')
        .next()
        .unwrap_or_default();
    if name.is_empty() {
        "repofs".to_string()
    } else {
        name.to_string()
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let mountpoint = args
        .mountpoint
        .clone()
        .unwrap_or_else(|| default_mountpoint(&args.host));

    let mut opts = ClientOptions::new(&args.host, &args.user, &args.password);
    opts.base = args.base.clone();
    opts.insecure = args.insecure;
    let client = RepoClient::connect(opts)
        .await
        .with_context(|| format!("connect to {}", args.host))?;

    let cfg = MountConfig {
        refresh_interval: Duration::from_secs(args.refresh_secs),
        max_depth: args.depth,
        ..MountConfig::default()
    };

    let fs = RepoFs::new(HttpRepo::new(client), cfg.clone());
    // Pull the root listing up front so a bad base path or credentials fail
    // here instead of surfacing as I/O errors after the mount.
    fs.list_dir("/").await.context("read repository root")?;

    std::fs::create_dir_all(&mountpoint)
        .with_context(|| format!("create mount point {mountpoint}"))?;

    let refresh = RefreshTask::spawn(fs.clone());
    let handle = mount_unprivileged(RepoFuse::new(fs), &cfg, &mountpoint)
        .await
        .with_context(|| format!("mount at {mountpoint}"))?;
    info!(%mountpoint, "repository mounted, press Ctrl+C to unmount");

    shutdown_signal().await;

    refresh.stop().await;
    handle.unmount().await.context("unmount")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("signal received, unmounting");
}
