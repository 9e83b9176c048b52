use anyhow::{Context, bail};
use clap::Parser;
use mvirt_vde::DriverState;
use mvirt_vde::api::{bind_unix, ipam_router, network_router, serve};
use mvirt_vde::config::{DEFAULT_SOCKET_ROOT, DriverConfig, lookup_executable, parse_listen_addr};
use mvirt_vde::host::IpHost;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mvirt-vde")]
#[command(about = "Docker network and IPAM plugin for VDE switches")]
struct Args {
    /// Directory for per-network switch sockets
    #[arg(long, default_value = DEFAULT_SOCKET_ROOT)]
    socket_root: PathBuf,

    /// Network driver listen address (unix:///path or absolute path, can be repeated)
    #[arg(long, default_value = "unix:///run/docker/plugins/vde.sock", value_parser = parse_listen_addr)]
    network_listen: Vec<PathBuf>,

    /// IPAM driver listen address (unix:///path or absolute path, can be repeated)
    #[arg(long, default_value = "unix:///run/docker/plugins/vde-ipam.sock", value_parser = parse_listen_addr)]
    ipam_listen: Vec<PathBuf>,

    /// iproute2 binary
    #[arg(long, default_value = "ip")]
    ip_bin: PathBuf,

    /// vde_switch binary
    #[arg(long, default_value = "vde_switch")]
    switch_bin: PathBuf,

    /// vde_plug2tap binary
    #[arg(long, default_value = "vde_plug2tap")]
    plug_bin: PathBuf,

    /// Interface GC poll interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    gc_interval_ms: u64,

    /// Log level filter for this crate (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn resolve(name: &Path) -> anyhow::Result<PathBuf> {
    match lookup_executable(name) {
        Some(path) => Ok(path),
        None => bail!("Required executable not found: {}", name.display()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("mvirt_vde={}", args.log_level).parse()?),
        )
        .init();

    let ip_bin = resolve(&args.ip_bin)?;
    let switch_bin = resolve(&args.switch_bin)?;
    let plug_bin = resolve(&args.plug_bin)?;

    info!(
        socket_root = %args.socket_root.display(),
        ip = %ip_bin.display(),
        vde_switch = %switch_bin.display(),
        vde_plug2tap = %plug_bin.display(),
        "Starting mvirt-vde"
    );

    tokio::fs::create_dir_all(&args.socket_root)
        .await
        .with_context(|| format!("Failed to create socket root {}", args.socket_root.display()))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let host = Arc::new(IpHost::new(ip_bin, switch_bin, plug_bin, shutdown_rx.clone()));
    let mut config = DriverConfig::new(&args.socket_root);
    config.gc_interval = Duration::from_millis(args.gc_interval_ms);
    let state = DriverState::new(config, host);

    let gc_handle = state
        .gc()
        .clone()
        .spawn(state.config().gc_interval, shutdown_rx.clone());

    let mut servers = Vec::new();
    let mut listen_paths = Vec::new();
    for path in &args.network_listen {
        let listener = bind_unix(path)
            .with_context(|| format!("Failed to bind {}", path.display()))?;
        info!(path = %path.display(), "Network driver listening");
        servers.push(tokio::spawn(serve(
            listener,
            network_router(state.network_driver()),
            shutdown_rx.clone(),
        )));
        listen_paths.push(path.clone());
    }
    for path in &args.ipam_listen {
        let listener = bind_unix(path)
            .with_context(|| format!("Failed to bind {}", path.display()))?;
        info!(path = %path.display(), "IPAM driver listening");
        servers.push(tokio::spawn(serve(
            listener,
            ipam_router(state.ipam_driver()),
            shutdown_rx.clone(),
        )));
        listen_paths.push(path.clone());
    }

    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    tokio::select! {
        _ = signal::ctrl_c() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }

    // Aborts in-flight host commands and stops servers and GC
    let _ = shutdown_tx.send(true);

    for server in servers {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Plugin server failed"),
            Err(e) => error!(error = %e, "Plugin server task panicked"),
        }
    }
    log_task_exit("interface GC", gc_handle.await);

    state.shutdown().await;

    for path in listen_paths {
        if let Err(e) = std::fs::remove_file(&path) {
            warn!(path = %path.display(), error = %e, "Failed to remove listen socket");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Log a background task that ended abnormally. Returns whether it exited cleanly.
fn log_task_exit(task: &str, result: Result<(), JoinError>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            error!(task = %task, error = %e, "Background task panicked");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_task_exit() {
        assert!(log_task_exit("ok", tokio::spawn(async {}).await));

        let panicked = tokio::spawn(async {
            if true {
                panic!("gc loop failed");
            }
        })
        .await;
        assert!(!log_task_exit("gc", panicked));
    }
}
