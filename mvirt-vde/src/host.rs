//! Host operations: TAP interfaces via `ip`, and the VDE helper processes.
//!
//! Everything the drivers do to the host goes through [`HostOps`] so the
//! lifecycle logic can be exercised against [`crate::test_util::FakeHost`].

use crate::error::{DriverError, Result};
use crate::process::ProcessHandle;
use async_trait::async_trait;
use ipnet::IpNet;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::debug;

/// Parameters for a new vde_switch instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchSpec {
    pub socket_dir: PathBuf,
    pub management_socket: PathBuf,
    pub num_ports: u32,
    pub group: Option<String>,
}

impl SwitchSpec {
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--sock".to_string(),
            self.socket_dir.display().to_string(),
            "--mgmt".to_string(),
            self.management_socket.display().to_string(),
            "--numports".to_string(),
            self.num_ports.to_string(),
        ];
        if let Some(group) = &self.group {
            args.push("--group".to_string());
            args.push(group.clone());
        }
        args
    }
}

#[async_trait]
pub trait HostOps: Send + Sync {
    async fn create_tap(&self, name: &str) -> Result<()>;

    async fn set_link_address(&self, name: &str, mac: &str) -> Result<()>;

    async fn set_link_up(&self, name: &str) -> Result<()>;

    async fn add_address(&self, name: &str, addr: IpNet) -> Result<()>;

    async fn delete_link(&self, name: &str) -> Result<()>;

    /// Whether an interface with this name is visible in the host namespace.
    async fn link_exists(&self, name: &str) -> Result<bool>;

    async fn spawn_switch(&self, spec: &SwitchSpec) -> Result<ProcessHandle>;

    /// Attach `tap` to the switch listening in `socket_dir`.
    async fn spawn_plug(&self, socket_dir: &Path, tap: &str) -> Result<ProcessHandle>;
}

/// [`HostOps`] backed by iproute2 and the VDE binaries.
pub struct IpHost {
    ip_bin: PathBuf,
    switch_bin: PathBuf,
    plug_bin: PathBuf,
    shutdown: watch::Receiver<bool>,
}

impl IpHost {
    pub fn new(
        ip_bin: PathBuf,
        switch_bin: PathBuf,
        plug_bin: PathBuf,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ip_bin,
            switch_bin,
            plug_bin,
            shutdown,
        }
    }

    /// Run `ip` with `args` and fail on non-zero exit.
    ///
    /// If the shutdown token fires while waiting, the child is killed (on
    /// drop) and the call chain aborts with [`DriverError::Interrupted`].
    async fn ip(&self, args: &[&str]) -> Result<()> {
        let cmd_line = format!("ip {}", args.join(" "));
        debug!(cmd = %cmd_line, "Executing command");

        let mut cmd = Command::new(&self.ip_bin);
        cmd.args(args).kill_on_drop(true);

        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return Err(DriverError::Interrupted);
        }

        let output = tokio::select! {
            output = cmd.output() => output.map_err(|source| DriverError::Spawn {
                cmd: cmd_line.clone(),
                source,
            })?,
            _ = shutdown_requested(&mut shutdown) => {
                return Err(DriverError::Interrupted);
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stdout.lines() {
            debug!(cmd = %cmd_line, pipe = "stdout", "{}", line);
        }
        for line in stderr.lines() {
            debug!(cmd = %cmd_line, pipe = "stderr", "{}", line);
        }

        if !output.status.success() {
            return Err(DriverError::Command {
                cmd: cmd_line,
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Resolves once shutdown was requested. A dropped sender never resolves.
pub(crate) async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[async_trait]
impl HostOps for IpHost {
    async fn create_tap(&self, name: &str) -> Result<()> {
        self.ip(&["tuntap", "add", "dev", name, "mode", "tap"]).await
    }

    async fn set_link_address(&self, name: &str, mac: &str) -> Result<()> {
        self.ip(&["link", "set", "dev", name, "address", mac]).await
    }

    async fn set_link_up(&self, name: &str) -> Result<()> {
        self.ip(&["link", "set", "dev", name, "up"]).await
    }

    async fn add_address(&self, name: &str, addr: IpNet) -> Result<()> {
        let addr = addr.to_string();
        self.ip(&["address", "add", &addr, "dev", name]).await
    }

    async fn delete_link(&self, name: &str) -> Result<()> {
        self.ip(&["link", "delete", "dev", name]).await
    }

    async fn link_exists(&self, name: &str) -> Result<bool> {
        match nix::net::if_::if_nametoindex(name) {
            Ok(_) => Ok(true),
            Err(nix::errno::Errno::ENODEV) => Ok(false),
            Err(e) => Err(DriverError::Io(e.into())),
        }
    }

    async fn spawn_switch(&self, spec: &SwitchSpec) -> Result<ProcessHandle> {
        let mut cmd = Command::new(&self.switch_bin);
        cmd.args(spec.args());
        ProcessHandle::spawn("vde_switch", cmd)
    }

    async fn spawn_plug(&self, socket_dir: &Path, tap: &str) -> Result<ProcessHandle> {
        let mut cmd = Command::new(&self.plug_bin);
        cmd.arg("--sock").arg(socket_dir).arg(tap);
        ProcessHandle::spawn("vde_plug2tap", cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_with(ip_bin: &str) -> (IpHost, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let host = IpHost::new(
            PathBuf::from(ip_bin),
            PathBuf::from("vde_switch"),
            PathBuf::from("vde_plug2tap"),
            rx,
        );
        (host, tx)
    }

    #[test]
    fn test_switch_args() {
        let spec = SwitchSpec {
            socket_dir: PathBuf::from("/run/docker-vde/0123456789ab"),
            management_socket: PathBuf::from("/run/docker-vde/0123456789ab.mgmt.sock"),
            num_ports: 32,
            group: None,
        };
        assert_eq!(
            spec.args(),
            vec![
                "--sock",
                "/run/docker-vde/0123456789ab",
                "--mgmt",
                "/run/docker-vde/0123456789ab.mgmt.sock",
                "--numports",
                "32"
            ]
        );

        let with_group = SwitchSpec {
            group: Some("docker".into()),
            ..spec
        };
        assert_eq!(with_group.args()[6..], ["--group", "docker"]);
    }

    #[tokio::test]
    async fn test_command_failure_reports_stderr() {
        // `false` ignores its arguments and exits 1.
        let (host, _tx) = host_with("false");
        let err = host.set_link_up("vdetest").await.unwrap_err();
        match err {
            DriverError::Command { cmd, .. } => assert_eq!(cmd, "ip link set dev vdetest up"),
            other => panic!("Unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_command_success() {
        let (host, _tx) = host_with("true");
        host.create_tap("vdetest").await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_commands() {
        let (host, tx) = host_with("true");
        tx.send(true).unwrap();
        let err = host.delete_link("vdetest").await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_loopback_exists() {
        let (host, _tx) = host_with("true");
        assert!(host.link_exists("lo").await.unwrap());
        assert!(!host.link_exists("vdenothere0").await.unwrap());
    }
}
