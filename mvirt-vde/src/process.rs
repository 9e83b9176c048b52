//! Supervision of long-running helper processes (vde_switch, vde_plug2tap).
//!
//! Each spawned process is owned by a reaper task. The handle only holds the
//! process input pipe and channels to the reaper: one to request a kill, one
//! that reports the exit. Dropping the handle kills the process.

use crate::error::{DriverError, Result};
use std::fmt;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Run state as observed by the reaper task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// Exited with the given code (`None` when killed by a signal).
    Exited(Option<i32>),
}

/// Handle to a supervised process.
pub struct ProcessHandle {
    name: String,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    kill_tx: Option<oneshot::Sender<()>>,
    state_rx: watch::Receiver<ProcessState>,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("state", &*self.state_rx.borrow())
            .finish()
    }
}

impl ProcessHandle {
    /// Spawn `cmd` with piped stdio and hand it to a reaper task.
    ///
    /// stdout/stderr are forwarded to the debug log, stdin is kept open as
    /// the process input pipe.
    pub fn spawn(name: &str, mut cmd: Command) -> Result<Self> {
        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        debug!(cmd = ?cmd.as_std(), "Spawning process");

        let mut child = cmd.spawn().map_err(|source| DriverError::Spawn {
            cmd: name.to_string(),
            source,
        })?;
        let pid = child.id();
        let stdin = child.stdin.take();

        if let Some(stdout) = child.stdout.take() {
            forward_output(name.to_string(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(name.to_string(), "stderr", stderr);
        }

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (state_tx, state_rx) = watch::channel(ProcessState::Running);

        let task_name = name.to_string();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        debug!(cmd = %task_name, error = %e, "Kill failed, process already gone");
                    }
                    child.wait().await
                }
            };

            let code = match status {
                Ok(status) => {
                    info!(cmd = %task_name, pid = ?pid, status = %status, "Process exited");
                    status.code()
                }
                Err(e) => {
                    warn!(cmd = %task_name, pid = ?pid, error = %e, "Failed to wait for process");
                    None
                }
            };
            let _ = state_tx.send(ProcessState::Exited(code));
        });

        info!(cmd = %name, pid = ?pid, "Process started");

        Ok(Self {
            name: name.to_string(),
            pid,
            stdin,
            kill_tx: Some(kill_tx),
            state_rx,
        })
    }

    /// A handle without an OS process behind it. The returned
    /// [`SimulatedExit`] makes the "process" exit with a code.
    pub fn simulated(name: &str, pid: u32) -> (Self, SimulatedExit) {
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, mut exit_rx) = mpsc::channel::<i32>(1);
        let (state_tx, state_rx) = watch::channel(ProcessState::Running);

        tokio::spawn(async move {
            let code = tokio::select! {
                Some(code) = exit_rx.recv() => Some(code),
                _ = kill_rx => None,
            };
            let _ = state_tx.send(ProcessState::Exited(code));
        });

        let handle = Self {
            name: name.to_string(),
            pid: Some(pid),
            stdin: None,
            kill_tx: Some(kill_tx),
            state_rx,
        };
        (handle, SimulatedExit { tx: exit_tx })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        *self.state_rx.borrow()
    }

    /// Non-blocking liveness check.
    pub fn is_running(&self) -> bool {
        self.state() == ProcessState::Running
    }

    /// Close the process input pipe. Idempotent.
    pub fn close_stdin(&mut self) {
        if self.stdin.take().is_some() {
            debug!(cmd = %self.name, pid = ?self.pid, "Closed input pipe");
        }
    }

    /// Wait until the reaper has observed the exit.
    pub async fn exited(&self) -> ProcessState {
        let mut rx = self.state_rx.clone();
        match rx.wait_for(|s| *s != ProcessState::Running).await {
            Ok(state) => *state,
            // Reaper is gone without reporting, nothing left to wait for.
            Err(_) => ProcessState::Exited(None),
        }
    }

    /// Close the pipe, kill the process and wait for it. Idempotent.
    pub async fn terminate(&mut self) -> ProcessState {
        self.close_stdin();
        if let Some(kill_tx) = self.kill_tx.take() {
            debug!(cmd = %self.name, pid = ?self.pid, "Killing process");
            let _ = kill_tx.send(());
        }
        self.exited().await
    }
}

/// Trigger for a simulated process exit.
#[derive(Debug, Clone)]
pub struct SimulatedExit {
    tx: mpsc::Sender<i32>,
}

impl SimulatedExit {
    pub fn exit(&self, code: i32) {
        let _ = self.tx.try_send(code);
    }
}

/// Forward every line of a process pipe to the debug log.
pub(crate) fn forward_output<R>(cmd: String, pipe: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(cmd = %cmd, pipe, "{}", line);
        }
    });
}
