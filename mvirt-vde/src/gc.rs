//! Deferred tap device removal.
//!
//! A container sandbox hands its interfaces back to the host namespace some
//! time after Leave/DeleteEndpoint. Names that could not be deleted right
//! away are polled here until the device is gone. A name that was never seen
//! in the host namespace stays pending: the sandbox may still hold it.

use crate::host::{HostOps, shutdown_requested};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub struct InterfaceGc {
    host: Arc<dyn HostOps>,
    /// Pending names, mapped to whether the device was seen in the host namespace.
    pending: Mutex<HashMap<String, bool>>,
}

impl InterfaceGc {
    pub fn new(host: Arc<dyn HostOps>) -> Self {
        Self {
            host,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn pending_set(&self) -> MutexGuard<'_, HashMap<String, bool>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue an interface for deletion. Idempotent.
    pub fn schedule(&self, name: &str) {
        let mut pending = self.pending_set();
        if !pending.contains_key(name) {
            pending.insert(name.to_string(), false);
            info!(interface = %name, "Interface scheduled for deletion");
        }
    }

    /// Drop a name, e.g. once a new device of that name was created.
    pub fn cancel(&self, name: &str) {
        if self.pending_set().remove(name).is_some() {
            debug!(interface = %name, "Interface deletion cancelled");
        }
    }

    pub fn is_pending(&self, name: &str) -> bool {
        self.pending_set().contains_key(name)
    }

    pub fn pending(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pending_set().keys().cloned().collect();
        names.sort();
        names
    }

    /// One reconciliation pass. Returns the number of names still pending.
    pub async fn poll_once(&self) -> usize {
        let names = self.pending();

        for name in names {
            let gone = match self.host.link_exists(&name).await {
                Ok(false) => {
                    let seen = self.pending_set().get(&name).copied().unwrap_or(false);
                    if !seen {
                        debug!(interface = %name, "Interface not back in host namespace yet");
                    }
                    seen
                }
                Ok(true) => {
                    if let Some(seen) = self.pending_set().get_mut(&name) {
                        *seen = true;
                    }
                    match self.host.delete_link(&name).await {
                        Ok(()) => true,
                        Err(e) => {
                            debug!(interface = %name, error = %e, "Interface deletion failed, retrying later");
                            false
                        }
                    }
                }
                Err(e) => {
                    debug!(interface = %name, error = %e, "Interface lookup failed, retrying later");
                    false
                }
            };

            if gone {
                self.pending_set().remove(&name);
                info!(interface = %name, "Interface removed");
            }
        }

        self.pending_set().len()
    }

    /// Poll every `interval` until shutdown is requested.
    pub fn spawn(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_requested(&mut shutdown) => {
                        info!("Interface GC shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if !self.pending_set().is_empty() {
                            self.poll_once().await;
                        }
                    }
                }
            }
        })
    }
}
