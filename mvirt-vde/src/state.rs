//! State shared by the network and IPAM drivers.

use crate::config::DriverConfig;
use crate::gc::InterfaceGc;
use crate::host::HostOps;
use crate::ipam::IpamDriver;
use crate::ipam::pool::IpPool;
use crate::network::{Network, NetworkDriver};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Registries and host access behind both plugin adapters.
///
/// Lock order is `networks` before a network's endpoint map. `pools` is
/// independent of both.
pub struct DriverState {
    pub(crate) config: DriverConfig,
    pub(crate) host: Arc<dyn HostOps>,
    pub(crate) networks: RwLock<HashMap<String, Arc<Network>>>,
    pub(crate) pools: RwLock<HashMap<String, Arc<IpPool>>>,
    pub(crate) gc: Arc<InterfaceGc>,
}

impl DriverState {
    pub fn new(config: DriverConfig, host: Arc<dyn HostOps>) -> Arc<Self> {
        let gc = Arc::new(InterfaceGc::new(host.clone()));
        Arc::new(Self {
            config,
            host,
            networks: RwLock::new(HashMap::new()),
            pools: RwLock::new(HashMap::new()),
            gc,
        })
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn gc(&self) -> &Arc<InterfaceGc> {
        &self.gc
    }

    pub fn network_driver(self: &Arc<Self>) -> NetworkDriver {
        NetworkDriver::new(self.clone())
    }

    pub fn ipam_driver(self: &Arc<Self>) -> IpamDriver {
        IpamDriver::new(self.clone())
    }

    pub async fn network(&self, id: &str) -> Option<Arc<Network>> {
        self.networks.read().await.get(id).cloned()
    }

    pub async fn network_count(&self) -> usize {
        self.networks.read().await.len()
    }

    pub async fn pool(&self, id: &str) -> Option<Arc<IpPool>> {
        self.pools.read().await.get(id).cloned()
    }

    /// Stop every plug and driver-owned switch and remove owned sockets.
    ///
    /// Tap devices are left behind: `ip` commands are already interrupted
    /// once the shutdown token fired.
    pub async fn shutdown(&self) {
        let mut networks = self.networks.write().await;
        for (id, network) in networks.drain() {
            info!(network_id = %id, "Tearing down network");
            network.stop_plugs().await;
            network.teardown().await;
        }
    }
}
