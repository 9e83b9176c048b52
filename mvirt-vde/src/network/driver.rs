//! Network driver operations.

use super::endpoint::{MacAddr, parse_interface_address, tap_name};
use super::{Endpoint, Network, NetworkOptions, SocketPlan, plan_sockets, pools_from_ipam_data};
use crate::config::INTERFACE_PREFIX;
use crate::error::{DriverError, Result};
use crate::host::SwitchSpec;
use crate::ipam::pool::IpPool;
use crate::process::ProcessHandle;
use crate::protocol::{
    CapabilitiesResponse, CreateEndpointRequest, CreateEndpointResponse, CreateNetworkRequest,
    DeleteEndpointRequest, DeleteNetworkRequest, DiscoveryNotification, EndpointInterface,
    ExternalConnectivityRequest, InfoRequest, InfoResponse, InterfaceName, JoinRequest,
    JoinResponse, LOCAL_SCOPE, LeaveRequest,
};
use crate::state::DriverState;
use ipnet::IpNet;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// libnetwork remote network driver.
#[derive(Clone)]
pub struct NetworkDriver {
    state: Arc<DriverState>,
}

impl NetworkDriver {
    pub fn new(state: Arc<DriverState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<DriverState> {
        &self.state
    }

    pub fn capabilities(&self) -> CapabilitiesResponse {
        debug!("GetCapabilities request received");
        CapabilitiesResponse {
            scope: LOCAL_SCOPE.to_string(),
        }
    }

    pub async fn create_network(&self, req: CreateNetworkRequest) -> Result<()> {
        let id = req.network_id.as_str();
        info!(network_id = %id, "CreateNetwork request received");

        if self.state.networks.read().await.contains_key(id) {
            return Err(DriverError::NetworkExists(id.to_string()));
        }

        let options = NetworkOptions::from_request(req.options.as_ref())?;
        let pools4 = pools_from_ipam_data(req.ipv4_data.as_deref())?;
        let pools6 = pools_from_ipam_data(req.ipv6_data.as_deref())?;
        if let Some(group) = &options.socket_group {
            check_group(group).await?;
        }

        let plan = plan_sockets(&self.state.config, id, &options)?;
        let switch = if plan.create {
            Some(self.start_switch(&plan, &options).await?)
        } else {
            None
        };

        let network = Arc::new(Network::new(id, plan, switch, pools4, pools6));

        let mut networks = self.state.networks.write().await;
        if networks.contains_key(id) {
            drop(networks);
            warn!(network_id = %id, "Network created concurrently, discarding duplicate");
            // Sockets may be shared with the winner, only the switch goes
            network.stop_switch().await;
            return Err(DriverError::NetworkExists(id.to_string()));
        }
        networks.insert(id.to_string(), network.clone());

        info!(
            network_id = %id,
            socket_dir = %network.socket_dir.display(),
            switch_pid = ?network.switch_pid(),
            owned = network.owns_switch(),
            "Network created"
        );
        Ok(())
    }

    /// Spawn vde_switch for `plan` and make sure it survives the grace period.
    async fn start_switch(&self, plan: &SocketPlan, options: &NetworkOptions) -> Result<ProcessHandle> {
        if let Some(parent) = plan.socket_dir.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DriverError::SocketDir {
                    path: parent.display().to_string(),
                    reason: format!("could not create socket root: {}", e),
                })?;
        }

        let spec = SwitchSpec {
            socket_dir: plan.socket_dir.clone(),
            management_socket: plan
                .management_socket
                .clone()
                .unwrap_or_else(|| super::mgmt_socket_for(&plan.socket_dir)),
            num_ports: options
                .num_switchports
                .unwrap_or(self.state.config.default_num_switchports),
            group: options.socket_group.clone(),
        };
        debug!(num_ports = spec.num_ports, "Starting vde_switch");

        let mut switch = self.state.host.spawn_switch(&spec).await?;

        tokio::time::sleep(self.state.config.switch_grace_period).await;
        if !switch.is_running() {
            error!(
                socket_dir = %spec.socket_dir.display(),
                state = ?switch.state(),
                "vde_switch exited during startup"
            );
            switch.terminate().await;
            return Err(DriverError::SwitchStartup);
        }
        Ok(switch)
    }

    pub async fn delete_network(&self, req: DeleteNetworkRequest) -> Result<()> {
        let id = req.network_id.as_str();
        info!(network_id = %id, "DeleteNetwork request received");

        let mut networks = self.state.networks.write().await;
        let network = networks
            .get(id)
            .cloned()
            .ok_or_else(|| DriverError::NetworkNotFound(id.to_string()))?;

        let count = network.endpoint_count().await;
        if count > 0 {
            return Err(DriverError::NetworkInUse(count));
        }

        networks.remove(id);
        network.teardown().await;
        info!(network_id = %id, "Network deleted");
        Ok(())
    }

    pub async fn create_endpoint(&self, req: CreateEndpointRequest) -> Result<CreateEndpointResponse> {
        let network_id = req.network_id.as_str();
        let endpoint_id = req.endpoint_id.as_str();
        info!(network_id = %network_id, endpoint_id = %endpoint_id, "CreateEndpoint request received");

        let networks = self.state.networks.read().await;
        let network = networks
            .get(network_id)
            .ok_or_else(|| DriverError::NetworkNotFound(network_id.to_string()))?;

        if network.has_endpoint(endpoint_id).await {
            return Err(DriverError::EndpointExists(endpoint_id.to_string()));
        }

        let requested = req.interface.clone().unwrap_or_default();
        let address = parse_family(&requested.address, true)?;
        let address6 = parse_family(&requested.address_ipv6, false)?;
        let mac = if requested.mac_address.is_empty() {
            MacAddr::random()
        } else {
            requested.mac_address.parse()?
        };

        let mut endpoints = network.endpoints.write().await;
        if endpoints.contains_key(endpoint_id) {
            return Err(DriverError::EndpointExists(endpoint_id.to_string()));
        }

        let mut endpoint = Endpoint::new(endpoint_id, mac);
        let address = reserve_address(&mut endpoint, &network.pools4, address)?;
        let address6 = match reserve_address(&mut endpoint, &network.pools6, address6) {
            Ok(addr) => addr,
            Err(e) => {
                for ip in endpoint.reserved() {
                    network.release_address(ip);
                }
                return Err(e);
            }
        };
        endpoint.address = address;
        endpoint.address6 = address6;
        endpoint.gateway = endpoint.address.and_then(|a| network.gateway_for(&a.addr()));
        endpoint.gateway6 = endpoint.address6.and_then(|a| network.gateway_for(&a.addr()));

        info!(
            network_id = %network_id,
            endpoint_id = %endpoint_id,
            address = %endpoint.address_string(),
            address6 = %endpoint.address6_string(),
            mac = %endpoint.mac,
            "Endpoint created"
        );

        // Docker only accepts interface data back if it did not send any
        let interface = req.interface.is_none().then(|| EndpointInterface {
            address: endpoint.address_string(),
            address_ipv6: endpoint.address6_string(),
            mac_address: endpoint.mac.to_string(),
        });

        endpoints.insert(endpoint_id.to_string(), endpoint);
        Ok(CreateEndpointResponse { interface })
    }

    pub async fn delete_endpoint(&self, req: DeleteEndpointRequest) -> Result<()> {
        let network_id = req.network_id.as_str();
        let endpoint_id = req.endpoint_id.as_str();
        info!(network_id = %network_id, endpoint_id = %endpoint_id, "DeleteEndpoint request received");

        let networks = self.state.networks.read().await;
        let network = networks
            .get(network_id)
            .ok_or_else(|| DriverError::NetworkNotFound(network_id.to_string()))?;

        let mut endpoints = network.endpoints.write().await;
        let mut endpoint = endpoints
            .remove(endpoint_id)
            .ok_or_else(|| DriverError::EndpointNotFound(endpoint_id.to_string()))?;

        for ip in endpoint.reserved() {
            network.release_address(ip);
        }

        let tap = match endpoint.detach() {
            Some((tap, plug)) => {
                if let Some(mut plug) = plug {
                    plug.terminate().await;
                }
                Some(tap)
            }
            None => endpoint.take_released_tap(),
        };

        if let Some(tap) = tap {
            match self.state.host.delete_link(&tap).await {
                Ok(()) => info!(tap = %tap, "Tap device deleted"),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    debug!(tap = %tap, error = %e, "Tap device not deletable yet, scheduling for cleanup");
                    self.state.gc.schedule(&tap);
                }
            }
        }

        info!(network_id = %network_id, endpoint_id = %endpoint_id, "Endpoint deleted");
        Ok(())
    }

    pub async fn endpoint_info(&self, req: InfoRequest) -> Result<InfoResponse> {
        let network_id = req.network_id.as_str();
        let endpoint_id = req.endpoint_id.as_str();
        debug!(network_id = %network_id, endpoint_id = %endpoint_id, "EndpointOperInfo request received");

        let networks = self.state.networks.read().await;
        let network = networks
            .get(network_id)
            .ok_or_else(|| DriverError::NetworkNotFound(network_id.to_string()))?;
        let endpoints = network.endpoints.read().await;
        let endpoint = endpoints
            .get(endpoint_id)
            .ok_or_else(|| DriverError::EndpointNotFound(endpoint_id.to_string()))?;

        let pid = |p: Option<u32>| p.map(|p| p.to_string()).unwrap_or_default();
        let value = HashMap::from([
            ("socket_dir".to_string(), network.socket_dir.display().to_string()),
            (
                "management_socket".to_string(),
                network
                    .management_socket
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
            ),
            ("switch_pid".to_string(), pid(network.switch_pid())),
            (
                "create_sockets".to_string(),
                if network.owns_switch() { "true" } else { "" }.to_string(),
            ),
            ("plug_pid".to_string(), pid(endpoint.plug_pid())),
            (
                "tap_device".to_string(),
                endpoint.tap_device().unwrap_or_default().to_string(),
            ),
        ]);
        Ok(InfoResponse { value })
    }

    pub async fn join(&self, req: JoinRequest) -> Result<JoinResponse> {
        let network_id = req.network_id.as_str();
        let endpoint_id = req.endpoint_id.as_str();
        info!(
            network_id = %network_id,
            endpoint_id = %endpoint_id,
            sandbox = %req.sandbox_key,
            "Join request received"
        );

        let networks = self.state.networks.read().await;
        let network = networks
            .get(network_id)
            .ok_or_else(|| DriverError::NetworkNotFound(network_id.to_string()))?;

        let mut endpoints = network.endpoints.write().await;
        let endpoint = endpoints
            .get_mut(endpoint_id)
            .ok_or_else(|| DriverError::EndpointNotFound(endpoint_id.to_string()))?;

        if !network.is_running() {
            error!(network_id = %network_id, "Switch is not running");
            return Err(DriverError::NetworkDown);
        }
        if let Some(tap) = endpoint.tap_device() {
            return Err(DriverError::AlreadyJoined(tap.to_string()));
        }

        if let Some(old) = endpoint.take_released_tap()
            && let Err(e) = self.state.host.delete_link(&old).await
        {
            if e.is_fatal() {
                return Err(e);
            }
            debug!(tap = %old, error = %e, "Released tap device not deletable yet");
            self.state.gc.schedule(&old);
        }

        let tap = tap_name(endpoint_id);
        self.state.host.create_tap(&tap).await?;
        // Any older device of this name is gone, the GC must not touch the new one
        self.state.gc.cancel(&tap);

        match self.configure_tap(network, endpoint, &tap).await {
            Ok(plug) => {
                info!(tap = %tap, plug_pid = ?plug.pid(), "Endpoint joined");
                endpoint.attach(tap.clone(), plug);
            }
            Err(e) => {
                error!(tap = %tap, error = %e, "Join failed, removing tap device");
                if let Err(del) = self.state.host.delete_link(&tap).await {
                    warn!(tap = %tap, error = %del, "Failed to remove tap device");
                }
                return Err(e);
            }
        }

        Ok(JoinResponse {
            interface_name: InterfaceName {
                src_name: tap,
                dst_prefix: INTERFACE_PREFIX.to_string(),
            },
            gateway: endpoint.gateway.map(|g| g.to_string()).unwrap_or_default(),
            gateway_ipv6: endpoint.gateway6.map(|g| g.to_string()).unwrap_or_default(),
            disable_gateway_service: false,
        })
    }

    /// Set MAC, link state and addresses on a fresh tap and attach it to the switch.
    async fn configure_tap(
        &self,
        network: &Network,
        endpoint: &Endpoint,
        tap: &str,
    ) -> Result<ProcessHandle> {
        let host = &self.state.host;
        host.set_link_address(tap, &endpoint.mac.to_string()).await?;
        host.set_link_up(tap).await?;
        if let Some(addr) = endpoint.address {
            host.add_address(tap, addr).await?;
        }
        if let Some(addr) = endpoint.address6 {
            host.add_address(tap, addr).await?;
        }
        host.spawn_plug(&network.socket_dir, tap).await
    }

    pub async fn leave(&self, req: LeaveRequest) -> Result<()> {
        let network_id = req.network_id.as_str();
        let endpoint_id = req.endpoint_id.as_str();
        info!(network_id = %network_id, endpoint_id = %endpoint_id, "Leave request received");

        let networks = self.state.networks.read().await;
        let network = networks
            .get(network_id)
            .ok_or_else(|| DriverError::NetworkNotFound(network_id.to_string()))?;

        let mut endpoints = network.endpoints.write().await;
        let endpoint = endpoints
            .get_mut(endpoint_id)
            .ok_or_else(|| DriverError::EndpointNotFound(endpoint_id.to_string()))?;

        match endpoint.detach() {
            Some((tap, plug)) => {
                if let Some(mut plug) = plug {
                    let state = plug.terminate().await;
                    debug!(tap = %tap, state = ?state, "Plug stopped");
                }
                info!(tap = %tap, "Endpoint left");
                endpoint.set_released_tap(tap);
            }
            None => warn!(endpoint_id = %endpoint_id, "Leave for endpoint that is not joined"),
        }
        Ok(())
    }

    pub fn discover_new(&self, notification: DiscoveryNotification) -> Result<()> {
        debug!(discovery_type = notification.discovery_type, "DiscoverNew request received");
        Ok(())
    }

    pub fn discover_delete(&self, notification: DiscoveryNotification) -> Result<()> {
        debug!(discovery_type = notification.discovery_type, "DiscoverDelete request received");
        Ok(())
    }

    pub fn program_external_connectivity(&self, req: ExternalConnectivityRequest) -> Result<()> {
        debug!(
            network_id = %req.network_id,
            endpoint_id = %req.endpoint_id,
            "ProgramExternalConnectivity request received"
        );
        Ok(())
    }

    pub fn revoke_external_connectivity(&self, req: ExternalConnectivityRequest) -> Result<()> {
        debug!(
            network_id = %req.network_id,
            endpoint_id = %req.endpoint_id,
            "RevokeExternalConnectivity request received"
        );
        Ok(())
    }
}

/// Parse an interface address and check its family.
fn parse_family(s: &str, v4: bool) -> Result<Option<IpNet>> {
    let addr = parse_interface_address(s)?;
    match addr {
        Some(IpNet::V4(_)) if !v4 => Err(DriverError::InvalidAddress(s.to_string())),
        Some(IpNet::V6(_)) if v4 => Err(DriverError::InvalidAddress(s.to_string())),
        other => Ok(other),
    }
}

/// Reserve an endpoint address in the network pools.
///
/// A requested address is reserved in its containing pool when possible.
/// Without one, the first pool with a free address provides it.
fn reserve_address(
    endpoint: &mut Endpoint,
    pools: &[Arc<IpPool>],
    requested: Option<IpNet>,
) -> Result<Option<IpNet>> {
    if let Some(addr) = requested {
        let ip = addr.addr();
        if let Some(pool) = pools.iter().find(|p| p.contains(&ip)) {
            if pool.assign(Some(ip)).is_some() {
                endpoint.add_reserved(ip);
            } else {
                debug!(ip = %ip, pool = %pool.pool(), "Requested address not reservable in network pool");
            }
        }
        return Ok(Some(addr));
    }

    if pools.is_empty() {
        return Ok(None);
    }
    for pool in pools {
        if let Some(ip) = pool.assign(None) {
            endpoint.add_reserved(ip);
            let addr = IpNet::new(ip, pool.prefix_len())
                .map_err(|_| DriverError::InvalidAddress(ip.to_string()))?;
            return Ok(Some(addr));
        }
    }
    Err(DriverError::NoAddress(
        pools.iter().map(|p| p.pool().to_string()).collect::<Vec<_>>().join(", "),
    ))
}

/// The switch would fail late with a confusing error for an unknown group.
async fn check_group(group: &str) -> Result<()> {
    // NSS lookups block
    let name = group.to_string();
    let lookup = tokio::task::spawn_blocking(move || nix::unistd::Group::from_name(&name))
        .await
        .map_err(|e| DriverError::Io(std::io::Error::other(e)))?;
    match lookup {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(DriverError::InvalidOption {
            key: super::OPT_SOCKET_GROUP.to_string(),
            reason: format!("unknown group {}", group),
        }),
        Err(e) => Err(DriverError::Io(e.into())),
    }
}
