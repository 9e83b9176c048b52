//! VDE networks: options, socket placement and the per-network registry.

mod driver;
pub mod endpoint;

pub use driver::NetworkDriver;
pub use endpoint::{Endpoint, MacAddr};

use crate::config::{DriverConfig, NETWORK_ID_LEN};
use crate::error::{DriverError, Result};
use crate::ipam::pool::IpPool;
use crate::process::ProcessHandle;
use crate::protocol::{GENERIC_OPTIONS, IpamData};
use serde_json::Value;
use std::collections::HashMap;
use std::net::IpAddr;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub const OPT_SOCKET_DIR: &str = "socket_dir";
pub const OPT_MANAGEMENT_SOCKET: &str = "management_socket";
pub const OPT_CREATE_SOCKETS: &str = "create_sockets";
pub const OPT_SOCKET_GROUP: &str = "socket_group";
pub const OPT_NUM_SWITCHPORTS: &str = "num_switchports";

/// Driver options passed with `docker network create -o key=value`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkOptions {
    pub socket_dir: Option<PathBuf>,
    pub management_socket: Option<PathBuf>,
    pub create_sockets: bool,
    pub socket_group: Option<String>,
    pub num_switchports: Option<u32>,
}

impl NetworkOptions {
    /// Extract driver options from the generic options map of a
    /// CreateNetwork request. Unknown keys are ignored.
    pub fn from_request(options: Option<&HashMap<String, Value>>) -> Result<Self> {
        let generic = match options.and_then(|o| o.get(GENERIC_OPTIONS)) {
            Some(Value::Object(map)) => map,
            Some(Value::Null) | None => return Ok(Self::default()),
            Some(other) => {
                return Err(DriverError::InvalidOption {
                    key: GENERIC_OPTIONS.to_string(),
                    reason: format!("expected an object, got {}", other),
                });
            }
        };

        let string_opt = |key: &str| -> Result<Option<String>> {
            match generic.get(key) {
                None | Some(Value::Null) => Ok(None),
                Some(Value::String(s)) if s.is_empty() => Ok(None),
                Some(Value::String(s)) => Ok(Some(s.clone())),
                Some(other) => Err(DriverError::InvalidOption {
                    key: key.to_string(),
                    reason: format!("expected a string, got {}", other),
                }),
            }
        };

        let create_sockets = match generic.get(OPT_CREATE_SOCKETS) {
            Some(Value::Bool(b)) => *b,
            _ => match string_opt(OPT_CREATE_SOCKETS)?.as_deref() {
                None => false,
                Some("true" | "1" | "yes") => true,
                Some("false" | "0" | "no") => false,
                Some(other) => {
                    return Err(DriverError::InvalidOption {
                        key: OPT_CREATE_SOCKETS.to_string(),
                        reason: format!("not a boolean: {}", other),
                    });
                }
            },
        };

        let num_switchports = match string_opt(OPT_NUM_SWITCHPORTS)? {
            None => None,
            Some(s) => match s.parse::<u32>() {
                Ok(n) if n > 0 => Some(n),
                _ => {
                    return Err(DriverError::InvalidOption {
                        key: OPT_NUM_SWITCHPORTS.to_string(),
                        reason: format!("unparseable number of switch ports: {}", s),
                    });
                }
            },
        };

        Ok(Self {
            socket_dir: string_opt(OPT_SOCKET_DIR)?.map(PathBuf::from),
            management_socket: string_opt(OPT_MANAGEMENT_SOCKET)?.map(PathBuf::from),
            create_sockets,
            socket_group: string_opt(OPT_SOCKET_GROUP)?,
            num_switchports,
        })
    }
}

/// Where a network's switch sockets live and whether the driver creates them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketPlan {
    pub socket_dir: PathBuf,
    pub management_socket: Option<PathBuf>,
    pub create: bool,
}

/// Network id cut to the length the docker CLI shows.
pub fn short_network_id(network_id: &str) -> String {
    network_id.chars().take(NETWORK_ID_LEN).collect()
}

fn mgmt_socket_for(socket_dir: &Path) -> PathBuf {
    let mut s = socket_dir.as_os_str().to_owned();
    s.push(".mgmt.sock");
    PathBuf::from(s)
}

fn is_socket(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.file_type().is_socket())
        .unwrap_or(false)
}

/// Decide the socket directory and management socket for a new network.
///
/// Without `socket_dir` the driver always creates a switch under the socket
/// root, adding `_0`, `_1`, ... if the truncated id is taken. An existing
/// `socket_dir` must hold a vde_switch `ctl` socket unless `create_sockets`
/// is set.
pub fn plan_sockets(
    config: &DriverConfig,
    network_id: &str,
    opts: &NetworkOptions,
) -> Result<SocketPlan> {
    let Some(socket_dir) = &opts.socket_dir else {
        let base = config.socket_root().join(short_network_id(network_id));
        let mut candidate = base.clone();
        let mut suffix = 0;
        while candidate.exists() {
            let mut name = base.as_os_str().to_owned();
            name.push(format!("_{}", suffix));
            candidate = PathBuf::from(name);
            debug!(path = %candidate.display(), "Truncated network id taken, trying suffix");
            suffix += 1;
        }
        let management_socket = mgmt_socket_for(&candidate);
        return Ok(SocketPlan {
            socket_dir: candidate,
            management_socket: Some(management_socket),
            create: true,
        });
    };

    if opts.create_sockets {
        let management_socket = opts
            .management_socket
            .clone()
            .unwrap_or_else(|| mgmt_socket_for(socket_dir));
        return Ok(SocketPlan {
            socket_dir: socket_dir.clone(),
            management_socket: Some(management_socket),
            create: true,
        });
    }

    if !socket_dir.is_dir() {
        return Err(DriverError::SocketDir {
            path: socket_dir.display().to_string(),
            reason: "does not exist or is not a directory".to_string(),
        });
    }
    if !is_socket(&socket_dir.join("ctl")) {
        return Err(DriverError::SocketDir {
            path: socket_dir.display().to_string(),
            reason: "does not look like a vde_switch directory (no ctl socket)".to_string(),
        });
    }
    match &opts.management_socket {
        Some(mgmt) if !is_socket(mgmt) => {
            warn!(path = %mgmt.display(), "Management socket does not exist");
        }
        None => warn!(socket_dir = %socket_dir.display(), "No management socket given"),
        _ => {}
    }

    Ok(SocketPlan {
        socket_dir: socket_dir.clone(),
        management_socket: opts.management_socket.clone(),
        create: false,
    })
}

/// Parse the IPAM data docker passes for one address family.
pub fn pools_from_ipam_data(data: Option<&[IpamData]>) -> Result<Vec<Arc<IpPool>>> {
    let Some(data) = data else {
        return Ok(Vec::new());
    };
    data.iter()
        .map(|d| {
            let gateway = parse_gateway(&d.gateway)?;
            IpPool::with_gateway(&d.pool, gateway, &d.address_space).map(Arc::new)
        })
        .collect()
}

/// Gateways come as `10.0.0.1/24`; a bare address is accepted too.
fn parse_gateway(s: &str) -> Result<Option<IpAddr>> {
    if s.is_empty() {
        return Ok(None);
    }
    if let Ok(net) = s.parse::<ipnet::IpNet>() {
        return Ok(Some(net.addr()));
    }
    s.parse::<IpAddr>()
        .map(Some)
        .map_err(|_| DriverError::InvalidAddress(s.to_string()))
}

/// A VDE network and its endpoints.
pub struct Network {
    pub id: String,
    pub socket_dir: PathBuf,
    pub management_socket: Option<PathBuf>,
    pub pools4: Vec<Arc<IpPool>>,
    pub pools6: Vec<Arc<IpPool>>,
    /// `Some` when the driver started the switch; taken on teardown.
    switch: Mutex<Option<ProcessHandle>>,
    switch_pid: Option<u32>,
    owns_switch: bool,
    pub(crate) endpoints: RwLock<HashMap<String, Endpoint>>,
}

impl Network {
    pub fn new(
        id: &str,
        plan: SocketPlan,
        switch: Option<ProcessHandle>,
        pools4: Vec<Arc<IpPool>>,
        pools6: Vec<Arc<IpPool>>,
    ) -> Self {
        Self {
            id: id.to_string(),
            socket_dir: plan.socket_dir,
            management_socket: plan.management_socket,
            pools4,
            pools6,
            switch_pid: switch.as_ref().and_then(|s| s.pid()),
            owns_switch: switch.is_some(),
            switch: Mutex::new(switch),
            endpoints: RwLock::new(HashMap::new()),
        }
    }

    pub fn owns_switch(&self) -> bool {
        self.owns_switch
    }

    pub fn switch_pid(&self) -> Option<u32> {
        self.switch_pid
    }

    /// An externally managed switch is assumed to be running.
    pub fn is_running(&self) -> bool {
        let switch = self.switch.lock().unwrap_or_else(PoisonError::into_inner);
        switch.as_ref().is_none_or(|s| s.is_running())
    }

    pub async fn endpoint_count(&self) -> usize {
        self.endpoints.read().await.len()
    }

    pub async fn joined_count(&self) -> usize {
        self.endpoints
            .read()
            .await
            .values()
            .filter(|e| e.is_joined())
            .count()
    }

    pub async fn has_endpoint(&self, id: &str) -> bool {
        self.endpoints.read().await.contains_key(id)
    }

    /// Pools of the address family of `ip`.
    pub fn pools_for(&self, ip: &IpAddr) -> &[Arc<IpPool>] {
        match ip {
            IpAddr::V4(_) => &self.pools4,
            IpAddr::V6(_) => &self.pools6,
        }
    }

    /// Gateway of the pool containing `ip`, if any.
    pub fn gateway_for(&self, ip: &IpAddr) -> Option<IpAddr> {
        self.pools_for(ip)
            .iter()
            .find(|p| p.contains(ip))
            .and_then(|p| p.gateway())
    }

    /// Return an address this network handed out to its pools.
    pub(crate) fn release_address(&self, ip: &IpAddr) {
        if let Some(pool) = self.pools_for(ip).iter().find(|p| p.contains(ip)) {
            pool.free(ip);
        }
    }

    /// Terminate the plug of every joined endpoint.
    pub(crate) async fn stop_plugs(&self) {
        let mut endpoints = self.endpoints.write().await;
        for endpoint in endpoints.values_mut() {
            if let Some((tap, plug)) = endpoint.detach() {
                if let Some(mut plug) = plug {
                    plug.terminate().await;
                }
                endpoint.set_released_tap(tap);
            }
        }
    }

    /// Terminate a driver-owned switch. Returns false for external switches.
    pub(crate) async fn stop_switch(&self) -> bool {
        let switch = self
            .switch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut switch) = switch else {
            return false;
        };

        let state = switch.terminate().await;
        info!(network_id = %self.id, pid = ?switch.pid(), state = ?state, "Switch stopped");
        true
    }

    /// Stop a driver-owned switch and remove its sockets. Externally
    /// managed switches are left alone.
    pub(crate) async fn teardown(&self) {
        if !self.stop_switch().await {
            return;
        }

        if let Err(e) = tokio::fs::remove_dir_all(&self.socket_dir).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.socket_dir.display(), error = %e, "Failed to remove socket directory");
        }
        if let Some(mgmt) = &self.management_socket
            && let Err(e) = tokio::fs::remove_file(mgmt).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %mgmt.display(), error = %e, "Failed to remove management socket");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::os::unix::net::UnixListener;

    fn generic(opts: Value) -> HashMap<String, Value> {
        HashMap::from([(GENERIC_OPTIONS.to_string(), opts)])
    }

    #[test]
    fn test_options_default() {
        assert_eq!(NetworkOptions::from_request(None).unwrap(), NetworkOptions::default());
        let empty = HashMap::new();
        assert_eq!(
            NetworkOptions::from_request(Some(&empty)).unwrap(),
            NetworkOptions::default()
        );
    }

    #[test]
    fn test_options_parse() {
        let opts = generic(json!({
            "socket_dir": "/tmp/sw",
            "management_socket": "/tmp/sw.mgmt",
            "create_sockets": "true",
            "socket_group": "docker",
            "num_switchports": "64",
            "unrelated": "ignored"
        }));
        let parsed = NetworkOptions::from_request(Some(&opts)).unwrap();
        assert_eq!(parsed.socket_dir, Some(PathBuf::from("/tmp/sw")));
        assert_eq!(parsed.management_socket, Some(PathBuf::from("/tmp/sw.mgmt")));
        assert!(parsed.create_sockets);
        assert_eq!(parsed.socket_group.as_deref(), Some("docker"));
        assert_eq!(parsed.num_switchports, Some(64));
    }

    #[test]
    fn test_options_reject_bad_values() {
        for bad in [
            json!({ "num_switchports": "many" }),
            json!({ "num_switchports": "0" }),
            json!({ "create_sockets": "maybe" }),
            json!({ "socket_dir": 5 }),
        ] {
            let opts = generic(bad.clone());
            let err = NetworkOptions::from_request(Some(&opts)).unwrap_err();
            assert!(
                matches!(err, DriverError::InvalidOption { .. }),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_short_network_id() {
        assert_eq!(short_network_id("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_network_id("net1"), "net1");
    }

    #[test]
    fn test_plan_default_location() {
        let root = tempfile::tempdir().unwrap();
        let config = DriverConfig::new(root.path());

        let plan = plan_sockets(&config, "0123456789abcdef", &NetworkOptions::default()).unwrap();
        assert!(plan.create);
        assert_eq!(plan.socket_dir, root.path().join("0123456789ab"));
        assert_eq!(
            plan.management_socket,
            Some(root.path().join("0123456789ab.mgmt.sock"))
        );
    }

    #[test]
    fn test_plan_suffix_on_collision() {
        let root = tempfile::tempdir().unwrap();
        let config = DriverConfig::new(root.path());
        std::fs::create_dir(root.path().join("0123456789ab")).unwrap();
        std::fs::create_dir(root.path().join("0123456789ab_0")).unwrap();

        let plan = plan_sockets(&config, "0123456789abffff", &NetworkOptions::default()).unwrap();
        assert_eq!(plan.socket_dir, root.path().join("0123456789ab_1"));
        assert_eq!(
            plan.management_socket,
            Some(root.path().join("0123456789ab_1.mgmt.sock"))
        );
    }

    #[test]
    fn test_plan_existing_switch() {
        let root = tempfile::tempdir().unwrap();
        let config = DriverConfig::new(root.path());
        let dir = root.path().join("external");
        std::fs::create_dir(&dir).unwrap();

        let opts = NetworkOptions {
            socket_dir: Some(dir.clone()),
            ..Default::default()
        };

        // No ctl socket yet
        let err = plan_sockets(&config, "net1", &opts).unwrap_err();
        assert!(matches!(err, DriverError::SocketDir { .. }));

        let _ctl = UnixListener::bind(dir.join("ctl")).unwrap();
        let plan = plan_sockets(&config, "net1", &opts).unwrap();
        assert!(!plan.create);
        assert_eq!(plan.socket_dir, dir);
        assert_eq!(plan.management_socket, None);
    }

    #[test]
    fn test_plan_missing_existing_dir() {
        let config = DriverConfig::new("/tmp");
        let opts = NetworkOptions {
            socket_dir: Some(PathBuf::from("/nonexistent/mvirt-vde/sw")),
            ..Default::default()
        };
        assert!(matches!(
            plan_sockets(&config, "net1", &opts),
            Err(DriverError::SocketDir { .. })
        ));
    }

    #[test]
    fn test_plan_create_at_given_location() {
        let config = DriverConfig::new("/tmp");
        let opts = NetworkOptions {
            socket_dir: Some(PathBuf::from("/srv/vde/sw1")),
            create_sockets: true,
            ..Default::default()
        };
        let plan = plan_sockets(&config, "net1", &opts).unwrap();
        assert!(plan.create);
        assert_eq!(
            plan.management_socket,
            Some(PathBuf::from("/srv/vde/sw1.mgmt.sock"))
        );
    }

    #[test]
    fn test_pools_from_ipam_data() {
        let data = vec![IpamData {
            address_space: "local".into(),
            pool: "192.168.1.0/24".into(),
            gateway: "192.168.1.1/24".into(),
            aux_addresses: None,
        }];
        let pools = pools_from_ipam_data(Some(data.as_slice())).unwrap();
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].gateway(), Some("192.168.1.1".parse().unwrap()));

        let bad_gw = vec![IpamData {
            pool: "192.168.1.0/24".into(),
            gateway: "10.0.0.1/24".into(),
            ..Default::default()
        }];
        assert!(pools_from_ipam_data(Some(bad_gw.as_slice())).is_err());
        assert!(pools_from_ipam_data(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_network_gateway_lookup() {
        let data = vec![IpamData {
            pool: "10.0.0.0/24".into(),
            gateway: "10.0.0.1/24".into(),
            ..Default::default()
        }];
        let pools4 = pools_from_ipam_data(Some(data.as_slice())).unwrap();
        let plan = SocketPlan {
            socket_dir: PathBuf::from("/tmp/sw"),
            management_socket: None,
            create: false,
        };
        let network = Network::new("net1", plan, None, pools4, Vec::new());

        assert!(network.is_running());
        assert!(!network.owns_switch());
        assert_eq!(
            network.gateway_for(&"10.0.0.5".parse().unwrap()),
            Some("10.0.0.1".parse().unwrap())
        );
        assert_eq!(network.gateway_for(&"10.0.1.5".parse().unwrap()), None);
        assert_eq!(network.gateway_for(&"fd00::5".parse().unwrap()), None);
    }

    #[tokio::test]
    async fn test_network_running_follows_switch() {
        let plan = SocketPlan {
            socket_dir: PathBuf::from("/tmp/mvirt-vde-test-sw"),
            management_socket: None,
            create: true,
        };
        let (switch, exit) = ProcessHandle::simulated("vde_switch", 10);
        let network = Network::new("net1", plan, Some(switch), Vec::new(), Vec::new());
        assert!(network.owns_switch());
        assert_eq!(network.switch_pid(), Some(10));
        assert!(network.is_running());

        exit.exit(1);
        for _ in 0..50 {
            if !network.is_running() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(!network.is_running());
    }
}
