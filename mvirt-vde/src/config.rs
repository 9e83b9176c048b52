//! Driver configuration and tunables.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default directory under which per-network switch sockets are created.
pub const DEFAULT_SOCKET_ROOT: &str = "/run/docker-vde";

/// Prefix for host tap devices and the container-side interface name.
pub const INTERFACE_PREFIX: &str = "vde";

/// vde_switch chokes on long socket paths, network ids are cut to docker CLI length.
pub const NETWORK_ID_LEN: usize = 12;

/// Interface names are limited to 15 chars: prefix + 11.
pub const ENDPOINT_ID_LEN: usize = 11;

pub const DEFAULT_NUM_SWITCHPORTS: u32 = 32;

/// vde_switch may die right after start; it must survive this long.
pub const SWITCH_GRACE_PERIOD: Duration = Duration::from_millis(100);

pub const GC_INTERVAL: Duration = Duration::from_secs(1);

/// Runtime configuration of the drivers.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub socket_root: PathBuf,
    pub switch_grace_period: Duration,
    pub gc_interval: Duration,
    pub default_num_switchports: u32,
}

impl DriverConfig {
    pub fn new(socket_root: impl Into<PathBuf>) -> Self {
        Self {
            socket_root: socket_root.into(),
            switch_grace_period: SWITCH_GRACE_PERIOD,
            gc_interval: GC_INTERVAL,
            default_num_switchports: DEFAULT_NUM_SWITCHPORTS,
        }
    }

    pub fn socket_root(&self) -> &Path {
        &self.socket_root
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self::new(DEFAULT_SOCKET_ROOT)
    }
}

/// Parse a plugin listen address. Only unix sockets are accepted:
/// `unix:///run/docker/plugins/vde.sock` or a bare absolute path.
pub fn parse_listen_addr(addr: &str) -> Result<PathBuf, String> {
    let path = match addr.split_once("://") {
        Some(("unix", path)) => path,
        Some((scheme, _)) => {
            return Err(format!("unsupported listen scheme '{}', only unix:// is allowed", scheme));
        }
        None => addr,
    };

    if path.is_empty() {
        return Err(format!("empty socket path in listen address '{}'", addr));
    }
    let path = PathBuf::from(path);
    if !path.is_absolute() {
        return Err(format!("socket path must be absolute: {}", path.display()));
    }
    Ok(path)
}

/// Find an executable by name in `PATH`, or check an explicit path.
pub fn lookup_executable(name: &Path) -> Option<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let is_executable = |p: &Path| {
        p.metadata()
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    };

    if name.components().count() > 1 {
        return is_executable(name).then(|| name.to_path_buf());
    }

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listen_addr_unix_scheme() {
        assert_eq!(
            parse_listen_addr("unix:///run/docker/plugins/vde.sock").unwrap(),
            PathBuf::from("/run/docker/plugins/vde.sock")
        );
    }

    #[test]
    fn test_parse_listen_addr_bare_path() {
        assert_eq!(
            parse_listen_addr("/tmp/vde.sock").unwrap(),
            PathBuf::from("/tmp/vde.sock")
        );
    }

    #[test]
    fn test_parse_listen_addr_refuses_other_schemes() {
        assert!(parse_listen_addr("tcp://127.0.0.1:8080").is_err());
        assert!(parse_listen_addr("http://localhost/vde").is_err());
        assert!(parse_listen_addr("unix://").is_err());
        assert!(parse_listen_addr("relative/vde.sock").is_err());
    }

    #[test]
    fn test_lookup_executable() {
        assert!(lookup_executable(Path::new("sh")).is_some());
        assert!(lookup_executable(Path::new("mvirt-vde-no-such-binary")).is_none());
        assert!(lookup_executable(Path::new("/nonexistent/dir/sh")).is_none());
    }

    #[test]
    fn test_default_config() {
        let config = DriverConfig::default();
        assert_eq!(config.socket_root(), Path::new(DEFAULT_SOCKET_ROOT));
        assert_eq!(config.default_num_switchports, 32);
        assert_eq!(config.switch_grace_period, Duration::from_millis(100));
    }
}
