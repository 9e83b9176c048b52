//! libnetwork remote IPAM driver.

pub mod pool;

use crate::error::{DriverError, Result};
use crate::protocol::{
    AddressSpacesResponse, GATEWAY_ADDRESS_TYPE, IpamCapabilitiesResponse, REQUEST_ADDRESS_TYPE,
    ReleaseAddressRequest, ReleasePoolRequest, RequestAddressRequest, RequestAddressResponse,
    RequestPoolRequest, RequestPoolResponse,
};
use crate::state::DriverState;
use pool::IpPool;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info};

pub const LOCAL_ADDRESS_SPACE: &str = "local";
pub const GLOBAL_ADDRESS_SPACE: &str = "global";

/// IPAM adapter over the shared pool registry.
#[derive(Clone)]
pub struct IpamDriver {
    state: Arc<DriverState>,
}

impl IpamDriver {
    pub fn new(state: Arc<DriverState>) -> Self {
        Self { state }
    }

    pub fn capabilities(&self) -> IpamCapabilitiesResponse {
        IpamCapabilitiesResponse {
            requires_mac_address: true,
        }
    }

    /// Address spaces carry no meaning here, overlapping pools are allowed.
    pub fn default_address_spaces(&self) -> AddressSpacesResponse {
        debug!("GetDefaultAddressSpaces request received");
        AddressSpacesResponse {
            local_default_address_space: LOCAL_ADDRESS_SPACE.to_string(),
            global_default_address_space: GLOBAL_ADDRESS_SPACE.to_string(),
        }
    }

    pub async fn request_pool(&self, req: RequestPoolRequest) -> Result<RequestPoolResponse> {
        info!(
            address_space = %req.address_space,
            pool = %req.pool,
            sub_pool = %req.sub_pool,
            v6 = req.v6,
            options = ?req.options,
            "RequestPool request received"
        );

        if req.pool.is_empty() {
            return Err(DriverError::InvalidCidr(
                "a pool subnet must be specified".to_string(),
            ));
        }

        let pool = IpPool::new(&req.pool, Some(&req.sub_pool), &req.address_space)?;
        let pool_cidr = pool.pool().to_string();
        let pool_id = uuid::Uuid::new_v4().simple().to_string();

        self.state
            .pools
            .write()
            .await
            .insert(pool_id.clone(), Arc::new(pool));

        info!(pool_id = %pool_id, pool = %pool_cidr, "Pool created");
        Ok(RequestPoolResponse {
            pool_id,
            pool: pool_cidr,
            data: HashMap::new(),
        })
    }

    pub async fn release_pool(&self, req: ReleasePoolRequest) -> Result<()> {
        info!(pool_id = %req.pool_id, "ReleasePool request received");

        match self.state.pools.write().await.remove(&req.pool_id) {
            Some(pool) => {
                info!(pool_id = %req.pool_id, pool = %pool.pool(), "Pool released");
                Ok(())
            }
            None => Err(DriverError::PoolNotFound(req.pool_id)),
        }
    }

    pub async fn request_address(&self, req: RequestAddressRequest) -> Result<RequestAddressResponse> {
        info!(
            pool_id = %req.pool_id,
            address = %req.address,
            options = ?req.options,
            "RequestAddress request received"
        );

        let pool = self
            .state
            .pool(&req.pool_id)
            .await
            .ok_or_else(|| DriverError::PoolNotFound(req.pool_id.clone()))?;
        let ip = parse_request_ip(&req.address)?;

        let is_gateway = req
            .options
            .as_ref()
            .and_then(|o| o.get(REQUEST_ADDRESS_TYPE))
            .is_some_and(|t| t == GATEWAY_ADDRESS_TYPE);

        if is_gateway {
            // A gateway is only recorded, some container must host it.
            let ip = ip.ok_or_else(|| {
                DriverError::InvalidAddress("gateway request needs an explicit address".to_string())
            })?;
            pool.set_gateway(ip)?;
            info!(pool_id = %req.pool_id, gateway = %ip, "Gateway set");
            return Ok(RequestAddressResponse {
                address: format!("{}/{}", ip, pool.prefix_len()),
                data: HashMap::new(),
            });
        }

        let assigned = pool.assign(ip).ok_or_else(|| match ip {
            Some(ip) => DriverError::AddressUnavailable {
                ip: ip.to_string(),
                pool: pool.pool().to_string(),
            },
            None => DriverError::NoAddress(pool.pool().to_string()),
        })?;

        info!(pool_id = %req.pool_id, address = %assigned, "Address assigned");
        Ok(RequestAddressResponse {
            address: format!("{}/{}", assigned, pool.prefix_len()),
            data: HashMap::new(),
        })
    }

    pub async fn release_address(&self, req: ReleaseAddressRequest) -> Result<()> {
        info!(pool_id = %req.pool_id, address = %req.address, "ReleaseAddress request received");

        let ip = parse_request_ip(&req.address)?
            .ok_or_else(|| DriverError::InvalidAddress(req.address.clone()))?;
        let pool = self
            .state
            .pool(&req.pool_id)
            .await
            .ok_or_else(|| DriverError::PoolNotFound(req.pool_id.clone()))?;

        pool.free(&ip);
        Ok(())
    }
}

/// Docker sends bare addresses, CIDR form is tolerated.
fn parse_request_ip(s: &str) -> Result<Option<IpAddr>> {
    if s.is_empty() {
        return Ok(None);
    }
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Ok(Some(ip));
    }
    s.parse::<ipnet::IpNet>()
        .map(|net| Some(net.addr()))
        .map_err(|_| DriverError::InvalidAddress(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::error::ErrorKind;
    use crate::test_util::FakeHost;

    fn driver() -> IpamDriver {
        let state = DriverState::new(DriverConfig::default(), Arc::new(FakeHost::new()));
        state.ipam_driver()
    }

    fn pool_req(pool: &str) -> RequestPoolRequest {
        RequestPoolRequest {
            address_space: LOCAL_ADDRESS_SPACE.to_string(),
            pool: pool.to_string(),
            ..Default::default()
        }
    }

    fn addr_req(pool_id: &str, address: &str, gateway: bool) -> RequestAddressRequest {
        RequestAddressRequest {
            pool_id: pool_id.to_string(),
            address: address.to_string(),
            options: gateway.then(|| {
                HashMap::from([(
                    REQUEST_ADDRESS_TYPE.to_string(),
                    GATEWAY_ADDRESS_TYPE.to_string(),
                )])
            }),
        }
    }

    #[test]
    fn test_capabilities_and_spaces() {
        let ipam = driver();
        assert!(ipam.capabilities().requires_mac_address);
        let spaces = ipam.default_address_spaces();
        assert_eq!(spaces.local_default_address_space, "local");
        assert_eq!(spaces.global_default_address_space, "global");
    }

    #[tokio::test]
    async fn test_request_pool() {
        let ipam = driver();
        let resp = ipam.request_pool(pool_req("10.10.0.5/16")).await.unwrap();
        assert_eq!(resp.pool, "10.10.0.0/16");
        assert_eq!(resp.pool_id.len(), 32);
        assert!(resp.pool_id.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(resp.data.is_empty());

        let other = ipam.request_pool(pool_req("10.10.0.0/16")).await.unwrap();
        assert_ne!(resp.pool_id, other.pool_id);
    }

    #[tokio::test]
    async fn test_request_pool_requires_subnet() {
        let ipam = driver();
        let err = ipam.request_pool(pool_req("")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let err = ipam.request_pool(pool_req("not-a-cidr")).await.unwrap_err();
        assert!(matches!(err, DriverError::InvalidCidr(_)));
    }

    #[tokio::test]
    async fn test_gateway_then_auto_assign() {
        let ipam = driver();
        let pool = ipam.request_pool(pool_req("192.168.1.0/24")).await.unwrap();

        let gw = ipam
            .request_address(addr_req(&pool.pool_id, "192.168.1.1", true))
            .await
            .unwrap();
        assert_eq!(gw.address, "192.168.1.1/24");

        let first = ipam
            .request_address(addr_req(&pool.pool_id, "", false))
            .await
            .unwrap();
        assert_eq!(first.address, "192.168.1.2/24");

        // Gateway is not consumed, a container may still take it explicitly
        let host = ipam
            .request_address(addr_req(&pool.pool_id, "192.168.1.1", false))
            .await
            .unwrap();
        assert_eq!(host.address, "192.168.1.1/24");
    }

    #[tokio::test]
    async fn test_gateway_needs_address() {
        let ipam = driver();
        let pool = ipam.request_pool(pool_req("192.168.1.0/24")).await.unwrap();
        let err = ipam
            .request_address(addr_req(&pool.pool_id, "", true))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::InvalidAddress(_)));

        let err = ipam
            .request_address(addr_req(&pool.pool_id, "10.0.0.1", true))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::OutOfRange { .. }));
    }

    #[tokio::test]
    async fn test_explicit_address_conflict() {
        let ipam = driver();
        let pool = ipam.request_pool(pool_req("10.0.0.0/24")).await.unwrap();
        ipam.request_address(addr_req(&pool.pool_id, "10.0.0.7", false))
            .await
            .unwrap();
        let err = ipam
            .request_address(addr_req(&pool.pool_id, "10.0.0.7", false))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        ipam.release_address(ReleaseAddressRequest {
            pool_id: pool.pool_id.clone(),
            address: "10.0.0.7".into(),
        })
        .await
        .unwrap();
        ipam.request_address(addr_req(&pool.pool_id, "10.0.0.7", false))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pool_exhaustion() {
        let ipam = driver();
        let pool = ipam.request_pool(pool_req("10.0.0.0/30")).await.unwrap();
        for _ in 0..2 {
            ipam.request_address(addr_req(&pool.pool_id, "", false))
                .await
                .unwrap();
        }
        let err = ipam
            .request_address(addr_req(&pool.pool_id, "", false))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    }

    #[tokio::test]
    async fn test_unknown_pool() {
        let ipam = driver();
        let err = ipam
            .request_address(addr_req("nope", "", false))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = ipam
            .release_pool(ReleasePoolRequest {
                pool_id: "nope".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_release_pool() {
        let ipam = driver();
        let pool = ipam.request_pool(pool_req("10.0.0.0/24")).await.unwrap();
        ipam.release_pool(ReleasePoolRequest {
            pool_id: pool.pool_id.clone(),
        })
        .await
        .unwrap();
        let err = ipam
            .request_address(addr_req(&pool.pool_id, "", false))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::PoolNotFound(_)));
    }

    #[tokio::test]
    async fn test_release_address_malformed() {
        let ipam = driver();
        let pool = ipam.request_pool(pool_req("10.0.0.0/24")).await.unwrap();
        let err = ipam
            .release_address(ReleaseAddressRequest {
                pool_id: pool.pool_id,
                address: "10.0.0.x".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::InvalidAddress(_)));
    }

    #[test]
    fn test_parse_request_ip() {
        assert_eq!(parse_request_ip("").unwrap(), None);
        assert_eq!(
            parse_request_ip("10.0.0.1").unwrap(),
            Some("10.0.0.1".parse().unwrap())
        );
        assert_eq!(
            parse_request_ip("10.0.0.1/24").unwrap(),
            Some("10.0.0.1".parse().unwrap())
        );
        assert!(parse_request_ip("bogus").is_err());
    }
}
