//! CIDR address pool with gateway reservation.

use crate::error::{DriverError, Result};
use ipnet::IpNet;
use std::collections::{BTreeSet, HashSet};
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// An address pool handed out by IPAM or derived from a network's IPAM data.
///
/// Addresses are only ever assigned out of `subpool`, which defaults to the
/// whole pool. The gateway must lie inside `pool` and is reserved through its
/// own path: auto-allocation never returns it.
#[derive(Debug)]
pub struct IpPool {
    address_space: String,
    pool: IpNet,
    subpool: IpNet,
    /// Network (and for IPv4, broadcast) address of the subpool.
    unusable: HashSet<IpAddr>,
    state: Mutex<PoolState>,
}

#[derive(Debug, Default)]
struct PoolState {
    gateway: Option<IpAddr>,
    assigned: BTreeSet<IpAddr>,
}

impl IpPool {
    /// Build a pool from CIDR text. `subpool` defaults to `pool` when absent.
    pub fn new(pool: &str, subpool: Option<&str>, address_space: &str) -> Result<Self> {
        let pool_net = parse_network(pool)?;
        let subpool_net = match subpool.filter(|s| !s.is_empty()) {
            Some(s) => parse_network(s)?,
            None => pool_net,
        };

        if !pool_net.contains(&subpool_net) {
            return Err(DriverError::InvalidCidr(format!(
                "subpool {} is not within pool {}",
                subpool_net, pool_net
            )));
        }

        let mut unusable = HashSet::new();
        unusable.insert(subpool_net.network());
        if let IpNet::V4(v4) = subpool_net {
            unusable.insert(IpAddr::V4(v4.broadcast()));
        }

        Ok(Self {
            address_space: address_space.to_string(),
            pool: pool_net,
            subpool: subpool_net,
            unusable,
            state: Mutex::new(PoolState::default()),
        })
    }

    /// Build a pool with a preconfigured gateway (network-side IPAM data).
    pub fn with_gateway(pool: &str, gateway: Option<IpAddr>, address_space: &str) -> Result<Self> {
        let this = Self::new(pool, None, address_space)?;
        if let Some(gw) = gateway {
            this.set_gateway(gw)?;
        }
        Ok(this)
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn address_space(&self) -> &str {
        &self.address_space
    }

    pub fn pool(&self) -> IpNet {
        self.pool
    }

    pub fn subpool(&self) -> IpNet {
        self.subpool
    }

    pub fn prefix_len(&self) -> u8 {
        self.pool.prefix_len()
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.pool.contains(ip)
    }

    pub fn gateway(&self) -> Option<IpAddr> {
        self.state().gateway
    }

    /// Set (or overwrite) the pool gateway. Fails unless `ip` lies in the pool.
    pub fn set_gateway(&self, ip: IpAddr) -> Result<()> {
        if !self.pool.contains(&ip) {
            return Err(DriverError::OutOfRange {
                ip: ip.to_string(),
                pool: self.pool.to_string(),
            });
        }
        self.state().gateway = Some(ip);
        Ok(())
    }

    /// Assign an address.
    ///
    /// With `Some(ip)` only that address is tried; with `None` the subpool is
    /// scanned upwards from its network address for the first usable free
    /// address. Returns `None` when nothing could be assigned.
    pub fn assign(&self, ip: Option<IpAddr>) -> Option<IpAddr> {
        let mut state = self.state();

        if let Some(ip) = ip {
            // The gateway bypasses the usability check, some container has to host it.
            if state.gateway == Some(ip) {
                return state.assigned.insert(ip).then_some(ip);
            }
            if !self.subpool.contains(&ip) {
                return None;
            }
            return state.assigned.insert(ip).then_some(ip);
        }

        let mut probe = Some(self.subpool.network());
        while let Some(ip) = probe {
            if !self.subpool.contains(&ip) {
                break;
            }
            if !state.assigned.contains(&ip) && self.is_usable(&state, &ip) {
                state.assigned.insert(ip);
                return Some(ip);
            }
            probe = next_addr(ip);
        }

        None
    }

    /// Release an address. No-op if it was not assigned.
    pub fn free(&self, ip: &IpAddr) {
        self.state().assigned.remove(ip);
    }

    pub fn is_assigned(&self, ip: &IpAddr) -> bool {
        self.state().assigned.contains(ip)
    }

    pub fn assigned_count(&self) -> usize {
        self.state().assigned.len()
    }

    fn is_usable(&self, state: &PoolState, ip: &IpAddr) -> bool {
        !self.unusable.contains(ip) && state.gateway.as_ref() != Some(ip)
    }
}

/// Parse CIDR text into its network (host bits cleared).
fn parse_network(s: &str) -> Result<IpNet> {
    s.trim()
        .parse::<IpNet>()
        .map(|net| net.trunc())
        .map_err(|_| DriverError::InvalidCidr(s.to_string()))
}

/// The next address in numeric order, `None` on overflow.
fn next_addr(ip: IpAddr) -> Option<IpAddr> {
    match ip {
        IpAddr::V4(v4) => u32::from(v4).checked_add(1).map(|n| IpAddr::V4(n.into())),
        IpAddr::V6(v6) => u128::from(v6).checked_add(1).map(|n| IpAddr::V6(n.into())),
    }
}
