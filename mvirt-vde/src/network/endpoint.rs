//! Endpoint state and MAC address helpers.

use crate::config::{ENDPOINT_ID_LEN, INTERFACE_PREFIX};
use crate::error::{DriverError, Result};
use crate::process::ProcessHandle;
use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// Random unicast MAC with the locally administered bit set.
    pub fn random() -> Self {
        use rand::Rng;
        let mut mac = [0u8; 6];
        rand::thread_rng().fill(&mut mac);
        mac[0] = (mac[0] & 0xfe) | 0x02;
        MacAddr(mac)
    }

    pub fn is_local(&self) -> bool {
        self.0[0] & 0x02 == 0x02
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 == 0x01
    }
}

impl FromStr for MacAddr {
    type Err = DriverError;

    /// Accepts `aa:bb:cc:dd:ee:ff` and `aa-bb-cc-dd-ee-ff`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || DriverError::InvalidMac(s.to_string());
        let sep = if s.contains('-') { '-' } else { ':' };
        let parts: Vec<&str> = s.split(sep).collect();
        if parts.len() != 6 {
            return Err(invalid());
        }

        let mut mac = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 {
                return Err(invalid());
            }
            mac[i] = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        Ok(MacAddr(mac))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

/// Host-side tap device name for an endpoint.
pub fn tap_name(endpoint_id: &str) -> String {
    let short: String = endpoint_id.chars().take(ENDPOINT_ID_LEN).collect();
    format!("{}{}", INTERFACE_PREFIX, short)
}

/// Parse an optional CIDR-form interface address. Empty and unspecified
/// addresses mean "none".
pub fn parse_interface_address(s: &str) -> Result<Option<IpNet>> {
    if s.is_empty() {
        return Ok(None);
    }
    let net: IpNet = s
        .parse()
        .map_err(|_| DriverError::InvalidAddress(s.to_string()))?;
    if net.addr().is_unspecified() {
        return Ok(None);
    }
    Ok(Some(net))
}

/// A container endpoint on a network.
///
/// `tap_device` and `plug` are set together by Join and cleared together by
/// Leave. Leave keeps the tap name in `released_tap` since the device is
/// still inside the container namespace at that point.
#[derive(Debug)]
pub struct Endpoint {
    pub id: String,
    pub address: Option<IpNet>,
    pub address6: Option<IpNet>,
    pub mac: MacAddr,
    pub gateway: Option<IpAddr>,
    pub gateway6: Option<IpAddr>,
    tap_device: Option<String>,
    released_tap: Option<String>,
    plug: Option<ProcessHandle>,
    /// Addresses this driver reserved in the network pools.
    reserved: Vec<IpAddr>,
}

impl Endpoint {
    pub fn new(id: &str, mac: MacAddr) -> Self {
        Self {
            id: id.to_string(),
            address: None,
            address6: None,
            mac,
            gateway: None,
            gateway6: None,
            tap_device: None,
            released_tap: None,
            plug: None,
            reserved: Vec::new(),
        }
    }

    pub fn tap_device(&self) -> Option<&str> {
        self.tap_device.as_deref()
    }

    pub fn plug_pid(&self) -> Option<u32> {
        self.plug.as_ref().and_then(|p| p.pid())
    }

    pub fn is_joined(&self) -> bool {
        self.tap_device.is_some()
    }

    pub fn address_string(&self) -> String {
        self.address.map(|a| a.to_string()).unwrap_or_default()
    }

    pub fn address6_string(&self) -> String {
        self.address6.map(|a| a.to_string()).unwrap_or_default()
    }

    pub fn reserved(&self) -> &[IpAddr] {
        &self.reserved
    }

    pub(crate) fn add_reserved(&mut self, ip: IpAddr) {
        self.reserved.push(ip);
    }

    pub(crate) fn attach(&mut self, tap: String, plug: ProcessHandle) {
        self.tap_device = Some(tap);
        self.plug = Some(plug);
    }

    /// Clear the joined state, returning the tap name and plug process.
    pub(crate) fn detach(&mut self) -> Option<(String, Option<ProcessHandle>)> {
        let tap = self.tap_device.take()?;
        Some((tap, self.plug.take()))
    }

    pub(crate) fn set_released_tap(&mut self, tap: String) {
        self.released_tap = Some(tap);
    }

    pub(crate) fn take_released_tap(&mut self) -> Option<String> {
        self.released_tap.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_mac_is_local_unicast() {
        for _ in 0..64 {
            let mac = MacAddr::random();
            assert!(mac.is_local());
            assert!(!mac.is_multicast());
        }
    }

    #[test]
    fn test_parse_mac() {
        let mac: MacAddr = "02:42:ac:11:00:02".parse().unwrap();
        assert_eq!(mac.0, [0x02, 0x42, 0xac, 0x11, 0x00, 0x02]);
        assert_eq!(mac.to_string(), "02:42:ac:11:00:02");

        let dashed: MacAddr = "02-42-AC-11-00-02".parse().unwrap();
        assert_eq!(dashed, mac);

        assert!("02:42:ac:11:00".parse::<MacAddr>().is_err());
        assert!("zz:42:ac:11:00:02".parse::<MacAddr>().is_err());
        assert!("2:42:ac:11:00:02".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_tap_name() {
        assert_eq!(tap_name("0123456789abcdef0123"), "vde0123456789a");
        assert_eq!(tap_name("0123456789abcdef0123").len(), 14);
        assert_eq!(tap_name("ep1"), "vdeep1");
    }

    #[test]
    fn test_parse_interface_address() {
        assert_eq!(parse_interface_address("").unwrap(), None);
        assert_eq!(parse_interface_address("0.0.0.0/0").unwrap(), None);

        let addr = parse_interface_address("192.168.1.5/24").unwrap().unwrap();
        assert_eq!(addr.addr().to_string(), "192.168.1.5");
        assert_eq!(addr.prefix_len(), 24);
        assert_eq!(addr.to_string(), "192.168.1.5/24");

        assert!(matches!(
            parse_interface_address("192.168.1.5"),
            Err(DriverError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_attach_detach() {
        let mut ep = Endpoint::new("ep1", MacAddr::random());
        assert!(!ep.is_joined());

        let (plug, _exit) = ProcessHandle::simulated("vde_plug2tap", 99);
        ep.attach("vdeep1".into(), plug);
        assert_eq!(ep.tap_device(), Some("vdeep1"));
        assert_eq!(ep.plug_pid(), Some(99));

        let (tap, plug) = ep.detach().unwrap();
        assert_eq!(tap, "vdeep1");
        assert!(plug.is_some());
        assert!(!ep.is_joined());
        assert_eq!(ep.plug_pid(), None);
        assert!(ep.detach().is_none());
    }
}
