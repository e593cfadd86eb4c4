//! Network value types shared across the fabric.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::error::FabricError;

/// A 48-bit Ethernet MAC address, formatted as colon-separated hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    /// The zero/null MAC address, used for ports without an endpoint
    /// identity (e.g. a bridge-local port).
    pub const ZERO: MacAddr = MacAddr([0, 0, 0, 0, 0, 0]);

    /// Creates a MAC address from raw bytes.
    pub const fn new(bytes: [u8; 6]) -> Self {
        MacAddr(bytes)
    }

    /// Returns the raw bytes.
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Returns true if this is the zero address.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 6]
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = FabricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| FabricError::parse(format!("invalid MAC address '{s}'")))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| FabricError::parse(format!("invalid MAC address '{s}'")))?;
        }
        if parts.next().is_some() {
            return Err(FabricError::parse(format!("invalid MAC address '{s}'")));
        }
        Ok(MacAddr(bytes))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = FabricError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MacAddr> for String {
    fn from(mac: MacAddr) -> String {
        mac.to_string()
    }
}

/// A dual-stack interface address: one IPv4 and one IPv6 address, each with
/// its prefix length. Endpoints in the fabric always carry both families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceAddress {
    /// IPv4 address.
    pub ipv4: Ipv4Addr,
    /// IPv4 prefix length.
    pub ipv4_prefix: u8,
    /// IPv6 address.
    pub ipv6: Ipv6Addr,
    /// IPv6 prefix length.
    pub ipv6_prefix: u8,
}

impl InterfaceAddress {
    /// Creates a dual-stack interface address.
    pub fn new(ipv4: Ipv4Addr, ipv4_prefix: u8, ipv6: Ipv6Addr, ipv6_prefix: u8) -> Self {
        Self {
            ipv4,
            ipv4_prefix,
            ipv6,
            ipv6_prefix,
        }
    }

    /// Returns the IPv4 address in `addr/prefix` form.
    pub fn ipv4_with_prefix(&self) -> String {
        format!("{}/{}", self.ipv4, self.ipv4_prefix)
    }

    /// Returns the IPv6 address in `addr/prefix` form.
    pub fn ipv6_with_prefix(&self) -> String {
        format!("{}/{}", self.ipv6, self.ipv6_prefix)
    }
}

/// A virtual network identifier, the logical network/tenant tag carried in
/// register reg0 through the pipeline.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Vni(pub u32);

impl Vni {
    /// The "no overlay" identifier assigned to interfaces before any VNI
    /// configuration.
    pub const NONE: Vni = Vni(0);

    /// Returns the raw identifier value.
    pub const fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Vni {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u32> for Vni {
    fn from(v: u32) -> Self {
        Vni(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_mac_roundtrip() {
        let mac: MacAddr = "00:00:00:01:02:03".parse().unwrap();
        assert_eq!(mac.octets(), [0, 0, 0, 1, 2, 3]);
        assert_eq!(mac.to_string(), "00:00:00:01:02:03");
    }

    #[test]
    fn test_mac_rejects_malformed() {
        assert!("00:11:22:33:44".parse::<MacAddr>().is_err());
        assert!("00:11:22:33:44:55:66".parse::<MacAddr>().is_err());
        assert!("zz:11:22:33:44:55".parse::<MacAddr>().is_err());
        assert!("".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_mac_zero() {
        assert!(MacAddr::ZERO.is_zero());
        let mac: MacAddr = "80:88:88:88:88:88".parse().unwrap();
        assert!(!mac.is_zero());
    }

    #[test]
    fn test_interface_address_prefix_forms() {
        let addr = InterfaceAddress::new(
            Ipv4Addr::new(172, 168, 1, 1),
            16,
            "2001:1000:1000:1000::aca8:101".parse().unwrap(),
            112,
        );
        assert_eq!(addr.ipv4_with_prefix(), "172.168.1.1/16");
        assert_eq!(
            addr.ipv6_with_prefix(),
            "2001:1000:1000:1000::aca8:101/112"
        );
    }

    #[test]
    fn test_vni_display() {
        assert_eq!(Vni(200).to_string(), "200");
        assert_eq!(Vni::NONE.value(), 0);
    }
}
