//! IPv4 address descriptors.
//!
//! An [`Address`] is a value object describing one entry in the kernel's
//! address table. Descriptors are built on demand from a profile's static
//! configuration, a DHCP lease, or a claimed IPv4LL address, handed to the
//! netlink layer for serialization, and not kept around afterwards.

use std::fmt;
use std::net::Ipv4Addr;

use crate::netlink::{LIFETIME_INFINITY, RT_SCOPE_LINK, RT_SCOPE_UNIVERSE};

/// What to install (or drop) in the kernel address table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub address: Ipv4Addr,
    pub prefixlen: u8,
    /// RT_SCOPE_*; link-local addresses use `RT_SCOPE_LINK`.
    pub scope: u8,
    pub broadcast: Option<Ipv4Addr>,
    /// `ifa_cacheinfo` preferred lifetime: 0 deprecates the address,
    /// [`LIFETIME_INFINITY`] approves it. Absent on plain installs.
    pub preferred_lifetime: Option<u32>,
}

impl Address {
    pub fn new(address: Ipv4Addr, prefixlen: u8) -> Self {
        Self {
            address,
            prefixlen,
            scope: RT_SCOPE_UNIVERSE,
            broadcast: None,
            preferred_lifetime: None,
        }
    }

    /// Descriptor for a claimed 169.254/16 link-local address.
    pub fn ipv4ll(address: Ipv4Addr) -> Self {
        let prefixlen = 16;
        Self {
            address,
            prefixlen,
            scope: RT_SCOPE_LINK,
            broadcast: Some(broadcast_address(address, prefixlen)),
            preferred_lifetime: None,
        }
    }

    /// Same descriptor, reissued to deprecate (preferred lifetime 0) or
    /// re-approve (infinite) an already installed link-local address.
    pub fn ipv4ll_lifetime(address: Ipv4Addr, deprecate: bool) -> Self {
        let mut addr = Self::ipv4ll(address);
        addr.preferred_lifetime = Some(if deprecate { 0 } else { LIFETIME_INFINITY });
        addr
    }

    /// Descriptor for a DHCP lease: prefix length from the netmask,
    /// broadcast is the address with all host bits set.
    pub fn from_lease(address: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        let prefixlen = netmask_prefixlen(netmask);
        Self {
            address,
            prefixlen,
            scope: RT_SCOPE_UNIVERSE,
            broadcast: Some(Ipv4Addr::from(u32::from(address) | !u32::from(netmask))),
            preferred_lifetime: None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefixlen)?;
        if let Some(brd) = self.broadcast {
            write!(f, " brd {brd}")?;
        }
        Ok(())
    }
}

/// Prefix length of a contiguous netmask (e.g. 255.255.255.0 → 24).
pub fn netmask_prefixlen(netmask: Ipv4Addr) -> u8 {
    u32::from(netmask).count_ones() as u8
}

/// Broadcast address of `addr`'s subnet: all host bits set.
pub fn broadcast_address(addr: Ipv4Addr, prefixlen: u8) -> Ipv4Addr {
    if prefixlen >= 32 {
        return addr;
    }
    let host_mask = 0xffff_ffffu32 >> prefixlen;
    Ipv4Addr::from(u32::from(addr) | host_mask)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_netmask_prefixlen() {
        assert_eq!(netmask_prefixlen("255.255.255.0".parse().unwrap()), 24);
        assert_eq!(netmask_prefixlen("255.255.0.0".parse().unwrap()), 16);
        assert_eq!(netmask_prefixlen("255.0.0.0".parse().unwrap()), 8);
        assert_eq!(netmask_prefixlen("255.255.255.255".parse().unwrap()), 32);
        assert_eq!(netmask_prefixlen("0.0.0.0".parse().unwrap()), 0);
    }

    #[test]
    fn test_broadcast_address() {
        assert_eq!(
            broadcast_address("192.168.1.5".parse().unwrap(), 24),
            "192.168.1.255".parse::<Ipv4Addr>().unwrap()
        );
        assert_eq!(
            broadcast_address("10.0.0.1".parse().unwrap(), 8),
            "10.255.255.255".parse::<Ipv4Addr>().unwrap()
        );
        assert_eq!(
            broadcast_address("172.16.5.10".parse().unwrap(), 32),
            "172.16.5.10".parse::<Ipv4Addr>().unwrap()
        );
    }

    #[test]
    fn test_ipv4ll_descriptor() {
        let addr = Address::ipv4ll("169.254.7.8".parse().unwrap());
        assert_eq!(addr.prefixlen, 16);
        assert_eq!(addr.scope, RT_SCOPE_LINK);
        assert_eq!(
            addr.broadcast,
            Some("169.254.255.255".parse().unwrap())
        );
        assert_eq!(addr.preferred_lifetime, None);
    }

    #[test]
    fn test_ipv4ll_lifetime() {
        let deprecated = Address::ipv4ll_lifetime("169.254.7.8".parse().unwrap(), true);
        assert_eq!(deprecated.preferred_lifetime, Some(0));

        let approved = Address::ipv4ll_lifetime("169.254.7.8".parse().unwrap(), false);
        assert_eq!(approved.preferred_lifetime, Some(LIFETIME_INFINITY));
    }

    #[test]
    fn test_from_lease() {
        let addr = Address::from_lease(
            "10.0.0.5".parse().unwrap(),
            "255.255.255.0".parse().unwrap(),
        );
        assert_eq!(addr.prefixlen, 24);
        assert_eq!(addr.scope, RT_SCOPE_UNIVERSE);
        assert_eq!(addr.broadcast, Some("10.0.0.255".parse().unwrap()));
    }

    #[test]
    fn test_display() {
        let mut addr = Address::new("192.0.2.10".parse().unwrap(), 24);
        assert_eq!(addr.to_string(), "192.0.2.10/24");
        addr.broadcast = Some("192.0.2.255".parse().unwrap());
        assert_eq!(addr.to_string(), "192.0.2.10/24 brd 192.0.2.255");
    }
}
