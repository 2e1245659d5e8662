//! DHCPv4 client adapter.
//!
//! The DHCPv4 protocol engine (DORA exchange, timers, retransmission) is an
//! external component; this module wraps it for the link state machine. The
//! adapter carries the engine's per-link binding (interface index, hardware
//! address, the hostname we announce, which options to request) and the
//! lease the engine currently holds. Engine activity surfaces as
//! [`DhcpEvent`] values delivered through the manager.

use std::fmt;
use std::io;
use std::net::Ipv4Addr;
use std::path::Path;

use crate::address::netmask_prefixlen;
use crate::state;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// What the DHCPv4 engine reports about a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpEvent {
    /// A lease was obtained for the first time.
    IpAcquire,
    /// The lease was renewed with a different address.
    IpChange,
    /// The lease expired without renewal.
    Expired,
    /// The client was stopped.
    Stop,
    /// The offered address failed duplicate address detection.
    NoLease,
    /// Engine-level error (negative errno).
    Error(i32),
}

impl fmt::Display for DhcpEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IpAcquire => write!(f, "IP_ACQUIRE"),
            Self::IpChange => write!(f, "IP_CHANGE"),
            Self::Expired => write!(f, "EXPIRED"),
            Self::Stop => write!(f, "STOP"),
            Self::NoLease => write!(f, "NO_LEASE"),
            Self::Error(e) => write!(f, "ERROR({e})"),
        }
    }
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// A lease as handed over by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpLease {
    /// Assigned IPv4 address.
    pub address: Ipv4Addr,

    /// Subnet mask (e.g. 255.255.255.0).
    pub netmask: Ipv4Addr,

    /// Default gateway.
    pub router: Option<Ipv4Addr>,

    /// DNS server addresses.
    pub dns_servers: Vec<Ipv4Addr>,

    /// Interface MTU offered by the server (option 26).
    pub mtu: Option<u32>,

    /// Hostname offered by the server (option 12).
    pub hostname: Option<String>,

    /// Server identifier (the DHCP server's address).
    pub server_id: Option<Ipv4Addr>,

    /// Lease duration in seconds.
    pub lifetime: u32,

    /// T1 renewal time in seconds.
    pub t1: u32,

    /// T2 rebinding time in seconds.
    pub t2: u32,
}

impl DhcpLease {
    /// Prefix length derived from the netmask.
    pub fn prefixlen(&self) -> u8 {
        netmask_prefixlen(self.netmask)
    }

    /// Write the snapshot other tools read back, atomically.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let mut content = String::new();
        content.push_str("# This is private data. Do not parse.\n");
        content.push_str(&format!("ADDRESS={}\n", self.address));
        content.push_str(&format!("NETMASK={}\n", self.netmask));
        if let Some(router) = self.router {
            content.push_str(&format!("ROUTER={router}\n"));
        }
        for dns in &self.dns_servers {
            content.push_str(&format!("DNS={dns}\n"));
        }
        if let Some(mtu) = self.mtu {
            content.push_str(&format!("MTU={mtu}\n"));
        }
        if let Some(ref hostname) = self.hostname {
            content.push_str(&format!("HOSTNAME={hostname}\n"));
        }
        if let Some(server_id) = self.server_id {
            content.push_str(&format!("SERVER_ADDRESS={server_id}\n"));
        }
        content.push_str(&format!("LIFETIME={}\n", self.lifetime));
        content.push_str(&format!("T1={}\n", self.t1));
        content.push_str(&format!("T2={}\n", self.t2));

        state::atomic_write(path, &content)
    }
}

impl fmt::Display for DhcpLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefixlen())?;
        if let Some(router) = self.router {
            write!(f, " via {router}")?;
        }
        write!(f, " lease {}s", self.lifetime)
    }
}

// ---------------------------------------------------------------------------
// Client adapter
// ---------------------------------------------------------------------------

/// Per-link handle on the DHCPv4 engine.
#[derive(Debug)]
pub struct DhcpClient {
    ifindex: i32,
    mac: Option<[u8; 6]>,
    hostname: Option<String>,
    request_mtu: bool,
    running: bool,
    lease: Option<DhcpLease>,
}

impl DhcpClient {
    pub fn new(ifindex: i32) -> Self {
        Self {
            ifindex,
            mac: None,
            hostname: None,
            request_mtu: false,
            running: false,
            lease: None,
        }
    }

    pub fn ifindex(&self) -> i32 {
        self.ifindex
    }

    /// Bind the client to a hardware address. The engine builds its client
    /// identifier from this, so it cannot change under a running exchange.
    pub fn set_mac(&mut self, mac: [u8; 6]) -> io::Result<()> {
        if self.running {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        self.mac = Some(mac);
        Ok(())
    }

    pub fn mac(&self) -> Option<[u8; 6]> {
        self.mac
    }

    /// Hostname to announce to the server (option 12), if any.
    pub fn set_hostname(&mut self, hostname: Option<String>) {
        self.hostname = hostname;
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    /// Ask the server for an interface MTU (option 26).
    pub fn set_request_mtu(&mut self, request: bool) {
        self.request_mtu = request;
    }

    pub fn requests_mtu(&self) -> bool {
        self.request_mtu
    }

    pub fn start(&mut self) -> io::Result<()> {
        self.running = true;
        Ok(())
    }

    pub fn stop(&mut self) -> io::Result<()> {
        self.running = false;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// The lease the engine currently holds.
    pub fn lease(&self) -> Option<&DhcpLease> {
        self.lease.as_ref()
    }

    /// Engine-side: install a freshly negotiated lease, replacing any
    /// previous one. Followed by an `IpAcquire`/`IpChange` event.
    pub fn update_lease(&mut self, lease: DhcpLease) {
        self.lease = Some(lease);
    }

    /// Engine-side: forget the lease (expiry, stop).
    pub fn clear_lease(&mut self) {
        self.lease = None;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn test_lease() -> DhcpLease {
        DhcpLease {
            address: "10.0.0.5".parse().unwrap(),
            netmask: "255.255.255.0".parse().unwrap(),
            router: Some("10.0.0.1".parse().unwrap()),
            dns_servers: vec!["10.0.0.1".parse().unwrap(), "8.8.8.8".parse().unwrap()],
            mtu: Some(1400),
            hostname: Some("h".to_string()),
            server_id: Some("10.0.0.1".parse().unwrap()),
            lifetime: 3600,
            t1: 1800,
            t2: 3150,
        }
    }

    #[test]
    fn test_prefixlen() {
        assert_eq!(test_lease().prefixlen(), 24);

        let mut lease = test_lease();
        lease.netmask = "255.255.0.0".parse().unwrap();
        assert_eq!(lease.prefixlen(), 16);
    }

    #[test]
    fn test_lease_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("3");

        test_lease().save(&path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("ADDRESS=10.0.0.5\n"));
        assert!(content.contains("NETMASK=255.255.255.0\n"));
        assert!(content.contains("ROUTER=10.0.0.1\n"));
        assert!(content.contains("DNS=8.8.8.8\n"));
        assert!(content.contains("MTU=1400\n"));
        assert!(content.contains("HOSTNAME=h\n"));
        assert!(content.contains("LIFETIME=3600\n"));
    }

    #[test]
    fn test_lease_save_optional_fields_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("4");

        let mut lease = test_lease();
        lease.router = None;
        lease.mtu = None;
        lease.hostname = None;
        lease.save(&path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(!content.contains("ROUTER="));
        assert!(!content.contains("MTU="));
        assert!(!content.contains("HOSTNAME="));
    }

    #[test]
    fn test_set_mac_while_stopped() {
        let mut client = DhcpClient::new(3);
        assert!(client.set_mac([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]).is_ok());
        assert_eq!(client.mac(), Some([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]));
    }

    #[test]
    fn test_set_mac_while_running_is_busy() {
        let mut client = DhcpClient::new(3);
        client.set_mac([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]).unwrap();
        client.start().unwrap();

        let err = client.set_mac([0x52, 0x54, 0x00, 0xff, 0xff, 0xff]).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBUSY));

        client.stop().unwrap();
        assert!(client.set_mac([0x52, 0x54, 0x00, 0xff, 0xff, 0xff]).is_ok());
    }

    #[test]
    fn test_lease_replacement() {
        let mut client = DhcpClient::new(3);
        assert!(client.lease().is_none());

        client.update_lease(test_lease());
        assert_eq!(client.lease().unwrap().address, "10.0.0.5".parse::<Ipv4Addr>().unwrap());

        let mut renewed = test_lease();
        renewed.address = "10.0.0.99".parse().unwrap();
        client.update_lease(renewed);
        assert_eq!(
            client.lease().unwrap().address,
            "10.0.0.99".parse::<Ipv4Addr>().unwrap()
        );

        client.clear_lease();
        assert!(client.lease().is_none());
    }

    #[test]
    fn test_lease_display() {
        assert_eq!(test_lease().to_string(), "10.0.0.5/24 via 10.0.0.1 lease 3600s");
    }

    #[test]
    fn test_event_display() {
        assert_eq!(DhcpEvent::IpAcquire.to_string(), "IP_ACQUIRE");
        assert_eq!(DhcpEvent::Expired.to_string(), "EXPIRED");
        assert_eq!(DhcpEvent::Error(-5).to_string(), "ERROR(-5)");
    }
}
