//! IPv4 link-local (169.254/16) client adapter.
//!
//! The claim/defend protocol itself (ARP probing and announcement per RFC
//! 3927) is an external engine; this module wraps it the same way
//! [`crate::dhcp`] wraps the DHCPv4 engine. The adapter holds the engine's
//! binding (interface index, hardware address, address selection seed) and
//! the currently claimed address. Engine activity surfaces as
//! [`Ipv4llEvent`] values delivered through the manager.

use std::fmt;
use std::io;
use std::net::Ipv4Addr;

use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// What the IPv4LL engine reports about a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipv4llEvent {
    /// An address was successfully claimed and defended.
    Bind,
    /// Another host claimed our address; the engine restarts selection.
    Conflict,
    /// The client was stopped.
    Stop,
    /// Engine-level error (negative errno).
    Error(i32),
}

impl fmt::Display for Ipv4llEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind => write!(f, "BIND"),
            Self::Conflict => write!(f, "CONFLICT"),
            Self::Stop => write!(f, "STOP"),
            Self::Error(e) => write!(f, "ERROR({e})"),
        }
    }
}

// ---------------------------------------------------------------------------
// Client adapter
// ---------------------------------------------------------------------------

/// Per-link handle on the IPv4LL engine.
#[derive(Debug)]
pub struct Ipv4llClient {
    ifindex: i32,
    mac: Option<[u8; 6]>,
    seed: Option<[u8; 8]>,
    running: bool,
    address: Option<Ipv4Addr>,
}

impl Ipv4llClient {
    pub fn new(ifindex: i32) -> Self {
        Self {
            ifindex,
            mac: None,
            seed: None,
            running: false,
            address: None,
        }
    }

    pub fn ifindex(&self) -> i32 {
        self.ifindex
    }

    /// Seed the engine's pseudo-random address selection so the same device
    /// claims the same address across reboots.
    pub fn set_seed(&mut self, seed: [u8; 8]) {
        self.seed = Some(seed);
    }

    pub fn seed(&self) -> Option<[u8; 8]> {
        self.seed
    }

    /// Bind the client to a hardware address; refused while the engine is
    /// probing or defending.
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

    /// The currently claimed address, if the engine has bound one.
    pub fn address(&self) -> Option<Ipv4Addr> {
        self.address
    }

    pub fn is_bound(&self) -> bool {
        self.address.is_some()
    }

    /// Engine-side: record a claimed address. Followed by a `Bind` event.
    pub fn set_address(&mut self, address: Ipv4Addr) {
        debug_assert!(address.is_link_local());
        self.address = Some(address);
    }

    /// Release the claimed address, returning it for teardown.
    pub fn take_address(&mut self) -> Option<Ipv4Addr> {
        self.address.take()
    }
}

/// Derive an address-selection seed from a device's stable udev identity
/// (its persistent name or path), so the claimed address survives reboots
/// even when the MAC does not.
pub fn seed_from_device_data(data: &str) -> [u8; 8] {
    let digest = Sha256::digest(data.as_bytes());
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&digest[..8]);
    seed
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_is_stable() {
        let a = seed_from_device_data("pci-0000:00:1f.6");
        let b = seed_from_device_data("pci-0000:00:1f.6");
        assert_eq!(a, b);

        let c = seed_from_device_data("pci-0000:00:14.3");
        assert_ne!(a, c);
    }

    #[test]
    fn test_bind_and_release() {
        let mut client = Ipv4llClient::new(3);
        assert!(!client.is_bound());

        client.set_address("169.254.7.8".parse().unwrap());
        assert!(client.is_bound());
        assert_eq!(client.address(), Some("169.254.7.8".parse().unwrap()));

        assert_eq!(client.take_address(), Some("169.254.7.8".parse().unwrap()));
        assert!(!client.is_bound());
        assert_eq!(client.take_address(), None);
    }

    #[test]
    fn test_set_mac_while_running_is_busy() {
        let mut client = Ipv4llClient::new(3);
        client.set_mac([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]).unwrap();
        client.start().unwrap();

        let err = client.set_mac([0x52, 0x54, 0x00, 0xff, 0xff, 0xff]).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBUSY));
    }

    #[test]
    fn test_stop_keeps_address_until_taken() {
        // The engine reports STOP after `stop()`; teardown then collects the
        // address via `take_address`.
        let mut client = Ipv4llClient::new(3);
        client.start().unwrap();
        client.set_address("169.254.7.8".parse().unwrap());

        client.stop().unwrap();
        assert!(!client.is_running());
        assert!(client.is_bound());
    }

    #[test]
    fn test_event_display() {
        assert_eq!(Ipv4llEvent::Bind.to_string(), "BIND");
        assert_eq!(Ipv4llEvent::Conflict.to_string(), "CONFLICT");
        assert_eq!(Ipv4llEvent::Error(-12).to_string(), "ERROR(-12)");
    }
}
