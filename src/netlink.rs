//! rtnetlink wire protocol and asynchronous request dispatch.
//!
//! This module owns everything that touches the `AF_NETLINK`/`NETLINK_ROUTE`
//! byte format:
//! - Serialization of the requests the daemon issues (RTM_SETLINK,
//!   RTM_NEWADDR, RTM_DELADDR, RTM_NEWROUTE, RTM_DELROUTE, link dumps)
//! - Parsing of kernel traffic: RTM_NEWLINK/RTM_DELLINK broadcasts and
//!   NLMSG_ERROR acknowledgements
//! - The [`Rtnl`] dispatcher, which hands out sequence numbers and keeps the
//!   table of outstanding requests so replies can be routed back to the link
//!   that issued them
//!
//! The kernel socket uses raw `libc` calls; there is no dependency on
//! external netlink crates. A recording transport stands in for the kernel
//! in tests.

use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;

use crate::address::Address;
use crate::route::Route;

// ---------------------------------------------------------------------------
// Netlink constants (from linux/netlink.h, linux/rtnetlink.h, linux/if.h)
// ---------------------------------------------------------------------------

const NETLINK_ROUTE: i32 = 0;

/// Multicast group carrying link state broadcasts.
const RTMGRP_LINK: u32 = 1;

// Netlink message types (RTM_*)
pub const RTM_NEWLINK: u16 = 16;
pub const RTM_DELLINK: u16 = 17;
pub const RTM_GETLINK: u16 = 18;
pub const RTM_SETLINK: u16 = 19;
pub const RTM_NEWADDR: u16 = 20;
pub const RTM_DELADDR: u16 = 21;
pub const RTM_NEWROUTE: u16 = 24;
pub const RTM_DELROUTE: u16 = 25;

// Netlink flags
const NLM_F_REQUEST: u16 = 0x0001;
const NLM_F_MULTI: u16 = 0x0002;
const NLM_F_ACK: u16 = 0x0004;
const NLM_F_ROOT: u16 = 0x0100;
const NLM_F_MATCH: u16 = 0x0200;
const NLM_F_DUMP: u16 = NLM_F_ROOT | NLM_F_MATCH;
const NLM_F_CREATE: u16 = 0x0400;
const NLM_F_EXCL: u16 = 0x0200;

// Control message types
const NLMSG_NOOP: u16 = 1;
const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;

// Address families
const AF_INET: u8 = 2;
const AF_UNSPEC: u8 = 0;

// Interface link attributes (IFLA_*)
const IFLA_ADDRESS: u16 = 1;
const IFLA_IFNAME: u16 = 3;
const IFLA_MTU: u16 = 4;
const IFLA_MASTER: u16 = 10;

// Address attributes (IFA_*)
const IFA_ADDRESS: u16 = 1;
const IFA_LOCAL: u16 = 2;
const IFA_BROADCAST: u16 = 4;
const IFA_CACHEINFO: u16 = 6;

// Route attributes (RTA_*)
const RTA_DST: u16 = 1;
const RTA_OIF: u16 = 4;
const RTA_GATEWAY: u16 = 5;
const RTA_PRIORITY: u16 = 6;

// Route table / type
const RT_TABLE_MAIN: u8 = 254;
const RTN_UNICAST: u8 = 1;

// Route scopes
pub const RT_SCOPE_UNIVERSE: u8 = 0;
pub const RT_SCOPE_LINK: u8 = 253;

// Route protocols
pub const RTPROT_STATIC: u8 = 4;
pub const RTPROT_DHCP: u8 = 16;

// IFF_* link flags
pub const IFF_UP: u32 = 0x1;
pub const IFF_BROADCAST: u32 = 0x2;
pub const IFF_DEBUG: u32 = 0x4;
pub const IFF_LOOPBACK: u32 = 0x8;
pub const IFF_NOARP: u32 = 0x80;
pub const IFF_PROMISC: u32 = 0x100;
pub const IFF_MASTER: u32 = 0x400;
pub const IFF_SLAVE: u32 = 0x800;
pub const IFF_MULTICAST: u32 = 0x1000;
pub const IFF_LOWER_UP: u32 = 0x10000;
pub const IFF_DORMANT: u32 = 0x20000;

/// `ifa_cacheinfo` lifetime value meaning "forever".
pub const LIFETIME_INFINITY: u32 = 0xffff_ffff;

// Fixed header sizes
const NLMSG_HDR_LEN: usize = 16;
const IFINFOMSG_LEN: usize = 16;
const IFADDRMSG_LEN: usize = 8;
const RTMSG_LEN: usize = 12;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// A typed rtnetlink request. Serialization to the wire format happens in
/// [`encode_request`]; the mock transport records these values verbatim so
/// tests can assert on exactly what the state machine asked the kernel to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// RTM_SETLINK changing the flag bits selected by `change`.
    SetFlags { ifindex: i32, flags: u32, change: u32 },
    /// RTM_SETLINK carrying IFLA_MTU.
    SetMtu { ifindex: i32, mtu: u32 },
    /// RTM_SETLINK carrying IFLA_MASTER (enslave to a bridge/bond/...).
    SetMaster { ifindex: i32, master: i32 },
    /// RTM_NEWADDR with NLM_F_EXCL (install; EEXIST when already present).
    NewAddress { ifindex: i32, address: Address },
    /// RTM_NEWADDR without NLM_F_EXCL (the kernel treats a duplicate with
    /// fresh cacheinfo as an update).
    UpdateAddress { ifindex: i32, address: Address },
    /// RTM_DELADDR.
    DelAddress { ifindex: i32, address: Address },
    /// RTM_NEWROUTE with NLM_F_EXCL.
    NewRoute { ifindex: i32, route: Route },
    /// RTM_DELROUTE.
    DelRoute { ifindex: i32, route: Route },
    /// RTM_GETLINK dump of all links.
    GetLinks,
}

/// Which reply handler an outstanding request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Enslave,
    LinkUp,
    SetMtu,
    NewAddress,
    UpdateAddress,
    DropAddress,
    NewRoute,
    DropRoute,
}

/// An outstanding request: the link it belongs to and how to interpret the
/// eventual acknowledgement. Links are referenced by ifindex, never by
/// pointer, so a reply arriving after teardown simply fails the lookup.
#[derive(Debug, Clone, Copy)]
pub struct Pending {
    pub ifindex: i32,
    pub kind: ReplyKind,
}

// ---------------------------------------------------------------------------
// Kernel-originated events
// ---------------------------------------------------------------------------

/// A parsed RTM_NEWLINK / RTM_DELLINK message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkMessage {
    /// RTM_NEWLINK or RTM_DELLINK.
    pub msg_type: u16,
    /// Kernel interface index (`ifi_index`, may be invalid in bad messages).
    pub ifindex: i32,
    /// IFF_* flag bits.
    pub flags: u32,
    /// IFLA_IFNAME, when present.
    pub ifname: Option<String>,
    /// IFLA_MTU, when present.
    pub mtu: Option<u32>,
    /// IFLA_ADDRESS, when present and exactly 6 bytes.
    pub mac: Option<[u8; 6]>,
}

/// Traffic read from the route socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtnlEvent {
    /// Acknowledgement (NLMSG_ERROR) for one of our requests. `errno` is 0
    /// on success, positive otherwise (e.g. `libc::EEXIST`).
    Reply { seq: u32, errno: i32 },
    /// An RTM_NEWLINK broadcast or dump entry.
    NewLink(LinkMessage),
    /// An RTM_DELLINK broadcast.
    DelLink { ifindex: i32 },
}

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// The boundary between the dispatcher and the kernel. The production
/// implementation is [`RtnlSocket`]; tests substitute a recorder.
pub trait RtnlTransport {
    /// Serialize and submit one request under the given sequence number.
    fn submit(&mut self, seq: u32, req: &Request) -> io::Result<()>;

    /// Drain whatever the kernel has queued, without blocking.
    fn poll_events(&mut self) -> io::Result<Vec<RtnlEvent>>;

    /// File descriptor for the event loop to poll, if any.
    fn raw_fd(&self) -> Option<RawFd>;
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Hands out sequence numbers, serializes requests through the transport and
/// keeps the pending-reply table.
pub struct Rtnl {
    transport: Box<dyn RtnlTransport>,
    seq: u32,
    pending: HashMap<u32, Pending>,
}

impl Rtnl {
    pub fn new(transport: Box<dyn RtnlTransport>) -> Self {
        Self {
            transport,
            seq: 1,
            pending: HashMap::new(),
        }
    }

    /// Submit a request on behalf of a link and register its reply handler.
    pub fn submit(&mut self, ifindex: i32, kind: ReplyKind, req: Request) -> io::Result<()> {
        let seq = self.next_seq();
        self.transport.submit(seq, &req)?;
        self.pending.insert(seq, Pending { ifindex, kind });
        Ok(())
    }

    /// Kick off an RTM_GETLINK dump. The entries come back as
    /// [`RtnlEvent::NewLink`] and flow through normal link ingress.
    pub fn enumerate_links(&mut self) -> io::Result<()> {
        let seq = self.next_seq();
        self.transport.submit(seq, &Request::GetLinks)
    }

    /// Claim the pending entry for an acknowledged sequence number.
    pub fn take_pending(&mut self, seq: u32) -> Option<Pending> {
        self.pending.remove(&seq)
    }

    pub fn poll_events(&mut self) -> io::Result<Vec<RtnlEvent>> {
        self.transport.poll_events()
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.transport.raw_fd()
    }

    /// Number of requests still awaiting acknowledgement.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn next_seq(&mut self) -> u32 {
        let s = self.seq;
        self.seq = self.seq.wrapping_add(1);
        s
    }
}

// ---------------------------------------------------------------------------
// Message builder
// ---------------------------------------------------------------------------

/// Append-only netlink message builder. The total length field in the
/// header is patched in by [`MessageBuilder::finish`].
struct MessageBuilder {
    buf: Vec<u8>,
}

impl MessageBuilder {
    fn new(msg_type: u16, flags: u16, seq: u32) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&0u32.to_ne_bytes()); // nlmsg_len, patched later
        buf.extend_from_slice(&msg_type.to_ne_bytes());
        buf.extend_from_slice(&flags.to_ne_bytes());
        buf.extend_from_slice(&seq.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes()); // nlmsg_pid
        Self { buf }
    }

    /// struct ifinfomsg: family, pad, type, index, flags, change.
    fn ifinfomsg(mut self, ifindex: i32, flags: u32, change: u32) -> Self {
        self.buf.push(AF_UNSPEC);
        self.buf.push(0);
        self.buf.extend_from_slice(&0u16.to_ne_bytes());
        self.buf.extend_from_slice(&ifindex.to_ne_bytes());
        self.buf.extend_from_slice(&flags.to_ne_bytes());
        self.buf.extend_from_slice(&change.to_ne_bytes());
        self
    }

    /// struct ifaddrmsg: family, prefixlen, flags, scope, index.
    fn ifaddrmsg(mut self, prefixlen: u8, scope: u8, ifindex: i32) -> Self {
        self.buf.push(AF_INET);
        self.buf.push(prefixlen);
        self.buf.push(0);
        self.buf.push(scope);
        self.buf.extend_from_slice(&(ifindex as u32).to_ne_bytes());
        self
    }

    /// struct rtmsg: family, dst_len, src_len, tos, table, protocol, scope, type.
    fn rtmsg(mut self, dst_len: u8, protocol: u8, scope: u8) -> Self {
        self.buf.push(AF_INET);
        self.buf.push(dst_len);
        self.buf.push(0); // rtm_src_len
        self.buf.push(0); // rtm_tos
        self.buf.push(RT_TABLE_MAIN);
        self.buf.push(protocol);
        self.buf.push(scope);
        self.buf.push(RTN_UNICAST);
        self.buf.extend_from_slice(&0u32.to_ne_bytes()); // rtm_flags
        self
    }

    fn attr_bytes(mut self, attr_type: u16, payload: &[u8]) -> Self {
        let rta_len = (4 + payload.len()) as u16;
        self.buf.extend_from_slice(&rta_len.to_ne_bytes());
        self.buf.extend_from_slice(&attr_type.to_ne_bytes());
        self.buf.extend_from_slice(payload);
        while self.buf.len() % 4 != 0 {
            self.buf.push(0);
        }
        self
    }

    fn attr_u32(self, attr_type: u16, val: u32) -> Self {
        self.attr_bytes(attr_type, &val.to_ne_bytes())
    }

    fn attr_ipv4(self, attr_type: u16, addr: Ipv4Addr) -> Self {
        self.attr_bytes(attr_type, &addr.octets())
    }

    /// struct ifa_cacheinfo: preferred, valid, cstamp, tstamp.
    fn attr_cacheinfo(self, preferred: u32, valid: u32) -> Self {
        let mut payload = [0u8; 16];
        payload[0..4].copy_from_slice(&preferred.to_ne_bytes());
        payload[4..8].copy_from_slice(&valid.to_ne_bytes());
        self.attr_bytes(IFA_CACHEINFO, &payload)
    }

    fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
        self.buf
    }
}

/// Serialize a [`Request`] into one netlink message.
pub fn encode_request(seq: u32, req: &Request) -> Vec<u8> {
    match req {
        Request::SetFlags {
            ifindex,
            flags,
            change,
        } => MessageBuilder::new(RTM_SETLINK, NLM_F_REQUEST | NLM_F_ACK, seq)
            .ifinfomsg(*ifindex, *flags, *change)
            .finish(),

        Request::SetMtu { ifindex, mtu } => {
            MessageBuilder::new(RTM_SETLINK, NLM_F_REQUEST | NLM_F_ACK, seq)
                .ifinfomsg(*ifindex, 0, 0)
                .attr_u32(IFLA_MTU, *mtu)
                .finish()
        }

        Request::SetMaster { ifindex, master } => {
            MessageBuilder::new(RTM_SETLINK, NLM_F_REQUEST | NLM_F_ACK, seq)
                .ifinfomsg(*ifindex, 0, 0)
                .attr_u32(IFLA_MASTER, *master as u32)
                .finish()
        }

        Request::NewAddress { ifindex, address } => {
            encode_address(seq, *ifindex, address, NLM_F_CREATE | NLM_F_EXCL)
        }

        Request::UpdateAddress { ifindex, address } => {
            encode_address(seq, *ifindex, address, NLM_F_CREATE)
        }

        Request::DelAddress { ifindex, address } => {
            MessageBuilder::new(RTM_DELADDR, NLM_F_REQUEST | NLM_F_ACK, seq)
                .ifaddrmsg(address.prefixlen, address.scope, *ifindex)
                .attr_ipv4(IFA_LOCAL, address.address)
                .finish()
        }

        Request::NewRoute { ifindex, route } => encode_route(
            RTM_NEWROUTE,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            seq,
            *ifindex,
            route,
        ),

        Request::DelRoute { ifindex, route } => {
            encode_route(RTM_DELROUTE, NLM_F_REQUEST | NLM_F_ACK, seq, *ifindex, route)
        }

        Request::GetLinks => MessageBuilder::new(RTM_GETLINK, NLM_F_REQUEST | NLM_F_DUMP, seq)
            .ifinfomsg(0, 0, 0)
            .finish(),
    }
}

fn encode_address(seq: u32, ifindex: i32, address: &Address, extra_flags: u16) -> Vec<u8> {
    let mut b = MessageBuilder::new(RTM_NEWADDR, NLM_F_REQUEST | NLM_F_ACK | extra_flags, seq)
        .ifaddrmsg(address.prefixlen, address.scope, ifindex)
        .attr_ipv4(IFA_LOCAL, address.address)
        .attr_ipv4(IFA_ADDRESS, address.address);
    if let Some(brd) = address.broadcast {
        b = b.attr_ipv4(IFA_BROADCAST, brd);
    }
    if let Some(preferred) = address.preferred_lifetime {
        b = b.attr_cacheinfo(preferred, LIFETIME_INFINITY);
    }
    b.finish()
}

fn encode_route(msg_type: u16, flags: u16, seq: u32, ifindex: i32, route: &Route) -> Vec<u8> {
    let mut b = MessageBuilder::new(msg_type, flags, seq).rtmsg(
        route.dst_prefixlen,
        route.protocol,
        route.scope,
    );
    if let Some(dst) = route.dst {
        b = b.attr_ipv4(RTA_DST, dst);
    }
    if let Some(gw) = route.gateway {
        b = b.attr_ipv4(RTA_GATEWAY, gw);
    }
    b = b.attr_u32(RTA_OIF, ifindex as u32);
    if let Some(metric) = route.metric {
        b = b.attr_u32(RTA_PRIORITY, metric);
    }
    b.finish()
}

// ---------------------------------------------------------------------------
// Incoming message parsing
// ---------------------------------------------------------------------------

fn nlmsg_align(len: usize) -> usize {
    (len + 3) & !3
}

/// Parse a sequence of rtattr TLVs into a map keyed by attribute type.
fn parse_rtattrs(data: &[u8]) -> HashMap<u16, Vec<u8>> {
    let mut attrs = HashMap::new();
    let mut offset = 0;

    while offset + 4 <= data.len() {
        let rta_len = u16::from_ne_bytes(data[offset..offset + 2].try_into().unwrap()) as usize;
        let rta_type = u16::from_ne_bytes(data[offset + 2..offset + 4].try_into().unwrap());

        if rta_len < 4 || offset + rta_len > data.len() {
            break;
        }

        // Strip the nested/byte-order bits, keep the base type.
        let base_type = rta_type & 0x3FFF;
        attrs.insert(base_type, data[offset + 4..offset + rta_len].to_vec());

        offset += nlmsg_align(rta_len);
    }

    attrs
}

/// Parse one datagram's worth of netlink messages into events.
pub fn parse_datagram(data: &[u8]) -> Vec<RtnlEvent> {
    let mut events = Vec::new();
    let mut offset = 0;

    while offset + NLMSG_HDR_LEN <= data.len() {
        let nlmsg_len =
            u32::from_ne_bytes(data[offset..offset + 4].try_into().unwrap()) as usize;
        let nlmsg_type = u16::from_ne_bytes(data[offset + 4..offset + 6].try_into().unwrap());
        let nlmsg_seq = u32::from_ne_bytes(data[offset + 8..offset + 12].try_into().unwrap());

        if nlmsg_len < NLMSG_HDR_LEN || offset + nlmsg_len > data.len() {
            break;
        }

        let payload = &data[offset + NLMSG_HDR_LEN..offset + nlmsg_len];

        match nlmsg_type {
            NLMSG_NOOP | NLMSG_DONE => {}
            NLMSG_ERROR => {
                if payload.len() >= 4 {
                    let err = i32::from_ne_bytes(payload[0..4].try_into().unwrap());
                    events.push(RtnlEvent::Reply {
                        seq: nlmsg_seq,
                        errno: -err,
                    });
                }
            }
            RTM_NEWLINK => {
                if let Some(msg) = parse_link_message(RTM_NEWLINK, payload) {
                    events.push(RtnlEvent::NewLink(msg));
                }
            }
            RTM_DELLINK => {
                if payload.len() >= IFINFOMSG_LEN {
                    let ifindex = i32::from_ne_bytes(payload[4..8].try_into().unwrap());
                    events.push(RtnlEvent::DelLink { ifindex });
                }
            }
            _ => {}
        }

        offset += nlmsg_align(nlmsg_len);
    }

    events
}

/// Parse the ifinfomsg + attributes of an RTM_NEWLINK payload.
pub fn parse_link_message(msg_type: u16, payload: &[u8]) -> Option<LinkMessage> {
    if payload.len() < IFINFOMSG_LEN {
        return None;
    }

    let ifindex = i32::from_ne_bytes(payload[4..8].try_into().unwrap());
    let flags = u32::from_ne_bytes(payload[8..12].try_into().unwrap());

    let attrs = parse_rtattrs(&payload[IFINFOMSG_LEN..]);

    let ifname = attrs.get(&IFLA_IFNAME).and_then(|d| {
        let s = std::str::from_utf8(d).ok()?;
        Some(s.trim_end_matches('\0').to_string())
    });

    let mtu = attrs.get(&IFLA_MTU).and_then(|d| {
        if d.len() >= 4 {
            Some(u32::from_ne_bytes(d[..4].try_into().unwrap()))
        } else {
            None
        }
    });

    let mac = attrs.get(&IFLA_ADDRESS).and_then(|d| {
        if d.len() == 6 {
            let mut mac = [0u8; 6];
            mac.copy_from_slice(d);
            Some(mac)
        } else {
            None
        }
    });

    Some(LinkMessage {
        msg_type,
        ifindex,
        flags,
        ifname,
        mtu,
        mac,
    })
}

/// Colon-separated lowercase hex rendering of a hardware address.
pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

// ---------------------------------------------------------------------------
// Kernel transport
// ---------------------------------------------------------------------------

/// A non-blocking NETLINK_ROUTE socket subscribed to link broadcasts.
pub struct RtnlSocket {
    fd: i32,
}

impl RtnlSocket {
    /// Open the route socket and join the RTMGRP_LINK multicast group.
    pub fn open() -> io::Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                NETLINK_ROUTE,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as u16;
        addr.nl_pid = 0; // Let the kernel assign.
        addr.nl_groups = RTMGRP_LINK;

        let ret = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        Ok(Self { fd })
    }
}

impl RtnlTransport for RtnlSocket {
    fn submit(&mut self, seq: u32, req: &Request) -> io::Result<()> {
        let msg = encode_request(seq, req);
        let sent =
            unsafe { libc::send(self.fd, msg.as_ptr() as *const libc::c_void, msg.len(), 0) };
        if sent < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn poll_events(&mut self) -> io::Result<Vec<RtnlEvent>> {
        let mut events = Vec::new();
        let mut buf = vec![0u8; 65536];

        loop {
            let n = unsafe {
                libc::recv(
                    self.fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    break;
                }
                return Err(err);
            }
            if n == 0 {
                break;
            }

            events.extend(parse_datagram(&buf[..n as usize]));
        }

        Ok(events)
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.fd)
    }
}

impl Drop for RtnlSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

// ---------------------------------------------------------------------------
// Test transport
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str, prefixlen: u8) -> Address {
        Address::new(s.parse().unwrap(), prefixlen)
    }

    #[test]
    fn test_nlmsg_align() {
        assert_eq!(nlmsg_align(1), 4);
        assert_eq!(nlmsg_align(4), 4);
        assert_eq!(nlmsg_align(5), 8);
        assert_eq!(nlmsg_align(16), 16);
        assert_eq!(nlmsg_align(17), 20);
    }

    #[test]
    fn test_encode_set_flags() {
        let msg = encode_request(
            7,
            &Request::SetFlags {
                ifindex: 3,
                flags: IFF_UP,
                change: IFF_UP,
            },
        );

        assert_eq!(msg.len(), NLMSG_HDR_LEN + IFINFOMSG_LEN);
        assert_eq!(
            u32::from_ne_bytes(msg[0..4].try_into().unwrap()),
            msg.len() as u32
        );
        assert_eq!(u16::from_ne_bytes(msg[4..6].try_into().unwrap()), RTM_SETLINK);
        assert_eq!(u32::from_ne_bytes(msg[8..12].try_into().unwrap()), 7);

        let ifi = &msg[NLMSG_HDR_LEN..];
        assert_eq!(i32::from_ne_bytes(ifi[4..8].try_into().unwrap()), 3);
        assert_eq!(u32::from_ne_bytes(ifi[8..12].try_into().unwrap()), IFF_UP);
        assert_eq!(u32::from_ne_bytes(ifi[12..16].try_into().unwrap()), IFF_UP);
    }

    #[test]
    fn test_encode_set_mtu() {
        let msg = encode_request(1, &Request::SetMtu { ifindex: 2, mtu: 1400 });

        let attrs = parse_rtattrs(&msg[NLMSG_HDR_LEN + IFINFOMSG_LEN..]);
        let mtu = attrs.get(&IFLA_MTU).unwrap();
        assert_eq!(u32::from_ne_bytes(mtu[..4].try_into().unwrap()), 1400);
    }

    #[test]
    fn test_encode_set_master() {
        let msg = encode_request(1, &Request::SetMaster { ifindex: 4, master: 9 });

        let attrs = parse_rtattrs(&msg[NLMSG_HDR_LEN + IFINFOMSG_LEN..]);
        let master = attrs.get(&IFLA_MASTER).unwrap();
        assert_eq!(u32::from_ne_bytes(master[..4].try_into().unwrap()), 9);
    }

    #[test]
    fn test_encode_new_address() {
        let mut address = addr("192.0.2.10", 24);
        address.broadcast = Some("192.0.2.255".parse().unwrap());

        let msg = encode_request(5, &Request::NewAddress { ifindex: 3, address });

        assert_eq!(u16::from_ne_bytes(msg[4..6].try_into().unwrap()), RTM_NEWADDR);
        let flags = u16::from_ne_bytes(msg[6..8].try_into().unwrap());
        assert_ne!(flags & NLM_F_EXCL, 0);

        let ifa = &msg[NLMSG_HDR_LEN..];
        assert_eq!(ifa[0], AF_INET);
        assert_eq!(ifa[1], 24); // prefixlen
        assert_eq!(ifa[3], RT_SCOPE_UNIVERSE);
        assert_eq!(u32::from_ne_bytes(ifa[4..8].try_into().unwrap()), 3);

        let attrs = parse_rtattrs(&msg[NLMSG_HDR_LEN + IFADDRMSG_LEN..]);
        assert_eq!(attrs.get(&IFA_LOCAL).unwrap().as_slice(), &[192, 0, 2, 10]);
        assert_eq!(
            attrs.get(&IFA_BROADCAST).unwrap().as_slice(),
            &[192, 0, 2, 255]
        );
        assert!(!attrs.contains_key(&IFA_CACHEINFO));
    }

    #[test]
    fn test_encode_update_address_carries_cacheinfo() {
        let mut address = addr("169.254.7.8", 16);
        address.preferred_lifetime = Some(0);

        let msg = encode_request(5, &Request::UpdateAddress { ifindex: 3, address });

        // No EXCL: the kernel applies the new cacheinfo to the existing entry.
        let flags = u16::from_ne_bytes(msg[6..8].try_into().unwrap());
        assert_eq!(flags & NLM_F_EXCL, 0);

        let attrs = parse_rtattrs(&msg[NLMSG_HDR_LEN + IFADDRMSG_LEN..]);
        let ci = attrs.get(&IFA_CACHEINFO).unwrap();
        assert_eq!(ci.len(), 16);
        assert_eq!(u32::from_ne_bytes(ci[0..4].try_into().unwrap()), 0);
        assert_eq!(
            u32::from_ne_bytes(ci[4..8].try_into().unwrap()),
            LIFETIME_INFINITY
        );
    }

    #[test]
    fn test_encode_del_address() {
        let address = addr("10.0.0.5", 24);
        let msg = encode_request(2, &Request::DelAddress { ifindex: 3, address });

        assert_eq!(u16::from_ne_bytes(msg[4..6].try_into().unwrap()), RTM_DELADDR);
        let attrs = parse_rtattrs(&msg[NLMSG_HDR_LEN + IFADDRMSG_LEN..]);
        assert_eq!(attrs.get(&IFA_LOCAL).unwrap().as_slice(), &[10, 0, 0, 5]);
    }

    #[test]
    fn test_encode_default_route() {
        let route = Route::dhcp_default("10.0.0.1".parse().unwrap());
        let msg = encode_request(9, &Request::NewRoute { ifindex: 3, route });

        assert_eq!(
            u16::from_ne_bytes(msg[4..6].try_into().unwrap()),
            RTM_NEWROUTE
        );

        let rt = &msg[NLMSG_HDR_LEN..];
        assert_eq!(rt[0], AF_INET);
        assert_eq!(rt[1], 0); // default route: dst_len 0
        assert_eq!(rt[4], RT_TABLE_MAIN);
        assert_eq!(rt[5], RTPROT_DHCP);
        assert_eq!(rt[6], RT_SCOPE_UNIVERSE);

        let attrs = parse_rtattrs(&msg[NLMSG_HDR_LEN + RTMSG_LEN..]);
        assert!(!attrs.contains_key(&RTA_DST));
        assert_eq!(attrs.get(&RTA_GATEWAY).unwrap().as_slice(), &[10, 0, 0, 1]);
        let oif = attrs.get(&RTA_OIF).unwrap();
        assert_eq!(u32::from_ne_bytes(oif[..4].try_into().unwrap()), 3);
    }

    #[test]
    fn test_encode_gateway_host_route() {
        let route = Route::dhcp_gateway_host("10.0.0.1".parse().unwrap());
        let msg = encode_request(9, &Request::NewRoute { ifindex: 3, route });

        let rt = &msg[NLMSG_HDR_LEN..];
        assert_eq!(rt[1], 32);
        assert_eq!(rt[6], RT_SCOPE_LINK);

        let attrs = parse_rtattrs(&msg[NLMSG_HDR_LEN + RTMSG_LEN..]);
        assert_eq!(attrs.get(&RTA_DST).unwrap().as_slice(), &[10, 0, 0, 1]);
        assert!(!attrs.contains_key(&RTA_GATEWAY));
    }

    #[test]
    fn test_encode_ipv4ll_route_metric() {
        let route = Route::ipv4ll();
        let msg = encode_request(3, &Request::NewRoute { ifindex: 2, route });

        let attrs = parse_rtattrs(&msg[NLMSG_HDR_LEN + RTMSG_LEN..]);
        let prio = attrs.get(&RTA_PRIORITY).unwrap();
        assert_eq!(u32::from_ne_bytes(prio[..4].try_into().unwrap()), 99);
    }

    #[test]
    fn test_parse_reply_error() {
        // NLMSG_ERROR carrying -EEXIST for seq 12.
        let mut msg = MessageBuilder::new(NLMSG_ERROR, 0, 12).finish();
        msg.extend_from_slice(&(-libc::EEXIST).to_ne_bytes());
        msg.extend_from_slice(&[0u8; NLMSG_HDR_LEN]); // echoed request header
        let len = msg.len() as u32;
        msg[0..4].copy_from_slice(&len.to_ne_bytes());

        let events = parse_datagram(&msg);
        assert_eq!(
            events,
            vec![RtnlEvent::Reply {
                seq: 12,
                errno: libc::EEXIST
            }]
        );
    }

    #[test]
    fn test_parse_reply_ack() {
        let mut msg = MessageBuilder::new(NLMSG_ERROR, 0, 4).finish();
        msg.extend_from_slice(&0i32.to_ne_bytes());
        msg.extend_from_slice(&[0u8; NLMSG_HDR_LEN]);
        let len = msg.len() as u32;
        msg[0..4].copy_from_slice(&len.to_ne_bytes());

        let events = parse_datagram(&msg);
        assert_eq!(events, vec![RtnlEvent::Reply { seq: 4, errno: 0 }]);
    }

    #[test]
    fn test_parse_newlink_broadcast() {
        let msg = MessageBuilder::new(RTM_NEWLINK, 0, 0)
            .ifinfomsg(3, IFF_UP | IFF_LOWER_UP, 0)
            .attr_bytes(IFLA_IFNAME, b"eth0\0")
            .attr_u32(IFLA_MTU, 1500)
            .attr_bytes(IFLA_ADDRESS, &[0x52, 0x54, 0x00, 0x12, 0x34, 0x56])
            .finish();

        let events = parse_datagram(&msg);
        assert_eq!(events.len(), 1);
        match &events[0] {
            RtnlEvent::NewLink(m) => {
                assert_eq!(m.ifindex, 3);
                assert_eq!(m.flags, IFF_UP | IFF_LOWER_UP);
                assert_eq!(m.ifname.as_deref(), Some("eth0"));
                assert_eq!(m.mtu, Some(1500));
                assert_eq!(m.mac, Some([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_parse_newlink_without_address() {
        let msg = MessageBuilder::new(RTM_NEWLINK, 0, 0)
            .ifinfomsg(2, IFF_UP, 0)
            .attr_bytes(IFLA_IFNAME, b"ens3\0")
            .finish();

        let events = parse_datagram(&msg);
        match &events[0] {
            RtnlEvent::NewLink(m) => {
                assert_eq!(m.mac, None);
                assert_eq!(m.mtu, None);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_parse_dellink() {
        let msg = MessageBuilder::new(RTM_DELLINK, 0, 0)
            .ifinfomsg(5, 0, 0)
            .finish();

        let events = parse_datagram(&msg);
        assert_eq!(events, vec![RtnlEvent::DelLink { ifindex: 5 }]);
    }

    #[test]
    fn test_parse_multiple_messages() {
        let mut data = MessageBuilder::new(RTM_NEWLINK, NLM_F_MULTI, 1)
            .ifinfomsg(2, 0, 0)
            .attr_bytes(IFLA_IFNAME, b"eth0\0")
            .finish();
        data.extend(
            MessageBuilder::new(RTM_NEWLINK, NLM_F_MULTI, 1)
                .ifinfomsg(3, 0, 0)
                .attr_bytes(IFLA_IFNAME, b"eth1\0")
                .finish(),
        );
        data.extend(MessageBuilder::new(NLMSG_DONE, NLM_F_MULTI, 1).finish());

        let events = parse_datagram(&data);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_parse_truncated() {
        assert!(parse_datagram(&[0u8; 3]).is_empty());

        // Claimed length exceeds the buffer.
        let mut msg = MessageBuilder::new(RTM_NEWLINK, 0, 0).ifinfomsg(2, 0, 0).finish();
        msg[0..4].copy_from_slice(&1000u32.to_ne_bytes());
        assert!(parse_datagram(&msg).is_empty());
    }

    #[test]
    fn test_parse_rtattrs_bad_length() {
        let mut data = [0u8; 8];
        data[0..2].copy_from_slice(&100u16.to_ne_bytes());
        data[2..4].copy_from_slice(&1u16.to_ne_bytes());
        assert!(parse_rtattrs(&data).is_empty());
    }

    #[test]
    fn test_dispatcher_pending_table() {
        let (mock, sent) = testing::MockTransport::new();
        let mut rtnl = Rtnl::new(Box::new(mock));

        rtnl.submit(
            3,
            ReplyKind::LinkUp,
            Request::SetFlags {
                ifindex: 3,
                flags: IFF_UP,
                change: IFF_UP,
            },
        )
        .unwrap();

        assert_eq!(rtnl.pending_len(), 1);
        let (seq, _) = sent.borrow()[0].clone();

        let pending = rtnl.take_pending(seq).unwrap();
        assert_eq!(pending.ifindex, 3);
        assert_eq!(pending.kind, ReplyKind::LinkUp);

        // A second claim for the same seq fails: each reply is counted once.
        assert!(rtnl.take_pending(seq).is_none());
        assert_eq!(rtnl.pending_len(), 0);
    }

    #[test]
    fn test_format_mac() {
        assert_eq!(
            format_mac(&[0xaa, 0xbb, 0xcc, 0x00, 0x11, 0x22]),
            "aa:bb:cc:00:11:22"
        );
    }
}
