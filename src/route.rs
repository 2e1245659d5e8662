//! IPv4 route descriptors.
//!
//! A [`Route`] is a value object describing one entry in the kernel FIB.
//! Like address descriptors, routes are constructed at the point of use and
//! released once the corresponding netlink request has been serialized.

use std::fmt;
use std::net::Ipv4Addr;

use crate::netlink::{RT_SCOPE_LINK, RT_SCOPE_UNIVERSE, RTPROT_DHCP, RTPROT_STATIC};

/// Metric for the on-link route that backs an IPv4LL-only configuration.
/// Higher than any normally configured route so a real uplink wins.
const IPV4LL_ROUTE_METRIC: u32 = 99;

/// What to install (or drop) in the kernel FIB. `dst == None` with
/// `dst_prefixlen == 0` is the default route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub dst: Option<Ipv4Addr>,
    pub dst_prefixlen: u8,
    pub gateway: Option<Ipv4Addr>,
    /// RT_SCOPE_*.
    pub scope: u8,
    pub metric: Option<u32>,
    /// RTPROT_* origin marker, visible in `ip route` output.
    pub protocol: u8,
}

impl Route {
    /// A route from a profile's `[Route]` section. Scope follows the gateway:
    /// gatewayed routes are universe scope, direct routes link scope.
    pub fn static_route(
        dst: Option<(Ipv4Addr, u8)>,
        gateway: Option<Ipv4Addr>,
        metric: Option<u32>,
    ) -> Self {
        let (dst, dst_prefixlen) = match dst {
            Some((d, p)) => (Some(d), p),
            None => (None, 0),
        };
        Self {
            dst,
            dst_prefixlen,
            gateway,
            scope: if gateway.is_some() {
                RT_SCOPE_UNIVERSE
            } else {
                RT_SCOPE_LINK
            },
            metric,
            protocol: RTPROT_STATIC,
        }
    }

    /// The on-link route installed alongside an IPv4LL-only configuration.
    pub fn ipv4ll() -> Self {
        Self {
            dst: None,
            dst_prefixlen: 0,
            gateway: None,
            scope: RT_SCOPE_LINK,
            metric: Some(IPV4LL_ROUTE_METRIC),
            protocol: RTPROT_STATIC,
        }
    }

    /// Host route to the DHCP gateway. The lease's netmask may mask the
    /// gateway out, so this goes in before the default route to make the
    /// gateway resolvable regardless of the netmask or existing tables.
    pub fn dhcp_gateway_host(gateway: Ipv4Addr) -> Self {
        Self {
            dst: Some(gateway),
            dst_prefixlen: 32,
            gateway: None,
            scope: RT_SCOPE_LINK,
            metric: None,
            protocol: RTPROT_DHCP,
        }
    }

    /// Default route via the DHCP gateway.
    pub fn dhcp_default(gateway: Ipv4Addr) -> Self {
        Self {
            dst: None,
            dst_prefixlen: 0,
            gateway: Some(gateway),
            scope: RT_SCOPE_UNIVERSE,
            metric: None,
            protocol: RTPROT_DHCP,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.dst {
            Some(dst) => write!(f, "{}/{}", dst, self.dst_prefixlen)?,
            None => write!(f, "default")?,
        }
        if let Some(gw) = self.gateway {
            write!(f, " via {gw}")?;
        }
        if let Some(metric) = self.metric {
            write!(f, " metric {metric}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
