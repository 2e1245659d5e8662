//! Per-link configuration state machine.
//!
//! One [`Link`] exists for every interface the kernel reports. A link that
//! matches a profile is driven through a linear progression:
//!
//! ```text
//! INITIALIZING → ENSLAVING → SETTING_ADDRESSES → SETTING_ROUTES → CONFIGURED
//! ```
//!
//! with FAILED reachable from every step. Each phase submits its netlink
//! requests up front and counts outstanding replies; the counter reaching
//! zero advances the machine. A DHCP renewal with a changed address loops a
//! configured link back through SETTING_ADDRESSES, and the route reply
//! handler guards against acknowledgements left over from the abandoned
//! cycle.
//!
//! All of this runs on one event loop thread; handlers never block and never
//! propagate errors upward. They log, and fail the link when the error is
//! not recoverable.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use crate::address::{Address, broadcast_address};
use crate::config::Network;
use crate::dhcp::{DhcpClient, DhcpEvent, DhcpLease};
use crate::hostname::Hostnamed;
use crate::ipv4ll::{self, Ipv4llClient, Ipv4llEvent};
use crate::manager::UdevDevice;
use crate::netlink::{
    self, IFF_DORMANT, IFF_LOWER_UP, IFF_MASTER, IFF_SLAVE, IFF_UP, LinkMessage, ReplyKind,
    Request, Rtnl,
};
use crate::route::Route;
use crate::state;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Where a link is in its configuration lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Created from RTM_NEWLINK; not yet matched against a profile.
    Initializing,
    /// Attaching to bridge/bond/VLAN/MACVLAN masters.
    Enslaving,
    /// RTM_NEWADDR requests in flight.
    SettingAddresses,
    /// RTM_NEWROUTE requests in flight.
    SettingRoutes,
    /// All requested configuration is installed.
    Configured,
    /// Terminal; only teardown leaves this state.
    Failed,
}

impl LinkState {
    /// The public label written to the state file. Every state before
    /// CONFIGURED reads as "configuring".
    pub fn label(self) -> &'static str {
        match self {
            Self::Initializing | Self::Enslaving | Self::SettingAddresses | Self::SettingRoutes => {
                "configuring"
            }
            Self::Configured => "configured",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Shared manager resources a link needs while handling an event: the
/// netlink dispatcher to submit requests, the hostname service, and the
/// name → ifindex map of possible enslavement masters.
pub struct LinkCtx<'a> {
    pub rtnl: &'a mut Rtnl,
    pub hostnamed: &'a Hostnamed,
    pub netdevs: &'a HashMap<String, i32>,
}

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

/// A kernel network interface and its configuration progress.
#[derive(Debug)]
pub struct Link {
    /// Kernel interface index; positive, primary key in the registry.
    pub ifindex: i32,

    /// Interface name; the kernel may rename it while we hold the link.
    pub ifname: String,

    /// Hardware address, once a kernel message has carried one.
    pub mac: Option<[u8; 6]>,

    /// Last seen IFF_* flags.
    pub flags: u32,

    /// First MTU ever observed, restored when a DHCP lease that changed the
    /// MTU goes away. Latched exactly once.
    pub original_mtu: Option<u32>,

    pub state: LinkState,

    /// The matched profile; set at most once, for the link's lifetime.
    pub network: Option<Network>,

    /// udev device backing this interface, absent in containers.
    pub udev_device: Option<UdevDevice>,

    pub dhcp_client: Option<DhcpClient>,
    pub ipv4ll: Option<Ipv4llClient>,

    /// The lease whose address/routes are currently installed.
    pub dhcp_lease: Option<DhcpLease>,

    /// Outstanding enslave acknowledgements.
    pub enslaving: u32,
    /// Outstanding RTM_NEWADDR acknowledgements.
    pub addr_messages: u32,
    /// Outstanding RTM_NEWROUTE acknowledgements.
    pub route_messages: u32,

    /// Status file, `<links dir>/<ifindex>`.
    pub state_file: PathBuf,
    /// Lease snapshot file, `<leases dir>/<ifindex>`.
    pub lease_file: PathBuf,
}

impl Link {
    /// Build a link from an RTM_NEWLINK message. Rejects other message
    /// types, non-positive interface indices and messages without a name.
    pub fn new(msg: &LinkMessage, links_dir: &Path, leases_dir: &Path) -> io::Result<Self> {
        if msg.msg_type != netlink::RTM_NEWLINK {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        if msg.ifindex <= 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let ifname = msg
            .ifname
            .clone()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;

        Ok(Self {
            ifindex: msg.ifindex,
            ifname,
            mac: None,
            flags: 0,
            original_mtu: None,
            state: LinkState::Initializing,
            network: None,
            udev_device: None,
            dhcp_client: None,
            ipv4ll: None,
            dhcp_lease: None,
            enslaving: 0,
            addr_messages: 0,
            route_messages: 0,
            state_file: links_dir.join(msg.ifindex.to_string()),
            lease_file: leases_dir.join(msg.ifindex.to_string()),
        })
    }

    // -----------------------------------------------------------------------
    // Initialization
    // -----------------------------------------------------------------------

    /// Match the link against the profile set and start configuring it.
    ///
    /// Idempotent once the link has left INITIALIZING. A link that matches
    /// no profile stays unmanaged: flags keep being tracked, nothing is
    /// configured.
    pub fn initialized(
        &mut self,
        device: Option<UdevDevice>,
        networks: &[Network],
        ctx: &mut LinkCtx,
    ) -> io::Result<()> {
        if self.state != LinkState::Initializing {
            return Ok(());
        }

        if let Some(device) = device {
            self.udev_device = Some(device);
        }

        log::debug!("{}: link initialized", self.ifname);

        let mac = self.mac.map(|m| netlink::format_mac(&m));
        let driver = self.udev_device.as_ref().and_then(|d| d.driver());
        let path = self.udev_device.as_ref().and_then(|d| d.device_path());

        let network = networks
            .iter()
            .find(|n| n.match_section.matches(&self.ifname, mac.as_deref(), driver, path));

        let Some(network) = network else {
            return Ok(());
        };

        log::info!(
            "{}: matched profile {}",
            self.ifname,
            network.path.display()
        );
        self.network = Some(network.clone());

        self.configure(ctx)?;

        // Re-apply the flags seen so far so every edge handler fires against
        // the now-attached profile.
        let flags = self.flags;
        self.flags = 0;
        self.update_flags(flags);

        Ok(())
    }

    /// Instantiate the dynamic clients the profile asks for, then begin the
    /// enslavement phase.
    fn configure(&mut self, ctx: &mut LinkCtx) -> io::Result<()> {
        let Some(network) = self.network.as_ref() else {
            return Ok(());
        };
        let wants_ipv4ll = network.ipv4ll;
        let wants_dhcp = network.dhcp;
        let request_mtu = network.dhcp_mtu;
        let hostname = network.hostname.clone().or_else(|| {
            if network.send_hostname {
                nix::unistd::gethostname()
                    .ok()
                    .and_then(|h| h.into_string().ok())
            } else {
                None
            }
        });

        if wants_ipv4ll {
            let mut client = Ipv4llClient::new(self.ifindex);
            if let Some(data) = self
                .udev_device
                .as_ref()
                .and_then(|d| d.predictable_data())
            {
                client.set_seed(ipv4ll::seed_from_device_data(data));
            }
            if let Some(mac) = self.mac {
                client.set_mac(mac)?;
            }
            self.ipv4ll = Some(client);
        }

        if wants_dhcp {
            let mut client = DhcpClient::new(self.ifindex);
            if let Some(mac) = self.mac {
                client.set_mac(mac)?;
            }
            client.set_hostname(hostname);
            if request_mtu {
                client.set_request_mtu(true);
            }
            self.dhcp_client = Some(client);
        }

        self.enter_enslave(ctx)
    }

    // -----------------------------------------------------------------------
    // Enslavement phase
    // -----------------------------------------------------------------------

    fn enter_enslave(&mut self, ctx: &mut LinkCtx) -> io::Result<()> {
        self.state = LinkState::Enslaving;
        self.save();

        let names: Vec<String> = self
            .network
            .as_ref()
            .map(|n| n.netdev_names().iter().map(|s| s.to_string()).collect())
            .unwrap_or_default();

        if names.is_empty() {
            return self.enslaved(ctx);
        }

        for name in names {
            let Some(&master) = ctx.netdevs.get(&name) else {
                log::warn!("{}: could not enslave by '{}': no such device", self.ifname, name);
                self.enter_failed();
                return Err(io::Error::from_raw_os_error(libc::ENODEV));
            };

            log::debug!("{}: enslaving by '{}'", self.ifname, name);

            if let Err(e) = ctx.rtnl.submit(
                self.ifindex,
                ReplyKind::Enslave,
                Request::SetMaster {
                    ifindex: self.ifindex,
                    master,
                },
            ) {
                log::warn!("{}: could not enslave by '{}': {}", self.ifname, name, e);
                self.enter_failed();
                return Err(e);
            }

            self.enslaving += 1;
        }

        Ok(())
    }

    fn enslave_handler(&mut self, errno: i32, ctx: &mut LinkCtx) {
        self.enslaving = self.enslaving.saturating_sub(1);

        if self.state == LinkState::Failed {
            return;
        }

        if errno != 0 {
            log::error!(
                "{}: could not enslave: {}",
                self.ifname,
                io::Error::from_raw_os_error(errno)
            );
            self.enter_failed();
            return;
        }

        log::debug!("{}: enslaved", self.ifname);

        if self.enslaving == 0 && self.state == LinkState::Enslaving {
            let _ = self.enslaved(ctx);
        }
    }

    /// All masters attached: bring the interface up, and for a purely static
    /// profile proceed straight to address installation. Static
    /// configuration does not wait for carrier.
    fn enslaved(&mut self, ctx: &mut LinkCtx) -> io::Result<()> {
        if self.flags & IFF_UP == 0
            && let Err(e) = self.link_up(ctx)
        {
            self.enter_failed();
            return Err(e);
        }

        let (dhcp, ll) = match self.network.as_ref() {
            Some(n) => (n.dhcp, n.ipv4ll),
            None => (false, false),
        };

        if !dhcp && !ll {
            return self.enter_set_addresses(ctx);
        }

        Ok(())
    }

    fn link_up(&mut self, ctx: &mut LinkCtx) -> io::Result<()> {
        log::debug!("{}: bringing link up", self.ifname);

        ctx.rtnl
            .submit(
                self.ifindex,
                ReplyKind::LinkUp,
                Request::SetFlags {
                    ifindex: self.ifindex,
                    flags: IFF_UP,
                    change: IFF_UP,
                },
            )
            .inspect_err(|e| {
                log::error!("{}: could not send rtnetlink message: {}", self.ifname, e);
            })
    }

    fn link_up_handler(&mut self, errno: i32) {
        if self.state == LinkState::Failed {
            return;
        }

        if errno == 0 {
            let flags = self.flags | IFF_UP;
            self.update_flags(flags);
        } else {
            log::warn!(
                "{}: could not bring up interface: {}",
                self.ifname,
                io::Error::from_raw_os_error(errno)
            );
        }
    }

    // -----------------------------------------------------------------------
    // Flag updates and carrier edges
    // -----------------------------------------------------------------------

    /// Fold a new flag word into the link and react to carrier edges.
    ///
    /// Carrier means `LOWER_UP && !DORMANT`; gaining it starts the enabled
    /// dynamic clients, losing it stops them. Flags are always recorded, even
    /// for unmanaged links, so a profile attached later sees current state.
    pub fn update_flags(&mut self, flags: u32) {
        if self.state == LinkState::Failed {
            return;
        }

        if self.flags == flags {
            return;
        }

        let added = (self.flags ^ flags) & flags;
        let removed = (self.flags ^ flags) & self.flags;

        let carrier_gained = (added & IFF_LOWER_UP != 0 && flags & IFF_DORMANT == 0)
            || (removed & IFF_DORMANT != 0 && flags & IFF_LOWER_UP != 0);
        let carrier_lost = (self.flags & IFF_LOWER_UP != 0 && self.flags & IFF_DORMANT == 0)
            && (removed & IFF_LOWER_UP != 0 || added & IFF_DORMANT != 0);

        self.flags = flags;

        let (dhcp, ll) = match self.network.as_ref() {
            Some(n) => (n.dhcp, n.ipv4ll),
            // Not currently managing this link; state changes are tracked
            // but acted on only once a profile is applied.
            None => return,
        };

        if added & IFF_UP != 0 {
            log::info!("{}: link is up", self.ifname);
        } else if removed & IFF_UP != 0 {
            log::info!("{}: link is down", self.ifname);
        }

        if added & IFF_LOWER_UP != 0 {
            log::debug!("{}: link is lower up", self.ifname);
        } else if removed & IFF_LOWER_UP != 0 {
            log::debug!("{}: link is lower down", self.ifname);
        }

        if added & IFF_DORMANT != 0 {
            log::debug!("{}: link is dormant", self.ifname);
        } else if removed & IFF_DORMANT != 0 {
            log::debug!("{}: link is not dormant", self.ifname);
        }

        if added & IFF_MASTER != 0 {
            log::debug!("{}: link is master", self.ifname);
        }
        if added & IFF_SLAVE != 0 {
            log::debug!("{}: link is slave", self.ifname);
        }

        if carrier_gained {
            log::info!("{}: gained carrier", self.ifname);

            if (dhcp || ll) && let Err(e) = self.acquire_conf() {
                log::warn!("{}: could not acquire configuration: {}", self.ifname, e);
                self.enter_failed();
            }
        } else if carrier_lost {
            log::info!("{}: lost carrier", self.ifname);

            if dhcp
                && let Some(client) = self.dhcp_client.as_mut()
                && let Err(e) = client.stop()
            {
                log::warn!("{}: could not stop DHCPv4 client: {}", self.ifname, e);
                self.enter_failed();
                return;
            }

            if ll
                && let Some(client) = self.ipv4ll.as_mut()
                && let Err(e) = client.stop()
            {
                log::warn!("{}: could not stop IPv4 link-local: {}", self.ifname, e);
                self.enter_failed();
            }
        }
    }

    /// Start whichever dynamic clients the profile enables.
    fn acquire_conf(&mut self) -> io::Result<()> {
        let (dhcp, ll) = match self.network.as_ref() {
            Some(n) => (n.dhcp, n.ipv4ll),
            None => return Ok(()),
        };

        if ll {
            let client = self
                .ipv4ll
                .as_mut()
                .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
            log::debug!("{}: acquiring IPv4 link-local address", self.ifname);
            client.start()?;
        }

        if dhcp {
            let client = self
                .dhcp_client
                .as_mut()
                .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
            log::debug!("{}: acquiring DHCPv4 lease", self.ifname);
            client.start()?;
        }

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Address phase
    // -----------------------------------------------------------------------

    fn enter_set_addresses(&mut self, ctx: &mut LinkCtx) -> io::Result<()> {
        self.state = LinkState::SettingAddresses;
        self.save();

        let static_addresses = self
            .network
            .as_ref()
            .map(|n| n.addresses.clone())
            .unwrap_or_default();
        // A bound link-local address is only installed while no lease is
        // held; DHCP supersedes it.
        let ll_address = if self.dhcp_lease.is_none() {
            self.ipv4ll.as_ref().and_then(|c| c.address())
        } else {
            None
        };
        let lease = self
            .dhcp_lease
            .as_ref()
            .map(|l| (l.address, l.netmask));

        if static_addresses.is_empty() && ll_address.is_none() && lease.is_none() {
            return self.enter_set_routes(ctx);
        }

        log::debug!("{}: setting addresses", self.ifname);

        for ad in static_addresses {
            let mut address = Address::new(ad.address, ad.prefixlen);
            address.broadcast =
                Some(ad.broadcast.unwrap_or_else(|| broadcast_address(ad.address, ad.prefixlen)));
            self.submit_address(address, ctx)?;
        }

        if let Some(addr) = ll_address {
            self.submit_address(Address::ipv4ll(addr), ctx)?;
        }

        if let Some((addr, netmask)) = lease {
            self.submit_address(Address::from_lease(addr, netmask), ctx)?;
        }

        Ok(())
    }

    fn submit_address(&mut self, address: Address, ctx: &mut LinkCtx) -> io::Result<()> {
        log::debug!("{}: adding address {}", self.ifname, address);

        if let Err(e) = ctx.rtnl.submit(
            self.ifindex,
            ReplyKind::NewAddress,
            Request::NewAddress {
                ifindex: self.ifindex,
                address,
            },
        ) {
            log::warn!("{}: could not set addresses: {}", self.ifname, e);
            self.enter_failed();
            return Err(e);
        }

        self.addr_messages += 1;
        Ok(())
    }

    fn address_handler(&mut self, errno: i32, ctx: &mut LinkCtx) {
        self.addr_messages = self.addr_messages.saturating_sub(1);

        if self.state == LinkState::Failed {
            return;
        }

        // The address may already exist; that is success for our purposes.
        if errno != 0 && errno != libc::EEXIST {
            log::warn!(
                "{}: could not set address: {}",
                self.ifname,
                io::Error::from_raw_os_error(errno)
            );
        }

        if self.addr_messages == 0 && self.state == LinkState::SettingAddresses {
            log::debug!("{}: addresses set", self.ifname);
            let _ = self.enter_set_routes(ctx);
        }
    }

    fn address_update_handler(&mut self, errno: i32) {
        if self.state == LinkState::Failed {
            return;
        }

        if errno != 0 && errno != libc::ENOENT {
            log::warn!(
                "{}: could not update address: {}",
                self.ifname,
                io::Error::from_raw_os_error(errno)
            );
        }
    }

    fn address_drop_handler(&mut self, errno: i32) {
        if self.state == LinkState::Failed {
            return;
        }

        if errno != 0 && errno != libc::ENOENT {
            log::warn!(
                "{}: could not drop address: {}",
                self.ifname,
                io::Error::from_raw_os_error(errno)
            );
        }
    }

    // -----------------------------------------------------------------------
    // Route phase
    // -----------------------------------------------------------------------

    fn enter_set_routes(&mut self, ctx: &mut LinkCtx) -> io::Result<()> {
        self.state = LinkState::SettingRoutes;
        self.save();

        let static_routes = self
            .network
            .as_ref()
            .map(|n| n.routes.clone())
            .unwrap_or_default();
        let ll_bound = self.dhcp_lease.is_none()
            && self.ipv4ll.as_ref().is_some_and(|c| c.is_bound());
        let has_lease = self.dhcp_lease.is_some();

        if static_routes.is_empty() && !ll_bound && !has_lease {
            self.enter_configured();
            return Ok(());
        }

        log::debug!("{}: setting routes", self.ifname);

        for rt in static_routes {
            let route = Route::static_route(rt.destination, rt.gateway, rt.metric);
            self.submit_route(route, ctx)?;
        }

        if ll_bound {
            self.submit_route(Route::ipv4ll(), ctx)?;
        }

        if has_lease {
            let gateway = self.dhcp_lease.as_ref().and_then(|l| l.router);
            let Some(gateway) = gateway else {
                log::warn!("{}: DHCP error: no router", self.ifname);
                return Err(io::Error::from_raw_os_error(libc::ENOENT));
            };

            // Host route first so the default route can resolve the gateway
            // even when the lease's netmask masks it out.
            self.submit_route(Route::dhcp_gateway_host(gateway), ctx)?;
            self.submit_route(Route::dhcp_default(gateway), ctx)?;
        }

        Ok(())
    }

    fn submit_route(&mut self, route: Route, ctx: &mut LinkCtx) -> io::Result<()> {
        log::debug!("{}: adding route {}", self.ifname, route);

        if let Err(e) = ctx.rtnl.submit(
            self.ifindex,
            ReplyKind::NewRoute,
            Request::NewRoute {
                ifindex: self.ifindex,
                route,
            },
        ) {
            log::warn!("{}: could not set routes: {}", self.ifname, e);
            self.enter_failed();
            return Err(e);
        }

        self.route_messages += 1;
        Ok(())
    }

    fn route_handler(&mut self, errno: i32) {
        self.route_messages = self.route_messages.saturating_sub(1);

        if self.state == LinkState::Failed {
            return;
        }

        if errno != 0 && errno != libc::EEXIST {
            log::warn!(
                "{}: could not set route: {}",
                self.ifname,
                io::Error::from_raw_os_error(errno)
            );
        }

        // A DHCP renewal may have moved the link back to SETTING_ADDRESSES
        // while replies from the abandoned cycle were still in flight; those
        // are counted but must not advance the state machine.
        if self.route_messages == 0 && self.state == LinkState::SettingRoutes {
            log::debug!("{}: routes set", self.ifname);
            self.enter_configured();
        }
    }

    fn route_drop_handler(&mut self, errno: i32) {
        if self.state == LinkState::Failed {
            return;
        }

        if errno != 0 && errno != libc::ENOENT {
            log::warn!(
                "{}: could not drop route: {}",
                self.ifname,
                io::Error::from_raw_os_error(errno)
            );
        }
    }

    // -----------------------------------------------------------------------
    // Terminal states
    // -----------------------------------------------------------------------

    fn enter_configured(&mut self) {
        log::info!("{}: link configured", self.ifname);

        self.state = LinkState::Configured;
        self.save();
    }

    pub fn enter_failed(&mut self) {
        log::warn!("{}: failed", self.ifname);

        self.state = LinkState::Failed;
        self.save();
    }

    // -----------------------------------------------------------------------
    // MTU
    // -----------------------------------------------------------------------

    fn set_mtu(&mut self, mtu: u32, ctx: &mut LinkCtx) -> io::Result<()> {
        log::debug!("{}: setting MTU: {}", self.ifname, mtu);

        ctx.rtnl
            .submit(
                self.ifindex,
                ReplyKind::SetMtu,
                Request::SetMtu {
                    ifindex: self.ifindex,
                    mtu,
                },
            )
            .inspect_err(|e| {
                log::error!("{}: could not send rtnetlink message: {}", self.ifname, e);
            })
    }

    fn set_mtu_handler(&mut self, errno: i32) {
        if self.state == LinkState::Failed {
            return;
        }

        if errno != 0 {
            log::warn!(
                "{}: could not set MTU: {}",
                self.ifname,
                io::Error::from_raw_os_error(errno)
            );
        }
    }

    // -----------------------------------------------------------------------
    // DHCP integration
    // -----------------------------------------------------------------------

    /// React to a DHCPv4 engine event.
    pub fn dhcp_event(&mut self, event: DhcpEvent, ctx: &mut LinkCtx) {
        if self.state == LinkState::Failed {
            return;
        }

        let (critical, ll_enabled) = match self.network.as_ref() {
            Some(n) => (n.dhcp_critical, n.ipv4ll),
            None => return,
        };

        match event {
            DhcpEvent::NoLease => log::debug!("{}: IP address in use", self.ifname),

            DhcpEvent::Expired | DhcpEvent::Stop | DhcpEvent::IpChange => {
                if critical {
                    log::error!(
                        "{}: DHCPv4 connection considered system critical, \
                         ignoring request to reconfigure it",
                        self.ifname
                    );
                    return;
                }

                if self.dhcp_lease.is_some() && self.dhcp_lease_lost(ctx).is_err() {
                    self.enter_failed();
                    return;
                }

                if event == DhcpEvent::IpChange && self.dhcp_lease_acquired(ctx).is_err() {
                    self.enter_failed();
                    return;
                }

                if event == DhcpEvent::Expired && ll_enabled {
                    let (running, bound) = self
                        .ipv4ll
                        .as_ref()
                        .map(|c| (c.is_running(), c.is_bound()))
                        .unwrap_or((false, false));

                    let r = if !running {
                        self.ipv4ll.as_mut().map(|c| c.start()).unwrap_or(Ok(()))
                    } else if bound {
                        self.ipv4ll_address_update(false, ctx)
                    } else {
                        Ok(())
                    };

                    if r.is_err() {
                        self.enter_failed();
                    }
                }
            }

            DhcpEvent::IpAcquire => {
                if self.dhcp_lease_acquired(ctx).is_err() {
                    self.enter_failed();
                    return;
                }

                if self.ipv4ll.is_some() {
                    let bound = self.ipv4ll.as_ref().is_some_and(|c| c.is_bound());
                    let r = if bound {
                        // The link-local address stays installed but is
                        // deprecated while the lease is preferred.
                        self.ipv4ll_address_update(true, ctx)
                    } else {
                        self.ipv4ll.as_mut().map(|c| c.stop()).unwrap_or(Ok(()))
                    };
                    if r.is_err() {
                        self.enter_failed();
                    }
                }
            }

            DhcpEvent::Error(e) => {
                log::warn!(
                    "{}: DHCP error: {}",
                    self.ifname,
                    io::Error::from_raw_os_error(-e)
                );
            }
        }
    }

    /// Adopt the lease the client holds and reconfigure addresses/routes.
    fn dhcp_lease_acquired(&mut self, ctx: &mut LinkCtx) -> io::Result<()> {
        let Some(lease) = self.dhcp_client.as_ref().and_then(|c| c.lease()).cloned() else {
            log::warn!("{}: DHCP error: no lease", self.ifname);
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        };

        let Some(router) = lease.router else {
            log::warn!("{}: DHCP error: no router", self.ifname);
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        };

        log::info!(
            "{}: DHCPv4 address {}/{} via {}",
            self.ifname,
            lease.address,
            lease.prefixlen(),
            router,
        );

        let (dhcp_mtu, dhcp_hostname) = self
            .network
            .as_ref()
            .map(|n| (n.dhcp_mtu, n.dhcp_hostname))
            .unwrap_or((false, false));

        let mtu = lease.mtu;
        let hostname = lease.hostname.clone();
        self.dhcp_lease = Some(lease);

        if dhcp_mtu
            && let Some(mtu) = mtu
            && let Err(e) = self.set_mtu(mtu, ctx)
        {
            log::error!("{}: failed to set MTU to {}: {}", self.ifname, mtu, e);
        }

        if dhcp_hostname
            && let Some(hostname) = hostname
            && let Err(e) = ctx.hostnamed.set_hostname(&hostname)
        {
            log::error!(
                "{}: failed to set transient hostname to '{}': {}",
                self.ifname,
                hostname,
                e
            );
        }

        self.enter_set_addresses(ctx)
    }

    /// Tear down everything the lease installed: the address, the gateway
    /// host route, the default route, an adopted MTU, and the transient
    /// hostname. Teardown is best effort; only a failed MTU reset fails
    /// the link.
    fn dhcp_lease_lost(&mut self, ctx: &mut LinkCtx) -> io::Result<()> {
        log::warn!("{}: DHCP lease lost", self.ifname);

        let Some(lease) = self.dhcp_lease.take() else {
            return Ok(());
        };

        if let Some(gateway) = lease.router {
            self.drop_route(Route::dhcp_gateway_host(gateway), ctx);
            self.drop_route(Route::dhcp_default(gateway), ctx);
        }

        self.drop_address(Address::from_lease(lease.address, lease.netmask), ctx);

        let dhcp_mtu = self.network.as_ref().is_some_and(|n| n.dhcp_mtu);
        if dhcp_mtu
            && let Some(lease_mtu) = lease.mtu
            && let Some(original) = self.original_mtu
            && original != lease_mtu
            && let Err(e) = self.set_mtu(original, ctx)
        {
            log::warn!("{}: DHCP error: could not reset MTU", self.ifname);
            self.enter_failed();
            return Err(e);
        }

        let dhcp_hostname = self.network.as_ref().is_some_and(|n| n.dhcp_hostname);
        if dhcp_hostname
            && lease.hostname.is_some()
            && ctx.hostnamed.set_hostname("").is_err()
        {
            log::error!("{}: failed to reset transient hostname", self.ifname);
        }

        Ok(())
    }

    fn drop_address(&mut self, address: Address, ctx: &mut LinkCtx) {
        log::debug!("{}: dropping address {}", self.ifname, address);

        if let Err(e) = ctx.rtnl.submit(
            self.ifindex,
            ReplyKind::DropAddress,
            Request::DelAddress {
                ifindex: self.ifindex,
                address,
            },
        ) {
            log::warn!("{}: could not drop address: {}", self.ifname, e);
        }
    }

    fn drop_route(&mut self, route: Route, ctx: &mut LinkCtx) {
        log::debug!("{}: dropping route {}", self.ifname, route);

        if let Err(e) = ctx.rtnl.submit(
            self.ifindex,
            ReplyKind::DropRoute,
            Request::DelRoute {
                ifindex: self.ifindex,
                route,
            },
        ) {
            log::warn!("{}: could not drop route: {}", self.ifname, e);
        }
    }

    // -----------------------------------------------------------------------
    // IPv4LL integration
    // -----------------------------------------------------------------------

    /// React to an IPv4LL engine event.
    pub fn ipv4ll_event(&mut self, event: Ipv4llEvent, ctx: &mut LinkCtx) {
        match event {
            Ipv4llEvent::Stop | Ipv4llEvent::Conflict => {
                if self.ipv4ll_address_lost(ctx).is_err() {
                    self.enter_failed();
                }
            }
            Ipv4llEvent::Bind => {
                if self.ipv4ll_address_claimed(ctx).is_err() {
                    self.enter_failed();
                }
            }
            Ipv4llEvent::Error(e) => {
                log::warn!(
                    "{}: IPv4 link-local error: {}",
                    self.ifname,
                    io::Error::from_raw_os_error(-e)
                );
            }
        }
    }

    fn ipv4ll_address_claimed(&mut self, ctx: &mut LinkCtx) -> io::Result<()> {
        let address = self
            .ipv4ll
            .as_ref()
            .and_then(|c| c.address())
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;

        log::info!("{}: IPv4 link-local address {}", self.ifname, address);

        self.enter_set_addresses(ctx)
    }

    fn ipv4ll_address_lost(&mut self, ctx: &mut LinkCtx) -> io::Result<()> {
        let Some(address) = self.ipv4ll.as_mut().and_then(|c| c.take_address()) else {
            return Ok(());
        };

        log::debug!("{}: IPv4 link-local release {}", self.ifname, address);

        self.drop_address(Address::ipv4ll(address), ctx);
        self.drop_route(Route::ipv4ll(), ctx);

        Ok(())
    }

    /// Reissue the installed link-local address with a new preferred
    /// lifetime: 0 while a DHCP lease supersedes it, infinite when the lease
    /// goes away and the address becomes primary again.
    fn ipv4ll_address_update(&mut self, deprecate: bool, ctx: &mut LinkCtx) -> io::Result<()> {
        let Some(address) = self.ipv4ll.as_ref().and_then(|c| c.address()) else {
            return Ok(());
        };

        log::debug!(
            "{}: IPv4 link-local {} {}",
            self.ifname,
            if deprecate { "deprecate" } else { "approve" },
            address
        );

        if let Err(e) = ctx.rtnl.submit(
            self.ifindex,
            ReplyKind::UpdateAddress,
            Request::UpdateAddress {
                ifindex: self.ifindex,
                address: Address::ipv4ll_lifetime(address, deprecate),
            },
        ) {
            log::warn!("{}: could not update address: {}", self.ifname, e);
        }

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Kernel updates
    // -----------------------------------------------------------------------

    /// Fold a fresh RTM_NEWLINK into the link: rename, MTU latch, MAC
    /// propagation to the dynamic clients, then flag edges. A MAC change the
    /// clients cannot absorb is fatal for the link; the caller handles the
    /// error.
    pub fn update(&mut self, msg: &LinkMessage) -> io::Result<()> {
        if self.state == LinkState::Failed {
            return Ok(());
        }

        if let Some(ref ifname) = msg.ifname
            && *ifname != self.ifname
        {
            log::info!("{}: renamed to {}", self.ifname, ifname);
            self.ifname = ifname.clone();
        }

        if self.original_mtu.is_none()
            && let Some(mtu) = msg.mtu
        {
            self.original_mtu = Some(mtu);
            log::debug!("{}: saved original MTU: {}", self.ifname, mtu);
        }

        // The kernel may broadcast NEWLINK messages without the MAC address
        // set; those must not clobber the recorded one.
        if let Some(mac) = msg.mac
            && Some(mac) != self.mac
        {
            self.mac = Some(mac);
            log::debug!("{}: MAC address: {}", self.ifname, netlink::format_mac(&mac));

            if let Some(client) = self.ipv4ll.as_mut()
                && let Err(e) = client.set_mac(mac)
            {
                log::warn!(
                    "{}: could not update MAC address in IPv4LL client: {}",
                    self.ifname,
                    e
                );
                return Err(e);
            }

            if let Some(client) = self.dhcp_client.as_mut()
                && let Err(e) = client.set_mac(mac)
            {
                log::warn!(
                    "{}: could not update MAC address in DHCP client: {}",
                    self.ifname,
                    e
                );
                return Err(e);
            }
        }

        self.update_flags(msg.flags);

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reply dispatch
    // -----------------------------------------------------------------------

    /// Route an acknowledged request to its handler.
    pub fn handle_reply(&mut self, kind: ReplyKind, errno: i32, ctx: &mut LinkCtx) {
        match kind {
            ReplyKind::Enslave => self.enslave_handler(errno, ctx),
            ReplyKind::LinkUp => self.link_up_handler(errno),
            ReplyKind::SetMtu => self.set_mtu_handler(errno),
            ReplyKind::NewAddress => self.address_handler(errno, ctx),
            ReplyKind::UpdateAddress => self.address_update_handler(errno),
            ReplyKind::DropAddress => self.address_drop_handler(errno),
            ReplyKind::NewRoute => self.route_handler(errno),
            ReplyKind::DropRoute => self.route_drop_handler(errno),
        }
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Write the state file (and lease snapshot) for external observers.
    pub fn save(&self) {
        let mut content = String::new();
        content.push_str("# This is private data. Do not parse.\n");
        content.push_str(&format!("STATE={}\n", self.state.label()));

        if let Some(ref lease) = self.dhcp_lease {
            match lease.save(&self.lease_file) {
                Ok(()) => {
                    content.push_str(&format!("DHCP_LEASE={}\n", self.lease_file.display()));
                }
                Err(e) => {
                    log::warn!(
                        "{}: could not save lease file {}: {}",
                        self.ifname,
                        self.lease_file.display(),
                        e
                    );
                }
            }
        }

        if let Err(e) = state::atomic_write(&self.state_file, &content) {
            log::error!(
                "Failed to save link data {}: {}",
                self.state_file.display(),
                e
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_network;
    use crate::netlink::RTM_DELLINK;
    use std::fs;

    fn newlink(ifindex: i32, flags: u32, ifname: &str) -> LinkMessage {
        LinkMessage {
            msg_type: netlink::RTM_NEWLINK,
            ifindex,
            flags,
            ifname: Some(ifname.to_string()),
            mtu: None,
            mac: None,
        }
    }

    fn make_link(dir: &Path) -> Link {
        Link::new(
            &newlink(3, 0, "eth0"),
            &dir.join("links"),
            &dir.join("leases"),
        )
        .unwrap()
    }

    fn profile(content: &str) -> Network {
        parse_network(content, Path::new("test.network"))
    }

    #[test]
    fn test_state_labels() {
        assert_eq!(LinkState::Initializing.label(), "configuring");
        assert_eq!(LinkState::Enslaving.label(), "configuring");
        assert_eq!(LinkState::SettingAddresses.label(), "configuring");
        assert_eq!(LinkState::SettingRoutes.label(), "configuring");
        assert_eq!(LinkState::Configured.label(), "configured");
        assert_eq!(LinkState::Failed.label(), "failed");
    }

    #[test]
    fn test_new_rejects_wrong_type() {
        let mut msg = newlink(3, 0, "eth0");
        msg.msg_type = RTM_DELLINK;

        let err = Link::new(&msg, Path::new("/tmp/l"), Path::new("/tmp/e")).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }

    #[test]
    fn test_new_rejects_bad_ifindex() {
        for ifindex in [0, -1] {
            let msg = newlink(ifindex, 0, "eth0");
            let err = Link::new(&msg, Path::new("/tmp/l"), Path::new("/tmp/e")).unwrap_err();
            assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
        }
    }

    #[test]
    fn test_new_rejects_missing_name() {
        let mut msg = newlink(3, 0, "eth0");
        msg.ifname = None;

        let err = Link::new(&msg, Path::new("/tmp/l"), Path::new("/tmp/e")).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }

    #[test]
    fn test_state_file_path_derived_from_ifindex() {
        let dir = tempfile::tempdir().unwrap();
        let link = make_link(dir.path());
        assert!(link.state_file.ends_with("links/3"));
        assert!(link.lease_file.ends_with("leases/3"));
    }

    #[test]
    fn test_update_latches_original_mtu_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut link = make_link(dir.path());

        let mut msg = newlink(3, 0, "eth0");
        msg.mtu = Some(1500);
        link.update(&msg).unwrap();
        assert_eq!(link.original_mtu, Some(1500));

        msg.mtu = Some(9000);
        link.update(&msg).unwrap();
        assert_eq!(link.original_mtu, Some(1500));
    }

    #[test]
    fn test_update_without_mac_keeps_recorded_mac() {
        let dir = tempfile::tempdir().unwrap();
        let mut link = make_link(dir.path());

        let mac = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];
        let mut msg = newlink(3, 0, "eth0");
        msg.mac = Some(mac);
        link.update(&msg).unwrap();
        assert_eq!(link.mac, Some(mac));

        msg.mac = None;
        link.update(&msg).unwrap();
        assert_eq!(link.mac, Some(mac));
    }

    #[test]
    fn test_update_rename() {
        let dir = tempfile::tempdir().unwrap();
        let mut link = make_link(dir.path());

        link.update(&newlink(3, 0, "lan0")).unwrap();
        assert_eq!(link.ifname, "lan0");
    }

    #[test]
    fn test_mac_change_while_client_running_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut link = make_link(dir.path());
        link.network = Some(profile("[Network]\nDHCP=yes\n"));

        let mut client = DhcpClient::new(3);
        client.set_mac([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]).unwrap();
        client.start().unwrap();
        link.dhcp_client = Some(client);
        link.mac = Some([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);

        let mut msg = newlink(3, 0, "eth0");
        msg.mac = Some([0x52, 0x54, 0x00, 0xff, 0xff, 0xff]);

        let err = link.update(&msg).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBUSY));
    }

    #[test]
    fn test_same_flags_twice_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mut link = make_link(dir.path());
        link.network = Some(profile("[Network]\nDHCP=yes\n"));
        link.dhcp_client = Some(DhcpClient::new(3));

        link.update_flags(IFF_UP | IFF_LOWER_UP);
        assert!(link.dhcp_client.as_ref().unwrap().is_running());

        // Stop the client behind the machine's back; identical flags must
        // not re-trigger the carrier edge.
        link.dhcp_client.as_mut().unwrap().stop().unwrap();
        link.update_flags(IFF_UP | IFF_LOWER_UP);
        assert!(!link.dhcp_client.as_ref().unwrap().is_running());
    }

    #[test]
    fn test_carrier_gained_starts_clients() {
        let dir = tempfile::tempdir().unwrap();
        let mut link = make_link(dir.path());
        link.network = Some(profile("[Network]\nDHCP=yes\nLinkLocalAddressing=ipv4\n"));
        link.dhcp_client = Some(DhcpClient::new(3));
        link.ipv4ll = Some(Ipv4llClient::new(3));

        link.update_flags(IFF_UP | IFF_LOWER_UP);

        assert!(link.dhcp_client.as_ref().unwrap().is_running());
        assert!(link.ipv4ll.as_ref().unwrap().is_running());
    }

    #[test]
    fn test_carrier_lost_stops_clients() {
        let dir = tempfile::tempdir().unwrap();
        let mut link = make_link(dir.path());
        link.network = Some(profile("[Network]\nDHCP=yes\nLinkLocalAddressing=ipv4\n"));
        link.dhcp_client = Some(DhcpClient::new(3));
        link.ipv4ll = Some(Ipv4llClient::new(3));

        link.update_flags(IFF_UP | IFF_LOWER_UP);
        link.update_flags(IFF_UP);

        assert!(!link.dhcp_client.as_ref().unwrap().is_running());
        assert!(!link.ipv4ll.as_ref().unwrap().is_running());
    }

    #[test]
    fn test_dormant_masks_carrier() {
        let dir = tempfile::tempdir().unwrap();
        let mut link = make_link(dir.path());
        link.network = Some(profile("[Network]\nDHCP=yes\n"));
        link.dhcp_client = Some(DhcpClient::new(3));

        // LOWER_UP arriving together with DORMANT is not carrier.
        link.update_flags(IFF_UP | IFF_LOWER_UP | IFF_DORMANT);
        assert!(!link.dhcp_client.as_ref().unwrap().is_running());

        // Dropping DORMANT while LOWER_UP holds is a carrier gain.
        link.update_flags(IFF_UP | IFF_LOWER_UP);
        assert!(link.dhcp_client.as_ref().unwrap().is_running());

        // Going dormant again is a carrier loss.
        link.update_flags(IFF_UP | IFF_LOWER_UP | IFF_DORMANT);
        assert!(!link.dhcp_client.as_ref().unwrap().is_running());
    }

    #[test]
    fn test_flags_tracked_without_profile() {
        let dir = tempfile::tempdir().unwrap();
        let mut link = make_link(dir.path());

        link.update_flags(IFF_UP | IFF_LOWER_UP);
        assert_eq!(link.flags, IFF_UP | IFF_LOWER_UP);
        assert_eq!(link.state, LinkState::Initializing);
    }

    #[test]
    fn test_failed_ignores_flag_updates() {
        let dir = tempfile::tempdir().unwrap();
        let mut link = make_link(dir.path());
        link.enter_failed();

        link.update_flags(IFF_UP | IFF_LOWER_UP);
        assert_eq!(link.flags, 0);
        assert_eq!(link.state, LinkState::Failed);
    }

    #[test]
    fn test_save_writes_state_label() {
        let dir = tempfile::tempdir().unwrap();
        let mut link = make_link(dir.path());

        link.save();
        let content = fs::read_to_string(&link.state_file).unwrap();
        assert!(content.contains("STATE=configuring\n"));
        assert!(!content.contains("DHCP_LEASE="));

        link.state = LinkState::Configured;
        link.save();
        let content = fs::read_to_string(&link.state_file).unwrap();
        assert!(content.contains("STATE=configured\n"));
    }

    #[test]
    fn test_save_records_lease_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut link = make_link(dir.path());

        link.dhcp_lease = Some(DhcpLease {
            address: "10.0.0.5".parse().unwrap(),
            netmask: "255.255.255.0".parse().unwrap(),
            router: Some("10.0.0.1".parse().unwrap()),
            dns_servers: Vec::new(),
            mtu: None,
            hostname: None,
            server_id: None,
            lifetime: 3600,
            t1: 1800,
            t2: 3150,
        });
        link.save();

        let content = fs::read_to_string(&link.state_file).unwrap();
        assert!(content.contains(&format!("DHCP_LEASE={}\n", link.lease_file.display())));
        assert!(link.lease_file.is_file());
    }
}
