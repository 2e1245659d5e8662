//! Link registry and event ingress.
//!
//! The manager owns the netlink dispatcher, the set of loaded profiles, the
//! per-ifindex [`Link`] registry and the shared host services (udev
//! database, hostname1, resolv.conf). Kernel traffic, netlink
//! acknowledgements and DHCP/IPv4LL engine events all enter here and are
//! routed to the owning link; everything runs on the single event loop
//! thread.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use crate::config::Network;
use crate::dhcp::DhcpEvent;
use crate::hostname::Hostnamed;
use crate::ipv4ll::Ipv4llEvent;
use crate::link::{Link, LinkCtx, LinkState};
use crate::netlink::{LinkMessage, Rtnl, RtnlEvent, RtnlTransport};
use crate::state;

// ---------------------------------------------------------------------------
// udev database
// ---------------------------------------------------------------------------

/// Properties of a network device from the udev database.
#[derive(Debug, Clone, Default)]
pub struct UdevDevice {
    properties: HashMap<String, String>,
}

impl UdevDevice {
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Kernel driver, for `Driver=` profile matching.
    pub fn driver(&self) -> Option<&str> {
        self.property("ID_NET_DRIVER")
    }

    /// Persistent device path, for `Path=` profile matching.
    pub fn device_path(&self) -> Option<&str> {
        self.property("ID_PATH")
    }

    /// Stable per-device identity for seeding IPv4LL address selection: the
    /// most persistent of the predictable-name properties.
    pub fn predictable_data(&self) -> Option<&str> {
        ["ID_NET_NAME_ONBOARD", "ID_NET_NAME_SLOT", "ID_NET_NAME_PATH", "ID_NET_NAME_MAC"]
            .iter()
            .find_map(|key| self.property(key))
    }
}

/// Read-only view of udev's device database. Network interfaces are keyed
/// by `n<ifindex>`; a device without a database entry has not finished udev
/// processing yet.
#[derive(Debug, Clone)]
pub struct UdevDb {
    root: PathBuf,
}

impl UdevDb {
    pub fn system() -> Self {
        Self {
            root: PathBuf::from("/run/udev"),
        }
    }

    pub fn at(root: PathBuf) -> Self {
        Self { root }
    }

    /// Look up the device for a kernel interface index. `None` means udev
    /// has not initialized the device (yet).
    pub fn lookup(&self, ifindex: i32) -> Option<UdevDevice> {
        let path = self.root.join("data").join(format!("n{ifindex}"));
        let content = fs::read_to_string(path).ok()?;

        let mut properties = HashMap::new();
        for line in content.lines() {
            if let Some(rest) = line.strip_prefix("E:")
                && let Some((key, value)) = rest.split_once('=')
            {
                properties.insert(key.to_string(), value.to_string());
            }
        }

        Some(UdevDevice { properties })
    }
}

/// Whether we run in a container, where udev is not available and device
/// enrichment must be skipped.
pub fn detect_container() -> bool {
    if Path::new("/run/systemd/container").exists() {
        return true;
    }

    match fs::read("/proc/1/environ") {
        Ok(environ) => environ_has_container(&environ),
        Err(_) => false,
    }
}

fn environ_has_container(environ: &[u8]) -> bool {
    environ
        .split(|&b| b == 0)
        .any(|entry| entry.starts_with(b"container="))
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Default location of the resolver configuration this daemon maintains.
const RESOLV_CONF_PATH: &str = "/run/systemd/resolve/resolv.conf";

pub struct Manager {
    rtnl: Rtnl,

    /// All known links, keyed by kernel interface index.
    pub links: HashMap<i32, Link>,

    /// Every interface name seen so far and its index; enslavement targets
    /// (bridges, bonds, VLANs, MACVLANs) are resolved against this.
    netdevs: HashMap<String, i32>,

    /// Loaded `.network` profiles.
    pub networks: Vec<Network>,

    hostnamed: Hostnamed,
    udev: UdevDb,
    in_container: bool,

    links_dir: PathBuf,
    leases_dir: PathBuf,
    resolv_conf: PathBuf,
}

impl Manager {
    pub fn new(transport: Box<dyn RtnlTransport>, networks: Vec<Network>) -> Self {
        Self::with_environment(
            transport,
            networks,
            PathBuf::from(state::LINK_STATE_DIR),
            PathBuf::from(state::LEASE_STATE_DIR),
            UdevDb::system(),
            detect_container(),
            Hostnamed::connect(),
        )
    }

    /// Fully parameterized constructor for containers and tests.
    pub fn with_environment(
        transport: Box<dyn RtnlTransport>,
        networks: Vec<Network>,
        links_dir: PathBuf,
        leases_dir: PathBuf,
        udev: UdevDb,
        in_container: bool,
        hostnamed: Hostnamed,
    ) -> Self {
        Self {
            rtnl: Rtnl::new(transport),
            links: HashMap::new(),
            netdevs: HashMap::new(),
            networks,
            hostnamed,
            udev,
            in_container,
            links_dir,
            leases_dir,
            resolv_conf: PathBuf::from(RESOLV_CONF_PATH),
        }
    }

    /// Redirect resolver configuration writes (tests, alternative layouts).
    pub fn set_resolv_conf(&mut self, path: PathBuf) {
        self.resolv_conf = path;
    }

    /// Ask the kernel for a dump of all existing links.
    pub fn enumerate_links(&mut self) -> io::Result<()> {
        self.rtnl.enumerate_links()
    }

    /// File descriptor the event loop should poll for kernel traffic.
    pub fn netlink_fd(&self) -> Option<RawFd> {
        self.rtnl.raw_fd()
    }

    /// Drain the netlink socket and dispatch everything read.
    pub fn process_events(&mut self) -> io::Result<()> {
        for event in self.rtnl.poll_events()? {
            self.dispatch_event(event);
        }
        Ok(())
    }

    pub fn dispatch_event(&mut self, event: RtnlEvent) {
        match event {
            RtnlEvent::Reply { seq, errno } => self.handle_reply(seq, errno),
            RtnlEvent::NewLink(msg) => self.handle_new_link(&msg),
            RtnlEvent::DelLink { ifindex } => self.remove_link(ifindex),
        }
    }

    // -----------------------------------------------------------------------
    // Link ingress
    // -----------------------------------------------------------------------

    /// RTM_NEWLINK: create the link on first sight, fold updates in
    /// afterwards.
    pub fn handle_new_link(&mut self, msg: &LinkMessage) {
        if let Some(ref name) = msg.ifname {
            self.netdevs.insert(name.clone(), msg.ifindex);
        }

        if self.links.contains_key(&msg.ifindex) {
            self.apply_update(msg.ifindex, msg);
            self.retry_initialization(msg.ifindex);
        } else if let Err(e) = self.add_link(msg) {
            log::warn!("could not add link {}: {}", msg.ifindex, e);
        }
    }

    /// Register a new link and, when its udev processing is complete (or
    /// irrelevant in a container), initialize it against the profile set.
    fn add_link(&mut self, msg: &LinkMessage) -> io::Result<()> {
        let link = Link::new(msg, &self.links_dir, &self.leases_dir)?;
        let ifindex = link.ifindex;

        if self.links.contains_key(&ifindex) {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }

        log::info!("{}: link added", link.ifname);
        self.links.insert(ifindex, link);

        let device = if self.in_container {
            // No udev in containers; proceed without device enrichment.
            None
        } else {
            match self.udev.lookup(ifindex) {
                Some(device) => Some(device),
                None => {
                    // udev has not processed the device yet; a later event
                    // retriggers initialization.
                    log::debug!("udev device n{ifindex} not initialized yet");
                    self.apply_update(ifindex, msg);
                    return Ok(());
                }
            }
        };

        self.init_link(ifindex, device);
        self.apply_update(ifindex, msg);

        Ok(())
    }

    fn init_link(&mut self, ifindex: i32, device: Option<UdevDevice>) {
        let Some(link) = self.links.get_mut(&ifindex) else {
            return;
        };
        let mut ctx = LinkCtx {
            rtnl: &mut self.rtnl,
            hostnamed: &self.hostnamed,
            netdevs: &self.netdevs,
        };
        if let Err(e) = link.initialized(device, &self.networks, &mut ctx) {
            log::warn!("{}: could not initialize link: {}", link.ifname, e);
        }
    }

    fn apply_update(&mut self, ifindex: i32, msg: &LinkMessage) {
        let Some(link) = self.links.get_mut(&ifindex) else {
            return;
        };
        if let Err(e) = link.update(msg) {
            log::warn!("{}: could not process link message: {}", link.ifname, e);
            link.enter_failed();
        }
    }

    /// A link that predates its udev database entry (or a profile reload)
    /// is matched again on the next kernel event.
    fn retry_initialization(&mut self, ifindex: i32) {
        let needs_init = self
            .links
            .get(&ifindex)
            .is_some_and(|l| l.state == LinkState::Initializing && l.network.is_none());
        if !needs_init {
            return;
        }

        let device = if self.in_container {
            None
        } else {
            match self.udev.lookup(ifindex) {
                Some(device) => Some(device),
                None => return,
            }
        };

        self.init_link(ifindex, device);
    }

    /// RTM_DELLINK: drop the link, its clients and its state files.
    pub fn remove_link(&mut self, ifindex: i32) {
        let Some(link) = self.links.remove(&ifindex) else {
            return;
        };

        log::info!("{}: link removed", link.ifname);

        let _ = fs::remove_file(&link.state_file);
        let _ = fs::remove_file(&link.lease_file);

        self.netdevs.retain(|_, idx| *idx != ifindex);
    }

    // -----------------------------------------------------------------------
    // Reply and client-event routing
    // -----------------------------------------------------------------------

    /// Route a netlink acknowledgement to the link that issued the request.
    /// Replies for links that were torn down in the meantime are dropped.
    pub fn handle_reply(&mut self, seq: u32, errno: i32) {
        let Some(pending) = self.rtnl.take_pending(seq) else {
            log::debug!("ignoring unexpected netlink reply (seq {seq})");
            return;
        };

        let Some(link) = self.links.get_mut(&pending.ifindex) else {
            log::debug!("reply for removed link {} (seq {seq})", pending.ifindex);
            return;
        };

        let mut ctx = LinkCtx {
            rtnl: &mut self.rtnl,
            hostnamed: &self.hostnamed,
            netdevs: &self.netdevs,
        };
        link.handle_reply(pending.kind, errno, &mut ctx);
    }

    /// Deliver a DHCPv4 engine event to its link.
    pub fn dhcp_event(&mut self, ifindex: i32, event: DhcpEvent) {
        log::debug!("DHCP event {event} on ifindex {ifindex}");

        {
            let Some(link) = self.links.get_mut(&ifindex) else {
                return;
            };
            let mut ctx = LinkCtx {
                rtnl: &mut self.rtnl,
                hostnamed: &self.hostnamed,
                netdevs: &self.netdevs,
            };
            link.dhcp_event(event, &mut ctx);
        }

        let wants_dns = self
            .links
            .get(&ifindex)
            .and_then(|l| l.network.as_ref())
            .is_some_and(|n| n.dhcp_dns);
        if wants_dns {
            self.update_resolv_conf();
        }
    }

    /// Deliver an IPv4LL engine event to its link.
    pub fn ipv4ll_event(&mut self, ifindex: i32, event: Ipv4llEvent) {
        log::debug!("IPv4LL event {event} on ifindex {ifindex}");

        let Some(link) = self.links.get_mut(&ifindex) else {
            return;
        };
        let mut ctx = LinkCtx {
            rtnl: &mut self.rtnl,
            hostnamed: &self.hostnamed,
            netdevs: &self.netdevs,
        };
        link.ipv4ll_event(event, &mut ctx);
    }

    // -----------------------------------------------------------------------
    // Aggregated host state
    // -----------------------------------------------------------------------

    /// One-word summary for sd_notify STATUS.
    pub fn overall_state(&self) -> &'static str {
        let mut any_configuring = false;
        let mut any_configured = false;
        let mut any_failed = false;

        for link in self.links.values() {
            if link.network.is_none() {
                continue;
            }
            match link.state {
                LinkState::Configured => any_configured = true,
                LinkState::Failed => any_failed = true,
                _ => any_configuring = true,
            }
        }

        if any_configuring {
            "configuring"
        } else if any_failed {
            "degraded"
        } else if any_configured {
            "configured"
        } else {
            "idle"
        }
    }

    /// Rewrite resolv.conf from every link's static and lease DNS.
    pub fn update_resolv_conf(&self) {
        let mut dns: Vec<Ipv4Addr> = Vec::new();
        let mut domains: Vec<String> = Vec::new();

        for link in self.links.values() {
            let Some(network) = &link.network else {
                continue;
            };
            for server in &network.dns {
                if !dns.contains(server) {
                    dns.push(*server);
                }
            }
            for domain in &network.domains {
                if !domains.contains(domain) {
                    domains.push(domain.clone());
                }
            }
            if network.dhcp_dns
                && let Some(lease) = &link.dhcp_lease
            {
                for server in &lease.dns_servers {
                    if !dns.contains(server) {
                        dns.push(*server);
                    }
                }
            }
        }

        if let Err(e) = write_resolv_conf(&self.resolv_conf, &dns, &domains) {
            log::warn!("Failed to write resolv.conf: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// resolv.conf
// ---------------------------------------------------------------------------

/// Render resolv.conf contents from aggregated DNS configuration.
pub fn render_resolv_conf(dns: &[Ipv4Addr], domains: &[String]) -> String {
    let mut content = String::from("# Generated by linkd\n");
    if !domains.is_empty() {
        content.push_str("search");
        for domain in domains {
            content.push(' ');
            content.push_str(domain);
        }
        content.push('\n');
    }
    for server in dns {
        content.push_str(&format!("nameserver {server}\n"));
    }
    content
}

fn write_resolv_conf(path: &Path, dns: &[Ipv4Addr], domains: &[String]) -> io::Result<()> {
    // When systemd-resolved runs it owns this directory and reads per-link
    // DNS from our state files instead; writing there would only fail.
    if let Some(dir) = path.parent()
        && dir.join("stub-resolv.conf").exists()
    {
        log::debug!("systemd-resolved is running, skipping resolv.conf write");
        return Ok(());
    }

    if dns.is_empty() && domains.is_empty() {
        return Ok(());
    }

    state::atomic_write(path, &render_resolv_conf(dns, domains))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
