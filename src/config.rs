//! Parser for declarative `.network` profiles.
//!
//! INI-style files with the sections this daemon acts on:
//! - `[Match]`   — select links by name glob, MAC, driver, or device path
//! - `[Network]` — address acquisition (DHCP, IPv4LL), enslavement targets,
//!   static DNS
//! - `[Address]` — static addresses (repeatable)
//! - `[Route]`   — static routes (repeatable)
//! - `[DHCPv4]`  — what to adopt from an acquired lease
//!
//! A profile is matched to a link once, when the link is initialized, and
//! stays attached for the link's lifetime.

use std::collections::BTreeMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Profile model
// ---------------------------------------------------------------------------

/// A parsed `.network` profile.
#[derive(Debug, Clone)]
pub struct Network {
    /// Original file path (for diagnostics).
    pub path: PathBuf,

    /// `[Match]` section — determines which links this profile applies to.
    pub match_section: MatchSection,

    /// Acquire an IPv4 address via DHCPv4.
    pub dhcp: bool,

    /// Acquire an IPv4 link-local address (169.254/16).
    pub ipv4ll: bool,

    /// Adopt DNS servers from the DHCP lease.
    pub dhcp_dns: bool,

    /// Adopt the interface MTU from the DHCP lease.
    pub dhcp_mtu: bool,

    /// Adopt the transient hostname from the DHCP lease.
    pub dhcp_hostname: bool,

    /// Never tear the lease configuration down once acquired.
    pub dhcp_critical: bool,

    /// Send the local hostname to the DHCP server.
    pub send_hostname: bool,

    /// Hostname to send instead of the local one.
    pub hostname: Option<String>,

    /// `DNS=` — static DNS servers.
    pub dns: Vec<Ipv4Addr>,

    /// `Domains=` — search domains.
    pub domains: Vec<String>,

    /// `Bridge=` — enslave to this bridge.
    pub bridge: Option<String>,

    /// `Bond=` — enslave to this bond.
    pub bond: Option<String>,

    /// `VLAN=` — VLAN devices to attach to (repeatable).
    pub vlans: Vec<String>,

    /// `MACVLAN=` — MACVLAN devices to attach to (repeatable).
    pub macvlans: Vec<String>,

    /// `[Address]` sections.
    pub addresses: Vec<StaticAddress>,

    /// `[Route]` sections.
    pub routes: Vec<StaticRoute>,
}

impl Network {
    fn empty(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            match_section: MatchSection::default(),
            dhcp: false,
            ipv4ll: false,
            dhcp_dns: true,
            dhcp_mtu: true,
            dhcp_hostname: true,
            dhcp_critical: false,
            send_hostname: true,
            hostname: None,
            dns: Vec::new(),
            domains: Vec::new(),
            bridge: None,
            bond: None,
            vlans: Vec::new(),
            macvlans: Vec::new(),
            addresses: Vec::new(),
            routes: Vec::new(),
        }
    }

    /// Whether this profile asks for any enslavement at all.
    pub fn has_netdevs(&self) -> bool {
        self.bridge.is_some()
            || self.bond.is_some()
            || !self.vlans.is_empty()
            || !self.macvlans.is_empty()
    }

    /// All enslavement targets, bridge and bond first.
    pub fn netdev_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        if let Some(ref bridge) = self.bridge {
            names.push(bridge.as_str());
        }
        if let Some(ref bond) = self.bond {
            names.push(bond.as_str());
        }
        names.extend(self.vlans.iter().map(String::as_str));
        names.extend(self.macvlans.iter().map(String::as_str));
        names
    }
}

/// A static address from an `[Address]` section, already validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticAddress {
    pub address: Ipv4Addr,
    pub prefixlen: u8,
    pub broadcast: Option<Ipv4Addr>,
}

/// A static route from a `[Route]` section, already validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticRoute {
    /// Destination network; `None` means the default route.
    pub destination: Option<(Ipv4Addr, u8)>,
    pub gateway: Option<Ipv4Addr>,
    pub metric: Option<u32>,
}

// ---------------------------------------------------------------------------
// [Match]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct MatchSection {
    /// `Name=` — glob patterns for interface names (e.g. `en*`, `eth0`).
    pub names: Vec<String>,

    /// `MACAddress=` — match by hardware address.
    pub mac_addresses: Vec<String>,

    /// `Driver=` — match by kernel driver (from the udev database).
    pub drivers: Vec<String>,

    /// `Path=` — match by persistent device path glob (from udev).
    pub paths: Vec<String>,
}

impl MatchSection {
    /// Returns `true` if this section matches the given interface.
    pub fn matches(
        &self,
        name: &str,
        mac: Option<&str>,
        driver: Option<&str>,
        path: Option<&str>,
    ) -> bool {
        // No criteria at all matches every link.
        if self.names.is_empty()
            && self.mac_addresses.is_empty()
            && self.drivers.is_empty()
            && self.paths.is_empty()
        {
            return true;
        }

        if !self.names.is_empty() && !self.names.iter().any(|pat| glob_match(pat, name)) {
            return false;
        }

        if !self.mac_addresses.is_empty() {
            match mac {
                Some(m) => {
                    if !self.mac_addresses.iter().any(|a| a.eq_ignore_ascii_case(m)) {
                        return false;
                    }
                }
                None => return false,
            }
        }

        if !self.drivers.is_empty() {
            match driver {
                Some(d) => {
                    if !self.drivers.iter().any(|pat| glob_match(pat, d)) {
                        return false;
                    }
                }
                None => return false,
            }
        }

        if !self.paths.is_empty() {
            match path {
                Some(p) => {
                    if !self.paths.iter().any(|pat| glob_match(pat, p)) {
                        return false;
                    }
                }
                None => return false,
            }
        }

        true
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load all `.network` profiles from the standard search paths.
///
/// Files are read in lexicographic order; earlier directories shadow later
/// ones by filename.
pub fn load_networks() -> Vec<Network> {
    let search_dirs = [
        PathBuf::from("/etc/systemd/network"),
        PathBuf::from("/run/systemd/network"),
        PathBuf::from("/usr/lib/systemd/network"),
        PathBuf::from("/lib/systemd/network"),
    ];

    load_networks_from(&search_dirs)
}

/// Load `.network` profiles from the given directories. When several
/// directories carry the same filename, the earliest directory in the list
/// shadows the rest.
pub fn load_networks_from(dirs: &[PathBuf]) -> Vec<Network> {
    // Collect candidate files first, keyed by filename. The map keeps one
    // path per name (first directory wins) and its iteration order is the
    // lexicographic order profiles are matched in.
    let mut by_name: BTreeMap<String, PathBuf> = BTreeMap::new();

    for dir in dirs {
        let Ok(entries) = fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "network") {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            by_name.entry(name).or_insert(path);
        }
    }

    by_name
        .into_values()
        .filter_map(|path| match fs::read_to_string(&path) {
            Ok(content) => Some(parse_network(&content, &path)),
            Err(e) => {
                log::warn!("Failed to read {}: {}", path.display(), e);
                None
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse one profile. Unknown sections and keys are skipped, malformed
/// addresses are dropped with a warning.
pub fn parse_network(content: &str, path: &Path) -> Network {
    let mut network = Network::empty(path);

    let mut current_section = String::new();
    let mut current_address: Option<StaticAddress> = None;
    let mut current_route: Option<StaticRoute> = None;

    for line in content.lines() {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if line.starts_with('[') && line.ends_with(']') {
            flush_address(&mut network, &mut current_address);
            flush_route(&mut network, &mut current_route);

            current_section = line[1..line.len() - 1].to_string();

            match current_section.as_str() {
                "Address" => {
                    current_address = Some(StaticAddress {
                        address: Ipv4Addr::UNSPECIFIED,
                        prefixlen: 0,
                        broadcast: None,
                    });
                }
                "Route" => {
                    current_route = Some(StaticRoute {
                        destination: None,
                        gateway: None,
                        metric: None,
                    });
                }
                _ => {}
            }

            continue;
        }

        let (key, value) = match line.split_once('=') {
            Some((k, v)) => (k.trim(), v.trim()),
            None => continue,
        };

        match current_section.as_str() {
            "Match" => parse_match_entry(key, value, &mut network.match_section),
            "Network" => parse_network_entry(key, value, &mut network, path),
            "Address" => {
                if let Some(ref mut addr) = current_address {
                    parse_address_entry(key, value, addr, path);
                }
            }
            "Route" => {
                if let Some(ref mut route) = current_route {
                    parse_route_entry(key, value, route, path);
                }
            }
            "DHCPv4" | "DHCP" => parse_dhcpv4_entry(key, value, &mut network),
            section => {
                log::trace!(
                    "{}: ignoring unknown section [{}] key {}",
                    path.display(),
                    section,
                    key
                );
            }
        }
    }

    flush_address(&mut network, &mut current_address);
    flush_route(&mut network, &mut current_route);

    network
}

fn flush_address(network: &mut Network, pending: &mut Option<StaticAddress>) {
    if let Some(addr) = pending.take() {
        // An [Address] section without a valid Address= is dropped.
        if addr.address != Ipv4Addr::UNSPECIFIED || addr.prefixlen != 0 {
            network.addresses.push(addr);
        }
    }
}

fn flush_route(network: &mut Network, pending: &mut Option<StaticRoute>) {
    if let Some(route) = pending.take()
        && (route.destination.is_some() || route.gateway.is_some())
    {
        network.routes.push(route);
    }
}

fn parse_match_entry(key: &str, value: &str, section: &mut MatchSection) {
    match key {
        "Name" => section.names.extend(split_values(value)),
        "MACAddress" => section.mac_addresses.extend(split_values(value)),
        "Driver" => section.drivers.extend(split_values(value)),
        "Path" => section.paths.extend(split_values(value)),
        _ => {}
    }
}

fn parse_network_entry(key: &str, value: &str, network: &mut Network, path: &Path) {
    match key {
        "DHCP" => {
            network.dhcp = matches!(
                value.to_lowercase().as_str(),
                "yes" | "true" | "1" | "both" | "ipv4" | "v4"
            )
        }
        "LinkLocalAddressing" | "IPv4LL" => {
            network.ipv4ll = matches!(
                value.to_lowercase().as_str(),
                "yes" | "true" | "1" | "ipv4" | "v4"
            )
        }
        "DNS" => {
            for tok in split_values(value) {
                match tok.parse::<Ipv4Addr>() {
                    Ok(ip) => network.dns.push(ip),
                    Err(_) => log::warn!("{}: invalid DNS server '{}'", path.display(), tok),
                }
            }
        }
        "Domains" => network.domains.extend(split_values(value)),
        "Bridge" => network.bridge = Some(value.to_string()),
        "Bond" => network.bond = Some(value.to_string()),
        "VLAN" => network.vlans.extend(split_values(value)),
        "MACVLAN" => network.macvlans.extend(split_values(value)),
        _ => {}
    }
}

fn parse_address_entry(key: &str, value: &str, section: &mut StaticAddress, path: &Path) {
    match key {
        "Address" => match parse_ipv4_cidr(value) {
            Some((addr, prefixlen)) => {
                section.address = addr;
                section.prefixlen = prefixlen;
            }
            None => log::warn!("{}: invalid Address '{}'", path.display(), value),
        },
        "Broadcast" => section.broadcast = value.parse().ok(),
        _ => {}
    }
}

fn parse_route_entry(key: &str, value: &str, section: &mut StaticRoute, path: &Path) {
    match key {
        "Destination" => match parse_ipv4_cidr(value) {
            Some(dst) => section.destination = Some(dst),
            None => log::warn!("{}: invalid Destination '{}'", path.display(), value),
        },
        "Gateway" => match value.parse() {
            Ok(gw) => section.gateway = Some(gw),
            Err(_) => log::warn!("{}: invalid Gateway '{}'", path.display(), value),
        },
        "Metric" => section.metric = value.parse().ok(),
        _ => {}
    }
}

fn parse_dhcpv4_entry(key: &str, value: &str, network: &mut Network) {
    match key {
        "UseDNS" => network.dhcp_dns = parse_bool(value),
        "UseMTU" => network.dhcp_mtu = parse_bool(value),
        "UseHostname" => network.dhcp_hostname = parse_bool(value),
        "SendHostname" => network.send_hostname = parse_bool(value),
        "Hostname" => network.hostname = Some(value.to_string()),
        "CriticalConnection" => network.dhcp_critical = parse_bool(value),
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "yes" | "true" | "1" | "on")
}

fn split_values(value: &str) -> Vec<String> {
    value.split_whitespace().map(|s| s.to_string()).collect()
}

/// Parse a CIDR string like `192.168.1.5/24` into (address, prefix length).
pub fn parse_ipv4_cidr(cidr: &str) -> Option<(Ipv4Addr, u8)> {
    let (addr_str, prefix_str) = cidr.split_once('/')?;
    let addr: Ipv4Addr = addr_str.trim().parse().ok()?;
    let prefix: u8 = prefix_str.trim().parse().ok()?;
    if prefix > 32 {
        return None;
    }
    Some((addr, prefix))
}

/// Shell-style pattern match: `*` spans any run of characters, `?` exactly
/// one.
///
/// The pattern is cut into literal segments at every `*`. The first segment
/// is anchored at the start of the text and the last at the end; segments in
/// between float, each taking the leftmost position after the previous one.
fn glob_match(pattern: &str, text: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let parts: Vec<Vec<char>> = pattern.split('*').map(|p| p.chars().collect()).collect();

    // No '*' at all: the pattern must cover the text exactly.
    if parts.len() == 1 {
        return segment_eq(&parts[0], &text);
    }

    let head = &parts[0];
    let tail = &parts[parts.len() - 1];
    if text.len() < head.len() + tail.len() {
        return false;
    }
    if !segment_eq(head, &text[..head.len()]) {
        return false;
    }
    let tail_start = text.len() - tail.len();
    if !segment_eq(tail, &text[tail_start..]) {
        return false;
    }

    let mut pos = head.len();
    for part in &parts[1..parts.len() - 1] {
        match find_segment(part, &text[pos..tail_start]) {
            Some(offset) => pos += offset + part.len(),
            None => return false,
        }
    }

    true
}

/// Whether a pattern segment covers this exact run of text.
fn segment_eq(segment: &[char], text: &[char]) -> bool {
    segment.len() == text.len() && segment.iter().zip(text).all(|(p, c)| *p == '?' || p == c)
}

/// Leftmost offset in `region` where the segment fits.
fn find_segment(segment: &[char], region: &[char]) -> Option<usize> {
    if segment.is_empty() {
        return Some(0);
    }
    if region.len() < segment.len() {
        return None;
    }
    (0..=region.len() - segment.len()).find(|&o| segment_eq(segment, &region[o..o + segment.len()]))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
