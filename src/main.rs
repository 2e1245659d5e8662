#![allow(dead_code)]

//! linkd — network link configuration daemon.
//!
//! Watches the kernel's rtnetlink link broadcasts and drives every matched
//! interface through enslavement, administrative up and IPv4 address
//! acquisition (static, DHCPv4 and/or IPv4 link-local), then installs the
//! resulting addresses and routes. Per-link status is published under
//! `/run/systemd/network/links/`.
//!
//! Also speaks the service-manager conventions:
//! - sd_notify READY/STATUS/WATCHDOG/STOPPING
//! - SIGTERM/SIGINT for shutdown, SIGHUP for profile reload
//!
//! Usage:
//!   linkd              # Run as daemon
//!   linkd --help       # Show help

mod address;
mod config;
mod dhcp;
mod hostname;
mod ipv4ll;
mod link;
mod manager;
mod netlink;
mod route;
mod state;

use std::os::unix::net::UnixDatagram;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use manager::Manager;
use netlink::RtnlSocket;

/// Report daemon state to the service manager, if one is listening on
/// NOTIFY_SOCKET. Best effort: delivery problems are only logged.
fn sd_notify(message: &str) {
    let Ok(mut target) = std::env::var("NOTIFY_SOCKET") else {
        return;
    };
    // A leading '@' names a socket in the abstract namespace, which binds
    // under a NUL byte instead.
    if target.starts_with('@') {
        target.replace_range(..1, "\0");
    }

    let sent = UnixDatagram::unbound().and_then(|sock| sock.send_to(message.as_bytes(), &target));
    if let Err(e) = sent {
        log::debug!("sd_notify to {target:?} failed: {e}");
    }
}

/// Keepalive cadence derived from WATCHDOG_USEC: ping at half the period
/// the service manager expects, or not at all when the variable is unset,
/// zero or garbage.
fn watchdog_interval() -> Option<Duration> {
    let raw = std::env::var("WATCHDOG_USEC").ok()?;
    match raw.parse::<u64>() {
        Ok(usec) if usec > 0 => Some(Duration::from_micros(usec) / 2),
        _ => None,
    }
}

fn print_help() {
    eprintln!("linkd — network link configuration daemon");
    eprintln!();
    eprintln!("Usage: linkd [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --help, -h    Show this help message");
    eprintln!("  --version     Show version information");
}

fn print_version() {
    eprintln!("linkd {}", env!("CARGO_PKG_VERSION"));
}

fn setup_logging() {
    let level = std::env::var("LINKD_LOG_LEVEL")
        .ok()
        .and_then(|l| match l.to_lowercase().as_str() {
            "debug" | "7" => Some(log::LevelFilter::Debug),
            "info" | "6" => Some(log::LevelFilter::Info),
            "notice" | "5" | "warning" | "4" => Some(log::LevelFilter::Warn),
            "err" | "3" | "crit" | "2" | "alert" | "1" | "emerg" | "0" => {
                Some(log::LevelFilter::Error)
            }
            _ => None,
        })
        .unwrap_or(log::LevelFilter::Info);

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][linkd][{}] {}",
                chrono::Local::now().format("%H:%M:%S"),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr())
        .apply()
        .ok();
}

/// Block until the netlink socket is readable or the timeout elapses.
fn wait_for_events(manager: &Manager, timeout: Duration) {
    let Some(fd) = manager.netlink_fd() else {
        std::thread::sleep(timeout);
        return;
    };

    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
    // EINTR on signal delivery is fine; the loop re-checks the flags.
    unsafe {
        libc::poll(&mut pfd, 1, timeout_ms);
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    for arg in &args[1..] {
        match arg.as_str() {
            "--help" | "-h" => {
                print_help();
                return;
            }
            "--version" => {
                print_version();
                return;
            }
            _ => {
                // Ignore unknown flags (service managers pass various ones).
            }
        }
    }

    setup_logging();
    log::info!("linkd starting");

    let shutdown = Arc::new(AtomicBool::new(false));
    let reload = Arc::new(AtomicBool::new(false));

    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown)).ok();
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown)).ok();
    signal_hook::flag::register(signal_hook::consts::SIGHUP, Arc::clone(&reload)).ok();

    let networks = config::load_networks();
    if networks.is_empty() {
        log::info!("No .network profiles found");
    } else {
        log::info!("Loaded {} .network profile(s)", networks.len());
    }

    let socket = match RtnlSocket::open() {
        Ok(socket) => socket,
        Err(e) => {
            log::error!("Failed to open netlink socket: {e}");
            sd_notify("STATUS=Failed to open netlink socket");
            std::process::exit(1);
        }
    };

    let mut manager = Manager::new(Box::new(socket), networks);

    // Ask for a dump of the links that already exist; they arrive through
    // the same ingress as later broadcasts.
    if let Err(e) = manager.enumerate_links() {
        log::error!("Failed to enumerate links: {e}");
        sd_notify("STATUS=Failed to enumerate links");
        std::process::exit(1);
    }

    sd_notify("READY=1\nSTATUS=Watching links");
    log::info!("linkd ready");

    let watchdog = watchdog_interval();
    let mut last_watchdog = Instant::now();
    let mut last_status = "";

    let poll_interval = Duration::from_millis(500);

    while !shutdown.load(Ordering::Relaxed) {
        if reload.swap(false, Ordering::Relaxed) {
            log::info!("Reloading profiles (SIGHUP)");
            manager.networks = config::load_networks();
            log::info!("Loaded {} .network profile(s)", manager.networks.len());
        }

        wait_for_events(&manager, poll_interval);

        if let Err(e) = manager.process_events() {
            log::warn!("Error processing netlink events: {e}");
        }

        let status = manager.overall_state();
        if status != last_status {
            sd_notify(&format!("STATUS={status}"));
            last_status = status;
        }

        if let Some(interval) = watchdog
            && last_watchdog.elapsed() >= interval
        {
            sd_notify("WATCHDOG=1");
            last_watchdog = Instant::now();
        }
    }

    log::info!("linkd shutting down");
    sd_notify("STOPPING=1\nSTATUS=Shutting down");

    log::info!("linkd stopped");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // Each environment variable gets exactly one test, since the variables
    // are process-global and the test harness runs in parallel.

    #[test]
    fn test_notify_is_best_effort() {
        // Unset: nothing to do.
        unsafe { std::env::remove_var("NOTIFY_SOCKET") };
        sd_notify("READY=1");

        // Pointing at nothing: the send fails, the daemon carries on.
        unsafe { std::env::set_var("NOTIFY_SOCKET", "/nonexistent/linkd-notify") };
        sd_notify("STATUS=still here");

        unsafe { std::env::remove_var("NOTIFY_SOCKET") };
    }

    #[test]
    fn test_watchdog_cadence_follows_environment() {
        let cases: [(&str, Option<Duration>); 4] = [
            ("8000000", Some(Duration::from_secs(4))),
            ("1000000", Some(Duration::from_millis(500))),
            ("0", None),
            ("soon", None),
        ];
        for (value, expected) in cases {
            unsafe { std::env::set_var("WATCHDOG_USEC", value) };
            assert_eq!(watchdog_interval(), expected, "WATCHDOG_USEC={value}");
        }

        unsafe { std::env::remove_var("WATCHDOG_USEC") };
        assert_eq!(watchdog_interval(), None);
    }
}
