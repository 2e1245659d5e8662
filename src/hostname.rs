//! Transient hostname updates via `org.freedesktop.hostname1`.
//!
//! A DHCP lease may carry a hostname the link should adopt while the lease
//! is held. The call goes over the system bus so hostnamed applies its usual
//! validation and policy; losing the lease clears the transient hostname by
//! setting the empty string. A missing system bus is tolerated; hosts
//! without one simply never get a transient hostname.

use std::io;

use zbus::blocking::Connection;

const HOSTNAME1_DESTINATION: &str = "org.freedesktop.hostname1";
const HOSTNAME1_PATH: &str = "/org/freedesktop/hostname1";
const HOSTNAME1_INTERFACE: &str = "org.freedesktop.hostname1";

/// Handle on the hostname service. Holds the bus connection for the
/// daemon's lifetime; `None` when the system bus was unreachable.
pub struct Hostnamed {
    conn: Option<Connection>,
}

impl Hostnamed {
    /// Connect to the system bus. Failure is not fatal.
    pub fn connect() -> Self {
        match Connection::system() {
            Ok(conn) => Self { conn: Some(conn) },
            Err(e) => {
                log::info!("Not connected to system bus, transient hostname disabled: {e}");
                Self { conn: None }
            }
        }
    }

    /// A handle that never talks to a bus (containers without D-Bus, tests).
    pub fn disconnected() -> Self {
        Self { conn: None }
    }

    /// Set the transient hostname; the empty string clears it.
    pub fn set_hostname(&self, hostname: &str) -> io::Result<()> {
        let Some(ref conn) = self.conn else {
            log::debug!("No system bus, ignoring transient hostname '{hostname}'");
            return Ok(());
        };

        log::debug!("Setting transient hostname: '{hostname}'");

        conn.call_method(
            Some(HOSTNAME1_DESTINATION),
            HOSTNAME1_PATH,
            Some(HOSTNAME1_INTERFACE),
            "SetHostname",
            &(hostname, false),
        )
        .map(|_| ())
        .map_err(io::Error::other)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnected_is_a_no_op() {
        let hostnamed = Hostnamed::disconnected();
        assert!(hostnamed.set_hostname("somehost").is_ok());
        assert!(hostnamed.set_hostname("").is_ok());
    }
}
