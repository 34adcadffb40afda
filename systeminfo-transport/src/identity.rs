//! Best-effort host identity (hostname and outbound IP address).

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, UdpSocket};

use serde::Serialize;
use tracing::{debug, error};

/// Hostname used when nothing better is known.
pub const UNKNOWN_COMPUTER: &str = "Unknown Computer";

/// Address used when the network probe fails.
pub const LOOPBACK_ADDRESS: &str = "127.0.0.1";

/// Environment variables consulted for the computer name, in priority order.
pub const COMPUTER_NAME_VARS: &[&str] = &["COMPUTERNAME", "HOSTNAME"];

/// Public address the probe socket is connected to. No packet is sent.
pub const PROBE_TARGET: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 10002));

/// Hostname and address reported in every record of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostIdentity {
    pub hostname: String,
    #[serde(rename = "ip")]
    pub address: String,
}

impl HostIdentity {
    pub fn new(hostname: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            address: address.into(),
        }
    }
}

/// Discovers the local address the OS would use for outbound traffic.
pub trait NetworkProbe: Send + Sync {
    fn local_address(&self) -> io::Result<IpAddr>;
}

/// Probe that "connects" an unbound UDP socket and reads back its local address.
#[derive(Debug, Clone, Copy)]
pub struct UdpProbe {
    target: SocketAddr,
}

impl UdpProbe {
    pub fn new(target: SocketAddr) -> Self {
        Self { target }
    }
}

impl Default for UdpProbe {
    fn default() -> Self {
        Self::new(PROBE_TARGET)
    }
}

impl NetworkProbe for UdpProbe {
    fn local_address(&self) -> io::Result<IpAddr> {
        let bind: SocketAddr = match self.target {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind)?;
        socket.connect(self.target)?;
        let ip = socket.local_addr()?.ip();
        if ip.is_unspecified() {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no outbound interface selected",
            ));
        }
        Ok(ip)
    }
}

type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;
type NameLookup = Box<dyn Fn() -> Option<String> + Send + Sync>;
type ReverseLookup = Box<dyn Fn(IpAddr) -> Option<String> + Send + Sync>;

/// Resolves a [`HostIdentity`] with a layered fallback.
///
/// 1. Computer-name environment variables ([`COMPUTER_NAME_VARS`]), then the
///    OS hostname, then [`UNKNOWN_COMPUTER`].
/// 2. The network probe. On success its address is used, and the hostname
///    becomes the reverse-resolved name of that address (or the address
///    literal if it has none).
/// 3. On probe failure the step 1 name is kept with [`LOOPBACK_ADDRESS`].
///
/// Resolution never fails.
pub struct IdentityResolver {
    env: EnvLookup,
    system_hostname: NameLookup,
    reverse: ReverseLookup,
    probe: Box<dyn NetworkProbe>,
}

impl IdentityResolver {
    /// Resolver using the process environment, the `hostname` crate, a
    /// [`UdpProbe`] towards [`PROBE_TARGET`] and the system resolver for
    /// reverse lookups.
    pub fn new() -> Self {
        Self {
            env: Box::new(|name| std::env::var(name).ok()),
            system_hostname: Box::new(|| {
                hostname::get().ok().and_then(|h| h.into_string().ok())
            }),
            reverse: Box::new(|ip| dns_lookup::lookup_addr(&ip).ok()),
            probe: Box::new(UdpProbe::default()),
        }
    }

    /// Replace the environment lookup.
    pub fn with_env<F>(mut self, env: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Box::new(env);
        self
    }

    /// Replace the OS hostname lookup.
    pub fn with_system_hostname<F>(mut self, lookup: F) -> Self
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        self.system_hostname = Box::new(lookup);
        self
    }

    /// Replace the reverse (address to name) lookup.
    pub fn with_reverse_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(IpAddr) -> Option<String> + Send + Sync + 'static,
    {
        self.reverse = Box::new(lookup);
        self
    }

    /// Replace the network probe.
    pub fn with_probe(mut self, probe: impl NetworkProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    fn system_hostname(&self) -> Option<String> {
        (self.system_hostname)().filter(|h| !h.trim().is_empty())
    }

    /// Name derived from the environment, without touching the network.
    pub fn computer_name(&self) -> String {
        COMPUTER_NAME_VARS
            .iter()
            .copied()
            .find_map(|var| (self.env)(var).filter(|v| !v.trim().is_empty()))
            .or_else(|| self.system_hostname())
            .unwrap_or_else(|| UNKNOWN_COMPUTER.to_string())
    }

    pub fn resolve(&self) -> HostIdentity {
        let hostname = self.computer_name();

        match self.probe.local_address() {
            Ok(ip) => {
                let address = ip.to_string();
                let hostname = (self.reverse)(ip)
                    .filter(|name| !name.trim().is_empty())
                    .unwrap_or_else(|| address.clone());
                debug!(%hostname, %address, "Resolved host identity");
                HostIdentity { hostname, address }
            }
            Err(e) => {
                error!(
                    error = %e,
                    %hostname,
                    address = LOOPBACK_ADDRESS,
                    "Hostname can not be resolved, using fallback identity"
                );
                HostIdentity::new(hostname, LOOPBACK_ADDRESS)
            }
        }
    }
}

impl Default for IdentityResolver {
    fn default() -> Self {
        Self::new()
    }
}
