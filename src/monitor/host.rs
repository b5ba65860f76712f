//! Discovery of the monitoring host's own address.
//!
//! Traffic from (ICMP) or to/from (TCP) the host itself is excluded from
//! analysis. The address is resolved once at startup and copied into both
//! workers; when it cannot be found, filtering is skipped and a single
//! degraded-mode warning is logged.

use crate::logger::{Event, SharedLogger};
use crate::monitor::error::MonitorError;
use get_if_addrs::get_if_addrs;
use std::net::{IpAddr, SocketAddr, UdpSocket};

/// Single-method capability returning the host's own outbound address.
pub trait SelfAddressResolver: Send + Sync {
    /// # Errors
    /// [`MonitorError::Resolution`] when no address can be determined.
    fn resolve(&self) -> Result<IpAddr, MonitorError>;
}

/// Reads back the local address the kernel picks for an outbound route.
///
/// `connect` on a UDP socket only sets the default peer; no datagram is sent,
/// so any routable address works as the probe target.
#[derive(Debug, Clone)]
pub struct UdpProbeResolver {
    pub target: SocketAddr,
}

impl UdpProbeResolver {
    pub fn new(target: SocketAddr) -> Self {
        Self { target }
    }
}

impl SelfAddressResolver for UdpProbeResolver {
    fn resolve(&self) -> Result<IpAddr, MonitorError> {
        let bind_addr = if self.target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr)
            .map_err(|e| MonitorError::Resolution(format!("bind {}: {}", bind_addr, e)))?;
        socket
            .connect(self.target)
            .map_err(|e| MonitorError::Resolution(format!("no route to {}: {}", self.target, e)))?;
        let local = socket
            .local_addr()
            .map_err(|e| MonitorError::Resolution(e.to_string()))?;

        if local.ip().is_unspecified() {
            return Err(MonitorError::Resolution("kernel returned an unspecified address".into()));
        }
        Ok(local.ip())
    }
}

/// Uses the first non-loopback address bound to a named interface.
#[derive(Debug, Clone)]
pub struct InterfaceResolver {
    pub interface: String,
}

impl SelfAddressResolver for InterfaceResolver {
    fn resolve(&self) -> Result<IpAddr, MonitorError> {
        let ifaces = get_if_addrs().map_err(|e| MonitorError::Resolution(e.to_string()))?;

        // Prefer IPv4, as the probe does.
        let mut candidates: Vec<IpAddr> = ifaces
            .iter()
            .filter(|i| i.name == self.interface && !i.is_loopback())
            .map(|i| i.ip())
            .collect();
        candidates.sort_by_key(|ip| !ip.is_ipv4());

        candidates.into_iter().next().ok_or_else(|| {
            MonitorError::Resolution(format!("no usable address on '{}'", self.interface))
        })
    }
}

/// A known address, or none at all. Used for `--self-ip` and in tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedAddress(pub Option<IpAddr>);

impl SelfAddressResolver for FixedAddress {
    fn resolve(&self) -> Result<IpAddr, MonitorError> {
        self.0
            .ok_or_else(|| MonitorError::Resolution("no address configured".into()))
    }
}

/// Tries each resolver in order and returns the first success.
pub struct FallbackResolver(pub Vec<Box<dyn SelfAddressResolver>>);

impl SelfAddressResolver for FallbackResolver {
    fn resolve(&self) -> Result<IpAddr, MonitorError> {
        let mut reasons = Vec::new();
        for resolver in &self.0 {
            match resolver.resolve() {
                Ok(ip) => return Ok(ip),
                Err(e) => reasons.push(e.to_string()),
            }
        }
        Err(MonitorError::Resolution(reasons.join("; ")))
    }
}

/// Resolves the self-address, downgrading failure to `None`.
pub fn resolve_self_address(resolver: &dyn SelfAddressResolver, logger: &SharedLogger) -> Option<IpAddr> {
    match resolver.resolve() {
        Ok(ip) => {
            logger.info(&format!("Host address identified: {}", ip));
            Some(ip)
        }
        Err(e) => {
            let reason = e.to_string();
            logger.log(&Event::DegradedMode { reason: &reason });
            None
        }
    }
}

/// Picks the capture interface when none was configured: the first interface
/// with a non-loopback IPv4 address.
pub fn default_interface() -> Option<String> {
    get_if_addrs()
        .ok()?
        .into_iter()
        .find(|i| !i.is_loopback() && i.ip().is_ipv4())
        .map(|i| i.name)
}
