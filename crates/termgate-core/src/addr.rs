//! Client network addresses.
//!
//! A pending session remembers the address of whoever asked for it. A later
//! claim is only honored from the same host; the port is not compared, since
//! the browser opens the WebSocket on a fresh ephemeral port.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Network-layer address of a client: a host and, when known, a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginAddr {
    host: String,
    port: Option<u16>,
}

impl OriginAddr {
    /// Build an address from a host string and optional port.
    ///
    /// Hosts that parse as IP addresses are canonicalized, so an IPv4-mapped
    /// IPv6 peer (`::ffff:10.0.0.5`) compares equal to `10.0.0.5`.
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        let host = host.into();
        let host = match host.parse::<IpAddr>() {
            Ok(ip) => ip.to_canonical().to_string(),
            Err(_) => host,
        };
        Self { host, port }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Whether `other` comes from the same host (ports ignored).
    pub fn same_host(&self, other: &OriginAddr) -> bool {
        self.host == other.host
    }
}

impl From<SocketAddr> for OriginAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), Some(addr.port()))
    }
}

impl fmt::Display for OriginAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) if self.host.contains(':') => write!(f, "[{}]:{}", self.host, port),
            Some(port) => write!(f, "{}:{}", self.host, port),
            None => f.write_str(&self.host),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_is_not_compared() {
        let a = OriginAddr::new("10.0.0.5", Some(50000));
        let b = OriginAddr::new("10.0.0.5", Some(50001));
        assert!(a.same_host(&b));
        assert!(a.same_host(&OriginAddr::new("10.0.0.5", None)));
    }

    #[test]
    fn different_hosts_do_not_match() {
        let a = OriginAddr::new("10.0.0.5", None);
        assert!(!a.same_host(&OriginAddr::new("10.0.0.6", None)));
    }

    #[test]
    fn mapped_ipv6_matches_ipv4() {
        let v4: SocketAddr = "10.0.0.5:4000".parse().unwrap();
        let mapped: SocketAddr = "[::ffff:10.0.0.5]:5000".parse().unwrap();
        assert!(OriginAddr::from(v4).same_host(&OriginAddr::from(mapped)));
    }

    #[test]
    fn display() {
        assert_eq!(OriginAddr::new("10.0.0.5", Some(22)).to_string(), "10.0.0.5:22");
        assert_eq!(OriginAddr::new("::1", Some(22)).to_string(), "[::1]:22");
        assert_eq!(OriginAddr::new("example.com", None).to_string(), "example.com");
    }
}
