//! Address matchers for policy clauses.
//!
//! A matcher is one fragment of a `bypass=` clause: a literal host
//! (optionally with a port), a CIDR range, or a wildcard domain pattern.
//! Wildcards apply to hostnames only, never to IP addresses.

use std::net::{IpAddr, SocketAddr};

use ipnet::IpNet;

/// Host portion of a candidate address, as seen by the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostAddr {
    /// A literal IP address.
    Ip(IpAddr),
    /// A hostname (lower-cased).
    Name(String),
}

impl HostAddr {
    /// Classify a host string as an IP address or a hostname.
    pub fn parse(host: &str) -> Self {
        match host.parse::<IpAddr>() {
            Ok(ip) => Self::Ip(ip),
            Err(_) => Self::Name(host.to_ascii_lowercase()),
        }
    }
}

/// One matcher from a policy clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    /// A CIDR range, e.g. `0.0.0.0/0` or `10.0.0.0/8`.
    Cidr(IpNet),
    /// A literal IP address, any port.
    Ip(IpAddr),
    /// A literal IP address with a specific port, e.g. `10.0.0.5:9000`.
    Socket(SocketAddr),
    /// An exact hostname, any port.
    Domain(String),
    /// An exact hostname with a specific port.
    DomainPort(String, u16),
    /// A wildcard domain suffix; the stored string is the bare suffix
    /// (`example.com` for `*.example.com`, empty for `*`).
    Wildcard(String),
}

impl Matcher {
    /// Parse a single matcher fragment.
    ///
    /// Unrecognized fragments degrade to exact-hostname matchers, which
    /// simply never match an address they do not name.
    pub fn parse(fragment: &str) -> Self {
        let fragment = fragment.trim();

        if fragment == "*" {
            return Self::Wildcard(String::new());
        }
        if let Some(suffix) = fragment.strip_prefix("*.") {
            return Self::Wildcard(suffix.to_ascii_lowercase());
        }
        if fragment.contains('/') {
            if let Ok(net) = fragment.parse::<IpNet>() {
                return Self::Cidr(net);
            }
            return Self::Domain(fragment.to_ascii_lowercase());
        }
        if let Ok(socket) = fragment.parse::<SocketAddr>() {
            return Self::Socket(socket);
        }
        if let Ok(ip) = fragment.parse::<IpAddr>() {
            return Self::Ip(ip);
        }
        if let Some((host, port)) = fragment.rsplit_once(':') {
            if !host.is_empty() && !host.contains(':') {
                if let Ok(port) = port.parse::<u16>() {
                    return Self::DomainPort(host.to_ascii_lowercase(), port);
                }
            }
        }
        Self::Domain(fragment.to_ascii_lowercase())
    }

    /// Check whether this matcher covers the candidate address.
    pub fn matches(&self, host: &HostAddr, port: u16) -> bool {
        match (self, host) {
            (Self::Cidr(net), HostAddr::Ip(ip)) => net.contains(ip),
            (Self::Ip(matcher), HostAddr::Ip(ip)) => matcher == ip,
            (Self::Socket(socket), HostAddr::Ip(ip)) => {
                socket.ip() == *ip && socket.port() == port
            }
            (Self::Domain(domain), HostAddr::Name(name)) => domain == name,
            (Self::DomainPort(domain, matcher_port), HostAddr::Name(name)) => {
                domain == name && *matcher_port == port
            }
            (Self::Wildcard(suffix), HostAddr::Name(name)) => {
                suffix.is_empty() || name == suffix || name.ends_with(&format!(".{suffix}"))
            }
            _ => false,
        }
    }
}
