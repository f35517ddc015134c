use crate::codec::ProxyRequest;
use crate::protocol::{AddressType, ReplyCode};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

/// Address represents a network address or domain as carried in
/// SOCKS5 request and reply frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    IPv4(Ipv4Addr),
    DomainName(String),
    IPv6(Ipv6Addr),
}

/// Address implementation block
impl Address {
    /// address_type returns the ATYP tag this address is encoded with
    pub fn address_type(&self) -> AddressType {
        match self {
            Address::IPv4(_) => AddressType::IPv4,
            Address::DomainName(_) => AddressType::DomainName,
            Address::IPv6(_) => AddressType::IPv6,
        }
    }

    /// unspecified is the zeroed IPv4 address used in failure replies
    pub fn unspecified() -> Self {
        Address::IPv4(Ipv4Addr::UNSPECIFIED)
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Address::IPv4(v4),
            IpAddr::V6(v6) => Address::IPv6(v6),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::IPv4(ip) => write!(f, "{ip}"),
            Address::DomainName(name) => write!(f, "{name}"),
            Address::IPv6(ip) => write!(f, "[{ip}]"),
        }
    }
}

/// Host is the part of a dial target that is either already numeric or
/// still needs a DNS lookup at dial time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Host {
    Ip(IpAddr),
    Domain(String),
}

/// DialTarget is a normalized host and port the dispatcher connects to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialTarget {
    pub host: Host,
    pub port: u16,
}

/// ResolveError is returned when a request address cannot be turned into
/// something dialable
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("invalid hostname: {0:?}")]
    InvalidHostname(String),

    #[error("invalid authority: {0:?}")]
    InvalidAuthority(String),
}

impl ResolveError {
    /// reply_code is the SOCKS5 status reported for this error
    pub fn reply_code(&self) -> ReplyCode {
        ReplyCode::HostUnreachable
    }
}

/// DialTarget implementation block
impl DialTarget {
    pub fn new(host: Host, port: u16) -> Self {
        Self { host, port }
    }

    /// socket_addr returns the target directly when no lookup is needed
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self.host {
            Host::Ip(ip) => Some(SocketAddr::new(ip, self.port)),
            Host::Domain(_) => None,
        }
    }

    /// parse_authority parses `host:port`, `[v6]:port` or a bare host (when a
    /// default port is given) as found in HTTP request targets
    pub fn parse_authority(authority: &str, default_port: Option<u16>) -> Result<Self, ResolveError> {
        let invalid = || ResolveError::InvalidAuthority(authority.to_string());

        // Bracketed IPv6 literal
        if let Some(rest) = authority.strip_prefix('[') {
            let (ip, after) = rest.split_once(']').ok_or_else(invalid)?;
            let ip: Ipv6Addr = ip.parse().map_err(|_| invalid())?;
            let port = match after.strip_prefix(':') {
                Some(port) => port.parse().map_err(|_| invalid())?,
                None if after.is_empty() => default_port.ok_or_else(invalid)?,
                None => return Err(invalid()),
            };
            return Ok(Self::new(Host::Ip(IpAddr::V6(ip)), port));
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().map_err(|_| invalid())?),
            None => (authority, default_port.ok_or_else(invalid)?),
        };

        let host = match host.parse::<Ipv4Addr>() {
            Ok(ip) => Host::Ip(IpAddr::V4(ip)),
            Err(_) => Host::Domain(validate_hostname(host)?),
        };

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for DialTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::Ip(IpAddr::V6(ip)) => write!(f, "[{ip}]:{}", self.port),
            Host::Ip(ip) => write!(f, "{ip}:{}", self.port),
            Host::Domain(name) => write!(f, "{name}:{}", self.port),
        }
    }
}

/// resolve normalizes the address carried by a request into a dial target.
/// Domain names are only validated here; the lookup happens when dialing so
/// DNS failures are reported with the dial's reply code
pub fn resolve(request: &ProxyRequest) -> Result<DialTarget, ResolveError> {
    let host = match &request.address {
        Address::IPv4(ip) => Host::Ip(IpAddr::V4(*ip)),
        Address::IPv6(ip) => Host::Ip(IpAddr::V6(*ip)),
        Address::DomainName(name) => Host::Domain(validate_hostname(name)?),
    };

    Ok(DialTarget::new(host, request.port))
}

/// validate_hostname rejects names no resolver could accept
fn validate_hostname(name: &str) -> Result<String, ResolveError> {
    let valid = !name.is_empty()
        && name.len() <= 255
        && name
            .chars()
            .all(|c| !c.is_control() && !c.is_whitespace() && c != '/' && c != ':');

    if valid {
        Ok(name.to_string())
    } else {
        Err(ResolveError::InvalidHostname(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, RSV, Version};

    fn request(address: Address, port: u16) -> ProxyRequest {
        ProxyRequest {
            version: Version::SOCKS5 as u8,
            command: Command::Connect,
            reserved: RSV,
            address,
            port,
        }
    }

    #[test]
    fn numeric_addresses_need_no_lookup() {
        let target = resolve(&request(Address::IPv4(Ipv4Addr::LOCALHOST), 80)).unwrap();
        assert_eq!(target.socket_addr(), Some("127.0.0.1:80".parse().unwrap()));

        let target = resolve(&request(Address::IPv6(Ipv6Addr::LOCALHOST), 443)).unwrap();
        assert_eq!(target.to_string(), "[::1]:443");
    }

    #[test]
    fn domain_lookup_is_deferred() {
        let target = resolve(&request(Address::DomainName("example.com".into()), 8080)).unwrap();
        assert_eq!(target.host, Host::Domain("example.com".into()));
        assert_eq!(target.socket_addr(), None);
    }

    #[test]
    fn port_zero_passes_through() {
        let target = resolve(&request(Address::IPv4(Ipv4Addr::LOCALHOST), 0)).unwrap();
        assert_eq!(target.port, 0);
    }

    #[test]
    fn hostname_with_whitespace_is_rejected() {
        let err = resolve(&request(Address::DomainName("bad host".into()), 80)).unwrap_err();
        assert_eq!(err.reply_code(), ReplyCode::HostUnreachable);
    }

    #[test]
    fn authority_forms() {
        let t = DialTarget::parse_authority("example.com:443", None).unwrap();
        assert_eq!(t.to_string(), "example.com:443");

        let t = DialTarget::parse_authority("[::1]:8443", None).unwrap();
        assert_eq!(t.socket_addr(), Some("[::1]:8443".parse().unwrap()));

        let t = DialTarget::parse_authority("10.0.0.1", Some(80)).unwrap();
        assert_eq!(t.socket_addr(), Some("10.0.0.1:80".parse().unwrap()));

        assert!(DialTarget::parse_authority("example.com", None).is_err());
        assert!(DialTarget::parse_authority("example.com:http", None).is_err());
        assert!(DialTarget::parse_authority("[::1", Some(80)).is_err());
    }
}
