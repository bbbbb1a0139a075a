use anyhow::Context;
use dns_lookup::{AddrInfoHints, getaddrinfo};
use std::io;
use std::net::{IpAddr, SocketAddr, SocketAddrV6};

/// Where echo requests are written to. Datagram sockets take a transport
/// address (port 0), raw sockets a bare network address. Both keep the IPv6
/// scope id so link-local targets stay reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Datagram(SocketAddr),
    Raw { ip: IpAddr, scope_id: u32 },
}

impl Destination {
    pub fn new(ip: IpAddr, scope_id: u32, privileged: bool) -> Self {
        if privileged {
            Destination::Raw { ip, scope_id }
        } else {
            Destination::Datagram(with_scope(ip, scope_id))
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        match *self {
            Destination::Datagram(addr) => addr,
            Destination::Raw { ip, scope_id } => with_scope(ip, scope_id),
        }
    }
}

fn with_scope(ip: IpAddr, scope_id: u32) -> SocketAddr {
    match ip {
        IpAddr::V6(v6) => SocketAddr::V6(SocketAddrV6::new(v6, 0, 0, scope_id)),
        IpAddr::V4(_) => SocketAddr::new(ip, 0),
    }
}

/// The resolved ping target. Built once at startup and never changed.
#[derive(Debug, Clone)]
pub struct Target {
    pub host: String,
    pub ip: IpAddr,
    pub destination: Destination,
}

impl Target {
    pub fn new(host: &str, addr: SocketAddr, privileged: bool) -> Self {
        let ip = addr.ip().to_canonical();
        let scope_id = match (addr, ip) {
            (SocketAddr::V6(v6), IpAddr::V6(_)) => v6.scope_id(),
            _ => 0,
        };
        Self {
            host: host.to_string(),
            ip,
            destination: Destination::new(ip, scope_id, privileged),
        }
    }
}

pub async fn resolve_target(host: &str, privileged: bool, force_ipv4: bool, force_ipv6: bool) -> anyhow::Result<Target> {
    let addr = resolve_hostname(host, force_ipv4, force_ipv6).await?;
    log::debug!("resolved {} to {}", host, addr);
    Ok(Target::new(host, addr, privileged))
}

/// Resolves to a socket address with port 0. Zoned literals such as
/// `fe80::1%eth0` go through the resolver so the scope id is kept.
pub async fn resolve_hostname(hostname: &str, force_ipv4: bool, force_ipv6: bool) -> anyhow::Result<SocketAddr> {
    // First try to parse as IP address
    if let Ok(ip) = hostname.parse::<IpAddr>() {
        match (ip.to_canonical(), force_ipv4, force_ipv6) {
            (IpAddr::V4(_), false, true) => {
                return Err(anyhow::anyhow!("IPv4 address provided but IPv6 forced"));
            }
            (IpAddr::V6(_), true, false) => {
                return Err(anyhow::anyhow!("IPv6 address provided but IPv4 forced"));
            }
            _ => return Ok(SocketAddr::new(ip, 0)),
        }
    }

    let addresses = tokio::task::spawn_blocking({
        let hostname = hostname.to_string();
        move || lookup_socket_addrs(&hostname)
    })
    .await?
    .with_context(|| format!("lookup of {} failed", hostname))?;

    pick_address(&addresses, force_ipv4, force_ipv6)
        .ok_or_else(|| anyhow::anyhow!("no suitable address found for {}", hostname))
}

fn lookup_socket_addrs(host: &str) -> io::Result<Vec<SocketAddr>> {
    let hints = AddrInfoHints {
        socktype: libc::SOCK_DGRAM,
        ..AddrInfoHints::default()
    };
    getaddrinfo(Some(host), None, Some(hints))?
        .map(|info| info.map(|info| info.sockaddr))
        .collect()
}

/// Picks the first address of the forced family, or the first IPv4 address
/// with a fallback to whatever came first.
pub fn pick_address(addresses: &[SocketAddr], force_ipv4: bool, force_ipv6: bool) -> Option<SocketAddr> {
    if force_ipv4 {
        addresses.iter().find(|addr| addr.is_ipv4()).copied()
    } else if force_ipv6 {
        addresses.iter().find(|addr| addr.is_ipv6()).copied()
    } else {
        addresses
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| addresses.first())
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ip_address_parsing() {
        let result = resolve_hostname("8.8.8.8", false, false).await;
        assert_eq!(result.unwrap(), "8.8.8.8:0".parse::<SocketAddr>().unwrap());

        let result = resolve_hostname("::1", false, false).await;
        assert_eq!(result.unwrap(), "[::1]:0".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_literal_conflicts_with_forced_family() {
        assert!(resolve_hostname("8.8.8.8", false, true).await.is_err());
        assert!(resolve_hostname("2001:db8::1", true, false).await.is_err());
    }

    #[tokio::test]
    async fn test_localhost_resolution() {
        let result = resolve_hostname("localhost", false, false).await;
        assert!(result.unwrap().ip().is_loopback());
    }

    #[tokio::test]
    async fn test_unresolvable_host_is_an_error() {
        assert!(resolve_hostname("no-such-host.invalid", false, false).await.is_err());
    }

    #[test]
    fn test_pick_address_preferences() {
        let v6: SocketAddr = "[2001:db8::1]:0".parse().unwrap();
        let v4: SocketAddr = "192.0.2.7:0".parse().unwrap();
        let both = [v6, v4];

        assert_eq!(pick_address(&both, false, false), Some(v4));
        assert_eq!(pick_address(&both, false, true), Some(v6));
        assert_eq!(pick_address(&[v6], false, false), Some(v6));
        assert_eq!(pick_address(&[v6], true, false), None);
        assert_eq!(pick_address(&[], false, false), None);
    }

    #[test]
    fn test_destination_by_privilege() {
        let ip: IpAddr = "192.0.2.7".parse().unwrap();
        let target = Target::new("host", SocketAddr::new(ip, 0), false);
        assert_eq!(target.destination, Destination::Datagram("192.0.2.7:0".parse().unwrap()));

        let target = Target::new("host", SocketAddr::new(ip, 0), true);
        assert_eq!(target.destination, Destination::Raw { ip, scope_id: 0 });
        assert_eq!(target.destination.socket_addr().port(), 0);
    }

    #[test]
    fn test_mapped_address_is_canonicalized() {
        let target = Target::new("mapped", "[::ffff:192.0.2.7]:0".parse().unwrap(), true);
        assert_eq!(target.ip, "192.0.2.7".parse::<IpAddr>().unwrap());
        assert_eq!(target.destination.socket_addr(), "192.0.2.7:0".parse().unwrap());
    }

    #[test]
    fn test_scope_id_survives_into_destination() {
        let addr = SocketAddr::V6(SocketAddrV6::new("fe80::1".parse().unwrap(), 0, 0, 3));
        for privileged in [false, true] {
            let target = Target::new("fe80::1%3", addr, privileged);
            match target.destination.socket_addr() {
                SocketAddr::V6(v6) => assert_eq!(v6.scope_id(), 3),
                other => panic!("expected an IPv6 destination, got {}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_zoned_literal_keeps_scope_id() {
        let target = resolve_target("fe80::1%1", false, false, false).await.unwrap();
        assert_eq!(target.ip, "fe80::1".parse::<IpAddr>().unwrap());
        match target.destination.socket_addr() {
            SocketAddr::V6(v6) => assert_eq!(v6.scope_id(), 1),
            other => panic!("expected an IPv6 destination, got {}", other),
        }
    }
}
