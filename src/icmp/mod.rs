pub mod packet;
pub mod socket;

pub use packet::*;
pub use socket::*;

use std::net::IpAddr;

pub const PROTOCOL_ICMP: u8 = 1;
pub const PROTOCOL_ICMPV6: u8 = 58;

/// Address family of a session, decided once when the connection is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    /// IPv4-mapped IPv6 addresses are treated as IPv4.
    pub fn of(addr: IpAddr) -> Self {
        match addr.to_canonical() {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }

    pub fn protocol(self) -> u8 {
        match self {
            IpVersion::V4 => PROTOCOL_ICMP,
            IpVersion::V6 => PROTOCOL_ICMPV6,
        }
    }

    pub fn echo_request_type(self) -> u8 {
        match self {
            IpVersion::V4 => ICMP_ECHO_REQUEST,
            IpVersion::V6 => ICMPV6_ECHO_REQUEST,
        }
    }

    pub fn echo_reply_type(self) -> u8 {
        match self {
            IpVersion::V4 => ICMP_ECHO_REPLY,
            IpVersion::V6 => ICMPV6_ECHO_REPLY,
        }
    }

    /// Name of the per-packet hop counter as printed in reply lines.
    pub fn hop_label(self) -> &'static str {
        match self {
            IpVersion::V4 => "ttl",
            IpVersion::V6 => "hlim",
        }
    }
}

impl std::fmt::Display for IpVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpVersion::V4 => write!(f, "IPv4"),
            IpVersion::V6 => write!(f, "IPv6"),
        }
    }
}

/// One datagram read from the connection, with the IP header already removed.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub data: Vec<u8>,
    pub source: Option<IpAddr>,
    /// TTL (IPv4) or hop limit (IPv6) from the packet's control data.
    pub hop_limit: Option<u8>,
}

/// A matched echo reply, ready to be reported.
#[derive(Debug, Clone)]
pub struct IcmpResponse {
    pub source: Option<IpAddr>,
    pub bytes: usize,
    pub rtt: std::time::Duration,
    pub hop_limit: Option<u8>,
    pub sequence: u16,
    pub version: IpVersion,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_classification() {
        assert_eq!(IpVersion::of("8.8.8.8".parse().unwrap()), IpVersion::V4);
        assert_eq!(IpVersion::of("2001:db8::1".parse().unwrap()), IpVersion::V6);
        assert_eq!(IpVersion::of("::ffff:10.0.0.1".parse().unwrap()), IpVersion::V4);
    }

    #[test]
    fn test_version_constants() {
        assert_eq!(IpVersion::V4.protocol(), 1);
        assert_eq!(IpVersion::V6.protocol(), 58);
        assert_eq!(IpVersion::V4.echo_request_type(), 8);
        assert_eq!(IpVersion::V4.echo_reply_type(), 0);
        assert_eq!(IpVersion::V6.echo_request_type(), 128);
        assert_eq!(IpVersion::V6.echo_reply_type(), 129);
        assert_eq!(IpVersion::V4.to_string(), "IPv4");
        assert_eq!(IpVersion::V6.to_string(), "IPv6");
    }
}
