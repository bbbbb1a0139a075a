use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

use super::{IpVersion, PROTOCOL_ICMP, PROTOCOL_ICMPV6};

pub const ICMP_ECHO_REQUEST: u8 = 8;
pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMPV6_ECHO_REQUEST: u8 = 128;
pub const ICMPV6_ECHO_REPLY: u8 = 129;

pub const ECHO_PAYLOAD: &[u8] = b"Ping: Echo Request send";

const HEADER_LEN: usize = 4;
const ECHO_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    EchoReply,
    EchoRequest,
    DestinationUnreachable,
    PacketTooBig,
    TimeExceeded,
    ParameterProblem,
    Redirect,
    SourceQuench,
    Unknown(u8),
}

impl MessageType {
    pub fn from_wire(version: IpVersion, value: u8) -> Self {
        if value == version.echo_reply_type() {
            return MessageType::EchoReply;
        }
        if value == version.echo_request_type() {
            return MessageType::EchoRequest;
        }
        match (version, value) {
            (IpVersion::V4, 3) | (IpVersion::V6, 1) => MessageType::DestinationUnreachable,
            (IpVersion::V6, 2) => MessageType::PacketTooBig,
            (IpVersion::V4, 11) | (IpVersion::V6, 3) => MessageType::TimeExceeded,
            (IpVersion::V4, 12) | (IpVersion::V6, 4) => MessageType::ParameterProblem,
            (IpVersion::V4, 5) | (IpVersion::V6, 137) => MessageType::Redirect,
            (IpVersion::V4, 4) => MessageType::SourceQuench,
            (_, other) => MessageType::Unknown(other),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageType::EchoReply => write!(f, "echo reply"),
            MessageType::EchoRequest => write!(f, "echo request"),
            MessageType::DestinationUnreachable => write!(f, "destination unreachable"),
            MessageType::PacketTooBig => write!(f, "packet too big"),
            MessageType::TimeExceeded => write!(f, "time exceeded"),
            MessageType::ParameterProblem => write!(f, "parameter problem"),
            MessageType::SourceQuench => write!(f, "source quench"),
            MessageType::Redirect => write!(f, "redirect"),
            MessageType::Unknown(value) => write!(f, "unknown type {}", value),
        }
    }
}

#[derive(Debug)]
pub enum DecodeError {
    UnsupportedProtocol(u8),
    Truncated { needed: usize, got: usize },
    Io(io::Error),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::UnsupportedProtocol(p) => write!(f, "unsupported protocol number {}", p),
            DecodeError::Truncated { needed, got } => {
                write!(f, "message too short: need {} bytes, got {}", needed, got)
            }
            DecodeError::Io(e) => write!(f, "malformed message: {}", e),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<io::Error> for DecodeError {
    fn from(e: io::Error) -> Self {
        DecodeError::Io(e)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoBody {
    pub identifier: u16,
    pub sequence: u16,
    pub payload: Vec<u8>,
}

/// A parsed ICMP/ICMPv6 message. Only echo messages get a typed body.
#[derive(Debug, Clone)]
pub struct IcmpMessage {
    pub kind: MessageType,
    pub code: u8,
    pub checksum: u16,
    pub echo: Option<EchoBody>,
}

impl IcmpMessage {
    pub fn decode(protocol: u8, data: &[u8]) -> Result<Self, DecodeError> {
        let version = match protocol {
            PROTOCOL_ICMP => IpVersion::V4,
            PROTOCOL_ICMPV6 => IpVersion::V6,
            other => return Err(DecodeError::UnsupportedProtocol(other)),
        };
        if data.len() < HEADER_LEN {
            return Err(DecodeError::Truncated { needed: HEADER_LEN, got: data.len() });
        }

        let mut cursor = Cursor::new(data);
        let raw_type = cursor.read_u8()?;
        let code = cursor.read_u8()?;
        let checksum = cursor.read_u16::<BigEndian>()?;
        let kind = MessageType::from_wire(version, raw_type);

        let echo = match kind {
            MessageType::EchoReply | MessageType::EchoRequest => {
                if data.len() < ECHO_HEADER_LEN {
                    return Err(DecodeError::Truncated { needed: ECHO_HEADER_LEN, got: data.len() });
                }
                let identifier = cursor.read_u16::<BigEndian>()?;
                let sequence = cursor.read_u16::<BigEndian>()?;
                let mut payload = Vec::new();
                cursor.read_to_end(&mut payload)?;
                Some(EchoBody { identifier, sequence, payload })
            }
            _ => None,
        };

        Ok(Self { kind, code, checksum, echo })
    }
}

#[derive(Debug, Clone)]
pub struct EchoRequest {
    pub version: IpVersion,
    pub identifier: u16,
    pub sequence: u16,
}

impl EchoRequest {
    pub fn new(version: IpVersion, identifier: u16, sequence: u16) -> Self {
        Self { version, identifier, sequence }
    }

    /// Serializes the request. A write failure is logged and whatever was
    /// produced up to that point is returned.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(ECHO_HEADER_LEN + ECHO_PAYLOAD.len());
        if let Err(e) = self.write_to(&mut bytes) {
            log::error!("failed to encode echo request {}: {}", self.sequence, e);
            return bytes;
        }
        // ICMPv6 checksums cover a pseudo-header; the kernel computes those.
        if self.version == IpVersion::V4 {
            let checksum = compute_checksum(&bytes);
            bytes[2..4].copy_from_slice(&checksum.to_be_bytes());
        }
        bytes
    }

    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u8(self.version.echo_request_type())?;
        w.write_u8(0)?;
        w.write_u16::<BigEndian>(0)?;
        w.write_u16::<BigEndian>(self.identifier)?;
        w.write_u16::<BigEndian>(self.sequence)?;
        w.write_all(ECHO_PAYLOAD)
    }
}

/// Internet checksum (RFC 1071).
pub fn compute_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Drops a leading IPv4 header if one is present. Raw sockets (and datagram
/// sockets on BSDs) hand back the whole IP packet.
pub fn strip_ipv4_header(data: &[u8]) -> &[u8] {
    if data.len() >= 20 && data[0] >> 4 == 4 {
        let ihl = (data[0] & 0x0F) as usize * 4;
        if ihl >= 20 && data.len() >= ihl {
            return &data[ihl..];
        }
    }
    data
}
