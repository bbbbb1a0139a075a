use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::AsRawFd;
use std::ptr;
use tokio::io::unix::AsyncFd;

use crate::icmp::{Datagram, IpVersion, strip_ipv4_header};

/// The send/receive half of a session. `IcmpConnection` is the real one;
/// the exchange loop is generic so it can run against a scripted transport.
pub trait EchoTransport {
    fn version(&self) -> IpVersion;

    /// True when the kernel owns the echo identifier (unprivileged datagram
    /// sockets) and only delivers replies addressed to this socket.
    fn kernel_assigns_identifier(&self) -> bool;

    async fn send_to(&self, buf: &[u8], dest: SocketAddr) -> io::Result<usize>;

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<Datagram>;
}

/// One of the four socket flavours, keyed by (family, privileged).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenSpec {
    pub version: IpVersion,
    pub privileged: bool,
}

impl ListenSpec {
    pub fn select(addr: IpAddr, privileged: bool) -> Self {
        Self { version: IpVersion::of(addr), privileged }
    }

    pub fn domain(&self) -> Domain {
        match self.version {
            IpVersion::V4 => Domain::IPV4,
            IpVersion::V6 => Domain::IPV6,
        }
    }

    pub fn socket_type(&self) -> Type {
        if self.privileged { Type::RAW } else { Type::DGRAM }
    }

    pub fn protocol(&self) -> Protocol {
        match self.version {
            IpVersion::V4 => Protocol::ICMPV4,
            IpVersion::V6 => Protocol::ICMPV6,
        }
    }

    /// Linux rewrites the echo identifier of datagram ICMP sockets and only
    /// delivers replies carrying it. Elsewhere the identifier goes out as
    /// written and every process sees every reply.
    pub fn kernel_assigns_identifier(&self) -> bool {
        cfg!(target_os = "linux") && !self.privileged
    }

    pub fn wildcard(&self) -> SocketAddr {
        match self.version {
            IpVersion::V4 => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpVersion::V6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        }
    }
}

impl std::fmt::Display for ListenSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.privileged { "raw" } else { "datagram" };
        write!(f, "{} {} ICMP socket", self.version, kind)
    }
}

#[derive(Debug)]
pub struct OpenError {
    pub spec: ListenSpec,
    pub source: io::Error,
}

impl std::fmt::Display for OpenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to open {} on {}: {}", self.spec, self.spec.wildcard().ip(), self.source)?;
        if self.source.kind() == io::ErrorKind::PermissionDenied {
            if self.spec.privileged {
                write!(f, " (raw sockets need root or CAP_NET_RAW)")?;
            } else {
                write!(f, " (check net.ipv4.ping_group_range, or use -root)")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for OpenError {}

/// An open ICMP socket registered with the tokio reactor. The descriptor is
/// closed when this value is dropped.
pub struct IcmpConnection {
    fd: AsyncFd<Socket>,
    spec: ListenSpec,
}

impl IcmpConnection {
    pub fn open(addr: IpAddr, privileged: bool) -> Result<Self, OpenError> {
        let spec = ListenSpec::select(addr, privileged);
        let fail = |source| OpenError { spec, source };

        let socket = Socket::new(spec.domain(), spec.socket_type(), Some(spec.protocol())).map_err(fail)?;
        socket.set_nonblocking(true).map_err(fail)?;
        socket.bind(&spec.wildcard().into()).map_err(fail)?;

        if let Err(e) = enable_hop_limit_control(&socket, spec.version) {
            log::warn!("could not enable {} control messages: {}", spec.version.hop_label(), e);
        }

        // SAFETY: the socket is moved into the AsyncFd and closed only when it is dropped.
        let fd = unsafe { AsyncFd::register(socket) }.map_err(|e| fail(e.into()))?;
        log::debug!("opened {}", spec);
        Ok(Self { fd, spec })
    }

    pub fn spec(&self) -> ListenSpec {
        self.spec
    }
}

impl EchoTransport for IcmpConnection {
    fn version(&self) -> IpVersion {
        self.spec.version
    }

    fn kernel_assigns_identifier(&self) -> bool {
        self.spec.kernel_assigns_identifier()
    }

    async fn send_to(&self, buf: &[u8], dest: SocketAddr) -> io::Result<usize> {
        let dest = SockAddr::from(dest);
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| inner.get_ref().send_to(buf, &dest)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<Datagram> {
        let version = self.spec.version;
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| recv_with_control(inner.get_ref(), version, &mut *buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

fn enable_hop_limit_control(socket: &Socket, version: IpVersion) -> io::Result<()> {
    let (level, name) = match version {
        IpVersion::V4 => (libc::IPPROTO_IP, libc::IP_RECVTTL),
        IpVersion::V6 => (libc::IPPROTO_IPV6, libc::IPV6_RECVHOPLIMIT),
    };
    let enable: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            name,
            (&enable as *const libc::c_int).cast(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn recv_with_control(socket: &Socket, version: IpVersion, buf: &mut [u8]) -> io::Result<Datagram> {
    let mut addr: libc::sockaddr_storage = unsafe { mem::zeroed() };
    // u64 keeps the buffer aligned for cmsghdr.
    let mut control = [0u64; 16];
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = (&mut addr as *mut libc::sockaddr_storage).cast();
    msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = mem::size_of_val(&control) as _;

    let n = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    let n = n as usize;

    let hop_limit = unsafe { hop_limit_from_control(&msg) };
    let source = unsafe { SockAddr::new(addr, msg.msg_namelen) }
        .as_socket()
        .map(|s| s.ip().to_canonical());

    let data = match version {
        IpVersion::V4 => strip_ipv4_header(&buf[..n]).to_vec(),
        IpVersion::V6 => buf[..n].to_vec(),
    };
    log::debug!("received {} bytes ({} after header strip) from {:?}", n, data.len(), source);

    Ok(Datagram { data, source, hop_limit })
}

/// Walks the control messages of a completed `recvmsg` looking for the
/// TTL / hop limit.
///
/// # Safety
/// `msg` must describe a control buffer filled in by a successful `recvmsg`.
unsafe fn hop_limit_from_control(msg: &libc::msghdr) -> Option<u8> {
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(msg) };
    while !cmsg.is_null() {
        let hdr = unsafe { &*cmsg };
        let data = unsafe { libc::CMSG_DATA(cmsg) };
        match (hdr.cmsg_level, hdr.cmsg_type) {
            (libc::IPPROTO_IP, libc::IP_TTL) | (libc::IPPROTO_IPV6, libc::IPV6_HOPLIMIT) => {
                let value = unsafe { ptr::read_unaligned(data as *const libc::c_int) };
                return u8::try_from(value).ok();
            }
            // BSDs report the TTL as a single byte under IP_RECVTTL.
            #[cfg(not(target_os = "linux"))]
            (libc::IPPROTO_IP, libc::IP_RECVTTL) => {
                return Some(unsafe { *data });
            }
            _ => {}
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(msg, cmsg) };
    }
    None
}
