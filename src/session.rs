use anyhow::Context;
use std::io;
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::{Instant, sleep, timeout_at};

use crate::dns::Target;
use crate::icmp::{DecodeError, EchoBody, EchoRequest, EchoTransport, IcmpMessage, IcmpResponse, IpVersion, MessageType};
use crate::stats::PingStatistics;
use crate::utils::Shutdown;

const ICMP_HEADER_LEN: usize = 8;
const IPV4_MAX_HEADER_LEN: usize = 60;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub timeout: Duration,
    pub interval: Duration,
    /// `None` runs until interrupted.
    pub count: Option<u64>,
    pub packet_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            interval: Duration::from_secs(1),
            count: None,
            packet_size: 56,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    CountExhausted,
    Interrupted,
}

#[derive(Debug)]
pub enum RecvError {
    Timeout,
    Io(io::Error),
}

impl RecvError {
    fn from_io(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => RecvError::Timeout,
            _ => RecvError::Io(e),
        }
    }
}

impl std::fmt::Display for RecvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecvError::Timeout => write!(f, "receive timed out"),
            RecvError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for RecvError {}

#[derive(Debug)]
enum Outcome {
    Reply(IcmpResponse),
    Failed(RecvError),
    Undecodable(DecodeError),
    Unexpected(MessageType, u8, Option<IpAddr>),
}

/// One request and whatever came back for it.
#[derive(Debug)]
struct Exchange {
    sequence: u16,
    sent_at: Instant,
    received_at: Option<Instant>,
    outcome: Outcome,
}

/// Sequence numbers follow the iteration index and wrap at 16 bits.
pub fn sequence_number(index: u64) -> u16 {
    (index & 0xffff) as u16
}

/// The send/wait/receive loop for one target over one connection.
pub struct Session<T> {
    transport: T,
    target: Target,
    config: SessionConfig,
    identifier: u16,
    stats: PingStatistics,
}

impl<T: EchoTransport> Session<T> {
    pub fn new(transport: T, target: Target, config: SessionConfig, identifier: u16) -> Self {
        let stats = PingStatistics::new(&target.host);
        Self { transport, target, config, identifier, stats }
    }

    pub fn statistics(&self) -> &PingStatistics {
        &self.stats
    }

    /// Runs until the configured count is reached or `shutdown` fires. An
    /// interrupt abandons whatever exchange is in flight.
    pub async fn run(&mut self, shutdown: &mut Shutdown) -> anyhow::Result<StopReason> {
        let mut index: u64 = 0;
        loop {
            if shutdown.is_requested() {
                return Ok(StopReason::Interrupted);
            }
            if self.config.count == Some(index) {
                return Ok(StopReason::CountExhausted);
            }
            let last = self.config.count.is_some_and(|count| index + 1 == count);

            tokio::select! {
                biased;
                _ = shutdown.requested() => return Ok(StopReason::Interrupted),
                step = self.iteration(index, last) => step?,
            }
            index += 1;
        }
    }

    async fn iteration(&mut self, index: u64, last: bool) -> anyhow::Result<()> {
        let exchange = self.exchange(sequence_number(index)).await?;
        let pause = self.report(exchange);
        if pause && !last {
            sleep(self.config.interval).await;
        }
        Ok(())
    }

    async fn exchange(&mut self, sequence: u16) -> anyhow::Result<Exchange> {
        let version = self.transport.version();
        let request = EchoRequest::new(version, self.identifier, sequence).encode();
        let dest = self.target.destination.socket_addr();

        let sent_at = Instant::now();
        let written = self
            .transport
            .send_to(&request, dest)
            .await
            .with_context(|| format!("sending echo request {} to {} failed", sequence, dest))?;
        if written != request.len() {
            anyhow::bail!("short write to {}: {} of {} bytes sent", dest, written, request.len());
        }
        self.stats.record_sent();

        let deadline = Instant::now() + self.config.timeout;
        let mut buf = vec![0u8; self.recv_buffer_len(version)];
        loop {
            let datagram = match timeout_at(deadline, self.transport.recv_from(&mut buf)).await {
                Err(_elapsed) => return Ok(Exchange::failed(sequence, sent_at, RecvError::Timeout)),
                Ok(Err(e)) => return Ok(Exchange::failed(sequence, sent_at, RecvError::from_io(e))),
                Ok(Ok(datagram)) => datagram,
            };
            let received_at = Instant::now();
            let done = |outcome| Exchange { sequence, sent_at, received_at: Some(received_at), outcome };

            let message = match IcmpMessage::decode(version.protocol(), &datagram.data) {
                Ok(message) => message,
                Err(e) => return Ok(done(Outcome::Undecodable(e))),
            };

            match (message.kind, message.echo) {
                (MessageType::EchoReply, Some(echo)) if self.is_ours(&echo, sequence) => {
                    let rtt = received_at - sent_at;
                    self.stats.record_received(rtt);
                    return Ok(done(Outcome::Reply(IcmpResponse {
                        source: datagram.source,
                        bytes: datagram.data.len(),
                        rtt,
                        hop_limit: datagram.hop_limit,
                        sequence,
                        version,
                    })));
                }
                (MessageType::EchoReply, Some(echo)) => {
                    log::debug!("skipping echo reply id={} seq={}", echo.identifier, echo.sequence);
                }
                (MessageType::EchoRequest, _) | (MessageType::Unknown(_), _) => {
                    log::debug!("skipping {} message (checksum {:#06x})", message.kind, message.checksum);
                }
                (kind, _) => return Ok(done(Outcome::Unexpected(kind, message.code, datagram.source))),
            }
        }
    }

    fn is_ours(&self, echo: &EchoBody, sequence: u16) -> bool {
        echo.sequence == sequence && (self.transport.kernel_assigns_identifier() || echo.identifier == self.identifier)
    }

    fn recv_buffer_len(&self, version: IpVersion) -> usize {
        let header_room = match version {
            IpVersion::V4 => IPV4_MAX_HEADER_LEN,
            IpVersion::V6 => 0,
        };
        self.config.packet_size + ICMP_HEADER_LEN + header_room
    }

    /// Prints the per-iteration line. Returns whether the interval pause
    /// should follow. Receive failures, timeouts included, move straight on
    /// to the next request.
    fn report(&self, exchange: Exchange) -> bool {
        log::debug!(
            "icmp_seq={} sent at {:?}, answered at {:?}",
            exchange.sequence,
            exchange.sent_at,
            exchange.received_at
        );
        match exchange.outcome {
            Outcome::Reply(response) => {
                println!("{}", self.stats.format_response(&response));
                true
            }
            Outcome::Failed(RecvError::Timeout) => {
                println!("Request timeout for icmp_seq {}", exchange.sequence);
                false
            }
            Outcome::Failed(RecvError::Io(e)) => {
                eprintln!("ERROR while receiving echo reply: {}", e);
                false
            }
            Outcome::Undecodable(e) => {
                eprintln!("ERROR while parsing echo reply: {}", e);
                true
            }
            Outcome::Unexpected(kind, code, source) => {
                match source {
                    Some(ip) => println!("Unexpected reply received from {}: {} (code {})", ip, kind, code),
                    None => println!("Unexpected reply received: {} (code {})", kind, code),
                }
                true
            }
        }
    }
}

impl Exchange {
    fn failed(sequence: u16, sent_at: Instant, error: RecvError) -> Self {
        Self { sequence, sent_at, received_at: None, outcome: Outcome::Failed(error) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::icmp::Datagram;
    use std::collections::VecDeque;
    use std::net::SocketAddr;
    use std::sync::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Script {
        Echo,
        Timeout,
        Error,
        Unreachable,
        Garbage,
        StaleEcho,
        ForeignEcho,
        OwnRequest,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum OnSend {
        Ok,
        Short,
        Fail,
    }

    struct ScriptedTransport {
        version: IpVersion,
        kernel_ids: bool,
        on_send: OnSend,
        script: Mutex<VecDeque<Script>>,
        sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
    }

    impl ScriptedTransport {
        fn new(version: IpVersion, script: &[Script]) -> Self {
            Self {
                version,
                kernel_ids: true,
                on_send: OnSend::Ok,
                script: Mutex::new(script.iter().copied().collect()),
                sent: Mutex::new(Vec::new()),
            }
        }

        fn raw(mut self) -> Self {
            self.kernel_ids = false;
            self
        }

        fn on_send(mut self, on_send: OnSend) -> Self {
            self.on_send = on_send;
            self
        }

        fn sent_sequences(&self) -> Vec<u16> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|(bytes, _)| u16::from_be_bytes([bytes[6], bytes[7]]))
                .collect()
        }

        fn reply_to_last(&self, rewrite: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
            let mut bytes = self.sent.lock().unwrap().last().unwrap().0.clone();
            bytes[0] = self.version.echo_reply_type();
            rewrite(&mut bytes);
            bytes
        }
    }

    impl EchoTransport for ScriptedTransport {
        fn version(&self) -> IpVersion {
            self.version
        }

        fn kernel_assigns_identifier(&self) -> bool {
            self.kernel_ids
        }

        async fn send_to(&self, buf: &[u8], dest: SocketAddr) -> io::Result<usize> {
            match self.on_send {
                OnSend::Fail => Err(io::Error::other("network is unreachable")),
                OnSend::Short => Ok(buf.len() - 1),
                OnSend::Ok => {
                    self.sent.lock().unwrap().push((buf.to_vec(), dest));
                    Ok(buf.len())
                }
            }
        }

        async fn recv_from(&self, _buf: &mut [u8]) -> io::Result<Datagram> {
            let next = self.script.lock().unwrap().pop_front();
            let data = match next {
                None | Some(Script::Timeout) => std::future::pending().await,
                Some(Script::Error) => return Err(io::Error::other("connection refused")),
                Some(Script::Echo) => self.reply_to_last(|_| {}),
                Some(Script::StaleEcho) => self.reply_to_last(|b| {
                    let seq = u16::from_be_bytes([b[6], b[7]]).wrapping_sub(1);
                    b[6..8].copy_from_slice(&seq.to_be_bytes());
                }),
                Some(Script::ForeignEcho) => self.reply_to_last(|b| {
                    let id = u16::from_be_bytes([b[4], b[5]]).wrapping_add(1);
                    b[4..6].copy_from_slice(&id.to_be_bytes());
                }),
                Some(Script::OwnRequest) => self.sent.lock().unwrap().last().unwrap().0.clone(),
                Some(Script::Unreachable) => vec![3, 1, 0, 0, 0, 0, 0, 0],
                Some(Script::Garbage) => vec![0],
            };
            Ok(Datagram { data, source: Some("192.0.2.1".parse().unwrap()), hop_limit: Some(57) })
        }
    }

    fn session(transport: ScriptedTransport, count: Option<u64>) -> Session<ScriptedTransport> {
        let target = Target::new("192.0.2.1", "192.0.2.1:0".parse().unwrap(), !transport.kernel_ids);
        let config = SessionConfig { count, ..SessionConfig::default() };
        Session::new(transport, target, config, 0x4242)
    }

    fn idle_shutdown() -> (tokio::sync::watch::Sender<bool>, Shutdown) {
        Shutdown::channel()
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_replies_received() {
        let transport = ScriptedTransport::new(IpVersion::V4, &[Script::Echo; 3]);
        let mut session = session(transport, Some(3));
        let (_tx, mut shutdown) = idle_shutdown();

        let reason = session.run(&mut shutdown).await.unwrap();
        assert_eq!(reason, StopReason::CountExhausted);

        let stats = session.statistics();
        assert_eq!(stats.packets_sent, 3);
        assert_eq!(stats.packets_received, 3);
        assert_eq!(stats.rtts.len(), 3);
        assert_eq!(stats.loss_percentage(), 0.0);
        assert_eq!(session.transport.sent_sequences(), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_count_as_loss() {
        let script = [Script::Echo, Script::Timeout, Script::Echo, Script::Timeout];
        let mut session = session(ScriptedTransport::new(IpVersion::V4, &script), Some(4));
        let (_tx, mut shutdown) = idle_shutdown();

        session.run(&mut shutdown).await.unwrap();

        let stats = session.statistics();
        assert_eq!(stats.packets_sent, 4);
        assert_eq!(stats.packets_received, 2);
        assert_eq!(stats.rtts.len(), 2);
        assert!((stats.loss_percentage() - 50.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_waits_for_configured_deadline() {
        let mut session = session(ScriptedTransport::new(IpVersion::V4, &[Script::Timeout]), Some(1));
        let (_tx, mut shutdown) = idle_shutdown();

        let started = Instant::now();
        session.run(&mut shutdown).await.unwrap();
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(10) && waited < Duration::from_secs(11));
        assert_eq!(session.statistics().packets_received, 0);
        assert!(session.statistics().rtts.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_failures_are_not_counted() {
        let script = [Script::Unreachable, Script::Garbage, Script::Error];
        let mut session = session(ScriptedTransport::new(IpVersion::V4, &script), Some(3));
        let (_tx, mut shutdown) = idle_shutdown();

        assert_eq!(session.run(&mut shutdown).await.unwrap(), StopReason::CountExhausted);
        assert_eq!(session.statistics().packets_sent, 3);
        assert_eq!(session.statistics().packets_received, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_error_skips_interval() {
        let script = [Script::Error, Script::Echo];
        let mut session = session(ScriptedTransport::new(IpVersion::V4, &script), Some(2));
        let (_tx, mut shutdown) = idle_shutdown();

        let started = Instant::now();
        session.run(&mut shutdown).await.unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(session.statistics().packets_sent, 2);
        assert_eq!(session.statistics().packets_received, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_is_followed_by_interval() {
        let mut session = session(ScriptedTransport::new(IpVersion::V4, &[Script::Echo; 2]), Some(2));
        let (_tx, mut shutdown) = idle_shutdown();

        let started = Instant::now();
        session.run(&mut shutdown).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_and_looped_packets_are_skipped() {
        let script = [Script::OwnRequest, Script::StaleEcho, Script::Echo];
        let transport = ScriptedTransport::new(IpVersion::V4, &script).raw();
        let mut session = session(transport, Some(1));
        let (_tx, mut shutdown) = idle_shutdown();

        session.run(&mut shutdown).await.unwrap();
        assert_eq!(session.statistics().packets_received, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_identifier_ignored_on_raw_socket() {
        let transport = ScriptedTransport::new(IpVersion::V4, &[Script::ForeignEcho]).raw();
        let mut session = session(transport, Some(1));
        let (_tx, mut shutdown) = idle_shutdown();

        session.run(&mut shutdown).await.unwrap();
        assert_eq!(session.statistics().packets_sent, 1);
        assert_eq!(session.statistics().packets_received, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kernel_identifier_accepted_on_datagram_socket() {
        let transport = ScriptedTransport::new(IpVersion::V4, &[Script::ForeignEcho]);
        let mut session = session(transport, Some(1));
        let (_tx, mut shutdown) = idle_shutdown();

        session.run(&mut shutdown).await.unwrap();
        assert_eq!(session.statistics().packets_received, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ipv6_uses_icmpv6_types() {
        let transport = ScriptedTransport::new(IpVersion::V6, &[Script::Echo]);
        let mut session = session(transport, Some(1));
        let (_tx, mut shutdown) = idle_shutdown();

        session.run(&mut shutdown).await.unwrap();
        assert_eq!(session.transport.sent.lock().unwrap()[0].0[0], 128);
        assert_eq!(session.statistics().packets_received, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_write_is_fatal() {
        let transport = ScriptedTransport::new(IpVersion::V4, &[Script::Echo]).on_send(OnSend::Short);
        let mut session = session(transport, Some(2));
        let (_tx, mut shutdown) = idle_shutdown();

        let err = session.run(&mut shutdown).await.unwrap_err();
        assert!(err.to_string().contains("short write"));
        assert_eq!(session.statistics().packets_sent, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_error_is_fatal() {
        let transport = ScriptedTransport::new(IpVersion::V4, &[]).on_send(OnSend::Fail);
        let mut session = session(transport, None);
        let (_tx, mut shutdown) = idle_shutdown();

        assert!(session.run(&mut shutdown).await.is_err());
        assert_eq!(session.statistics().packets_sent, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_count_sends_nothing() {
        let mut session = session(ScriptedTransport::new(IpVersion::V4, &[]), Some(0));
        let (_tx, mut shutdown) = idle_shutdown();

        assert_eq!(session.run(&mut shutdown).await.unwrap(), StopReason::CountExhausted);
        assert_eq!(session.statistics().packets_sent, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_before_start() {
        let mut session = session(ScriptedTransport::new(IpVersion::V4, &[Script::Echo]), None);
        let (tx, mut shutdown) = idle_shutdown();
        tx.send(true).unwrap();

        assert_eq!(session.run(&mut shutdown).await.unwrap(), StopReason::Interrupted);
        assert_eq!(session.statistics().packets_sent, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_abandons_in_flight_exchange() {
        let mut session = session(ScriptedTransport::new(IpVersion::V4, &[]), None);
        let (tx, mut shutdown) = idle_shutdown();
        tokio::spawn(async move {
            sleep(Duration::from_secs(25)).await;
            let _ = tx.send(true);
        });

        // Every request times out after 10s, so the third is in flight at 25s.
        assert_eq!(session.run(&mut shutdown).await.unwrap(), StopReason::Interrupted);
        assert_eq!(session.statistics().packets_sent, 3);
        assert_eq!(session.statistics().packets_received, 0);
    }

    #[test]
    fn test_sequence_wraps_at_16_bits() {
        assert_eq!(sequence_number(0), 0);
        assert_eq!(sequence_number(65535), 65535);
        assert_eq!(sequence_number(65536), 0);
        assert_eq!(sequence_number(65537), 1);
    }

    #[test]
    fn test_timeout_classification() {
        assert!(matches!(RecvError::from_io(io::ErrorKind::WouldBlock.into()), RecvError::Timeout));
        assert!(matches!(RecvError::from_io(io::ErrorKind::TimedOut.into()), RecvError::Timeout));
        assert!(matches!(
            RecvError::from_io(io::ErrorKind::ConnectionRefused.into()),
            RecvError::Io(_)
        ));
    }
}
