//! UDP session transport for RTP streams.
//!
//! An [`RtpSession`] owns one datagram socket plus the outbound stream
//! state (SSRC, sequence, timestamp). Sending is fire-and-forget; receiving
//! happens on a background task that parses each datagram and hands valid
//! packets to a caller-supplied handler.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::TransportError;
use crate::observability::MetricsContext;
use crate::rtp::RtpPacket;

/// Largest datagram the receive loop will accept.
const MAX_DATAGRAM: usize = 2048;

/// Callback invoked for every successfully parsed inbound packet.
///
/// Errors are logged by the receive loop and never stop it.
pub type PacketHandler = Box<dyn FnMut(RtpPacket, SocketAddr) -> anyhow::Result<()> + Send>;

#[derive(Debug, Default)]
struct Counters {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    invalid_datagrams: AtomicU64,
}

/// Snapshot of a session's traffic counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    /// Bytes of datagrams that parsed as RTP
    pub bytes_received: u64,
    pub invalid_datagrams: u64,
    pub elapsed: Duration,
    pub send_rate_pps: f64,
    pub receive_rate_pps: f64,
}

struct ReceiveTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// RTP session bound to a local UDP port.
///
/// # Example
///
/// ```ignore
/// use voip_bench_common::RtpSession;
///
/// let mut session = RtpSession::open("127.0.0.1", 0).await?;
/// session.set_remote("127.0.0.1", 12345).await?;
/// session.send(&[0u8; 160], 0, false).await?;
/// session.advance_timestamp(160);
/// session.close().await;
/// ```
pub struct RtpSession {
    // ---
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    remote: Option<SocketAddr>,

    ssrc: u32,
    sequence: u16,
    timestamp: u32,

    counters: Arc<Counters>,
    metrics: Option<MetricsContext>,
    started_at: Instant,
    receiver: Option<ReceiveTask>,
    closed: bool,
}

impl RtpSession {
    // ---
    /// Binds a UDP socket and initializes a fresh stream with a random
    /// SSRC, sequence and timestamp.
    ///
    /// # Arguments
    ///
    /// * `local_addr` - Interface to bind, e.g. `"0.0.0.0"` or `"127.0.0.1"`
    /// * `local_port` - Port to bind, 0 for an ephemeral port
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Bind`] carrying the OS error if the address
    /// is in use or otherwise unavailable. Falling back to another address
    /// is up to the caller.
    pub async fn open(local_addr: &str, local_port: u16) -> Result<Self, TransportError> {
        // ---
        let addr = format!("{local_addr}:{local_port}");
        let socket = UdpSocket::bind(&addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = socket
            .local_addr()
            .map_err(|source| TransportError::Bind { addr, source })?;

        let session = Self {
            socket: Arc::new(socket),
            local_addr,
            remote: None,
            ssrc: rand::random(),
            sequence: rand::random(),
            timestamp: rand::random(),
            counters: Arc::new(Counters::default()),
            metrics: None,
            started_at: Instant::now(),
            receiver: None,
            closed: false,
        };

        info!(
            "RTP session bound to {} (ssrc=0x{:08X})",
            session.local_addr, session.ssrc
        );
        Ok(session)
    }

    /// Reports traffic into the given metrics registry as well.
    pub fn with_metrics(mut self, metrics: MetricsContext) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Overrides the randomly chosen SSRC.
    pub fn with_ssrc(mut self, ssrc: u32) -> Self {
        self.ssrc = ssrc;
        self
    }

    /// Overrides the next outbound sequence number.
    pub fn set_sequence(&mut self, sequence: u16) {
        self.sequence = sequence;
    }

    pub fn set_timestamp(&mut self, timestamp: u32) {
        self.timestamp = timestamp;
    }

    /// Resolves and stores the destination for [`send`](Self::send).
    ///
    /// Accepts a hostname or a literal IP. When the name resolves to
    /// several addresses, one matching the local socket's family wins.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Resolve`] if no usable address is found.
    pub async fn set_remote(&mut self, host: &str, port: u16) -> Result<SocketAddr, TransportError> {
        // ---
        let target = format!("{host}:{port}");
        let candidates: Vec<SocketAddr> = lookup_host(&target)
            .await
            .map_err(|e| TransportError::Resolve(format!("{target}: {e}")))?
            .collect();

        let remote = candidates
            .iter()
            .copied()
            .find(|a| a.is_ipv4() == self.local_addr.is_ipv4())
            .or_else(|| candidates.first().copied())
            .ok_or_else(|| TransportError::Resolve(target.clone()))?;

        debug!("Remote endpoint set to {} ({})", remote, target);
        self.remote = Some(remote);
        Ok(remote)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Sequence number the next [`send`](Self::send) will use.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Advances the RTP timestamp by one frame's worth of samples.
    ///
    /// The step size depends on frame duration, which only the stream
    /// layer knows, so `send` never does this itself.
    pub fn advance_timestamp(&mut self, samples: u32) {
        self.timestamp = self.timestamp.wrapping_add(samples);
    }

    /// Builds a packet from the current stream state and transmits it.
    ///
    /// On success the sequence number advances by one (mod 65536). Failures
    /// are returned, not retried.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Closed`] after [`close`](Self::close)
    /// - [`TransportError::NoRemoteEndpoint`] without [`set_remote`](Self::set_remote)
    /// - [`TransportError::Send`] if the OS rejects the datagram
    pub async fn send(
        &mut self,
        payload: &[u8],
        payload_type: u8,
        marker: bool,
    ) -> Result<usize, TransportError> {
        // ---
        let packet = RtpPacket::new(self.sequence, self.timestamp, self.ssrc, payload.to_vec())
            .with_payload_type(payload_type)
            .with_marker(marker);

        let sent = self.send_packet(&packet).await?;
        self.sequence = self.sequence.wrapping_add(1);
        Ok(sent)
    }

    /// Transmits an already-built packet unchanged.
    ///
    /// Stream state is not touched, which lets a relay forward packets
    /// that belong to someone else's stream.
    pub async fn send_packet(&self, packet: &RtpPacket) -> Result<usize, TransportError> {
        // ---
        if self.closed {
            return Err(TransportError::Closed);
        }
        let remote = self.remote.ok_or(TransportError::NoRemoteEndpoint)?;

        let data = packet.serialize()?;
        let sent = self
            .socket
            .send_to(&data, remote)
            .await
            .map_err(|source| TransportError::Send {
                addr: remote,
                source,
            })?;

        let total = self.counters.packets_sent.fetch_add(1, Ordering::Relaxed) + 1;
        self.counters
            .bytes_sent
            .fetch_add(sent as u64, Ordering::Relaxed);
        if let Some(m) = &self.metrics {
            m.packets_sent_total.inc();
            m.bytes_sent_total.inc_by(sent as u64);
        }

        if total % 100 == 0 {
            debug!(
                "Sent {} packets to {} - seq={}",
                total, remote, packet.sequence
            );
        }

        Ok(sent)
    }

    /// Starts the background receive loop.
    ///
    /// Each datagram is parsed; malformed ones are logged and dropped, and
    /// valid packets go to `handler` together with their source address.
    /// Calling this while a loop is already running is a logged no-op.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] after [`close`](Self::close).
    pub fn start_receiving(&mut self, handler: PacketHandler) -> Result<(), TransportError> {
        // ---
        if self.closed {
            return Err(TransportError::Closed);
        }
        if self.receiver.is_some() {
            warn!("Receive loop already running on {}", self.local_addr);
            return Ok(());
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(receive_loop(
            Arc::clone(&self.socket),
            Arc::clone(&self.counters),
            self.metrics.clone(),
            handler,
            shutdown_rx,
        ));

        self.receiver = Some(ReceiveTask { shutdown, handle });
        debug!("Receive loop started on {}", self.local_addr);
        Ok(())
    }

    /// Stops the receive loop and waits for it to exit. Idempotent.
    pub async fn stop_receiving(&mut self) {
        // ---
        let Some(task) = self.receiver.take() else {
            return;
        };

        // The loop may already have exited on its own; a send error is fine.
        let _ = task.shutdown.send(true);
        if let Err(e) = task.handle.await {
            error!("Receive loop on {} ended abnormally: {}", self.local_addr, e);
        }
        debug!("Receive loop stopped on {}", self.local_addr);
    }

    /// Stops receiving and marks the session closed. Idempotent.
    ///
    /// The receive loop has fully exited by the time this returns.
    pub async fn close(&mut self) {
        // ---
        if self.closed {
            return;
        }
        self.stop_receiving().await;
        self.closed = true;
        info!("RTP session on {} closed", self.local_addr);
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn stats(&self) -> SessionStats {
        // ---
        let elapsed = self.started_at.elapsed();
        let secs = elapsed.as_secs_f64();
        let packets_sent = self.counters.packets_sent.load(Ordering::Relaxed);
        let packets_received = self.counters.packets_received.load(Ordering::Relaxed);
        let rate = |n: u64| if secs > 0.0 { n as f64 / secs } else { 0.0 };

        SessionStats {
            packets_sent,
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            packets_received,
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            invalid_datagrams: self.counters.invalid_datagrams.load(Ordering::Relaxed),
            elapsed,
            send_rate_pps: rate(packets_sent),
            receive_rate_pps: rate(packets_received),
        }
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    counters: Arc<Counters>,
    metrics: Option<MetricsContext>,
    mut handler: PacketHandler,
    mut shutdown: watch::Receiver<bool>,
) {
    // ---
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (len, src) = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            result = socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) => {
                    // ICMP port-unreachable surfaces here on some platforms.
                    debug!("recv_from failed: {}", e);
                    continue;
                }
            },
        };

        let packet = match RtpPacket::deserialize(&buf[..len]) {
            Ok(packet) => packet,
            Err(e) => {
                counters.invalid_datagrams.fetch_add(1, Ordering::Relaxed);
                if let Some(m) = &metrics {
                    m.invalid_datagrams_total.inc();
                }
                warn!("Dropped invalid datagram from {}: {}", src, e);
                continue;
            }
        };

        counters.packets_received.fetch_add(1, Ordering::Relaxed);
        counters
            .bytes_received
            .fetch_add(len as u64, Ordering::Relaxed);
        if let Some(m) = &metrics {
            m.packets_received_total.inc();
            m.bytes_received_total.inc_by(len as u64);
        }

        let sequence = packet.sequence;
        if let Err(e) = handler(packet, src) {
            error!("Packet handler failed for seq={} from {}: {:#}", sequence, src, e);
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_send_without_remote_fails() {
        // ---
        let mut session = RtpSession::open("127.0.0.1", 0).await.expect("open failed");
        let result = session.send(&[1, 2, 3], 0, false).await;
        assert!(matches!(result, Err(TransportError::NoRemoteEndpoint)));
    }

    #[tokio::test]
    async fn test_bind_in_use_fails() {
        // ---
        let first = RtpSession::open("127.0.0.1", 0).await.expect("open failed");
        let port = first.local_addr().port();

        let second = RtpSession::open("127.0.0.1", port).await;
        assert!(matches!(second, Err(TransportError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_send_advances_sequence_only() {
        // ---
        let mut session = RtpSession::open("127.0.0.1", 0).await.expect("open failed");
        session.set_remote("127.0.0.1", 9).await.expect("remote failed");
        session.set_sequence(65535);
        let ts = session.timestamp();

        let sent = session.send(&[0; 160], 0, false).await.expect("send failed");
        assert_eq!(sent, 12 + 160);
        assert_eq!(session.sequence(), 0);
        assert_eq!(session.timestamp(), ts);

        session.advance_timestamp(160);
        assert_eq!(session.timestamp(), ts.wrapping_add(160));
        assert_eq!(session.stats().packets_sent, 1);
    }

    #[tokio::test]
    async fn test_loopback_receive_and_invalid_datagram() {
        // ---
        let mut rx = RtpSession::open("127.0.0.1", 0).await.expect("open failed");
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        rx.start_receiving(Box::new(move |packet: RtpPacket, _src: SocketAddr| {
            sink.lock().unwrap().push(packet);
            Ok(())
        }))
        .expect("start failed");

        let mut tx = RtpSession::open("127.0.0.1", 0)
            .await
            .expect("open failed")
            .with_ssrc(0xCAFE);
        tx.set_remote("127.0.0.1", rx.local_addr().port())
            .await
            .expect("remote failed");

        let raw = UdpSocket::bind("127.0.0.1:0").await.expect("bind failed");
        raw.send_to(b"short", rx.local_addr()).await.expect("raw send failed");

        for _ in 0..5 {
            tx.send(&[7; 20], 11, false).await.expect("send failed");
        }

        for _ in 0..50 {
            if received.lock().unwrap().len() == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        rx.close().await;
        rx.close().await;

        let packets = received.lock().unwrap();
        assert_eq!(packets.len(), 5);
        assert!(packets.iter().all(|p| p.ssrc == 0xCAFE && p.payload_type == 11));
        let stats = rx.stats();
        assert_eq!(stats.invalid_datagrams, 1);
        assert_eq!(stats.packets_received, 5);
        // 12-byte header plus 20-byte payload each; the junk datagram is not counted
        assert_eq!(stats.bytes_received, 5 * 32);
    }

    #[tokio::test]
    async fn test_handler_error_does_not_stop_loop() {
        // ---
        let mut rx = RtpSession::open("127.0.0.1", 0).await.expect("open failed");
        let count = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&count);
        rx.start_receiving(Box::new(move |_packet: RtpPacket, _src: SocketAddr| {
            seen.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("consumer failure")
        }))
        .expect("start failed");

        let mut tx = RtpSession::open("127.0.0.1", 0).await.expect("open failed");
        tx.set_remote("127.0.0.1", rx.local_addr().port())
            .await
            .expect("remote failed");
        for _ in 0..3 {
            tx.send(&[1], 0, false).await.expect("send failed");
        }

        for _ in 0..50 {
            if count.load(Ordering::SeqCst) == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        rx.close().await;

        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        // ---
        let mut session = RtpSession::open("127.0.0.1", 0).await.expect("open failed");
        session.set_remote("localhost", 9).await.expect("remote failed");
        session.close().await;

        let result = session.send(&[1], 0, false).await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }
}
