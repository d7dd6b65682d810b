//! One client session relayed to the upstream resolver
//!
//! A tunnel runs three tasks once admitted:
//!
//! - client → upstream: reads client frames, waits on the tenant's rate
//!   limiter, sends the bytes as UDP datagrams
//! - upstream → client: reads datagrams and queues them for the client
//! - writer: drains the outbound queue (datagrams and keepalive pings) into
//!   the client sink
//!
//! All three select on the tunnel's cancellation token, so `close` stops them
//! promptly wherever they are blocked. The UDP socket is owned by the relay
//! tasks and is dropped when they exit.

use crate::error::{RejectReason, RelayError};
use crate::rate_limiter::RateLimiter;
use crate::tenant::Tenant;
use bytes::Bytes;
use dnsbroker_transport::{ClientSink, ClientSource, ClientStream, InboundFrame, OutboundFrame};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Largest payload a single UDP datagram can carry
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique tunnel identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Admitted,
    Relaying,
    Closed,
}

/// Byte counters; sent is client → upstream, received is upstream → client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

pub struct Tunnel {
    session_id: SessionId,
    tenant_id: String,
    tenant: Weak<Tenant>,
    upstream: SocketAddr,
    peer_addr: Option<SocketAddr>,
    state: Mutex<TunnelState>,
    last_activity: Mutex<Instant>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    outbound: mpsc::Sender<OutboundFrame>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("session_id", &self.session_id)
            .field("tenant_id", &self.tenant_id)
            .field("upstream", &self.upstream)
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Tunnel {
    /// Admit `stream` as a new tunnel of `tenant`
    ///
    /// On rejection the stream is closed before returning.
    pub async fn admit(
        tenant: &Arc<Tenant>,
        stream: ClientStream,
    ) -> Result<Arc<Tunnel>, RejectReason> {
        let limit = tenant.max_tunnels();
        let too_many = || RejectReason::TooManyTunnels {
            tenant: tenant.id().to_string(),
            limit,
        };

        // Cheap early check; the authoritative one happens on registration.
        if tenant.active_tunnels() >= limit {
            warn!(tenant = %tenant.id(), limit, "Rejected tunnel: tenant at capacity");
            stream.close().await;
            return Err(too_many());
        }

        let upstream = tenant.settings().upstream;
        let socket = match connect_upstream(upstream).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!(tenant = %tenant.id(), upstream = %upstream, "Failed to open upstream association: {}", e);
                stream.close().await;
                return Err(RejectReason::UpstreamUnavailable(e.to_string()));
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::channel(tenant.settings().client_buffer.max(1));
        let tunnel = Arc::new(Tunnel {
            session_id: SessionId::next(),
            tenant_id: tenant.id().to_string(),
            tenant: Arc::downgrade(tenant),
            upstream,
            peer_addr: stream.peer_addr(),
            state: Mutex::new(TunnelState::Admitted),
            last_activity: Mutex::new(Instant::now()),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            outbound: outbound_tx,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        if !tenant.try_register(&tunnel) {
            warn!(tenant = %tenant.id(), limit, "Rejected tunnel: tenant at capacity");
            stream.close().await;
            return Err(too_many());
        }

        tunnel.start(
            stream,
            Arc::new(socket),
            tenant.rate_limiter().clone(),
            outbound_rx,
        );

        info!(
            tenant = %tunnel.tenant_id,
            session = %tunnel.session_id,
            peer = ?tunnel.peer_addr,
            upstream = %upstream,
            "Tunnel admitted"
        );

        Ok(tunnel)
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn upstream(&self) -> SocketAddr {
        self.upstream
    }

    pub fn state(&self) -> TunnelState {
        *lock(&self.state)
    }

    pub fn is_closed(&self) -> bool {
        self.state() == TunnelState::Closed
    }

    pub fn stats(&self) -> TunnelStats {
        TunnelStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }

    pub fn last_activity(&self) -> Instant {
        *lock(&self.last_activity)
    }

    /// Record activity now
    pub fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    /// Whether the tunnel saw activity within `window` before `now`
    pub fn is_alive(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.last_activity()) < window
    }

    /// Queue a protocol-level ping; returns false if it could not be queued
    pub fn ping(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        self.outbound.try_send(OutboundFrame::Ping).is_ok()
    }

    /// Close the tunnel. Closing an already closed tunnel is a no-op.
    pub fn close(&self) {
        self.shutdown("closed by broker");
    }

    /// Wait until the tunnel is closed and its relay tasks have exited
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for task in tasks {
            let _ = task.await;
        }
    }

    pub(crate) fn evict(&self) {
        self.shutdown("liveness timeout");
    }

    fn shutdown(&self, reason: &str) {
        {
            let mut state = lock(&self.state);
            if *state == TunnelState::Closed {
                return;
            }
            *state = TunnelState::Closed;
        }

        self.cancel.cancel();

        if let Some(tenant) = self.tenant.upgrade() {
            tenant.unregister(self.session_id);
        }

        let stats = self.stats();
        info!(
            tenant = %self.tenant_id,
            session = %self.session_id,
            bytes_sent = stats.bytes_sent,
            bytes_received = stats.bytes_received,
            "Tunnel closed: {}",
            reason
        );
    }

    fn start(
        self: &Arc<Self>,
        stream: ClientStream,
        socket: Arc<UdpSocket>,
        limiter: Arc<RateLimiter>,
        outbound_rx: mpsc::Receiver<OutboundFrame>,
    ) {
        let (source, sink) = stream.into_parts();

        {
            let mut state = lock(&self.state);
            if *state == TunnelState::Admitted {
                *state = TunnelState::Relaying;
            }
        }

        let handles = vec![
            tokio::spawn(
                self.clone()
                    .relay_client_to_upstream(source, socket.clone(), limiter),
            ),
            tokio::spawn(self.clone().relay_upstream_to_client(socket)),
            tokio::spawn(self.clone().write_to_client(sink, outbound_rx)),
        ];
        lock(&self.tasks).extend(handles);
    }

    async fn relay_client_to_upstream(
        self: Arc<Self>,
        mut source: Box<dyn ClientSource>,
        socket: Arc<UdpSocket>,
        limiter: Arc<RateLimiter>,
    ) {
        let result: Result<(), RelayError> = loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => return,
                frame = source.recv_frame() => frame,
            };

            match frame {
                Ok(Some(InboundFrame::Data(data))) => {
                    let forwarded = tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        r = self.forward_upstream(data, &socket, &limiter) => r,
                    };
                    if let Err(e) = forwarded {
                        break Err(e);
                    }
                }
                Ok(Some(InboundFrame::Heartbeat)) => self.touch(),
                Ok(None) => break Ok(()),
                Err(e) => break Err(RelayError::Client(e)),
            }
        };

        match result {
            Ok(()) => self.shutdown("client closed stream"),
            Err(e) => {
                debug!(tenant = %self.tenant_id, session = %self.session_id, "Relay to upstream failed: {}", e);
                self.shutdown(&e.to_string());
            }
        }
    }

    /// Send `data` upstream, never ahead of the rate limiter
    ///
    /// A chunk that fits the tenant's capacity is held until its whole length
    /// is granted, so it reaches the resolver unsplit. A chunk larger than the
    /// capacity can never be granted at once and is admitted piecewise across
    /// refills instead.
    async fn forward_upstream(
        &self,
        mut data: Bytes,
        socket: &UdpSocket,
        limiter: &RateLimiter,
    ) -> Result<(), RelayError> {
        let len = data.len() as u64;
        if limiter.is_unlimited() || len <= limiter.capacity() {
            limiter.acquire(len).await;
            while !data.is_empty() {
                let segment = data.split_to(data.len().min(MAX_DATAGRAM_SIZE));
                self.send_segment(&segment, socket).await?;
            }
            return Ok(());
        }

        while !data.is_empty() {
            let want = data.len().min(MAX_DATAGRAM_SIZE);
            let granted = limiter.acquire_up_to(want as u64).await as usize;
            let segment = data.split_to(granted.min(want));
            self.send_segment(&segment, socket).await?;
        }
        Ok(())
    }

    async fn send_segment(&self, segment: &[u8], socket: &UdpSocket) -> Result<(), RelayError> {
        socket.send(segment).await?;
        self.bytes_sent
            .fetch_add(segment.len() as u64, Ordering::Relaxed);
        self.touch();
        Ok(())
    }

    async fn relay_upstream_to_client(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut buf = vec![0u8; 65_535];

        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => return,
                r = socket.recv(&mut buf) => r,
            };

            let n = match received {
                Ok(n) => n,
                Err(e) => {
                    debug!(tenant = %self.tenant_id, session = %self.session_id, "Upstream receive failed: {}", e);
                    self.shutdown(&RelayError::Upstream(e).to_string());
                    return;
                }
            };

            let frame = OutboundFrame::Data(Bytes::copy_from_slice(&buf[..n]));
            let queued = tokio::select! {
                _ = self.cancel.cancelled() => return,
                r = self.outbound.send(frame) => r,
            };
            if queued.is_err() {
                self.shutdown("client writer stopped");
                return;
            }

            self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
            self.touch();
        }
    }

    async fn write_to_client(
        self: Arc<Self>,
        mut sink: Box<dyn ClientSink>,
        mut outbound: mpsc::Receiver<OutboundFrame>,
    ) {
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                frame = outbound.recv() => frame,
            };
            let Some(frame) = frame else {
                break;
            };

            let sent = tokio::select! {
                _ = self.cancel.cancelled() => break,
                r = sink.send_frame(frame) => r,
            };
            if let Err(e) = sent {
                debug!(tenant = %self.tenant_id, session = %self.session_id, "Write to client failed: {}", e);
                self.shutdown(&RelayError::Client(e).to_string());
                break;
            }
        }

        if let Err(e) = sink.close().await {
            debug!(tenant = %self.tenant_id, session = %self.session_id, "Error closing client stream: {}", e);
        }
    }
}

/// Open a UDP association connected to the resolver
async fn connect_upstream(upstream: SocketAddr) -> std::io::Result<UdpSocket> {
    let bind_addr: SocketAddr = if upstream.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };

    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(upstream).await?;
    Ok(socket)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RelaySettings, TenantConfig};
    use dnsbroker_transport::memory;

    async fn echo_upstream() -> (SocketAddr, JoinHandle<()>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 65_535];
            while let Ok((n, from)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&buf[..n], from).await;
            }
        });
        (addr, handle)
    }

    fn tenant(upstream: SocketAddr, rate_limit: u64, max_tunnels: u32) -> Arc<Tenant> {
        Tenant::new(
            &TenantConfig::new("T1", rate_limit, max_tunnels),
            Arc::new(RelaySettings::new(upstream)),
        )
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = SessionId::next();
        let b = SessionId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_admitted_tunnel_is_relaying() {
        let (upstream, _echo) = echo_upstream().await;
        let tenant = tenant(upstream, 0, 1);
        let (stream, _peer) = memory::pair(8);

        let tunnel = Tunnel::admit(&tenant, stream).await.unwrap();
        assert_eq!(tunnel.state(), TunnelState::Relaying);
        assert_eq!(tunnel.tenant_id(), "T1");
        assert_eq!(tunnel.upstream(), upstream);
        assert_eq!(tenant.active_tunnels(), 1);
    }

    #[tokio::test]
    async fn test_echo_round_trip_counts_bytes() {
        let (upstream, _echo) = echo_upstream().await;
        let tenant = tenant(upstream, 0, 1);
        let (stream, mut peer) = memory::pair(8);
        let tunnel = Tunnel::admit(&tenant, stream).await.unwrap();

        peer.send_data(Bytes::from_static(b"dns-query")).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), peer.recv())
            .await
            .unwrap();
        assert_eq!(
            reply,
            Some(OutboundFrame::Data(Bytes::from_static(b"dns-query")))
        );

        let stats = tunnel.stats();
        assert_eq!(stats.bytes_sent, 9);
        assert_eq!(stats.bytes_received, 9);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (upstream, _echo) = echo_upstream().await;
        let tenant = tenant(upstream, 0, 2);
        let (stream, mut peer) = memory::pair(8);
        let tunnel = Tunnel::admit(&tenant, stream).await.unwrap();

        tunnel.close();
        tunnel.close();
        tokio::time::timeout(Duration::from_secs(5), tunnel.closed())
            .await
            .unwrap();

        assert_eq!(tunnel.state(), TunnelState::Closed);
        assert_eq!(tenant.active_tunnels(), 0);
        assert!(!tunnel.ping());
        assert!(peer.recv().await.is_none());
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn test_client_error_closes_tunnel() {
        let (upstream, _echo) = echo_upstream().await;
        let tenant = tenant(upstream, 0, 2);
        let (stream, peer) = memory::pair(8);
        let tunnel = Tunnel::admit(&tenant, stream).await.unwrap();

        peer.inject_error(dnsbroker_transport::TransportError::ProtocolError(
            "bad frame".to_string(),
        ))
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(5), tunnel.closed())
            .await
            .unwrap();
        assert_eq!(tenant.active_tunnels(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_touches() {
        let (upstream, _echo) = echo_upstream().await;
        let tenant = tenant(upstream, 0, 1);
        let (stream, peer) = memory::pair(8);
        let tunnel = Tunnel::admit(&tenant, stream).await.unwrap();

        tokio::time::pause();
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(!tunnel.is_alive(Instant::now(), Duration::from_secs(10)));

        peer.send_heartbeat().await.unwrap();
        tokio::time::resume();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !tunnel.is_alive(Instant::now(), Duration::from_secs(10)) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_is_alive_window() {
        let (upstream, _echo) = echo_upstream().await;
        let tenant = tenant(upstream, 0, 1);
        let (stream, _peer) = memory::pair(8);
        let tunnel = Tunnel::admit(&tenant, stream).await.unwrap();

        let window = Duration::from_secs(30);
        let seen = tunnel.last_activity();
        assert!(tunnel.is_alive(seen + Duration::from_secs(29), window));
        assert!(!tunnel.is_alive(seen + Duration::from_secs(30), window));
        // a clock reading before the last activity is never dead
        assert!(tunnel.is_alive(seen, window));
    }
}
