//! Tenant: admission quota, rate limiter and the set of active tunnels
//!
//! Each tenant has its own lock over its tunnel set, so tenants never contend
//! with each other.

use crate::config::{RelaySettings, TenantConfig};
use crate::error::RejectReason;
use crate::rate_limiter::RateLimiter;
use crate::tunnel::{SessionId, Tunnel};
use dnsbroker_transport::ClientStream;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug)]
pub struct Tenant {
    id: String,
    max_tunnels: usize,
    rate_limiter: Arc<RateLimiter>,
    tunnels: Mutex<HashMap<SessionId, Arc<Tunnel>>>,
    settings: Arc<RelaySettings>,
}

impl Tenant {
    pub fn new(config: &TenantConfig, settings: Arc<RelaySettings>) -> Arc<Self> {
        Arc::new(Self {
            id: config.id.clone(),
            max_tunnels: config.max_tunnels as usize,
            rate_limiter: Arc::new(RateLimiter::new(config.rate_limit)),
            tunnels: Mutex::new(HashMap::new()),
            settings,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn max_tunnels(&self) -> usize {
        self.max_tunnels
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Number of tunnels currently registered
    pub fn active_tunnels(&self) -> usize {
        self.tunnels().len()
    }

    /// Snapshot of the active tunnels
    pub fn tunnel_list(&self) -> Vec<Arc<Tunnel>> {
        self.tunnels().values().cloned().collect()
    }

    /// Admit a new tunnel, or reject it and close the stream
    pub async fn admit(
        self: &Arc<Self>,
        stream: ClientStream,
    ) -> Result<Arc<Tunnel>, RejectReason> {
        Tunnel::admit(self, stream).await
    }

    /// Reset the tenant's rate budget for the next tick
    pub fn refill_rate(&self) {
        self.rate_limiter.refill();
    }

    /// Evict silent tunnels and ping the live ones; returns how many were evicted
    pub fn keepalive(&self) -> usize {
        let now = Instant::now();
        let window = self.settings.keepalive_window;
        let mut evicted = 0;
        let mut pinged = 0;

        // snapshot first: eviction re-enters the tunnel lock
        for tunnel in self.tunnel_list() {
            if tunnel.is_alive(now, window) {
                if tunnel.ping() {
                    pinged += 1;
                }
            } else {
                tunnel.evict();
                evicted += 1;
            }
        }

        if evicted > 0 {
            info!(tenant = %self.id, evicted, pinged, "Evicted idle tunnels");
        } else {
            debug!(tenant = %self.id, pinged, "Keepalive");
        }

        evicted
    }

    pub(crate) fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// Insert `tunnel` unless the tenant is already at capacity
    pub(crate) fn try_register(&self, tunnel: &Arc<Tunnel>) -> bool {
        let mut tunnels = self.tunnels();
        if tunnels.len() >= self.max_tunnels {
            return false;
        }
        tunnels.insert(tunnel.session_id(), tunnel.clone());
        true
    }

    pub(crate) fn unregister(&self, session_id: SessionId) {
        self.tunnels().remove(&session_id);
    }

    fn tunnels(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<Tunnel>>> {
        self.tunnels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::TunnelState;
    use dnsbroker_transport::{memory, OutboundFrame};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::UdpSocket;

    async fn sink_upstream() -> (SocketAddr, UdpSocket) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        (socket.local_addr().unwrap(), socket)
    }

    fn tenant(upstream: SocketAddr, rate_limit: u64, max_tunnels: u32) -> Arc<Tenant> {
        Tenant::new(
            &TenantConfig::new("T1", rate_limit, max_tunnels),
            Arc::new(RelaySettings::new(upstream)),
        )
    }

    #[tokio::test]
    async fn test_admission_limit() {
        let (upstream, _socket) = sink_upstream().await;
        let tenant = tenant(upstream, 204_800, 3);

        let mut peers = Vec::new();
        for _ in 0..3 {
            let (stream, peer) = memory::pair(8);
            tenant.admit(stream).await.unwrap();
            peers.push(peer);
        }
        assert_eq!(tenant.active_tunnels(), 3);

        let (stream, mut rejected) = memory::pair(8);
        let err = tenant.admit(stream).await.unwrap_err();
        assert_eq!(
            err,
            RejectReason::TooManyTunnels {
                tenant: "T1".to_string(),
                limit: 3
            }
        );
        assert_eq!(tenant.active_tunnels(), 3);

        // the rejected stream is closed, not queued
        assert!(rejected.is_closed());
        assert!(rejected.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_zero_quota_rejects_everything() {
        let (upstream, _socket) = sink_upstream().await;
        let tenant = tenant(upstream, 0, 0);

        let (stream, _peer) = memory::pair(8);
        assert!(matches!(
            tenant.admit(stream).await,
            Err(RejectReason::TooManyTunnels { limit: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_closing_frees_a_slot() {
        let (upstream, _socket) = sink_upstream().await;
        let tenant = tenant(upstream, 0, 1);

        let (stream, _peer) = memory::pair(8);
        let first = tenant.admit(stream).await.unwrap();

        first.close();
        assert_eq!(tenant.active_tunnels(), 0);

        let (stream, _peer2) = memory::pair(8);
        assert!(tenant.admit(stream).await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_admissions_respect_limit() {
        let (upstream, _socket) = sink_upstream().await;
        let tenant = tenant(upstream, 0, 3);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let tenant = tenant.clone();
            handles.push(tokio::spawn(async move {
                let (stream, peer) = memory::pair(8);
                (tenant.admit(stream).await.is_ok(), peer)
            }));
        }

        let mut admitted = 0;
        let mut peers = Vec::new();
        for handle in handles {
            let (ok, peer) = handle.await.unwrap();
            if ok {
                admitted += 1;
            }
            peers.push(peer);
        }

        assert_eq!(admitted, 3);
        assert_eq!(tenant.active_tunnels(), 3);
    }

    #[tokio::test]
    async fn test_refill_rate_delegates() {
        let (upstream, _socket) = sink_upstream().await;
        let tenant = tenant(upstream, 100, 1);

        assert!(tenant.rate_limiter().try_consume(100));
        assert_eq!(tenant.rate_limiter().available(), 0);

        tenant.refill_rate();
        assert_eq!(tenant.rate_limiter().available(), 100);
    }

    #[tokio::test]
    async fn test_keepalive_evicts_idle_and_pings_live() {
        let (upstream, _socket) = sink_upstream().await;
        let tenant = tenant(upstream, 0, 2);

        let (stream, mut idle_peer) = memory::pair(8);
        let idle = tenant.admit(stream).await.unwrap();

        tokio::time::pause();
        tokio::time::advance(Duration::from_secs(30)).await;

        let (stream, mut live_peer) = memory::pair(8);
        let live = tenant.admit(stream).await.unwrap();

        assert_eq!(tenant.keepalive(), 1);
        assert_eq!(idle.state(), TunnelState::Closed);
        assert_eq!(live.state(), TunnelState::Relaying);
        assert_eq!(tenant.active_tunnels(), 1);

        assert_eq!(live_peer.recv().await, Some(OutboundFrame::Ping));
        assert!(idle_peer.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_keepalive_keeps_recent_tunnels() {
        let (upstream, _socket) = sink_upstream().await;
        let tenant = tenant(upstream, 0, 1);

        let (stream, _peer) = memory::pair(8);
        let tunnel = tenant.admit(stream).await.unwrap();

        tokio::time::pause();
        tokio::time::advance(Duration::from_secs(29)).await;

        assert_eq!(tenant.keepalive(), 0);
        assert_eq!(tunnel.state(), TunnelState::Relaying);
    }
}
