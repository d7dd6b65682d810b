//! Entry point for inbound sessions
//!
//! Transport adapters hand over the client stream together with whatever
//! tenant identifier the client claimed. Anything that is not an admitted
//! tunnel ends with the stream closed and nothing else touched.

use crate::error::RejectReason;
use crate::registry::TenantRegistry;
use crate::tunnel::Tunnel;
use dnsbroker_transport::ClientStream;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct SessionAcceptor {
    registry: Arc<TenantRegistry>,
}

impl SessionAcceptor {
    pub fn new(registry: Arc<TenantRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<TenantRegistry> {
        &self.registry
    }

    /// Resolve the tenant and admit the stream as a tunnel
    pub async fn accept(
        &self,
        tenant_id: Option<&str>,
        stream: ClientStream,
    ) -> Result<Arc<Tunnel>, RejectReason> {
        let Some(tenant_id) = tenant_id.filter(|id| !id.is_empty()) else {
            warn!(peer = ?stream.peer_addr(), "Rejected session: missing tenant id");
            stream.close().await;
            return Err(RejectReason::MissingTenantId);
        };

        let Some(tenant) = self.registry.lookup(tenant_id) else {
            warn!(peer = ?stream.peer_addr(), tenant = %tenant_id, "Rejected session: unknown tenant");
            stream.close().await;
            return Err(RejectReason::UnknownTenant(tenant_id.to_string()));
        };

        tenant.admit(stream).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RelaySettings, TenantConfig};
    use dnsbroker_transport::memory;

    fn acceptor() -> SessionAcceptor {
        let registry = TenantRegistry::load(
            &[TenantConfig::new("T1", 0, 1)],
            RelaySettings::new("127.0.0.1:53".parse().unwrap()),
        )
        .unwrap();
        SessionAcceptor::new(Arc::new(registry))
    }

    #[tokio::test]
    async fn test_unknown_tenant_is_rejected() {
        let acceptor = acceptor();
        let (stream, peer) = memory::pair(8);

        let err = acceptor
            .accept(Some("unknown-id"), stream)
            .await
            .unwrap_err();

        assert_eq!(err, RejectReason::UnknownTenant("unknown-id".to_string()));
        assert!(peer.is_closed());
        assert_eq!(acceptor.registry().active_tunnels(), 0);
    }

    #[tokio::test]
    async fn test_missing_and_empty_ids_are_rejected() {
        let acceptor = acceptor();

        let (stream, peer) = memory::pair(8);
        assert_eq!(
            acceptor.accept(None, stream).await.unwrap_err(),
            RejectReason::MissingTenantId
        );
        assert!(peer.is_closed());

        let (stream, peer) = memory::pair(8);
        assert_eq!(
            acceptor.accept(Some(""), stream).await.unwrap_err(),
            RejectReason::MissingTenantId
        );
        assert!(peer.is_closed());

        assert_eq!(acceptor.registry().active_tunnels(), 0);
    }

    #[tokio::test]
    async fn test_case_mismatch_is_unknown() {
        let acceptor = acceptor();
        let (stream, _peer) = memory::pair(8);

        assert!(matches!(
            acceptor.accept(Some("t1"), stream).await,
            Err(RejectReason::UnknownTenant(_))
        ));
    }

    #[tokio::test]
    async fn test_known_tenant_is_admitted() {
        let acceptor = acceptor();
        let (stream, _peer) = memory::pair(8);

        let tunnel = acceptor.accept(Some("T1"), stream).await.unwrap();
        assert_eq!(tunnel.tenant_id(), "T1");
        assert_eq!(acceptor.registry().active_tunnels(), 1);

        tunnel.close();
        assert_eq!(acceptor.registry().active_tunnels(), 0);
    }
}
