//! Error types for the broker core

use dnsbroker_transport::TransportError;
use std::path::PathBuf;
use thiserror::Error;

/// Startup errors. Any of these must stop the process before it serves.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read tenant config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse tenant config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Tenant record #{index} has an empty identifier")]
    EmptyIdentifier { index: usize },

    #[error("Duplicate tenant identifier: {0}")]
    DuplicateIdentifier(String),

    #[error("Failed to resolve upstream address {address}: {reason}")]
    UnresolvableUpstream { address: String, reason: String },
}

/// Why a session was refused. The client only ever sees the stream close.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RejectReason {
    #[error("missing tenant identifier")]
    MissingTenantId,

    #[error("unknown tenant: {0}")]
    UnknownTenant(String),

    #[error("tenant {tenant} is at its limit of {limit} concurrent tunnels")]
    TooManyTunnels { tenant: String, limit: usize },

    #[error("upstream association failed: {0}")]
    UpstreamUnavailable(String),
}

/// Errors that terminate a single tunnel
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("client stream error: {0}")]
    Client(#[from] TransportError),

    #[error("upstream socket error: {0}")]
    Upstream(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_reason_messages() {
        let reason = RejectReason::TooManyTunnels {
            tenant: "t1".to_string(),
            limit: 3,
        };
        assert_eq!(
            reason.to_string(),
            "tenant t1 is at its limit of 3 concurrent tunnels"
        );
        assert_eq!(
            RejectReason::UnknownTenant("unknown-id".to_string()).to_string(),
            "unknown tenant: unknown-id"
        );
    }
}
