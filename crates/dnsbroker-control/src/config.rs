//! Tenant configuration and relay settings
//!
//! The tenants file is JSON:
//!
//! ```json
//! {
//!   "accounts": [
//!     { "uuid": "ee80e87b-fc41-4e59-a722-7c3fee039cb4", "rateLimit": 204800, "maxTunnelCount": 3 },
//!     { "uuid": "f6000866-1b89-4ab4-b1ce-6b7625b8259a", "rateLimit": 0, "maxTunnelCount": 3 }
//!   ]
//! }
//! ```
//!
//! `rateLimit` is in bytes per second, 0 meaning unlimited.

use crate::error::ConfigError;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Resolver used when none is configured
pub const DEFAULT_UPSTREAM: &str = "8.8.8.8:53";

/// Liveness window matching the default keepalive cadence (30 ticks of 1s)
pub const DEFAULT_KEEPALIVE_WINDOW: Duration = Duration::from_secs(30);

/// Frames buffered towards a slow client before the upstream reader waits
pub const DEFAULT_CLIENT_BUFFER: usize = 64;

/// One tenant record
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TenantConfig {
    /// Identifier clients present on connect (exact, case-sensitive)
    #[serde(rename = "uuid")]
    pub id: String,
    /// Bytes per second from clients to the resolver, 0 = unlimited
    #[serde(rename = "rateLimit")]
    pub rate_limit: u64,
    /// Maximum concurrent tunnels
    #[serde(rename = "maxTunnelCount")]
    pub max_tunnels: u32,
}

impl TenantConfig {
    pub fn new(id: impl Into<String>, rate_limit: u64, max_tunnels: u32) -> Self {
        Self {
            id: id.into(),
            rate_limit,
            max_tunnels,
        }
    }
}

/// Top-level shape of the tenants file
#[derive(Debug, Clone, Deserialize)]
pub struct TenantsFile {
    pub accounts: Vec<TenantConfig>,
}

/// Parse tenant records from JSON text
pub fn parse_tenants(json: &str) -> Result<Vec<TenantConfig>, ConfigError> {
    let file: TenantsFile = serde_json::from_str(json)?;
    Ok(file.accounts)
}

/// Read and parse the tenants file
pub fn load_tenants_file(path: &Path) -> Result<Vec<TenantConfig>, ConfigError> {
    let json = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let tenants = parse_tenants(&json)?;
    info!(path = %path.display(), tenants = tenants.len(), "Loaded tenant config");
    Ok(tenants)
}

/// Resolve the upstream resolver address once at startup
pub async fn resolve_upstream(address: &str) -> Result<SocketAddr, ConfigError> {
    let mut addrs =
        tokio::net::lookup_host(address)
            .await
            .map_err(|e| ConfigError::UnresolvableUpstream {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

    let resolved = addrs
        .next()
        .ok_or_else(|| ConfigError::UnresolvableUpstream {
            address: address.to_string(),
            reason: "no addresses returned".to_string(),
        })?;

    debug!(address = %address, resolved = %resolved, "Resolved upstream");
    Ok(resolved)
}

/// Process-wide settings shared by every tenant and tunnel
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// The fixed UDP endpoint every tunnel relays to
    pub upstream: SocketAddr,
    /// A tunnel silent for this long is evicted by keepalive
    pub keepalive_window: Duration,
    /// Outbound frame queue depth per tunnel
    pub client_buffer: usize,
}

impl RelaySettings {
    pub fn new(upstream: SocketAddr) -> Self {
        Self {
            upstream,
            keepalive_window: DEFAULT_KEEPALIVE_WINDOW,
            client_buffer: DEFAULT_CLIENT_BUFFER,
        }
    }

    pub fn with_keepalive_window(mut self, window: Duration) -> Self {
        self.keepalive_window = window;
        self
    }
}
