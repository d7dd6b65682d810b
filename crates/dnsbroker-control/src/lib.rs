//! Tenant and tunnel session management for the DNS broker
//!
//! - [`TenantRegistry`]: immutable map of tenants, built once at startup
//! - [`Tenant`]: admission quota, [`RateLimiter`] and active [`Tunnel`]s
//! - [`Tunnel`]: relays one client stream to the upstream UDP resolver
//! - [`Scheduler`]: 1s refill tick with keepalive every 30th tick
//! - [`SessionAcceptor`]: turns an inbound stream plus tenant id into a tunnel
pub mod acceptor;
pub mod config;
pub mod error;
pub mod rate_limiter;
pub mod registry;
pub mod scheduler;
pub mod tenant;
pub mod tunnel;

pub use acceptor::SessionAcceptor;
pub use config::{
    load_tenants_file, parse_tenants, resolve_upstream, RelaySettings, TenantConfig,
    TenantsFile, DEFAULT_UPSTREAM,
};
pub use error::{ConfigError, RejectReason, RelayError};
pub use rate_limiter::RateLimiter;
pub use registry::TenantRegistry;
pub use scheduler::{Scheduler, SchedulerConfig, TenantSet};
pub use tenant::Tenant;
pub use tunnel::{SessionId, Tunnel, TunnelState, TunnelStats, MAX_DATAGRAM_SIZE};
