//! Tenant registry
//!
//! Built once from configuration before any session is accepted and never
//! mutated afterwards, so lookups need no lock. Per-tenant state carries its
//! own synchronization.

use crate::config::{RelaySettings, TenantConfig};
use crate::error::ConfigError;
use crate::scheduler::TenantSet;
use crate::tenant::Tenant;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

#[derive(Debug)]
pub struct TenantRegistry {
    tenants: HashMap<String, Arc<Tenant>>,
    settings: Arc<RelaySettings>,
}

impl TenantRegistry {
    /// Build the registry from tenant records
    ///
    /// # Errors
    ///
    /// Returns an error on an empty or duplicate identifier. No registry is
    /// produced in that case.
    pub fn load(records: &[TenantConfig], settings: RelaySettings) -> Result<Self, ConfigError> {
        let settings = Arc::new(settings);
        let mut tenants = HashMap::with_capacity(records.len());

        for (index, record) in records.iter().enumerate() {
            if record.id.is_empty() {
                return Err(ConfigError::EmptyIdentifier { index });
            }
            if tenants.contains_key(&record.id) {
                return Err(ConfigError::DuplicateIdentifier(record.id.clone()));
            }
            tenants.insert(record.id.clone(), Tenant::new(record, settings.clone()));
        }

        info!(
            tenants = tenants.len(),
            upstream = %settings.upstream,
            "Tenant registry loaded"
        );

        Ok(Self { tenants, settings })
    }

    /// Find a tenant by exact identifier
    pub fn lookup(&self, id: &str) -> Option<Arc<Tenant>> {
        self.tenants.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }

    pub fn tenants(&self) -> impl Iterator<Item = &Arc<Tenant>> {
        self.tenants.values()
    }

    /// Total tunnels across all tenants
    pub fn active_tunnels(&self) -> usize {
        self.tenants().map(|t| t.active_tunnels()).sum()
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }
}

impl TenantSet for TenantRegistry {
    fn refill_all(&self) {
        for tenant in self.tenants.values() {
            tenant.refill_rate();
        }
    }

    fn keepalive_all(&self) {
        for tenant in self.tenants.values() {
            tenant.keepalive();
        }
    }
}
