use crate::config::Config;
use anyhow::Context;
use sqlx::SqlitePool;
use std::sync::Arc;
use webvirt_orchestrator::{
    ConfigStore, LdapDirectory, LeaseRegistry, ProxmoxClient, ResourceAllocator, VmOrchestrator,
};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: VmOrchestrator,
    pub admin_user: String,
    pub password_length: usize,
    pub home_prefix: String,
}

impl AppState {
    pub fn new(orchestrator: VmOrchestrator, config: &Config) -> Self {
        Self {
            orchestrator,
            admin_user: config.admin_user.clone(),
            password_length: config.password_length,
            home_prefix: config.home_prefix.clone(),
        }
    }

    /// Wires the orchestrator to the real Proxmox and LDAP backends.
    pub fn from_config(pool: SqlitePool, config: &Config) -> anyhow::Result<Self> {
        let store = ConfigStore::new(config.hypervisor.config_dir.clone());
        let ttl = i64::try_from(config.lease_ttl_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX);
        let leases = Arc::new(LeaseRegistry::new(config.lease_path.clone(), ttl));
        let allocator = ResourceAllocator::new(store, leases);
        let hypervisor =
            ProxmoxClient::new(config.hypervisor.clone()).context("Failed to build Proxmox client")?;
        let directory = LdapDirectory::new(config.directory.clone());

        let orchestrator = VmOrchestrator::new(
            pool,
            allocator,
            Arc::new(hypervisor),
            Arc::new(directory),
            config.timings.clone(),
        );

        Ok(Self::new(orchestrator, config))
    }
}

