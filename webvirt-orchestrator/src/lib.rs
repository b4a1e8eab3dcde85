//! VM lifecycle orchestration
//!
//! This crate provisions, tracks and reclaims short-lived VMs across three
//! backends that share no transaction: the Proxmox hypervisor, the LDAP
//! directory that gates Guacamole console access, and the SQLite ledger of
//! ownership and expiry. It is consumed by the webvirt-api HTTP service and
//! the webvirt-expose maintenance tool.

pub mod allocator;
pub mod bulk;
pub mod config_store;
pub mod credentials;
pub mod db;
pub mod directory;
pub mod error;
pub mod hypervisor;
pub mod lease;
pub mod ledger;
pub mod operation;
pub mod orchestrator;
pub mod reaper;
pub mod validation;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use allocator::{ResourceAllocator, FIRST_VMID};
pub use bulk::{assign_credentials, BulkProvisioner, BulkReport, BulkRequest, PersonName, TenantCredentials};
pub use config_store::ConfigStore;
pub use directory::{Directory, DirectoryConfig, DirectoryError, LdapDirectory};
pub use error::{OrchestratorError, Result};
pub use hypervisor::{Hypervisor, HypervisorConfig, HypervisorError, ProxmoxClient};
pub use lease::LeaseRegistry;
pub use ledger::{Ledger, VmRecord};
pub use operation::{Journal, Operation, OperationStatus, OperationType};
pub use orchestrator::{CreateStage, UpdateVmRequest, VmOrchestrator, VmSpec, WorkflowTimings};
pub use reaper::{ExpiryReaper, ReapReport};
