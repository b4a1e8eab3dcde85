//! Create, update, delete and reclaim workflows across the hypervisor, the
//! directory and the ledger.
//!
//! The three backends share no transaction. Create records a compensating
//! action after every remote step that succeeds and unwinds them in reverse
//! when a later step fails. Delete goes hypervisor, directory, ledger and does
//! not roll back.

use crate::allocator::ResourceAllocator;
use crate::config_store::VNC_BASE_PORT;
use crate::directory::{AccessGroupRequest, Directory};
use crate::error::{OrchestratorError, Result};
use crate::hypervisor::{Hypervisor, HypervisorError, PowerState};
use crate::ledger::{expiry_after, Ledger, NewVmRecord, VmRecord};
use crate::operation::{Journal, NewOperation, OperationStatus, OperationType};
use crate::validation::{validate_resources, validate_specs};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, instrument, warn};
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct VmSpec {
    pub name: String,
    pub core_count: i64,
    /// MiB
    pub memory: i64,
    /// Minutes until the VM is reclaimed; 0 hands it to the next reaper cycle.
    pub duration: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UpdateVmRequest {
    pub core_count: i64,
    pub memory: i64,
}

/// Waits between hypervisor steps while the node materializes or shuts down
/// a VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTimings {
    /// Before writing the VNC line into a freshly created config.
    pub config_settle_ms: u64,
    /// Before reading the MAC address back.
    pub mac_settle_ms: u64,
    /// Between power state checks while an expired VM shuts down.
    pub stop_poll_ms: u64,
    /// How long to wait for the shutdown before deleting anyway. Matches the
    /// node's own shutdown timeout, after which it forces the stop.
    pub stop_timeout_ms: u64,
}

impl Default for WorkflowTimings {
    fn default() -> Self {
        Self {
            config_settle_ms: 5000,
            mac_settle_ms: 1000,
            stop_poll_ms: 1000,
            stop_timeout_ms: 180_000,
        }
    }
}

impl WorkflowTimings {
    pub fn immediate() -> Self {
        Self {
            config_settle_ms: 0,
            mac_settle_ms: 0,
            stop_poll_ms: 0,
            stop_timeout_ms: 0,
        }
    }
}

/// Turns a duration in minutes into the stored expiry.
pub(crate) type ExpiryRule = fn(i64, DateTime<Utc>) -> Option<DateTime<Utc>>;

async fn settle(ms: u64) {
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

/// Step of the create workflow that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateStage {
    CreateVm,
    ReservePort,
    ExposeVnc,
    FetchMac,
    RegisterAccess,
    PersistRecord,
}

impl fmt::Display for CreateStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            CreateStage::CreateVm => "creating the hypervisor VM",
            CreateStage::ReservePort => "reserving a VNC display",
            CreateStage::ExposeVnc => "exposing VNC",
            CreateStage::FetchMac => "reading the MAC address",
            CreateStage::RegisterAccess => "registering directory access",
            CreateStage::PersistRecord => "recording the VM in the ledger",
        };
        f.write_str(stage)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Compensation {
    DeleteVm(u32),
    DeleteAccessGroup(String),
}

/// Undo log for one create run.
#[derive(Debug, Default)]
struct Saga {
    steps: Vec<Compensation>,
}

impl Saga {
    fn push(&mut self, step: Compensation) {
        self.steps.push(step);
    }

    /// Runs every compensation, newest first. Returns the ones that failed.
    async fn unwind(self, hypervisor: &dyn Hypervisor, directory: &dyn Directory) -> Vec<String> {
        let mut failures = Vec::new();

        for step in self.steps.into_iter().rev() {
            let outcome = match &step {
                Compensation::DeleteAccessGroup(name) => directory
                    .delete_access_group(name)
                    .await
                    .map_err(OrchestratorError::from),
                Compensation::DeleteVm(vmid) => hypervisor
                    .delete_vm(*vmid)
                    .await
                    .map_err(OrchestratorError::from),
            };

            match outcome {
                Ok(()) => info!(?step, "Compensation applied"),
                Err(e) => {
                    error!(?step, error = %e, "Compensation failed, remote state left behind");
                    failures.push(format!("{step:?}: {e}"));
                }
            }
        }

        failures
    }
}

/// Per-record async locks, so update, delete and reclaim of one VM never
/// interleave.
#[derive(Debug, Clone, Default)]
struct RecordLocks {
    inner: Arc<Mutex<HashMap<i64, Arc<Mutex<()>>>>>,
}

impl RecordLocks {
    async fn lock(&self, id: i64) -> OwnedMutexGuard<()> {
        let entry = {
            let mut locks = self.inner.lock().await;
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(id).or_default())
        };
        entry.lock_owned().await
    }
}

#[derive(Clone)]
pub struct VmOrchestrator {
    ledger: Ledger,
    journal: Journal,
    allocator: ResourceAllocator,
    hypervisor: Arc<dyn Hypervisor>,
    directory: Arc<dyn Directory>,
    timings: WorkflowTimings,
    locks: RecordLocks,
}

impl VmOrchestrator {
    pub fn new(
        pool: SqlitePool,
        allocator: ResourceAllocator,
        hypervisor: Arc<dyn Hypervisor>,
        directory: Arc<dyn Directory>,
        timings: WorkflowTimings,
    ) -> Self {
        Self {
            ledger: Ledger::new(pool.clone()),
            journal: Journal::new(pool),
            allocator,
            hypervisor,
            directory,
            timings,
            locks: RecordLocks::default(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        self.ledger.pool()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    /// The owner's VMs, newest first.
    pub async fn list_vms(&self, owner: &str) -> Result<Vec<VmRecord>> {
        self.ledger.list_by_owner(owner).await
    }

    /// Provision a VM for `owner` and record it in the ledger.
    pub async fn create_vm(&self, owner: &str, spec: &VmSpec) -> Result<VmRecord> {
        self.create_with_expiry(owner, spec, expiry_after).await
    }

    #[instrument(skip(self, spec, expiry), fields(name = %spec.name, cores = spec.core_count, memory = spec.memory))]
    pub(crate) async fn create_with_expiry(
        &self,
        owner: &str,
        spec: &VmSpec,
        expiry: ExpiryRule,
    ) -> Result<VmRecord> {
        validate_specs(&spec.name, spec.core_count, spec.memory, spec.duration)?;

        let started_at = Utc::now();
        let outcome = self.provision(owner, spec, expiry).await;

        let vmid = outcome.as_ref().ok().map(|record| record.vmid);
        self.journal_outcome(&spec.name, vmid, OperationType::Create, started_at, &outcome)
            .await;

        if let Ok(record) = &outcome {
            info!(id = record.id, vmid = record.vmid, port = record.port, "VM created");
        }
        outcome
    }

    async fn provision(&self, owner: &str, spec: &VmSpec, expiry: ExpiryRule) -> Result<VmRecord> {
        let vmid = self.allocator.reserve_identifier().await?;
        let mut saga = Saga::default();

        let outcome = self
            .run_create_steps(owner, spec, vmid.value(), expiry, &mut saga)
            .await;
        match outcome {
            Ok(record) => {
                vmid.release().await;
                Ok(record)
            }
            Err((stage, source)) => {
                warn!(vmid = vmid.value(), %stage, error = %source, "Create failed, compensating");
                let failures = saga
                    .unwind(self.hypervisor.as_ref(), self.directory.as_ref())
                    .await;
                if !failures.is_empty() {
                    self.journal_compensation_failures(&spec.name, vmid.value(), &failures)
                        .await;
                }
                vmid.release().await;
                Err(OrchestratorError::Provision {
                    stage,
                    source: Box::new(source),
                })
            }
        }
    }

    async fn run_create_steps(
        &self,
        owner: &str,
        spec: &VmSpec,
        vmid: u32,
        expiry: ExpiryRule,
        saga: &mut Saga,
    ) -> std::result::Result<VmRecord, (CreateStage, OrchestratorError)> {
        let at = |stage: CreateStage| move |e: OrchestratorError| (stage, e);
        let hv = |stage: CreateStage| move |e: HypervisorError| (stage, OrchestratorError::from(e));

        self.hypervisor
            .create_vm(vmid, &spec.name, spec.core_count, spec.memory)
            .await
            .map_err(hv(CreateStage::CreateVm))?;
        saga.push(Compensation::DeleteVm(vmid));

        // Held until the VNC line is on disk, where scans can see it.
        let vnc_display = self
            .allocator
            .reserve_port()
            .await
            .map_err(at(CreateStage::ReservePort))?;

        settle(self.timings.config_settle_ms).await;
        self.hypervisor
            .expose_vnc(vmid, vnc_display.value())
            .await
            .map_err(hv(CreateStage::ExposeVnc))?;

        settle(self.timings.mac_settle_ms).await;
        let mac_address = self
            .hypervisor
            .fetch_mac_address(vmid)
            .await
            .map_err(hv(CreateStage::FetchMac))?;

        let access = AccessGroupRequest {
            vm_name: spec.name.clone(),
            owner: owner.to_string(),
            vnc_port: u32::from(vnc_display.value()) + VNC_BASE_PORT,
            mac_address,
            core_count: spec.core_count,
            memory: spec.memory,
        };
        self.directory
            .create_access_group(&access)
            .await
            .map_err(|e| (CreateStage::RegisterAccess, e.into()))?;
        saga.push(Compensation::DeleteAccessGroup(spec.name.clone()));

        let record = self
            .ledger
            .insert(&NewVmRecord {
                vmid,
                name: spec.name.clone(),
                core_count: spec.core_count,
                memory: spec.memory,
                port: vnc_display.value(),
                owner: owner.to_string(),
                expiry: expiry(spec.duration, Utc::now()),
            })
            .await
            .map_err(at(CreateStage::PersistRecord))?;

        vnc_display.release().await;
        Ok(record)
    }

    /// Change cores and memory of one of `owner`'s VMs. The ledger is only
    /// touched once the hypervisor accepted the change.
    #[instrument(skip(self, request), fields(cores = request.core_count, memory = request.memory))]
    pub async fn update_vm(
        &self,
        owner: &str,
        id: i64,
        request: &UpdateVmRequest,
    ) -> Result<VmRecord> {
        validate_resources(request.core_count, request.memory)?;

        let _guard = self.locks.lock(id).await;
        let record = self.owned_record(id, owner).await?;

        let started_at = Utc::now();
        let outcome = self.apply_update(&record, request).await;

        self.journal_outcome(
            &record.name,
            Some(record.vmid),
            OperationType::Update,
            started_at,
            &outcome,
        )
        .await;
        outcome
    }

    /// Delete one of `owner`'s VMs. A running VM is refused with
    /// [`OrchestratorError::RunningConflict`] and nothing is changed.
    #[instrument(skip(self))]
    pub async fn delete_vm(&self, owner: &str, id: i64) -> Result<()> {
        let _guard = self.locks.lock(id).await;
        let record = self.owned_record(id, owner).await?;

        let started_at = Utc::now();
        let outcome = self.remove_everywhere(&record).await;

        self.journal_outcome(
            &record.name,
            Some(record.vmid),
            OperationType::Delete,
            started_at,
            &outcome,
        )
        .await;

        if outcome.is_ok() {
            info!(vmid = record.vmid, name = %record.name, "VM deleted");
        }
        outcome
    }

    /// Tear down an expired VM: stop, delete on the hypervisor, delete the
    /// access group. The ledger row is removed whatever the remote steps did.
    #[instrument(skip(self, record), fields(id = record.id, vmid = record.vmid, name = %record.name))]
    pub async fn reclaim(&self, record: &VmRecord) -> Result<()> {
        let _guard = self.locks.lock(record.id).await;

        // Deleted by its owner while we waited for the lock.
        if self.ledger.get(record.id).await?.is_none() {
            return Ok(());
        }

        let started_at = Utc::now();
        let teardown = self.teardown_remote(record).await;
        let removed = self.ledger.delete(record.id).await;

        let outcome = match (teardown, removed) {
            (Err(e), _) => Err(e),
            (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(_)) => Ok(()),
        };

        self.journal_outcome(
            &record.name,
            Some(record.vmid),
            OperationType::Reclaim,
            started_at,
            &outcome,
        )
        .await;
        outcome
    }

    async fn apply_update(&self, record: &VmRecord, request: &UpdateVmRequest) -> Result<VmRecord> {
        self.hypervisor
            .update_vm(record.vmid, request.core_count, request.memory)
            .await?;

        if !self
            .ledger
            .update_specs(record.id, request.core_count, request.memory)
            .await?
        {
            return Err(OrchestratorError::NotFound(record.id.to_string()));
        }

        Ok(VmRecord {
            core_count: request.core_count,
            memory: request.memory,
            ..record.clone()
        })
    }

    async fn remove_everywhere(&self, record: &VmRecord) -> Result<()> {
        self.hypervisor
            .delete_vm(record.vmid)
            .await
            .map_err(|e| match e {
                HypervisorError::Running(vmid) => OrchestratorError::RunningConflict { vmid },
                other => other.into(),
            })?;
        self.directory.delete_access_group(&record.name).await?;
        self.ledger.delete(record.id).await?;
        Ok(())
    }

    async fn teardown_remote(&self, record: &VmRecord) -> Result<()> {
        self.hypervisor.stop_vm(record.vmid).await?;
        self.wait_until_stopped(record.vmid).await;
        self.hypervisor.delete_vm(record.vmid).await?;
        self.directory.delete_access_group(&record.name).await?;
        Ok(())
    }

    /// Shutdown is asynchronous on the node. Polls the power state until the
    /// VM is stopped or `stop_timeout_ms` has passed; the delete that follows
    /// reports a VM that is still running.
    async fn wait_until_stopped(&self, vmid: u32) {
        let deadline = Instant::now() + Duration::from_millis(self.timings.stop_timeout_ms);
        let poll = Duration::from_millis(self.timings.stop_poll_ms.max(1));

        loop {
            match self.hypervisor.vm_status(vmid).await {
                Ok(PowerState::Stopped) => return,
                Ok(state) => debug!(vmid, ?state, "Waiting for VM to stop"),
                Err(e) => warn!(vmid, error = %e, "Power state check failed while stopping"),
            }

            if Instant::now() >= deadline {
                warn!(vmid, timeout_ms = self.timings.stop_timeout_ms, "VM did not stop in time");
                return;
            }
            tokio::time::sleep(poll).await;
        }
    }

    async fn owned_record(&self, id: i64, owner: &str) -> Result<VmRecord> {
        self.ledger
            .find_owned(id, owner)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))
    }

    async fn journal_outcome<T>(
        &self,
        vm_name: &str,
        vmid: Option<u32>,
        operation_type: OperationType,
        started_at: DateTime<Utc>,
        outcome: &Result<T>,
    ) {
        let (status, error) = match outcome {
            Ok(_) => (OperationStatus::Success, None),
            Err(e @ OrchestratorError::RunningConflict { .. }) => {
                (OperationStatus::Conflict, Some(e.to_string()))
            }
            Err(e) => (OperationStatus::Failed, Some(e.to_string())),
        };

        let entry = NewOperation {
            vm_name,
            vmid,
            operation_type,
            status,
            started_at,
            error,
        };
        if let Err(e) = self.journal.record(entry).await {
            warn!(vm = vm_name, error = %e, "Failed to journal operation");
        }
    }

    async fn journal_compensation_failures(&self, vm_name: &str, vmid: u32, failures: &[String]) {
        let entry = NewOperation {
            vm_name,
            vmid: Some(vmid),
            operation_type: OperationType::Delete,
            status: OperationStatus::Failed,
            started_at: Utc::now(),
            error: Some(format!("compensation failed: {}", failures.join("; "))),
        };
        if let Err(e) = self.journal.record(entry).await {
            warn!(vm = vm_name, error = %e, "Failed to journal compensation failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{DirectoryFailPoint, HypervisorFailPoint, TestEnv};

    fn spec(name: &str) -> VmSpec {
        VmSpec {
            name: name.to_string(),
            core_count: 2,
            memory: 2048,
            duration: 60,
        }
    }

    #[tokio::test]
    async fn invalid_spec_has_no_side_effects() {
        let env = TestEnv::new().await;
        let bad = VmSpec {
            memory: 256,
            ..spec("lab-1")
        };

        let err = env.orchestrator.create_vm("alice", &bad).await.unwrap_err();

        assert!(matches!(err, OrchestratorError::Validation(_)));
        assert!(env.hypervisor.calls().is_empty());
        assert!(env.directory.groups().is_empty());
    }

    #[tokio::test]
    async fn directory_failure_deletes_the_hypervisor_vm() {
        let env = TestEnv::new().await;
        env.directory.fail_on(DirectoryFailPoint::CreateGroup);

        let err = env
            .orchestrator
            .create_vm("alice", &spec("lab-1"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            OrchestratorError::Provision {
                stage: CreateStage::RegisterAccess,
                ..
            }
        ));
        assert!(env.hypervisor.vm(102).is_none());
        assert!(env.hypervisor.calls().contains(&"delete_vm 102".to_string()));
        assert!(env.orchestrator.list_vms("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn hypervisor_create_failure_needs_no_compensation() {
        let env = TestEnv::new().await;
        env.hypervisor.fail_on(HypervisorFailPoint::Create);

        let err = env
            .orchestrator
            .create_vm("alice", &spec("lab-1"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            OrchestratorError::Provision {
                stage: CreateStage::CreateVm,
                ..
            }
        ));
        assert!(!env.hypervisor.calls().iter().any(|c| c.starts_with("delete_vm")));
    }

    #[tokio::test]
    async fn failed_compensation_is_journaled() {
        let env = TestEnv::new().await;
        env.hypervisor.fail_on(HypervisorFailPoint::FetchMac);
        env.hypervisor.fail_on(HypervisorFailPoint::Delete);

        let err = env
            .orchestrator
            .create_vm("alice", &spec("lab-1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Provision {
                stage: CreateStage::FetchMac,
                ..
            }
        ));

        let ops = env.orchestrator.journal().list(Some("lab-1")).await.unwrap();
        assert!(ops.iter().any(|op| op
            .error
            .as_deref()
            .is_some_and(|e| e.starts_with("compensation failed"))));
        assert!(ops
            .iter()
            .any(|op| op.operation_type == OperationType::Create
                && op.status == OperationStatus::Failed));
    }

    #[tokio::test]
    async fn update_of_foreign_vm_is_not_found() {
        let env = TestEnv::new().await;
        let record = env
            .orchestrator
            .create_vm("alice", &spec("lab-1"))
            .await
            .unwrap();

        let err = env
            .orchestrator
            .update_vm(
                "mallory",
                record.id,
                &UpdateVmRequest {
                    core_count: 4,
                    memory: 4096,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_removes_all_three_records() {
        let env = TestEnv::new().await;
        let record = env
            .orchestrator
            .create_vm("alice", &spec("lab-1"))
            .await
            .unwrap();

        env.orchestrator.delete_vm("alice", record.id).await.unwrap();

        assert!(env.hypervisor.vm(record.vmid).is_none());
        assert!(env.directory.group("lab-1").is_none());
        assert!(env.orchestrator.ledger().get(record.id).await.unwrap().is_none());
    }

    fn patient_timings() -> WorkflowTimings {
        WorkflowTimings {
            stop_poll_ms: 1,
            stop_timeout_ms: 5_000,
            ..WorkflowTimings::immediate()
        }
    }

    fn status_checks(env: &TestEnv, vmid: u32) -> usize {
        let call = format!("vm_status {vmid}");
        env.hypervisor.calls().iter().filter(|c| **c == call).count()
    }

    #[tokio::test]
    async fn reclaim_waits_for_a_slow_shutdown() {
        let env = TestEnv::with_timings(patient_timings()).await;
        let record = env
            .orchestrator
            .create_vm("alice", &spec("lab-1"))
            .await
            .unwrap();
        env.hypervisor.set_running(record.vmid, true);
        env.hypervisor.shut_down_after(2);

        env.orchestrator.reclaim(&record).await.unwrap();

        assert!(env.hypervisor.vm(record.vmid).is_none());
        assert!(env.directory.group("lab-1").is_none());
        // Two checks still report running, the third sees it stopped.
        assert_eq!(status_checks(&env, record.vmid), 3);
    }

    #[tokio::test]
    async fn reclaim_stops_waiting_at_the_timeout() {
        let env = TestEnv::with_timings(WorkflowTimings {
            stop_timeout_ms: 30,
            ..patient_timings()
        })
        .await;
        let record = env
            .orchestrator
            .create_vm("alice", &spec("lab-1"))
            .await
            .unwrap();
        env.hypervisor.set_running(record.vmid, true);
        env.hypervisor.shut_down_after(u32::MAX);

        let err = env.orchestrator.reclaim(&record).await.unwrap_err();

        assert!(matches!(
            err,
            OrchestratorError::Hypervisor(HypervisorError::Running(_))
        ));
        assert!(env.hypervisor.vm(record.vmid).is_some());
        // The row goes regardless; the remote VM is left for an operator.
        assert!(env.orchestrator.ledger().get(record.id).await.unwrap().is_none());
    }
}
