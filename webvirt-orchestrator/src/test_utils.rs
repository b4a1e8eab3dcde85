//! In-memory backends and fixtures for tests of this crate and its dependents.

use crate::allocator::ResourceAllocator;
use crate::config_store::ConfigStore;
use crate::directory::{AccessGroupRequest, Directory, DirectoryError, DirectoryUser, NewUser};
use crate::hypervisor::{Hypervisor, HypervisorError, PowerState, RemoteFailure};
use crate::lease::LeaseRegistry;
use crate::orchestrator::{VmOrchestrator, WorkflowTimings};
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Helper to create an in-memory test database with migrations applied
pub async fn create_test_db() -> SqlitePool {
    // One connection: every new connection to `sqlite::memory:` is a new database.
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HypervisorFailPoint {
    Create,
    Update,
    Delete,
    Stop,
    Expose,
    FetchMac,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockVm {
    pub name: String,
    pub core_count: i64,
    pub memory: i64,
    pub display: Option<u16>,
    pub running: bool,
}

#[derive(Debug, Default)]
struct HypervisorState {
    vms: BTreeMap<u32, MockVm>,
    failures: HashSet<HypervisorFailPoint>,
    calls: Vec<String>,
    shutdown_polls: Option<u32>,
    // Status checks left before a requested shutdown completes.
    pending_stops: HashMap<u32, u32>,
}

/// Hypervisor that keeps VMs in memory and mirrors them into a configuration
/// store directory, so allocation scans see them like on a real node.
#[derive(Debug)]
pub struct MockHypervisor {
    state: Mutex<HypervisorState>,
    store: ConfigStore,
    latency: Duration,
}

fn rejected(reason: &str) -> RemoteFailure {
    RemoteFailure::Rejected {
        status: 500,
        reason: reason.to_string(),
    }
}

impl MockHypervisor {
    pub fn new(store: ConfigStore) -> Self {
        Self {
            state: Mutex::new(HypervisorState::default()),
            store,
            latency: Duration::ZERO,
        }
    }

    /// Every call yields for `latency` first, letting concurrent workflows interleave.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn fail_on(&self, point: HypervisorFailPoint) {
        self.state.lock().unwrap().failures.insert(point);
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failures.clear();
    }

    pub fn set_running(&self, vmid: u32, running: bool) {
        if let Some(vm) = self.state.lock().unwrap().vms.get_mut(&vmid) {
            vm.running = running;
        }
    }

    /// Later stops leave a running VM up for `polls` more status checks, like
    /// a guest that takes a while to shut down.
    pub fn shut_down_after(&self, polls: u32) {
        self.state.lock().unwrap().shutdown_polls = Some(polls);
    }

    pub fn vm(&self, vmid: u32) -> Option<MockVm> {
        self.state.lock().unwrap().vms.get(&vmid).cloned()
    }

    pub fn vm_ids(&self) -> Vec<u32> {
        self.state.lock().unwrap().vms.keys().copied().collect()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    async fn enter(&self, call: String, point: Option<HypervisorFailPoint>) -> bool {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        point.is_some_and(|p| state.failures.contains(&p))
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    async fn create_vm(
        &self,
        vmid: u32,
        name: &str,
        core_count: i64,
        memory: i64,
    ) -> Result<(), HypervisorError> {
        if self
            .enter(format!("create_vm {vmid}"), Some(HypervisorFailPoint::Create))
            .await
        {
            return Err(HypervisorError::Provision(rejected("injected create failure")));
        }

        let mut state = self.state.lock().unwrap();
        if state.vms.contains_key(&vmid) {
            return Err(HypervisorError::Provision(rejected(&format!(
                "VM {vmid} already exists"
            ))));
        }
        std::fs::write(
            self.store.config_path(vmid),
            format!("name: {name}\ncores: {core_count}\nmemory: {memory}\nnet0: virtio=BC:24:11:00:{:02X}:{:02X},bridge=vmbr0\n", vmid / 256 % 256, vmid % 256),
        )
        .map_err(|e| HypervisorError::Provision(RemoteFailure::Unreachable(e.to_string())))?;
        state.vms.insert(
            vmid,
            MockVm {
                name: name.to_string(),
                core_count,
                memory,
                display: None,
                running: false,
            },
        );
        Ok(())
    }

    async fn update_vm(
        &self,
        vmid: u32,
        core_count: i64,
        memory: i64,
    ) -> Result<(), HypervisorError> {
        if self
            .enter(format!("update_vm {vmid}"), Some(HypervisorFailPoint::Update))
            .await
        {
            return Err(HypervisorError::Update(rejected("injected update failure")));
        }

        let mut state = self.state.lock().unwrap();
        let vm = state
            .vms
            .get_mut(&vmid)
            .ok_or_else(|| HypervisorError::Update(rejected("no such VM")))?;
        vm.core_count = core_count;
        vm.memory = memory;
        Ok(())
    }

    async fn delete_vm(&self, vmid: u32) -> Result<(), HypervisorError> {
        if self
            .enter(format!("delete_vm {vmid}"), Some(HypervisorFailPoint::Delete))
            .await
        {
            return Err(HypervisorError::Delete(rejected("injected delete failure")));
        }

        let mut state = self.state.lock().unwrap();
        match state.vms.get(&vmid) {
            None => Err(HypervisorError::Delete(rejected("no such VM"))),
            Some(vm) if vm.running => Err(HypervisorError::Running(vmid)),
            Some(_) => {
                state.vms.remove(&vmid);
                let _ = std::fs::remove_file(self.store.config_path(vmid));
                Ok(())
            }
        }
    }

    async fn stop_vm(&self, vmid: u32) -> Result<(), HypervisorError> {
        if self
            .enter(format!("stop_vm {vmid}"), Some(HypervisorFailPoint::Stop))
            .await
        {
            return Err(HypervisorError::Stop(rejected("injected stop failure")));
        }

        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let vm = state
            .vms
            .get_mut(&vmid)
            .ok_or_else(|| HypervisorError::Stop(rejected("no such VM")))?;
        match state.shutdown_polls {
            Some(polls) if vm.running => {
                state.pending_stops.insert(vmid, polls);
            }
            _ => vm.running = false,
        }
        Ok(())
    }

    async fn vm_status(&self, vmid: u32) -> Result<PowerState, HypervisorError> {
        self.enter(format!("vm_status {vmid}"), None).await;
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        if let Some(remaining) = state.pending_stops.get_mut(&vmid) {
            if *remaining == 0 {
                state.pending_stops.remove(&vmid);
                if let Some(vm) = state.vms.get_mut(&vmid) {
                    vm.running = false;
                }
            } else {
                *remaining -= 1;
            }
        }
        match state.vms.get(&vmid) {
            Some(vm) if vm.running => Ok(PowerState::Running),
            Some(_) => Ok(PowerState::Stopped),
            None => Err(HypervisorError::Status(rejected("no such VM"))),
        }
    }

    async fn fetch_mac_address(&self, vmid: u32) -> Result<String, HypervisorError> {
        if self
            .enter(
                format!("fetch_mac_address {vmid}"),
                Some(HypervisorFailPoint::FetchMac),
            )
            .await
        {
            return Err(HypervisorError::Provision(RemoteFailure::TimedOut(
                "injected config read failure".to_string(),
            )));
        }

        let config = std::fs::read_to_string(self.store.config_path(vmid))
            .map_err(|e| HypervisorError::Provision(RemoteFailure::Malformed(e.to_string())))?;
        config
            .lines()
            .find_map(|line| line.strip_prefix("net0: "))
            .and_then(crate::hypervisor::parse_mac)
            .ok_or_else(|| {
                HypervisorError::Provision(RemoteFailure::Malformed("no net0".to_string()))
            })
    }

    async fn expose_vnc(&self, vmid: u32, display: u16) -> Result<(), HypervisorError> {
        if self
            .enter(format!("expose_vnc {vmid}"), Some(HypervisorFailPoint::Expose))
            .await
        {
            return Err(HypervisorError::Expose {
                vmid,
                reason: "injected expose failure".to_string(),
            });
        }

        self.store
            .append_vnc(vmid, display)
            .map_err(|e| HypervisorError::Expose {
                vmid,
                reason: e.to_string(),
            })?;
        if let Some(vm) = self.state.lock().unwrap().vms.get_mut(&vmid) {
            vm.display = Some(display);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirectoryFailPoint {
    CreateGroup,
    DeleteGroup,
    CreateUser,
    Search,
}

#[derive(Debug, Default)]
struct DirectoryState {
    groups: BTreeMap<String, AccessGroupRequest>,
    users: BTreeMap<String, NewUser>,
    failures: HashSet<DirectoryFailPoint>,
}

#[derive(Debug, Default)]
pub struct MockDirectory {
    state: Mutex<DirectoryState>,
}

fn write_failure(dn: &str) -> DirectoryError {
    DirectoryError::Write {
        dn: dn.to_string(),
        reason: "injected failure".to_string(),
    }
}

impl MockDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, point: DirectoryFailPoint) {
        self.state.lock().unwrap().failures.insert(point);
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failures.clear();
    }

    /// Seed an existing account.
    pub fn add_user(&self, username: &str, uid_number: u32, password: &str) {
        self.state.lock().unwrap().users.insert(
            username.to_string(),
            NewUser {
                first_name: username.to_string(),
                last_name: String::new(),
                username: username.to_string(),
                uid_number,
                password: password.to_string(),
                home_prefix: "/home".to_string(),
            },
        );
    }

    pub fn user(&self, username: &str) -> Option<NewUser> {
        self.state.lock().unwrap().users.get(username).cloned()
    }

    pub fn group(&self, vm_name: &str) -> Option<AccessGroupRequest> {
        self.state.lock().unwrap().groups.get(vm_name).cloned()
    }

    pub fn groups(&self) -> Vec<AccessGroupRequest> {
        self.state.lock().unwrap().groups.values().cloned().collect()
    }

    fn failing(&self, point: DirectoryFailPoint) -> bool {
        self.state.lock().unwrap().failures.contains(&point)
    }

    fn check_search(&self, base: &str) -> Result<(), DirectoryError> {
        if self.failing(DirectoryFailPoint::Search) {
            return Err(DirectoryError::Search {
                base: base.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Directory for MockDirectory {
    async fn create_access_group(
        &self,
        request: &AccessGroupRequest,
    ) -> Result<(), DirectoryError> {
        if self.failing(DirectoryFailPoint::CreateGroup) {
            return Err(write_failure(&request.vm_name));
        }
        let mut state = self.state.lock().unwrap();
        if state.groups.contains_key(&request.vm_name) {
            return Err(DirectoryError::Write {
                dn: request.vm_name.clone(),
                reason: "entry already exists".to_string(),
            });
        }
        state
            .groups
            .insert(request.vm_name.clone(), request.clone());
        Ok(())
    }

    async fn delete_access_group(&self, vm_name: &str) -> Result<(), DirectoryError> {
        if self.failing(DirectoryFailPoint::DeleteGroup) {
            return Err(write_failure(vm_name));
        }
        self.state
            .lock()
            .unwrap()
            .groups
            .remove(vm_name)
            .map(|_| ())
            .ok_or_else(|| DirectoryError::Write {
                dn: vm_name.to_string(),
                reason: "no such object".to_string(),
            })
    }

    async fn create_user(&self, user: &NewUser) -> Result<(), DirectoryError> {
        if self.failing(DirectoryFailPoint::CreateUser) {
            return Err(write_failure(&user.username));
        }
        let mut state = self.state.lock().unwrap();
        if state.users.contains_key(&user.username) {
            return Err(DirectoryError::Write {
                dn: user.username.clone(),
                reason: "entry already exists".to_string(),
            });
        }
        state.users.insert(user.username.clone(), user.clone());
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<DirectoryUser>, DirectoryError> {
        self.check_search("users")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .users
            .values()
            .map(|u| DirectoryUser {
                username: u.username.clone(),
                uid_number: u.uid_number,
            })
            .collect())
    }

    async fn access_groups_for(&self, username: &str) -> Result<Vec<String>, DirectoryError> {
        self.check_search("groups")?;
        let mut names: Vec<String> = self
            .state
            .lock()
            .unwrap()
            .groups
            .values()
            .filter(|g| g.owner == username)
            .map(|g| g.vm_name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn verify_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<bool, DirectoryError> {
        self.check_search("users")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .users
            .get(username)
            .is_some_and(|u| !password.is_empty() && u.password == password))
    }
}

/// Orchestrator wired to in-memory backends over a temporary configuration
/// store that already holds VMs 100 (display 1) and 101 (display 2).
pub struct TestEnv {
    pub orchestrator: VmOrchestrator,
    pub hypervisor: Arc<MockHypervisor>,
    pub directory: Arc<MockDirectory>,
    pub store: ConfigStore,
    pub pool: SqlitePool,
    _dir: TempDir,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_latency(Duration::ZERO).await
    }

    pub async fn with_latency(latency: Duration) -> Self {
        Self::build(latency, WorkflowTimings::immediate()).await
    }

    pub async fn with_timings(timings: WorkflowTimings) -> Self {
        Self::build(Duration::ZERO, timings).await
    }

    async fn build(latency: Duration, timings: WorkflowTimings) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config_dir: PathBuf = dir.path().join("qemu-server");
        std::fs::create_dir_all(&config_dir).expect("Failed to create config dir");
        std::fs::write(config_dir.join("100.conf"), "cores: 1\nargs: -vnc 0.0.0.0:1\n")
            .expect("Failed to seed config");
        std::fs::write(config_dir.join("101.conf"), "cores: 1\nargs: -vnc 0.0.0.0:2\n")
            .expect("Failed to seed config");

        let store = ConfigStore::new(&config_dir);
        let leases = Arc::new(LeaseRegistry::new(
            dir.path().join("leases.json"),
            chrono::Duration::minutes(10),
        ));
        let allocator = ResourceAllocator::new(store.clone(), leases);
        let hypervisor = Arc::new(MockHypervisor::new(store.clone()).with_latency(latency));
        let directory = Arc::new(MockDirectory::new());
        let pool = create_test_db().await;

        let orchestrator = VmOrchestrator::new(
            pool.clone(),
            allocator,
            hypervisor.clone(),
            directory.clone(),
            timings,
        );

        Self {
            orchestrator,
            hypervisor,
            directory,
            store,
            pool,
            _dir: dir,
        }
    }
}
