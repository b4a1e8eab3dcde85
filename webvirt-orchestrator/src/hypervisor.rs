//! Proxmox VE client.
//!
//! [`Hypervisor`] is the seam the orchestrator talks through; [`ProxmoxClient`]
//! is the production implementation over the `api2/json` REST API plus the
//! node's on-disk configuration store.

use crate::config_store::ConfigStore;
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HypervisorConfig {
    /// Scheme and host, e.g. `https://pve.example.org`.
    pub base_url: String,
    pub port: u16,
    pub node: String,
    /// Sent verbatim as the `Authorization` header,
    /// e.g. `PVEAPIToken=user@pam!token=secret`.
    pub access_token: String,
    pub net_bridge: String,
    pub config_dir: PathBuf,
    pub request_timeout_secs: u64,
    pub accept_invalid_certs: bool,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            base_url: "https://localhost".to_string(),
            port: 8006,
            node: "pve".to_string(),
            access_token: String::new(),
            net_bridge: "vmbr0".to_string(),
            config_dir: PathBuf::from("/etc/pve/qemu-server"),
            request_timeout_secs: 30,
            accept_invalid_certs: false,
        }
    }
}

impl HypervisorConfig {
    pub fn qemu_url(&self) -> String {
        format!(
            "{}:{}/api2/json/nodes/{}/qemu",
            self.base_url.trim_end_matches('/'),
            self.port,
            self.node
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    Running,
    Stopped,
    Paused,
    Unknown,
}

impl PowerState {
    fn from_status(status: &str) -> Self {
        match status {
            "running" => PowerState::Running,
            "stopped" => PowerState::Stopped,
            "paused" | "suspended" => PowerState::Paused,
            _ => PowerState::Unknown,
        }
    }
}

/// How a single remote call failed.
#[derive(Error, Debug)]
pub enum RemoteFailure {
    #[error("hypervisor unreachable: {0}")]
    Unreachable(String),

    #[error("hypervisor call timed out, outcome unknown: {0}")]
    TimedOut(String),

    #[error("hypervisor rejected the request ({status}): {reason}")]
    Rejected { status: u16, reason: String },

    #[error("unexpected hypervisor response: {0}")]
    Malformed(String),
}

#[derive(Error, Debug)]
pub enum HypervisorError {
    #[error("Failed to create VM: {0}")]
    Provision(RemoteFailure),

    #[error("Failed to update VM: {0}")]
    Update(RemoteFailure),

    #[error("Failed to delete VM: {0}")]
    Delete(RemoteFailure),

    #[error("Failed to stop VM: {0}")]
    Stop(RemoteFailure),

    #[error("Failed to read VM status: {0}")]
    Status(RemoteFailure),

    #[error("Failed to expose VNC for VM {vmid}: {reason}")]
    Expose { vmid: u32, reason: String },

    #[error("VM {0} is running")]
    Running(u32),
}

#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn create_vm(
        &self,
        vmid: u32,
        name: &str,
        core_count: i64,
        memory: i64,
    ) -> Result<(), HypervisorError>;

    async fn update_vm(&self, vmid: u32, core_count: i64, memory: i64)
        -> Result<(), HypervisorError>;

    /// Fails with [`HypervisorError::Running`] instead of deleting a running VM.
    async fn delete_vm(&self, vmid: u32) -> Result<(), HypervisorError>;

    async fn stop_vm(&self, vmid: u32) -> Result<(), HypervisorError>;

    async fn vm_status(&self, vmid: u32) -> Result<PowerState, HypervisorError>;

    /// MAC address of the VM's first network interface.
    async fn fetch_mac_address(&self, vmid: u32) -> Result<String, HypervisorError>;

    async fn expose_vnc(&self, vmid: u32, vnc_display: u16) -> Result<(), HypervisorError>;
}

/// MAC address from a `net0` value such as `virtio=AA:BB:CC:DD:EE:FF,bridge=vmbr0`.
pub fn parse_mac(net0: &str) -> Option<String> {
    let (_, mac) = net0.split(',').next()?.split_once('=')?;
    let mac = mac.trim();
    (!mac.is_empty()).then(|| mac.to_string())
}

/// Best human-readable reason from a Proxmox error response.
fn rejection_reason(status: StatusCode, body: &str) -> String {
    let from_json = serde_json::from_str::<Value>(body).ok().and_then(|v| {
        let message = v.get("message").and_then(Value::as_str).map(str::trim);
        let errors = v.get("errors").filter(|e| !e.is_null()).map(Value::to_string);
        match (message, errors) {
            (Some(m), Some(e)) => Some(format!("{m} {e}")),
            (Some(m), None) => Some(m.to_string()),
            (None, Some(e)) => Some(e),
            (None, None) => None,
        }
    });

    from_json
        .or_else(|| {
            let trimmed = body.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        })
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown").to_string())
}

pub struct ProxmoxClient {
    client: Client,
    config: HypervisorConfig,
    store: ConfigStore,
}

impl ProxmoxClient {
    pub fn new(config: HypervisorConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .user_agent(concat!("webvirt/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let store = ConfigStore::new(&config.config_dir);

        Ok(Self {
            client,
            config,
            store,
        })
    }

    fn vm_url(&self, vmid: u32) -> String {
        format!("{}/{}", self.config.qemu_url(), vmid)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, RemoteFailure> {
        let response = request
            .header(AUTHORIZATION, &self.config.access_token)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RemoteFailure::TimedOut(e.to_string())
                } else {
                    RemoteFailure::Unreachable(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(RemoteFailure::Rejected {
            status: status.as_u16(),
            reason: rejection_reason(status, &body),
        })
    }

    async fn data(&self, request: RequestBuilder) -> Result<Value, RemoteFailure> {
        let body: Value = self
            .send(request)
            .await?
            .json()
            .await
            .map_err(|e| RemoteFailure::Malformed(e.to_string()))?;
        Ok(body.get("data").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl Hypervisor for ProxmoxClient {
    #[instrument(skip(self), fields(node = %self.config.node))]
    async fn create_vm(
        &self,
        vmid: u32,
        name: &str,
        core_count: i64,
        memory: i64,
    ) -> Result<(), HypervisorError> {
        let body = json!({
            "vmid": vmid,
            "name": name,
            "cores": core_count,
            "memory": memory,
            "cpu": "x86-64-v2-AES",
            "ostype": "l26",
            "scsihw": "virtio-scsi-single",
            "net0": format!("virtio,bridge={},firewall=1", self.config.net_bridge),
        });

        self.send(self.client.post(self.config.qemu_url()).json(&body))
            .await
            .map_err(HypervisorError::Provision)?;

        info!(vmid, name, "VM created on hypervisor");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn update_vm(
        &self,
        vmid: u32,
        core_count: i64,
        memory: i64,
    ) -> Result<(), HypervisorError> {
        let body = json!({ "cores": core_count, "memory": memory });

        self.send(self.client.put(self.vm_url(vmid)).json(&body))
            .await
            .map_err(HypervisorError::Update)?;

        info!(vmid, "VM resources updated");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_vm(&self, vmid: u32) -> Result<(), HypervisorError> {
        match self.vm_status(vmid).await {
            Ok(PowerState::Running) => return Err(HypervisorError::Running(vmid)),
            Ok(state) => debug!(vmid, ?state, "Status pre-check passed"),
            Err(e) => warn!(vmid, error = %e, "Status pre-check failed, attempting delete anyway"),
        }

        match self.send(self.client.delete(self.vm_url(vmid))).await {
            Ok(_) => {
                info!(vmid, "VM deleted from hypervisor");
                Ok(())
            }
            // The VM may have been started between the pre-check and the delete.
            Err(RemoteFailure::Rejected { reason, .. })
                if reason.to_lowercase().contains("running") =>
            {
                Err(HypervisorError::Running(vmid))
            }
            Err(failure) => Err(HypervisorError::Delete(failure)),
        }
    }

    #[instrument(skip(self))]
    async fn stop_vm(&self, vmid: u32) -> Result<(), HypervisorError> {
        let url = format!("{}/status/shutdown", self.vm_url(vmid));

        self.send(self.client.post(url).json(&json!({ "forceStop": 1 })))
            .await
            .map_err(HypervisorError::Stop)?;

        info!(vmid, "VM shutdown requested");
        Ok(())
    }

    async fn vm_status(&self, vmid: u32) -> Result<PowerState, HypervisorError> {
        let url = format!("{}/status/current", self.vm_url(vmid));
        let data = self
            .data(self.client.get(url))
            .await
            .map_err(HypervisorError::Status)?;

        let status = data.get("status").and_then(Value::as_str).ok_or_else(|| {
            HypervisorError::Status(RemoteFailure::Malformed(
                "status field missing from response".to_string(),
            ))
        })?;

        Ok(PowerState::from_status(status))
    }

    async fn fetch_mac_address(&self, vmid: u32) -> Result<String, HypervisorError> {
        let url = format!("{}/config", self.vm_url(vmid));
        let data = self
            .data(self.client.get(url))
            .await
            .map_err(HypervisorError::Provision)?;

        data.get("net0")
            .and_then(Value::as_str)
            .and_then(parse_mac)
            .ok_or_else(|| {
                HypervisorError::Provision(RemoteFailure::Malformed(format!(
                    "VM {vmid} has no MAC address on net0"
                )))
            })
    }

    #[instrument(skip(self))]
    async fn expose_vnc(&self, vmid: u32, vnc_display: u16) -> Result<(), HypervisorError> {
        self.store
            .append_vnc(vmid, vnc_display)
            .map_err(|e| HypervisorError::Expose {
                vmid,
                reason: format!("{}: {e}", self.store.config_path(vmid).display()),
            })?;

        info!(vmid, vnc_display, "VNC exposed");
        Ok(())
    }
}
