//! In-flight allocation leases.
//!
//! Allocation scans the configuration store, but a freshly chosen VM id or VNC
//! display only shows up there once the hypervisor has written the config
//! file. Leases cover that window: a chosen value is recorded in a JSON file
//! under an exclusive lock and every later scan treats it as taken until the
//! lease is released or goes stale.
//!
//! Lease file access blocks on file locks, so the async entry points run it on
//! the blocking pool.

use chrono::{DateTime, Duration, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

const LOCK_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(10);
const LOCK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum LeaseError {
    #[error("Failed to access lease file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Lease file {path} is not valid JSON: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Timed out waiting for the lease file lock after {attempts} attempts")]
    LockTimeout { attempts: u32 },

    #[error("Lease registry lock was poisoned")]
    Poisoned,

    #[error("Lease file task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseKind {
    Vmid,
    Port,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeaseEntry {
    kind: LeaseKind,
    value: u32,
    holder: String,
    acquired_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct LeaseRegistry {
    path: PathBuf,
    ttl: Duration,
    // Serializes tasks in this process; the file lock covers other processes.
    local: Mutex<()>,
}

impl LeaseRegistry {
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            ttl,
            local: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Values of `kind` currently held by live leases.
    pub async fn active(self: &Arc<Self>, kind: LeaseKind) -> Result<BTreeSet<u32>, LeaseError> {
        let registry = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            registry.with_entries::<_, LeaseError, _>(|entries| Ok(values_of(entries, kind)))
        })
        .await?
    }

    /// Chooses a value with `pick`, given the values already leased, and
    /// records it. The whole step runs under the registry lock, so two
    /// concurrent claims can never receive the same value.
    pub async fn claim<F, E>(self: &Arc<Self>, kind: LeaseKind, pick: F) -> Result<Lease, E>
    where
        F: FnOnce(&BTreeSet<u32>) -> Result<u32, E> + Send + 'static,
        E: From<LeaseError> + Send + 'static,
    {
        let registry = Arc::clone(self);
        let holder = Uuid::new_v4().to_string();
        let recorded = holder.clone();

        let value = tokio::task::spawn_blocking(move || {
            registry.with_entries::<_, E, _>(|entries| {
                let value = pick(&values_of(entries, kind))?;
                entries.push(LeaseEntry {
                    kind,
                    value,
                    holder: recorded,
                    acquired_at: Utc::now(),
                });
                Ok(value)
            })
        })
        .await
        .map_err(|e| E::from(LeaseError::from(e)))??;

        debug!(?kind, value, "Lease acquired");
        Ok(Lease {
            registry: Arc::clone(self),
            kind,
            value,
            holder: Some(holder),
        })
    }

    fn release(&self, kind: LeaseKind, value: u32, holder: &str) -> Result<(), LeaseError> {
        self.with_entries(|entries| {
            entries.retain(|e| !(e.kind == kind && e.value == value && e.holder == holder));
            Ok(())
        })
    }

    /// Read-modify-write of the lease file under both locks. Stale entries are
    /// pruned before `update` sees the list.
    fn with_entries<T, E, F>(&self, update: F) -> Result<T, E>
    where
        F: FnOnce(&mut Vec<LeaseEntry>) -> Result<T, E>,
        E: From<LeaseError>,
    {
        let _local = self.local.lock().map_err(|_| LeaseError::Poisoned)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| self.io_error(source))?;
        }

        let lock_path = self.path.with_extension("lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(|source| LeaseError::Io {
                path: lock_path.clone(),
                source,
            })?;

        let started = Instant::now();
        let mut attempts = 0;
        while lock_file.try_lock_exclusive().is_err() {
            attempts += 1;
            if started.elapsed() > LOCK_TIMEOUT {
                return Err(LeaseError::LockTimeout { attempts }.into());
            }
            std::thread::sleep(LOCK_RETRY_DELAY);
        }
        let _unlock = scopeguard::guard((), |_| {
            let _ = FileExt::unlock(&lock_file);
        });

        let mut entries = self.read_entries()?;
        let cutoff = Utc::now() - self.ttl;
        let before = entries.len();
        entries.retain(|e| e.acquired_at > cutoff);
        if entries.len() < before {
            warn!(
                dropped = before - entries.len(),
                "Discarded stale allocation leases"
            );
        }

        let result = update(&mut entries)?;
        self.write_entries(&entries)?;

        Ok(result)
    }

    fn read_entries(&self) -> Result<Vec<LeaseEntry>, LeaseError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(self.io_error(source)),
        };

        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        serde_json::from_str(&content).map_err(|source| LeaseError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    fn write_entries(&self, entries: &[LeaseEntry]) -> Result<(), LeaseError> {
        let json = serde_json::to_string_pretty(entries).map_err(|source| LeaseError::Corrupt {
            path: self.path.clone(),
            source,
        })?;

        // Write aside then rename so a crash never leaves a truncated file.
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, json).map_err(|source| self.io_error(source))?;
        fs::rename(&temp_path, &self.path).map_err(|source| self.io_error(source))
    }

    fn io_error(&self, source: std::io::Error) -> LeaseError {
        LeaseError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

fn values_of(entries: &[LeaseEntry], kind: LeaseKind) -> BTreeSet<u32> {
    entries
        .iter()
        .filter(|e| e.kind == kind)
        .map(|e| e.value)
        .collect()
}

/// A held allocation. [`Lease::release`] gives the value back; a lease that
/// is merely dropped releases it in the background.
#[derive(Debug)]
pub struct Lease {
    registry: Arc<LeaseRegistry>,
    kind: LeaseKind,
    value: u32,
    // None once released.
    holder: Option<String>,
}

impl Lease {
    pub fn kind(&self) -> LeaseKind {
        self.kind
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    /// Removes the lease from the registry and waits until that is on disk.
    pub async fn release(mut self) {
        let Some(job) = self.take_release() else {
            return;
        };
        if let Err(e) = tokio::task::spawn_blocking(job).await {
            warn!(kind = ?self.kind, value = self.value, error = %e, "Lease release task failed");
        }
    }

    fn take_release(&mut self) -> Option<impl FnOnce() + Send + 'static> {
        let holder = self.holder.take()?;
        let registry = Arc::clone(&self.registry);
        let (kind, value) = (self.kind, self.value);

        Some(move || {
            if let Err(e) = registry.release(kind, value, &holder) {
                // The entry ages out after the TTL.
                warn!(?kind, value, error = %e, "Failed to release lease");
            }
        })
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let Some(job) = self.take_release() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let _ = handle.spawn_blocking(job);
            }
            Err(_) => job(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(dir: &Path) -> Arc<LeaseRegistry> {
        Arc::new(LeaseRegistry::new(
            dir.join("leases.json"),
            Duration::minutes(10),
        ))
    }

    fn pick_lowest_free(taken: &BTreeSet<u32>) -> Result<u32, LeaseError> {
        Ok((100..).find(|v| !taken.contains(v)).unwrap_or(100))
    }

    #[tokio::test]
    async fn claims_skip_values_already_leased() {
        let dir = tempfile::tempdir().unwrap();
        let leases = registry(dir.path());

        let first = leases.claim(LeaseKind::Vmid, pick_lowest_free).await.unwrap();
        let second = leases.claim(LeaseKind::Vmid, pick_lowest_free).await.unwrap();

        assert_eq!(first.value(), 100);
        assert_eq!(second.value(), 101);
        assert_eq!(
            leases.active(LeaseKind::Vmid).await.unwrap(),
            BTreeSet::from([100, 101])
        );
    }

    #[tokio::test]
    async fn kinds_are_tracked_separately() {
        let dir = tempfile::tempdir().unwrap();
        let leases = registry(dir.path());

        let _vmid = leases.claim(LeaseKind::Vmid, pick_lowest_free).await.unwrap();
        assert!(leases.active(LeaseKind::Port).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn released_lease_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let leases = registry(dir.path());

        let lease = leases.claim(LeaseKind::Port, pick_lowest_free).await.unwrap();
        lease.release().await;

        assert!(leases.active(LeaseKind::Port).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dropped_lease_is_released_in_the_background() {
        let dir = tempfile::tempdir().unwrap();
        let leases = registry(dir.path());

        let lease = leases.claim(LeaseKind::Port, pick_lowest_free).await.unwrap();
        drop(lease);

        for _ in 0..200 {
            if leases.active(LeaseKind::Port).await.unwrap().is_empty() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("dropped lease was never released");
    }

    #[test]
    fn lease_dropped_outside_a_runtime_is_released_inline() {
        let dir = tempfile::tempdir().unwrap();
        let leases = registry(dir.path());
        let runtime = tokio::runtime::Runtime::new().unwrap();

        let lease = runtime
            .block_on(leases.claim(LeaseKind::Vmid, pick_lowest_free))
            .unwrap();
        drop(lease);

        assert!(runtime
            .block_on(leases.active(LeaseKind::Vmid))
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn contended_file_lock_does_not_stall_the_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let leases = registry(dir.path());

        // Another process holding the lease file lock.
        let lock_file = fs::File::create(dir.path().join("leases.lock")).unwrap();
        lock_file.lock_exclusive().unwrap();

        let claim = tokio::spawn({
            let leases = Arc::clone(&leases);
            async move { leases.claim(LeaseKind::Vmid, pick_lowest_free).await }
        });

        // Single-threaded runtime: this timer only fires if the claim yields.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!claim.is_finished());

        FileExt::unlock(&lock_file).unwrap();
        let lease = claim.await.unwrap().unwrap();
        assert_eq!(lease.value(), 100);
    }

    #[tokio::test]
    async fn leases_are_visible_to_another_registry_on_the_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let a = registry(dir.path());
        let b = registry(dir.path());

        let held = a.claim(LeaseKind::Vmid, pick_lowest_free).await.unwrap();
        let other = b.claim(LeaseKind::Vmid, pick_lowest_free).await.unwrap();

        assert_ne!(held.value(), other.value());
    }

    #[tokio::test]
    async fn stale_leases_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let stale = vec![LeaseEntry {
            kind: LeaseKind::Vmid,
            value: 100,
            holder: "crashed".to_string(),
            acquired_at: Utc::now() - Duration::hours(1),
        }];
        fs::write(
            dir.path().join("leases.json"),
            serde_json::to_string(&stale).unwrap(),
        )
        .unwrap();

        let leases = registry(dir.path());
        assert!(leases.active(LeaseKind::Vmid).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_pick_records_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let leases = registry(dir.path());

        let result: Result<Lease, LeaseError> =
            leases.claim(LeaseKind::Port, |_| Err(LeaseError::Poisoned)).await;

        assert!(result.is_err());
        assert!(leases.active(LeaseKind::Port).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("leases.json"), "{not json").unwrap();

        let leases = registry(dir.path());
        assert!(matches!(
            leases.active(LeaseKind::Vmid).await,
            Err(LeaseError::Corrupt { .. })
        ));
    }
}
