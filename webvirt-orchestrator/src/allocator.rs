use crate::config_store::ConfigStore;
use crate::error::{OrchestratorError, Result};
use crate::lease::{Lease, LeaseKind, LeaseRegistry};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Identifier handed out when the configuration store is empty.
pub const FIRST_VMID: u32 = 100;

/// First unused identifier given the identifiers in use, in ascending order.
pub fn first_free_identifier(ids: &[u32]) -> Result<u32> {
    let after = match ids {
        [] => return Ok(FIRST_VMID),
        [only] => *only,
        _ => ids
            .windows(2)
            .find(|pair| pair[0].checked_add(1) != Some(pair[1]))
            .map_or(ids[ids.len() - 1], |pair| pair[0]),
    };
    after.checked_add(1).ok_or_else(|| {
        OrchestratorError::Allocation("VM identifiers are exhausted".to_string())
    })
}

/// Display number following the highest one in use. `None` when no display is
/// in use at all.
pub fn next_display(used: &[u16]) -> Option<Result<u16>> {
    let max = used.iter().max()?;
    Some(max.checked_add(1).ok_or_else(|| {
        OrchestratorError::Allocation("VNC display numbers are exhausted".to_string())
    }))
}

/// An allocated value that stays reserved while this handle is alive.
#[derive(Debug)]
pub struct Reserved<T> {
    value: T,
    lease: Lease,
}

impl<T: Copy> Reserved<T> {
    pub fn value(&self) -> T {
        self.value
    }

    /// Gives the value back once it is visible in the configuration store or
    /// no longer needed.
    pub async fn release(self) {
        self.lease.release().await;
    }
}

/// Hands out VM identifiers and VNC display numbers by scanning the
/// hypervisor's configuration store.
#[derive(Debug, Clone)]
pub struct ResourceAllocator {
    store: ConfigStore,
    leases: Arc<LeaseRegistry>,
}

impl ResourceAllocator {
    pub fn new(store: ConfigStore, leases: Arc<LeaseRegistry>) -> Self {
        Self { store, leases }
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub async fn next_free_identifier(&self) -> Result<u32> {
        let in_flight = self.leases.active(LeaseKind::Vmid).await?;
        self.scan(move |allocator| allocator.pick_identifier(&in_flight))
            .await
    }

    pub async fn next_free_port(&self) -> Result<u16> {
        let in_flight = self.leases.active(LeaseKind::Port).await?;
        self.scan(move |allocator| allocator.pick_display(&in_flight))
            .await
    }

    #[instrument(skip(self))]
    pub async fn reserve_identifier(&self) -> Result<Reserved<u32>> {
        let allocator = self.clone();
        let lease = self
            .leases
            .claim(LeaseKind::Vmid, move |in_flight| {
                allocator.pick_identifier(in_flight)
            })
            .await?;
        debug!(vmid = lease.value(), "Reserved VM identifier");
        Ok(Reserved {
            value: lease.value(),
            lease,
        })
    }

    #[instrument(skip(self))]
    pub async fn reserve_port(&self) -> Result<Reserved<u16>> {
        let allocator = self.clone();
        let lease = self
            .leases
            .claim(LeaseKind::Port, move |in_flight| {
                allocator.pick_display(in_flight).map(u32::from)
            })
            .await?;
        let vnc_display = u16::try_from(lease.value()).map_err(|_| {
            OrchestratorError::Allocation(format!("leased display {} is out of range", lease.value()))
        })?;
        debug!(vnc_display, "Reserved VNC display");
        Ok(Reserved {
            value: vnc_display,
            lease,
        })
    }

    /// Runs a configuration store scan on the blocking pool.
    async fn scan<T, F>(&self, pick: F) -> Result<T>
    where
        F: FnOnce(&ResourceAllocator) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let allocator = self.clone();
        tokio::task::spawn_blocking(move || pick(&allocator))
            .await
            .map_err(|e| OrchestratorError::Allocation(format!("store scan failed: {e}")))?
    }

    fn pick_identifier(&self, in_flight: &BTreeSet<u32>) -> Result<u32> {
        let on_disk = self.store.vm_ids().map_err(|e| {
            OrchestratorError::Allocation(format!(
                "cannot read configuration store {}: {e}",
                self.store.dir().display()
            ))
        })?;

        let taken: Vec<u32> = on_disk
            .into_iter()
            .chain(in_flight.iter().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        first_free_identifier(&taken)
    }

    fn pick_display(&self, in_flight: &BTreeSet<u32>) -> Result<u16> {
        let mut used = self.store.vnc_displays().map_err(|e| {
            OrchestratorError::Allocation(format!(
                "cannot read configuration store {}: {e}",
                self.store.dir().display()
            ))
        })?;
        used.extend(in_flight.iter().filter_map(|v| u16::try_from(*v).ok()));

        next_display(&used).unwrap_or_else(|| {
            Err(OrchestratorError::Allocation(
                "no VNC display is configured on any VM; expose one VM manually first".to_string(),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::fs;
    use tempfile::TempDir;

    fn allocator_with(files: &[(&str, &str)]) -> (TempDir, ResourceAllocator) {
        let dir = tempfile::tempdir().unwrap();
        let configs = dir.path().join("qemu-server");
        fs::create_dir_all(&configs).unwrap();
        for (name, contents) in files {
            fs::write(configs.join(name), contents).unwrap();
        }
        let leases = Arc::new(LeaseRegistry::new(
            dir.path().join("leases.json"),
            Duration::minutes(10),
        ));
        let allocator = ResourceAllocator::new(ConfigStore::new(configs), leases);
        (dir, allocator)
    }

    #[test]
    fn first_identifier_for_empty_store() {
        assert_eq!(first_free_identifier(&[]).unwrap(), 100);
    }

    #[test]
    fn single_identifier_is_followed_by_its_successor() {
        assert_eq!(first_free_identifier(&[100]).unwrap(), 101);
        assert_eq!(first_free_identifier(&[250]).unwrap(), 251);
    }

    #[test]
    fn fills_the_first_gap() {
        assert_eq!(first_free_identifier(&[100, 101, 103, 105]).unwrap(), 102);
        assert_eq!(first_free_identifier(&[100, 102]).unwrap(), 101);
    }

    #[test]
    fn contiguous_identifiers_continue_after_the_max() {
        assert_eq!(first_free_identifier(&[100, 101, 102]).unwrap(), 103);
    }

    #[test]
    fn largest_identifier_in_use_is_an_allocation_error() {
        assert!(matches!(
            first_free_identifier(&[u32::MAX]),
            Err(OrchestratorError::Allocation(_))
        ));
        assert!(matches!(
            first_free_identifier(&[u32::MAX - 1, u32::MAX]),
            Err(OrchestratorError::Allocation(_))
        ));
        assert_eq!(first_free_identifier(&[100, u32::MAX]).unwrap(), 101);
    }

    #[tokio::test]
    async fn store_holding_the_largest_identifier_fails_to_reserve() {
        let name = format!("{}.conf", u32::MAX);
        let (_dir, allocator) = allocator_with(&[(name.as_str(), "")]);

        assert!(matches!(
            allocator.reserve_identifier().await,
            Err(OrchestratorError::Allocation(_))
        ));
    }

    #[test]
    fn next_display_is_max_plus_one() {
        assert_eq!(next_display(&[3, 9, 4]).unwrap().unwrap(), 10);
        assert!(next_display(&[]).is_none());
        assert!(next_display(&[u16::MAX]).unwrap().is_err());
    }

    #[tokio::test]
    async fn scans_store_for_identifier() {
        let (_dir, allocator) = allocator_with(&[("100.conf", ""), ("101.conf", "")]);
        assert_eq!(allocator.next_free_identifier().await.unwrap(), 102);
    }

    #[tokio::test]
    async fn empty_store_starts_at_first_vmid() {
        let (_dir, allocator) = allocator_with(&[]);
        assert_eq!(allocator.next_free_identifier().await.unwrap(), FIRST_VMID);
    }

    #[tokio::test]
    async fn port_requires_a_vnc_marker() {
        let (_dir, allocator) = allocator_with(&[("100.conf", "cores: 1\n")]);
        assert!(matches!(
            allocator.next_free_port().await,
            Err(OrchestratorError::Allocation(_))
        ));
    }

    #[tokio::test]
    async fn unreadable_store_is_an_allocation_error() {
        let dir = tempfile::tempdir().unwrap();
        let leases = Arc::new(LeaseRegistry::new(
            dir.path().join("leases.json"),
            Duration::minutes(10),
        ));
        let allocator = ResourceAllocator::new(ConfigStore::new(dir.path().join("missing")), leases);

        assert!(matches!(
            allocator.next_free_identifier().await,
            Err(OrchestratorError::Allocation(_))
        ));
        assert!(matches!(
            allocator.next_free_port().await,
            Err(OrchestratorError::Allocation(_))
        ));
    }

    #[tokio::test]
    async fn reservations_are_treated_as_taken() {
        let (_dir, allocator) = allocator_with(&[
            ("100.conf", "args: -vnc 0.0.0.0:1\n"),
            ("101.conf", "args: -vnc 0.0.0.0:2\n"),
        ]);

        let first_id = allocator.reserve_identifier().await.unwrap();
        let second_id = allocator.reserve_identifier().await.unwrap();
        assert_eq!(first_id.value(), 102);
        assert_eq!(second_id.value(), 103);

        let first_port = allocator.reserve_port().await.unwrap();
        let second_port = allocator.reserve_port().await.unwrap();
        assert_eq!(first_port.value(), 3);
        assert_eq!(second_port.value(), 4);
    }

    #[tokio::test]
    async fn released_reservation_is_handed_out_again() {
        let (_dir, allocator) = allocator_with(&[("100.conf", "")]);

        let reserved = allocator.reserve_identifier().await.unwrap();
        assert_eq!(reserved.value(), 101);
        reserved.release().await;

        assert_eq!(allocator.next_free_identifier().await.unwrap(), 101);
    }
}
