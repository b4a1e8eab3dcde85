use crate::error::Result;
use crate::orchestrator::VmOrchestrator;
use chrono::Utc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub expired: usize,
    pub reclaimed: usize,
    pub failed: usize,
}

/// Background loop reclaiming VMs whose expiry has passed.
pub struct ExpiryReaper {
    orchestrator: VmOrchestrator,
    interval: Duration,
}

impl ExpiryReaper {
    pub fn new(orchestrator: VmOrchestrator, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
        }
    }

    /// Runs until `shutdown` flips to true or its sender is dropped. A cycle in
    /// progress always finishes first.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Expiry reaper started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            match self.run_cycle().await {
                Ok(report) if report.expired > 0 => info!(
                    expired = report.expired,
                    reclaimed = report.reclaimed,
                    failed = report.failed,
                    "Reaper cycle finished"
                ),
                Ok(_) => debug!("No expired VMs"),
                Err(e) => error!(error = %e, "Reaper cycle failed"),
            }

            if *shutdown.borrow() {
                break;
            }
        }

        info!("Expiry reaper stopped");
    }

    /// One pass over every expired record.
    pub async fn run_cycle(&self) -> Result<ReapReport> {
        let expired = self.orchestrator.ledger().list_expired(Utc::now()).await?;
        let mut report = ReapReport {
            expired: expired.len(),
            ..ReapReport::default()
        };

        for record in &expired {
            match self.orchestrator.reclaim(record).await {
                Ok(()) => {
                    info!(vmid = record.vmid, name = %record.name, owner = %record.owner, "Reclaimed expired VM");
                    report.reclaimed += 1;
                }
                Err(e) => {
                    warn!(vmid = record.vmid, name = %record.name, error = %e, "Failed to reclaim expired VM");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}
