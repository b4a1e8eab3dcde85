use crate::directory::DirectoryError;
use crate::hypervisor::HypervisorError;
use crate::lease::LeaseError;
use crate::orchestrator::CreateStage;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Invalid VM specification: {0}")]
    Validation(String),

    #[error("Allocation failed: {0}")]
    Allocation(String),

    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error("VM {vmid} is running and must be stopped before it can be deleted")]
    RunningConflict { vmid: u32 },

    #[error("VM not found: {0}")]
    NotFound(String),

    #[error("VM creation failed while {stage}: {source}")]
    Provision {
        stage: CreateStage,
        #[source]
        source: Box<OrchestratorError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    /// True for failures caused by the caller's input rather than a backend.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Validation(_)
                | OrchestratorError::NotFound(_)
                | OrchestratorError::RunningConflict { .. }
        )
    }
}
