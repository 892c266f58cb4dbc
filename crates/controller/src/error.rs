use classy_deployer::DeployerError;
use thiserror::Error;

/// Conditions that stop a (classifier, cluster) pair from moving forward on this pass.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("cleanup request is in progress; deploy must wait")]
    CleanupInProgress,
    #[error("deploy request is in progress; wait before redeploying")]
    DeployInProgress,
    #[error("deploy request is still provisioning")]
    StillProvisioning,
    #[error("cleanup request is still removing")]
    StillRemoving,
    #[error("cleanup request is queued")]
    CleanupQueued,
    #[error("cluster is paused")]
    ClusterPaused,
    #[error(transparent)]
    Dispatch(#[from] DeployerError),
}

impl DeployError {
    /// Recoverable conditions clear on their own; the pass is simply retried later.
    pub fn is_recoverable(&self) -> bool {
        match self {
            DeployError::Dispatch(DeployerError::Closed) => false,
            _ => true,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Deploy(#[from] DeployError),
    #[error(transparent)]
    Api(#[from] anyhow::Error),
}

impl ReconcileError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            ReconcileError::Deploy(e) => e.is_recoverable(),
            ReconcileError::Api(_) => true,
        }
    }
}
