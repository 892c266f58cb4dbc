//! Classy controller: drives classifiers to convergence across the fleet.
//!
//! One [`Reconciler`] pass for a classifier registers label claims, applies owned labels,
//! runs the per-cluster deploy state machine for every target cluster, refreshes the
//! consistency index and writes status back. Deploy work itself runs on the deployer.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use classy_core::ControlPlaneEndpoint;
use classy_deployer::Deployer;
use classy_kubehub::{FleetApi, RemoteApi};
use classy_store::{ConsistencyIndex, LabelArbiter};

pub mod deploy;
pub mod error;
pub mod events;
mod labels;
pub mod queue;
pub mod reconcile;
pub mod reports;

pub use deploy::{ClassifierHandler, CONTROL_PLANE_ENDPOINT_OPTION};
pub use error::{DeployError, ReconcileError};
pub use events::{requests_for, run_event_mapper};
pub use queue::{spawn_workers, WorkQueue};
pub use reconcile::warm_start;
pub use reports::ReportCollector;

/// How match reports reach the management cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportMode {
    /// The controller pulls reports from every cluster and mirrors them.
    CollectFromManagement,
    /// The agent pushes reports itself using a credential bootstrapped through an access request.
    AgentPush { endpoint: ControlPlaneEndpoint },
}

impl ReportMode {
    pub fn is_push(&self) -> bool {
        matches!(self, ReportMode::AgentPush { .. })
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub mode: ReportMode,
    /// Retry interval for classifiers that have not converged.
    pub requeue: Duration,
    /// Upper bound for one deploy/undeploy request on the deployer.
    pub deploy_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mode: ReportMode::CollectFromManagement,
            requeue: Duration::from_secs(20),
            deploy_timeout: Duration::from_secs(300),
        }
    }
}

/// What the worker should do with a classifier after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Done,
    RequeueAfter(Duration),
}

pub struct Reconciler {
    pub(crate) fleet: Arc<dyn FleetApi>,
    pub(crate) deployer: Arc<dyn Deployer>,
    pub(crate) keys: Arc<dyn LabelArbiter>,
    pub(crate) index: Arc<ConsistencyIndex>,
    pub(crate) handler: Arc<ClassifierHandler>,
    pub(crate) settings: Settings,
}

impl Reconciler {
    pub fn new(
        fleet: Arc<dyn FleetApi>,
        remote: Arc<dyn RemoteApi>,
        deployer: Arc<dyn Deployer>,
        keys: Arc<dyn LabelArbiter>,
        index: Arc<ConsistencyIndex>,
        settings: Settings,
    ) -> Self {
        let handler = Arc::new(ClassifierHandler::new(Arc::clone(&fleet), remote));
        Self { fleet, deployer, keys, index, handler, settings }
    }

    pub fn index(&self) -> &Arc<ConsistencyIndex> {
        &self.index
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}
