//! Classy deployer: fire-and-forget deploy/undeploy requests.
//!
//! Callers dispatch a request and return immediately; convergence is observed on a
//! later pass through [`Deployer::get_result`]. Handlers run on the deployer's own
//! workers, never on the caller.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use classy_core::ClusterRef;
use thiserror::Error;

pub mod local;

pub use local::LocalDeployer;

/// Identity of a request: one per (cluster, applicant, feature, direction).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey {
    pub cluster: ClusterRef,
    /// Name of the object asking for the work (the classifier).
    pub applicant: String,
    pub feature_id: String,
    pub undeploy: bool,
}

impl RequestKey {
    pub fn deploy(cluster: &ClusterRef, applicant: &str, feature_id: &str) -> Self {
        Self { cluster: cluster.clone(), applicant: applicant.to_string(), feature_id: feature_id.to_string(), undeploy: false }
    }

    pub fn undeploy(cluster: &ClusterRef, applicant: &str, feature_id: &str) -> Self {
        Self { undeploy: true, ..Self::deploy(cluster, applicant, feature_id) }
    }

    /// Same pair, other direction.
    pub fn opposite(&self) -> Self {
        Self { undeploy: !self.undeploy, ..self.clone() }
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = if self.undeploy { "undeploy" } else { "deploy" };
        write!(f, "{}:{}:{}:{}", dir, self.cluster, self.applicant, self.feature_id)
    }
}

/// Free-form options handed to the handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
    pub handler_options: BTreeMap<String, String>,
}

impl Options {
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.handler_options.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.handler_options.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub key: RequestKey,
    pub options: Options,
}

/// Work executed by the deployer for one request.
#[async_trait::async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: &Request) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    Deployed,
    Failed,
    InProgress,
    Removed,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployResult {
    pub status: ResultStatus,
    pub error: Option<String>,
}

impl DeployResult {
    pub fn of(status: ResultStatus) -> Self {
        Self { status, error: None }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeployerError {
    #[error("deployer queue is full; retry later")]
    QueueFull,
    #[error("deployer is shut down")]
    Closed,
}

/// Asynchronous work queue contract.
pub trait Deployer: Send + Sync {
    /// Queue `key` for execution by `handler`. Returns as soon as the request is queued.
    /// Dispatching a key that is already running marks it to run again afterwards.
    fn deploy(
        &self,
        key: RequestKey,
        handler: Arc<dyn RequestHandler>,
        timeout: Duration,
        options: Options,
    ) -> Result<(), DeployerError>;

    /// True while `key` is queued, running, or waiting to run again.
    fn is_in_progress(&self, key: &RequestKey) -> bool;

    fn get_result(&self, key: &RequestKey) -> DeployResult;

    /// Forget queued work and results of both directions for the pair.
    fn cleanup_entries(&self, cluster: &ClusterRef, applicant: &str, feature_id: &str);
}
