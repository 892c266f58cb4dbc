//! Per-(classifier, cluster) deploy/undeploy state machine and the handler the deployer runs.
//!
//! Every decision here is made from three inputs: the fingerprint recorded in the
//! classifier's status, the deployer's view of the pair, and the cluster's liveness.
//! Nothing blocks on the deployer; a dispatched request is observed on a later pass.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use classy_core::{
    Classifier, ClassifierSpec, ClusterInfo, ClusterRef, ControlPlaneEndpoint, FeatureStatus, Fingerprint, FEATURE_CLASSIFIER,
};
use classy_deployer::{Options, Request, RequestHandler, RequestKey, ResultStatus};
use classy_kubehub::{FleetApi, RemoteApi};
use metrics::counter;
use tracing::{debug, info};

use crate::error::{DeployError, ReconcileError};
use crate::{ReportMode, Reconciler};

/// Handler option carrying the management endpoint agents push reports to. Present
/// only in agent-push mode.
pub const CONTROL_PLANE_ENDPOINT_OPTION: &str = "controlPlaneEndpoint";

/// Executes classifier deploy and undeploy requests against a managed cluster.
pub struct ClassifierHandler {
    fleet: Arc<dyn FleetApi>,
    remote: Arc<dyn RemoteApi>,
}

impl ClassifierHandler {
    pub fn new(fleet: Arc<dyn FleetApi>, remote: Arc<dyn RemoteApi>) -> Self {
        Self { fleet, remote }
    }

    async fn deploy(&self, key: &RequestKey, options: &Options) -> Result<()> {
        let classifier = self
            .fleet
            .get_classifier(&key.applicant)
            .await?
            .ok_or_else(|| anyhow!("classifier {} not found", key.applicant))?;
        if classifier.metadata.deletion_timestamp.is_some() {
            bail!("classifier {} is being deleted", key.applicant);
        }
        let cluster = self.fleet.get_cluster(&key.cluster).await?.ok_or_else(|| anyhow!("cluster {} not found", key.cluster))?;
        if cluster.deleting {
            bail!("cluster {} is being deleted", key.cluster);
        }
        if let Some(raw) = options.get(CONTROL_PLANE_ENDPOINT_OPTION) {
            let endpoint = ControlPlaneEndpoint::parse(raw).context("control plane endpoint option")?;
            self.fleet.ensure_access_request(&key.cluster, &endpoint).await?;
            let kubeconfig = self
                .fleet
                .access_request_kubeconfig(&key.cluster)
                .await?
                .ok_or_else(|| anyhow!("access request kubeconfig not present yet"))?;
            self.remote.write_agent_kubeconfig(&key.cluster, &kubeconfig).await?;
        }
        self.remote.apply_classifier(&key.cluster, &classifier).await
    }

    async fn undeploy(&self, key: &RequestKey) -> Result<()> {
        match self.fleet.get_cluster(&key.cluster).await? {
            Some(c) if !c.deleting => self.remote.delete_classifier(&key.cluster, &key.applicant).await,
            _ => {
                debug!(cluster = %key.cluster, "cluster gone; nothing to clean up");
                Ok(())
            }
        }
    }
}

#[async_trait::async_trait]
impl RequestHandler for ClassifierHandler {
    async fn handle(&self, request: &Request) -> Result<()> {
        if request.key.undeploy {
            self.undeploy(&request.key).await
        } else {
            self.deploy(&request.key, &request.options).await
        }
    }
}

fn entry(cluster: &ClusterRef, hash: Option<Fingerprint>, status: FeatureStatus, message: Option<String>) -> ClusterInfo {
    ClusterInfo { cluster: cluster.clone(), hash, status: Some(status), failure_message: message }
}

impl Reconciler {
    /// Fingerprint of what would be deployed to `cluster` now. In push mode the agent
    /// credential and endpoint are folded in, so a rotated credential redeploys.
    pub(crate) async fn fingerprint(&self, spec: &ClassifierSpec, cluster: &ClusterRef) -> Result<Fingerprint> {
        match &self.settings.mode {
            ReportMode::CollectFromManagement => Ok(Fingerprint::of_spec(spec)),
            ReportMode::AgentPush { endpoint } => {
                let kubeconfig = self.fleet.access_request_kubeconfig(cluster).await?;
                let endpoint = endpoint.to_string();
                Ok(Fingerprint::compute(spec, kubeconfig.as_deref(), Some(&endpoint)))
            }
        }
    }

    fn dispatch(&self, key: RequestKey) -> Result<(), DeployError> {
        let undeploy = key.undeploy;
        let handler: Arc<dyn RequestHandler> = self.handler.clone();
        let options = match &self.settings.mode {
            ReportMode::AgentPush { endpoint } if !undeploy => {
                Options::default().with(CONTROL_PLANE_ENDPOINT_OPTION, endpoint.to_string())
            }
            _ => Options::default(),
        };
        self.deployer.deploy(key, handler, self.settings.deploy_timeout, options)?;
        if undeploy {
            counter!("undeploy_dispatch_total", 1u64);
        } else {
            counter!("deploy_dispatch_total", 1u64);
        }
        Ok(())
    }

    /// One pass of the deploy side for `previous.cluster`. Errors leave the previous
    /// entry in place; the caller records the message.
    pub(crate) async fn deploy_to_cluster(
        &self,
        classifier: &Classifier,
        name: &str,
        previous: &ClusterInfo,
        classifier_paused: bool,
    ) -> Result<ClusterInfo, ReconcileError> {
        let cluster_ref = &previous.cluster;
        let Some(cluster) = self.fleet.get_cluster(cluster_ref).await? else {
            return Ok(previous.clone());
        };
        if classifier_paused || cluster.paused {
            return Err(DeployError::ClusterPaused.into());
        }
        if !cluster.ready() {
            debug!(classifier = name, cluster = %cluster_ref, "cluster not ready; skipping");
            return Ok(previous.clone());
        }
        let hash = self.fingerprint(&classifier.spec, cluster_ref).await?;

        let key = RequestKey::deploy(cluster_ref, name, FEATURE_CLASSIFIER);
        if self.deployer.is_in_progress(&key.opposite()) {
            return Err(DeployError::CleanupInProgress.into());
        }

        if previous.hash == Some(hash) {
            let result = self.deployer.get_result(&key);
            match result.status {
                ResultStatus::Deployed => return Ok(entry(cluster_ref, Some(hash), FeatureStatus::Provisioned, None)),
                ResultStatus::InProgress => return Ok(entry(cluster_ref, Some(hash), FeatureStatus::Provisioning, None)),
                ResultStatus::Failed => {
                    let message = result.error.unwrap_or_else(|| "deploy failed".to_string());
                    info!(classifier = name, cluster = %cluster_ref, error = %message, "deploy failed; retrying");
                    let message = match self.dispatch(key) {
                        Ok(()) => message,
                        Err(e) => format!("{}; {}", message, e),
                    };
                    return Ok(entry(cluster_ref, Some(hash), FeatureStatus::Failed, Some(message)));
                }
                ResultStatus::Unavailable if previous.is_provisioned() => {
                    return Ok(entry(cluster_ref, Some(hash), FeatureStatus::Provisioned, None));
                }
                ResultStatus::Unavailable | ResultStatus::Removed => {}
            }
        } else if self.deployer.is_in_progress(&key) {
            // A deploy with an older fingerprint is still running.
            return Err(DeployError::DeployInProgress.into());
        }

        self.dispatch(key)?;
        debug!(classifier = name, cluster = %cluster_ref, hash = %hash, "deploy dispatched");
        Ok(entry(cluster_ref, Some(hash), FeatureStatus::Provisioning, None))
    }

    /// One pass of the undeploy side. `Ok(None)` means the pair is gone and its entry
    /// must be dropped.
    pub(crate) async fn undeploy_from_cluster(
        &self,
        name: &str,
        previous: &ClusterInfo,
        classifier_paused: bool,
    ) -> Result<Option<ClusterInfo>, ReconcileError> {
        let cluster_ref = &previous.cluster;
        match self.fleet.get_cluster(cluster_ref).await? {
            None => return Ok(None),
            Some(c) if c.deleting => return Ok(None),
            Some(c) if c.paused || classifier_paused => return Err(DeployError::ClusterPaused.into()),
            Some(_) => {}
        }

        let key = RequestKey::undeploy(cluster_ref, name, FEATURE_CLASSIFIER);
        if self.deployer.is_in_progress(&key.opposite()) {
            return Err(DeployError::DeployInProgress.into());
        }
        let result = self.deployer.get_result(&key);
        match result.status {
            ResultStatus::Removed => {
                debug!(classifier = name, cluster = %cluster_ref, "cleanup confirmed");
                Ok(None)
            }
            ResultStatus::InProgress => Ok(Some(entry(cluster_ref, previous.hash, FeatureStatus::Removing, None))),
            status => {
                let failed = (status == ResultStatus::Failed).then_some(result.error).flatten();
                self.dispatch(key)?;
                let message = failed.unwrap_or_else(|| DeployError::CleanupQueued.to_string());
                Ok(Some(entry(cluster_ref, previous.hash, FeatureStatus::Removing, Some(message))))
            }
        }
    }
}
