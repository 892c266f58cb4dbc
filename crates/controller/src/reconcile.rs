//! Fan-out over target clusters for one classifier, plus deletion and warm start.

use std::collections::BTreeSet;
use std::time::Instant;

use anyhow::Result;
use classy_core::{
    Classifier, ClassifierStatus, ClusterInfo, ClusterRef, FeatureStatus, ManagedCluster, CLASSIFIER_FINALIZER,
    FEATURE_CLASSIFIER, PAUSED_ANNOTATION,
};
use classy_kubehub::{FleetApi, ReportSelector};
use classy_store::{ConsistencyIndex, KeyManager};
use metrics::{counter, gauge, histogram};
use tracing::{debug, info, warn};

use crate::error::{DeployError, ReconcileError};
use crate::{Action, Reconciler};

fn is_paused(classifier: &Classifier) -> bool {
    classifier.metadata.annotations.as_ref().map(|a| a.contains_key(PAUSED_ANNOTATION)).unwrap_or(false)
}

fn publish_conflicts(name: &str, conflicts: usize) {
    gauge!("label_conflicts", conflicts as f64, "classifier" => name.to_string());
}

fn finalizers(classifier: &Classifier) -> Vec<String> {
    classifier.metadata.finalizers.clone().unwrap_or_default()
}

impl Reconciler {
    /// Run one full pass for the classifier called `name`.
    pub async fn reconcile(&self, name: &str) -> Result<Action, ReconcileError> {
        let started = Instant::now();
        counter!("reconcile_total", 1u64);
        let res = self.reconcile_inner(name).await;
        histogram!("reconcile_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
        if let Err(e) = &res {
            counter!("reconcile_errors_total", 1u64);
            warn!(classifier = name, error = %e, "reconcile failed");
        }
        res
    }

    async fn reconcile_inner(&self, name: &str) -> Result<Action, ReconcileError> {
        let Some(classifier) = self.fleet.get_classifier(name).await? else {
            debug!(classifier = name, "classifier gone");
            self.index.remove_classifier(name);
            publish_conflicts(name, 0);
            return Ok(Action::Done);
        };
        if classifier.metadata.deletion_timestamp.is_some() {
            self.reconcile_delete(&classifier, name).await
        } else {
            self.reconcile_normal(&classifier, name).await
        }
    }

    async fn reconcile_normal(&self, classifier: &Classifier, name: &str) -> Result<Action, ReconcileError> {
        let mut fins = finalizers(classifier);
        if !fins.iter().any(|f| f == CLASSIFIER_FINALIZER) {
            fins.push(CLASSIFIER_FINALIZER.to_string());
            self.fleet.set_classifier_finalizers(name, &fins).await?;
        }

        let matches = self.refresh_matches(classifier, name).await?;
        let conflicts: usize = matches.iter().map(|m| m.unmanaged_labels.len()).sum();
        self.index.set_conflicted(name, conflicts > 0);
        publish_conflicts(name, conflicts);

        let previous = classifier.status.clone().unwrap_or_default();
        let staged: Result<Vec<ManagedCluster>> = async {
            self.apply_owned_labels(classifier, &matches).await?;
            self.fleet.list_clusters().await
        }
        .await;
        let fleet = match staged {
            Ok(fleet) => fleet,
            Err(e) => {
                // The arbiter already holds this pass's claims; persist the match state
                // that goes with them before giving up.
                let status = ClassifierStatus {
                    cluster_info: previous.cluster_info,
                    matching_cluster_statuses: matches,
                    failure_message: Some(format!("{:#}", e)),
                };
                self.write_status(classifier, name, status).await?;
                return Err(e.into());
            }
        };

        let mut targets = Vec::with_capacity(previous.cluster_info.len());
        for t in previous.cluster_info.iter() {
            if fleet.iter().any(|c| c.cluster.same_cluster(&t.cluster)) {
                targets.push(t.clone());
            } else {
                debug!(classifier = name, cluster = %t.cluster, "cluster gone; entry dropped");
                self.deployer.cleanup_entries(&t.cluster, name, FEATURE_CLASSIFIER);
            }
        }
        for c in fleet {
            if c.deleting || previous.cluster_info_for(&c.cluster).is_some() {
                continue;
            }
            debug!(classifier = name, cluster = %c.cluster, "new target cluster");
            targets.push(ClusterInfo::new(c.cluster));
        }

        let paused = is_paused(classifier);
        let mut entries = Vec::with_capacity(targets.len());
        for t in targets.iter() {
            let next = match self.deploy_to_cluster(classifier, name, t, paused).await {
                Ok(next) => next,
                Err(e) => {
                    debug!(classifier = name, cluster = %t.cluster, reason = %e, "cluster not advanced");
                    ClusterInfo { failure_message: Some(e.to_string()), ..t.clone() }
                }
            };
            entries.push(next);
        }

        self.index.update_for_classifier(name, entries.iter().map(|e| e.cluster.clone()));
        let converged = entries.iter().all(ClusterInfo::is_provisioned);
        let status = ClassifierStatus { cluster_info: entries, matching_cluster_statuses: matches, failure_message: None };
        self.write_status(classifier, name, status).await?;

        if converged {
            Ok(Action::Done)
        } else {
            debug!(classifier = name, reason = %DeployError::StillProvisioning, "requeue");
            Ok(Action::RequeueAfter(self.settings.requeue))
        }
    }

    async fn reconcile_delete(&self, classifier: &Classifier, name: &str) -> Result<Action, ReconcileError> {
        let status = classifier.status.clone().unwrap_or_default();
        let mut claimed: BTreeSet<ClusterRef> = self.keys.registered_clusters(name).into_iter().collect();
        claimed.extend(status.matching_cluster_statuses.iter().map(|m| m.cluster_ref.clone()));
        for cluster in claimed.iter() {
            self.keys.remove_all_registrations(name, cluster);
        }
        let indexed = self.index.clusters_for_classifier(name);
        self.index.retire(name);
        publish_conflicts(name, 0);

        let paused = is_paused(classifier);
        let mut remaining = Vec::new();
        for info in status.cluster_info.iter() {
            match self.undeploy_from_cluster(name, info, paused).await {
                Ok(None) => {}
                Ok(Some(next)) => remaining.push(next),
                Err(e) => remaining.push(ClusterInfo {
                    status: Some(FeatureStatus::Removing),
                    failure_message: Some(e.to_string()),
                    ..info.clone()
                }),
            }
        }

        if !remaining.is_empty() {
            debug!(classifier = name, clusters = remaining.len(), reason = %DeployError::StillRemoving, "requeue");
            let next = ClassifierStatus { cluster_info: remaining, ..Default::default() };
            self.write_status(classifier, name, next).await?;
            return Ok(Action::RequeueAfter(self.settings.requeue));
        }

        self.fleet.delete_reports(&ReportSelector::Classifier(name.to_string())).await?;
        if self.settings.mode.is_push() && self.index.known_classifiers().is_empty() {
            self.fleet.delete_access_requests().await?;
        }
        let mut touched: BTreeSet<ClusterRef> = indexed.into_iter().collect();
        touched.extend(status.cluster_info.iter().map(|i| i.cluster.clone()));
        for cluster in touched.iter() {
            self.deployer.cleanup_entries(cluster, name, FEATURE_CLASSIFIER);
        }
        let fins = finalizers(classifier);
        if fins.iter().any(|f| f == CLASSIFIER_FINALIZER) {
            let kept: Vec<String> = fins.into_iter().filter(|f| f != CLASSIFIER_FINALIZER).collect();
            self.fleet.set_classifier_finalizers(name, &kept).await?;
        }
        self.index.remove_classifier(name);
        info!(classifier = name, "classifier finalized");
        Ok(Action::Done)
    }

    async fn write_status(&self, classifier: &Classifier, name: &str, status: ClassifierStatus) -> Result<()> {
        if classifier.status.as_ref() == Some(&status) {
            return Ok(());
        }
        self.fleet.update_classifier_status(name, &status).await
    }
}

/// Rebuild the label arbiter and the consistency index from persisted classifier status.
/// Classifiers already being deleted are skipped. Returns how many classifiers were loaded.
pub async fn warm_start(fleet: &dyn FleetApi, keys: &KeyManager, index: &ConsistencyIndex) -> Result<usize> {
    let classifiers: Vec<Classifier> =
        fleet.list_classifiers().await?.into_iter().filter(|c| c.metadata.deletion_timestamp.is_none()).collect();
    keys.rebuild(&classifiers);
    for c in classifiers.iter() {
        let Some(name) = c.metadata.name.as_deref() else { continue };
        let status = c.status.clone().unwrap_or_default();
        index.update_for_classifier(name, status.cluster_info.iter().map(|i| i.cluster.clone()));
        let conflicted = status.matching_cluster_statuses.iter().any(|m| !m.unmanaged_labels.is_empty());
        index.set_conflicted(name, conflicted);
    }
    info!(classifiers = classifiers.len(), "warm start complete");
    Ok(classifiers.len())
}
