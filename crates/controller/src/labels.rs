//! Match state and label ownership for one classifier.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use classy_core::{Classifier, ClusterRef, MatchingClusterStatus, UnmanagedLabel};
use classy_kubehub::ReportSelector;
use tracing::{debug, info};

use crate::Reconciler;

impl Reconciler {
    /// Rebuild the matching-cluster statuses from the classifier's reports, moving label
    /// claims through the arbiter on the way.
    pub(crate) async fn refresh_matches(&self, classifier: &Classifier, name: &str) -> Result<Vec<MatchingClusterStatus>> {
        let reports = self.fleet.list_reports(&ReportSelector::Classifier(name.to_string())).await?;
        let matching: BTreeSet<ClusterRef> = reports.iter().filter(|r| r.spec.matched).map(|r| r.cluster_ref()).collect();

        // Claims held in the arbiter count too: a pass that failed before its status
        // was written still left registrations behind.
        let mut previous: BTreeSet<ClusterRef> = self.keys.registered_clusters(name).into_iter().collect();
        if let Some(status) = classifier.status.as_ref() {
            previous.extend(status.matching_cluster_statuses.iter().map(|m| m.cluster_ref.clone()));
        }
        for old in previous.iter() {
            if !matching.iter().any(|c| c.same_cluster(old)) {
                debug!(classifier = name, cluster = %old, "cluster no longer matches");
                self.keys.remove_all_registrations(name, old);
            }
        }

        let mut out = Vec::with_capacity(matching.len());
        for cluster in matching {
            // Stale claims go first so a dropped key is free before anyone registers.
            self.keys.remove_stale_registrations(classifier, &cluster);
            self.keys.register_for_labels(classifier, &cluster);
            let mut managed = Vec::new();
            let mut unmanaged = Vec::new();
            for label in classifier.spec.classifier_labels.iter() {
                if self.keys.can_manage(name, &cluster, &label.key) {
                    managed.push(label.key.clone());
                    continue;
                }
                let reason = match self.keys.current_owner(&cluster, &label.key) {
                    Ok(owner) => format!("classifier {} currently manages this", owner),
                    Err(e) => e.to_string(),
                };
                unmanaged.push(UnmanagedLabel { key: label.key.clone(), failure_message: Some(reason) });
            }
            if !unmanaged.is_empty() {
                info!(classifier = name, cluster = %cluster, conflicts = unmanaged.len(), "label conflict");
            }
            out.push(MatchingClusterStatus { cluster_ref: cluster, managed_labels: managed, unmanaged_labels: unmanaged });
        }
        Ok(out)
    }

    /// Merge owned labels onto each matching cluster. Missing or deleting clusters are skipped.
    pub(crate) async fn apply_owned_labels(&self, classifier: &Classifier, matches: &[MatchingClusterStatus]) -> Result<()> {
        for m in matches.iter() {
            let wanted: BTreeMap<String, String> = classifier
                .spec
                .classifier_labels
                .iter()
                .filter(|l| m.managed_labels.contains(&l.key))
                .map(|l| (l.key.clone(), l.value.clone()))
                .collect();
            if wanted.is_empty() {
                continue;
            }
            let Some(cluster) = self.fleet.get_cluster(&m.cluster_ref).await? else { continue };
            if cluster.deleting {
                continue;
            }
            if wanted.iter().all(|(k, v)| cluster.labels.get(k) == Some(v)) {
                continue;
            }
            self.fleet.merge_cluster_labels(&m.cluster_ref, &wanted).await?;
        }
        Ok(())
    }
}
