//! Pull-mode report collection: mirror every cluster's reports into the management
//! cluster and prune mirrors whose cluster is gone.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use classy_core::{
    mirrored_report_name, ClassifierReport, ClassifierReportSpec, ClusterRef, CLASSIFIER_NAME_LABEL, REPORT_CLUSTER_LABEL,
};
use classy_kubehub::{FleetApi, RemoteApi, ReportSelector};
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct ReportCollector {
    fleet: Arc<dyn FleetApi>,
    remote: Arc<dyn RemoteApi>,
    interval: Duration,
}

/// Management-side copy of `report` collected from `cluster`. Reports without a
/// classifier label cannot be attributed and yield `None`.
pub fn mirror_of(report: &ClassifierReport, cluster: &ClusterRef) -> Option<ClassifierReport> {
    let classifier = report.classifier_label()?;
    let name = mirrored_report_name(classifier, &cluster.name);
    let mut m = ClassifierReport::new(
        &name,
        ClassifierReportSpec {
            cluster_namespace: cluster.namespace.clone(),
            cluster_name: cluster.name.clone(),
            classifier_name: classifier.to_string(),
            matched: report.spec.matched,
        },
    );
    m.metadata.namespace = Some(cluster.namespace.clone());
    m.metadata.labels = Some(BTreeMap::from([
        (CLASSIFIER_NAME_LABEL.to_string(), classifier.to_string()),
        (REPORT_CLUSTER_LABEL.to_string(), cluster.label_value()),
    ]));
    Some(m)
}

fn key_of(r: &ClassifierReport) -> (String, String) {
    (r.metadata.namespace.clone().unwrap_or_default(), r.metadata.name.clone().unwrap_or_default())
}

impl ReportCollector {
    pub fn new(fleet: Arc<dyn FleetApi>, remote: Arc<dyn RemoteApi>, interval: Duration) -> Self {
        Self { fleet, remote, interval }
    }

    /// One collection round. Returns how many mirrors were written.
    pub async fn collect_once(&self) -> Result<usize> {
        let clusters = self.fleet.list_clusters().await?;
        let existing: FxHashMap<(String, String), ClassifierReport> =
            self.fleet.list_reports(&ReportSelector::Mirrored).await?.into_iter().map(|r| (key_of(&r), r)).collect();

        let mut live: FxHashSet<ClusterRef> = FxHashSet::default();
        let mut written = 0;
        for c in clusters.iter() {
            if c.deleting {
                continue;
            }
            live.insert(c.cluster.clone());
            if !c.ready() || c.paused {
                continue;
            }
            let reports = match self.remote.list_reports(&c.cluster).await {
                Ok(r) => r,
                Err(e) => {
                    counter!("report_collect_errors_total", 1u64);
                    warn!(cluster = %c.cluster, error = %e, "collecting reports failed");
                    continue;
                }
            };
            for r in reports.iter() {
                let Some(m) = mirror_of(r, &c.cluster) else {
                    warn!(cluster = %c.cluster, report = ?r.metadata.name, "report without classifier label; skipped");
                    continue;
                };
                let unchanged = existing
                    .get(&key_of(&m))
                    .map(|cur| cur.spec == m.spec && cur.metadata.labels == m.metadata.labels)
                    .unwrap_or(false);
                if unchanged {
                    continue;
                }
                self.fleet.upsert_report(&m).await?;
                counter!("reports_mirrored_total", 1u64);
                written += 1;
            }
        }

        for (key, r) in existing.iter() {
            let cluster = r.cluster_ref();
            if !live.iter().any(|l| l.same_cluster(&cluster)) {
                debug!(report = %key.1, cluster = %cluster, "pruning report of vanished cluster");
                self.fleet.delete_report(&key.0, &key.1).await?;
            }
        }
        Ok(written)
    }

    /// Collect on a fixed interval until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "report collector started");
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.collect_once().await {
                        Ok(n) if n > 0 => debug!(mirrored = n, "reports collected"),
                        Ok(_) => {}
                        Err(e) => {
                            counter!("report_collect_errors_total", 1u64);
                            warn!(error = %e, "report collection failed");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("report collector stopped");
    }
}
