//! Watch events to reconcile requests. Only index lookups happen here, never I/O.

use std::sync::Arc;

use classy_kubehub::FleetEvent;
use classy_store::ConsistencyIndex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::queue::WorkQueue;

/// Classifiers to reconcile for `event`, sorted and without duplicates.
pub fn requests_for(index: &ConsistencyIndex, event: &FleetEvent) -> Vec<String> {
    let mut out = match event {
        // Any classifier change may free a label another classifier is waiting for.
        FleetEvent::Classifier { name } => {
            let mut v = index.conflicted_classifiers();
            v.push(name.clone());
            v
        }
        FleetEvent::Report { classifier } => vec![classifier.clone()],
        FleetEvent::Cluster { cluster } | FleetEvent::Credential { cluster } => {
            let targeting = index.classifiers_for_cluster(cluster);
            if targeting.is_empty() {
                // Not targeted yet: every classifier targets every cluster.
                index.known_classifiers()
            } else {
                targeting
            }
        }
    };
    out.sort();
    out.dedup();
    out
}

/// Feed the queue from watch events until the event channel closes.
pub async fn run_event_mapper(mut rx: mpsc::Receiver<FleetEvent>, index: Arc<ConsistencyIndex>, queue: WorkQueue) {
    while let Some(event) = rx.recv().await {
        let names = requests_for(&index, &event);
        trace!(?event, requests = names.len(), "event mapped");
        for name in names.iter() {
            queue.add(name);
        }
    }
    debug!("event channel closed");
}
