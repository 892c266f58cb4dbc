//! Bidirectional classifier <-> cluster membership cache.
//!
//! Event handlers use it to find which classifiers to reconcile when a cluster
//! changes without doing any I/O.

use std::sync::Mutex;

use classy_core::ClusterRef;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::lock;

#[derive(Default)]
struct IndexState {
    /// classifier -> clusters it currently targets
    clusters_by_classifier: FxHashMap<String, FxHashSet<ClusterRef>>,
    /// cluster -> classifiers currently targeting it
    classifiers_by_cluster: FxHashMap<ClusterRef, FxHashSet<String>>,
    /// classifiers with at least one unmanaged label
    conflicted: FxHashSet<String>,
    /// every live classifier seen by a reconciliation pass
    known: FxHashSet<String>,
}

impl IndexState {
    fn unlink(&mut self, cluster: &ClusterRef, classifier: &str) {
        if let Some(set) = self.classifiers_by_cluster.get_mut(cluster) {
            set.remove(classifier);
            if set.is_empty() {
                self.classifiers_by_cluster.remove(cluster);
            }
        }
    }
}

/// All mutation goes through whole-classifier operations so the forward and
/// reverse maps are never observed out of step.
#[derive(Default)]
pub struct ConsistencyIndex {
    state: Mutex<IndexState>,
}

impl ConsistencyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cluster set of `classifier` and fix up the reverse map.
    pub fn update_for_classifier<I>(&self, classifier: &str, clusters: I)
    where
        I: IntoIterator<Item = ClusterRef>,
    {
        let current: FxHashSet<ClusterRef> = clusters.into_iter().collect();
        let mut st = lock(&self.state);
        let previous = st.clusters_by_classifier.remove(classifier).unwrap_or_default();
        for gone in previous.difference(&current) {
            st.unlink(gone, classifier);
        }
        for c in current.iter() {
            st.classifiers_by_cluster.entry(c.clone()).or_default().insert(classifier.to_string());
        }
        debug!(classifier, clusters = current.len(), dropped = previous.difference(&current).count(), "index updated");
        st.clusters_by_classifier.insert(classifier.to_string(), current);
        st.known.insert(classifier.to_string());
    }

    /// Drop every trace of `classifier`.
    pub fn remove_classifier(&self, classifier: &str) {
        let mut st = lock(&self.state);
        if let Some(previous) = st.clusters_by_classifier.remove(classifier) {
            for c in previous.iter() {
                st.unlink(c, classifier);
            }
        }
        st.conflicted.remove(classifier);
        st.known.remove(classifier);
    }

    /// Stop offering `classifier` to other events (deletion started) while keeping
    /// its cluster membership until cleanup finishes.
    pub fn retire(&self, classifier: &str) {
        let mut st = lock(&self.state);
        st.conflicted.remove(classifier);
        st.known.remove(classifier);
    }

    pub fn set_conflicted(&self, classifier: &str, conflicted: bool) {
        let mut st = lock(&self.state);
        if conflicted {
            st.conflicted.insert(classifier.to_string());
        } else {
            st.conflicted.remove(classifier);
        }
        st.known.insert(classifier.to_string());
    }

    /// Classifiers targeting `cluster`, sorted.
    pub fn classifiers_for_cluster(&self, cluster: &ClusterRef) -> Vec<String> {
        let st = lock(&self.state);
        sorted(st.classifiers_by_cluster.get(cluster).into_iter().flatten().cloned())
    }

    /// Clusters targeted by `classifier`, sorted.
    pub fn clusters_for_classifier(&self, classifier: &str) -> Vec<ClusterRef> {
        let st = lock(&self.state);
        sorted(st.clusters_by_classifier.get(classifier).into_iter().flatten().cloned())
    }

    pub fn conflicted_classifiers(&self) -> Vec<String> {
        let st = lock(&self.state);
        sorted(st.conflicted.iter().cloned())
    }

    pub fn known_classifiers(&self) -> Vec<String> {
        let st = lock(&self.state);
        sorted(st.known.iter().cloned())
    }

    /// `classifier ∈ reverse[c] ⇔ c ∈ forward[classifier]` for every pair.
    pub fn is_consistent(&self) -> bool {
        let st = lock(&self.state);
        let forward_ok = st.clusters_by_classifier.iter().all(|(p, clusters)| {
            clusters.iter().all(|c| st.classifiers_by_cluster.get(c).map(|s| s.contains(p)).unwrap_or(false))
        });
        let reverse_ok = st.classifiers_by_cluster.iter().all(|(c, classifiers)| {
            classifiers.iter().all(|p| st.clusters_by_classifier.get(p).map(|s| s.contains(c)).unwrap_or(false))
        });
        forward_ok && reverse_ok
    }
}

fn sorted<T: Ord>(it: impl Iterator<Item = T>) -> Vec<T> {
    let mut v: Vec<T> = it.collect();
    v.sort();
    v
}
