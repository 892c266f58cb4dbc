//! Label key ownership.
//!
//! For every (cluster, label key) pair classifiers queue up in registration order;
//! the head of the queue owns the key. Ownership only moves on explicit
//! registration or release.

use std::sync::Mutex;

use classy_core::{Classifier, ClusterRef, MatchingClusterStatus};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, info};

use crate::lock;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("no classifier manages label {key} on cluster {cluster}")]
    NoOwner { cluster: String, key: String },
}

/// Decides which classifier may set a label on a cluster.
pub trait LabelArbiter: Send + Sync {
    /// True when `classifier` currently owns `key` on `cluster`.
    fn can_manage(&self, classifier: &str, cluster: &ClusterRef, key: &str) -> bool;

    /// Queue `classifier` for every label key its spec asks for, where not already queued.
    fn register_for_labels(&self, classifier: &Classifier, cluster: &ClusterRef);

    /// Release keys `classifier` is queued for on `cluster` but no longer asks for.
    fn remove_stale_registrations(&self, classifier: &Classifier, cluster: &ClusterRef);

    /// Release every key `classifier` is queued for on `cluster`.
    fn remove_all_registrations(&self, classifier: &str, cluster: &ClusterRef);

    /// Current owner of `key` on `cluster`.
    fn current_owner(&self, cluster: &ClusterRef, key: &str) -> Result<String, KeyError>;

    /// Clusters where `classifier` holds or waits for any key, sorted.
    fn registered_clusters(&self, classifier: &str) -> Vec<ClusterRef>;
}

type Queues = FxHashMap<String, Vec<String>>;

/// In-memory [`LabelArbiter`].
#[derive(Default)]
pub struct KeyManager {
    claims: Mutex<FxHashMap<ClusterRef, Queues>>,
}

impl KeyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted classifier status. Owners (managed labels) are queued
    /// before waiting claimants (unmanaged labels) so a restart keeps ownership.
    pub fn rebuild(&self, classifiers: &[Classifier]) {
        let mut ordered: Vec<&Classifier> = classifiers.iter().collect();
        ordered.sort_by_key(|c| name_of(c));
        let mut claims = lock(&self.claims);
        claims.clear();
        let statuses = |c: &Classifier| -> Vec<MatchingClusterStatus> {
            c.status.as_ref().map(|s| s.matching_cluster_statuses.clone()).unwrap_or_default()
        };
        for c in ordered.iter() {
            let name = name_of(c);
            for m in statuses(c) {
                let queues = claims.entry(m.cluster_ref.clone()).or_default();
                for key in m.managed_labels.iter() {
                    enqueue(queues, key, &name);
                }
            }
        }
        for c in ordered.iter() {
            let name = name_of(c);
            for m in statuses(c) {
                let queues = claims.entry(m.cluster_ref.clone()).or_default();
                for u in m.unmanaged_labels.iter() {
                    enqueue(queues, &u.key, &name);
                }
            }
        }
        info!(clusters = claims.len(), classifiers = classifiers.len(), "label key manager rebuilt");
    }
}

fn name_of(c: &Classifier) -> String {
    c.metadata.name.clone().unwrap_or_default()
}

fn enqueue(queues: &mut Queues, key: &str, classifier: &str) {
    let q = queues.entry(key.to_string()).or_default();
    if !q.iter().any(|c| c == classifier) {
        q.push(classifier.to_string());
    }
}

fn dequeue(queues: &mut Queues, key: &str, classifier: &str) {
    if let Some(q) = queues.get_mut(key) {
        let was_owner = q.first().map(|c| c == classifier).unwrap_or(false);
        q.retain(|c| c != classifier);
        if was_owner {
            debug!(key, from = classifier, to = ?q.first(), "label ownership released");
        }
        if q.is_empty() {
            queues.remove(key);
        }
    }
}

impl LabelArbiter for KeyManager {
    fn can_manage(&self, classifier: &str, cluster: &ClusterRef, key: &str) -> bool {
        let claims = lock(&self.claims);
        claims
            .get(cluster)
            .and_then(|q| q.get(key))
            .and_then(|q| q.first())
            .map(|owner| owner == classifier)
            .unwrap_or(false)
    }

    fn register_for_labels(&self, classifier: &Classifier, cluster: &ClusterRef) {
        let name = name_of(classifier);
        let mut claims = lock(&self.claims);
        let queues = claims.entry(cluster.clone()).or_default();
        for label in classifier.spec.classifier_labels.iter() {
            enqueue(queues, &label.key, &name);
        }
    }

    fn remove_stale_registrations(&self, classifier: &Classifier, cluster: &ClusterRef) {
        let name = name_of(classifier);
        let wanted: Vec<&str> = classifier.spec.classifier_labels.iter().map(|l| l.key.as_str()).collect();
        let mut claims = lock(&self.claims);
        let Some(queues) = claims.get_mut(cluster) else { return };
        let stale: Vec<String> = queues
            .iter()
            .filter(|(key, q)| !wanted.contains(&key.as_str()) && q.iter().any(|c| *c == name))
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            dequeue(queues, &key, &name);
        }
        if queues.is_empty() {
            claims.remove(cluster);
        }
    }

    fn remove_all_registrations(&self, classifier: &str, cluster: &ClusterRef) {
        let mut claims = lock(&self.claims);
        let Some(queues) = claims.get_mut(cluster) else { return };
        let keys: Vec<String> = queues.keys().cloned().collect();
        for key in keys {
            dequeue(queues, &key, classifier);
        }
        if queues.is_empty() {
            claims.remove(cluster);
        }
    }

    fn current_owner(&self, cluster: &ClusterRef, key: &str) -> Result<String, KeyError> {
        let claims = lock(&self.claims);
        claims
            .get(cluster)
            .and_then(|q| q.get(key))
            .and_then(|q| q.first())
            .cloned()
            .ok_or_else(|| KeyError::NoOwner { cluster: cluster.to_string(), key: key.to_string() })
    }

    fn registered_clusters(&self, classifier: &str) -> Vec<ClusterRef> {
        let claims = lock(&self.claims);
        let mut out: Vec<ClusterRef> = claims
            .iter()
            .filter(|(_, queues)| queues.values().any(|q| q.iter().any(|c| c == classifier)))
            .map(|(cluster, _)| cluster.clone())
            .collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use classy_core::{ClassifierLabel, ClassifierSpec, ClassifierStatus, UnmanagedLabel};

    fn classifier(name: &str, keys: &[&str]) -> Classifier {
        Classifier::new(
            name,
            ClassifierSpec {
                classifier_labels: keys
                    .iter()
                    .map(|k| ClassifierLabel { key: k.to_string(), value: name.to_string() })
                    .collect(),
                ..Default::default()
            },
        )
    }

    fn a() -> ClusterRef {
        ClusterRef::capi("fleet", "a")
    }

    #[test]
    fn first_registration_wins() {
        let km = KeyManager::new();
        let p1 = classifier("p1", &["team"]);
        let p2 = classifier("p2", &["team"]);
        km.register_for_labels(&p1, &a());
        km.register_for_labels(&p2, &a());
        assert!(km.can_manage("p1", &a(), "team"));
        assert!(!km.can_manage("p2", &a(), "team"));
        assert_eq!(km.current_owner(&a(), "team").unwrap(), "p1");
    }

    #[test]
    fn registering_twice_is_idempotent() {
        let km = KeyManager::new();
        let p1 = classifier("p1", &["team"]);
        let p2 = classifier("p2", &["team"]);
        km.register_for_labels(&p1, &a());
        km.register_for_labels(&p2, &a());
        km.register_for_labels(&p1, &a());
        km.remove_all_registrations("p1", &a());
        assert_eq!(km.current_owner(&a(), "team").unwrap(), "p2");
    }

    #[test]
    fn stale_release_promotes_next_claimant() {
        let km = KeyManager::new();
        let p1 = classifier("p1", &["team", "env"]);
        let p2 = classifier("p2", &["team"]);
        km.register_for_labels(&p1, &a());
        km.register_for_labels(&p2, &a());
        // p1 drops "team"
        let p1 = classifier("p1", &["env"]);
        km.remove_stale_registrations(&p1, &a());
        assert!(km.can_manage("p2", &a(), "team"));
        assert!(km.can_manage("p1", &a(), "env"));
    }

    #[test]
    fn registered_clusters_cover_owned_and_waiting_keys() {
        let km = KeyManager::new();
        let b = ClusterRef::capi("fleet", "b");
        let p1 = classifier("p1", &["team"]);
        let p2 = classifier("p2", &["team"]);
        km.register_for_labels(&p1, &a());
        km.register_for_labels(&p2, &a());
        km.register_for_labels(&p2, &b);
        assert_eq!(km.registered_clusters("p1"), vec![a()]);
        assert_eq!(km.registered_clusters("p2"), vec![a(), b.clone()]);
        km.remove_all_registrations("p2", &a());
        assert_eq!(km.registered_clusters("p2"), vec![b]);
        assert!(km.registered_clusters("p3").is_empty());
    }

    #[test]
    fn no_owner_is_an_error() {
        let km = KeyManager::new();
        assert_eq!(
            km.current_owner(&a(), "team"),
            Err(KeyError::NoOwner { cluster: "fleet/a".into(), key: "team".into() })
        );
        assert!(!km.can_manage("p1", &a(), "team"));
    }

    #[test]
    fn rebuild_keeps_owners_ahead_of_waiters() {
        let mut owner = classifier("zeta", &["team"]);
        owner.status = Some(ClassifierStatus {
            cluster_info: vec![],
            matching_cluster_statuses: vec![MatchingClusterStatus {
                cluster_ref: a(),
                managed_labels: vec!["team".into()],
                unmanaged_labels: vec![],
            }],
            ..Default::default()
        });
        let mut waiter = classifier("alpha", &["team"]);
        waiter.status = Some(ClassifierStatus {
            cluster_info: vec![],
            matching_cluster_statuses: vec![MatchingClusterStatus {
                cluster_ref: a(),
                managed_labels: vec![],
                unmanaged_labels: vec![UnmanagedLabel { key: "team".into(), failure_message: None }],
            }],
            ..Default::default()
        });
        let km = KeyManager::new();
        km.rebuild(&[waiter, owner]);
        assert_eq!(km.current_owner(&a(), "team").unwrap(), "zeta");
        km.remove_all_registrations("zeta", &a());
        assert_eq!(km.current_owner(&a(), "team").unwrap(), "alpha");
    }
}
