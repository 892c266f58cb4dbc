//! Classy core types: classifier CRDs, cluster references, fingerprints.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub mod crd;
pub mod endpoint;
pub mod fingerprint;

pub use crd::{
    AccessRequest, AccessRequestSpec, AccessRequestStatus, ApiEndpoint, Classifier, ACCESS_REQUEST_TYPE_AGENT, ClassifierLabel, ClassifierReport,
    ClassifierReportSpec, ClassifierSpec, ClassifierStatus, ClusterInfo, DeployedResourceConstraint, FeatureStatus,
    KubernetesVersionConstraint, LabelFilter, LabelOperation, MatchingClusterStatus, SecretRef, UnmanagedLabel,
    VersionComparison,
};
pub use endpoint::{ControlPlaneEndpoint, EndpointError};
pub use fingerprint::Fingerprint;

/// API group served for classifiers, reports and access requests.
pub const GROUP: &str = "classy.io";
pub const VERSION: &str = "v1alpha1";

/// Finalizer held on a classifier until every cluster has been cleaned up.
pub const CLASSIFIER_FINALIZER: &str = "classy.io/classifier-finalizer";
/// Label carried by every report, naming the classifier it belongs to.
pub const CLASSIFIER_NAME_LABEL: &str = "classy.io/classifier-name";
/// Label carried by mirrored reports, naming the source cluster (`<namespace>--<name>`).
pub const REPORT_CLUSTER_LABEL: &str = "classy.io/cluster";
/// Label set on access requests created on behalf of the classifier agent.
pub const ACCESS_REQUEST_LABEL: &str = "classy.io/classifier-agent";
/// Pause annotation honoured both on clusters and on classifiers.
pub const PAUSED_ANNOTATION: &str = "cluster.x-k8s.io/paused";

/// Where the agent finds the kubeconfig to reach the management cluster.
pub const AGENT_SECRET_NAMESPACE: &str = "classy-system";
pub const AGENT_SECRET_NAME: &str = "classy-agent-kubeconfig";
pub const AGENT_SECRET_KEY: &str = "kubeconfig";

/// Deployer feature id used for classifier deploy/undeploy requests.
pub const FEATURE_CLASSIFIER: &str = "Classifier";

pub const CAPI_GROUP: &str = "cluster.x-k8s.io";
pub const CAPI_VERSION: &str = "v1beta1";
pub const CAPI_CLUSTER_KIND: &str = "Cluster";

/// Reference to a managed cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRef {
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
}

impl ClusterRef {
    /// Reference to a Cluster API `Cluster`.
    pub fn capi(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            kind: CAPI_CLUSTER_KIND.to_string(),
            api_version: format!("{}/{}", CAPI_GROUP, CAPI_VERSION),
        }
    }

    /// Value of [`REPORT_CLUSTER_LABEL`] for this cluster.
    pub fn label_value(&self) -> String {
        format!("{}--{}", self.namespace, self.name)
    }

    /// Two references point at the same cluster when namespace and name agree and
    /// kind/apiVersion agree whenever both sides carry them.
    pub fn same_cluster(&self, other: &ClusterRef) -> bool {
        fn compatible(a: &str, b: &str) -> bool {
            a.is_empty() || b.is_empty() || a == b
        }
        self.namespace == other.namespace
            && self.name == other.name
            && compatible(&self.kind, &other.kind)
            && compatible(&self.api_version, &other.api_version)
    }
}

impl fmt::Display for ClusterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Snapshot of the fields of a managed cluster the controller looks at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ManagedCluster {
    pub cluster: ClusterRef,
    /// `spec.paused` or the pause annotation.
    pub paused: bool,
    /// `status.controlPlaneReady`.
    pub control_plane_ready: bool,
    /// `metadata.deletionTimestamp` is set.
    pub deleting: bool,
    pub labels: BTreeMap<String, String>,
}

impl ManagedCluster {
    /// Ready to be configured: control plane up and not going away.
    pub fn ready(&self) -> bool {
        self.control_plane_ready && !self.deleting
    }
}

/// Name of the management-side mirror of a report: `<classifier>--<cluster>`.
pub fn mirrored_report_name(classifier: &str, cluster_name: &str) -> String {
    format!("{}--{}", classifier, cluster_name)
}

/// Name of the access request created for a cluster.
pub fn access_request_name(cluster: &ClusterRef) -> String {
    let kind = if cluster.kind.is_empty() { CAPI_CLUSTER_KIND } else { cluster.kind.as_str() };
    format!("{}-{}", kind.to_ascii_lowercase(), cluster.name)
}

pub mod prelude {
    pub use super::{
        Classifier, ClassifierReport, ClassifierSpec, ClassifierStatus, ClusterInfo, ClusterRef, FeatureStatus,
        Fingerprint, ManagedCluster, MatchingClusterStatus, UnmanagedLabel,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capi_ref_carries_kind_and_version() {
        let c = ClusterRef::capi("fleet", "a");
        assert_eq!(c.kind, "Cluster");
        assert_eq!(c.api_version, "cluster.x-k8s.io/v1beta1");
        assert_eq!(c.to_string(), "fleet/a");
        assert_eq!(c.label_value(), "fleet--a");
    }

    #[test]
    fn same_cluster_tolerates_missing_kind() {
        let full = ClusterRef::capi("fleet", "a");
        let bare = ClusterRef { namespace: "fleet".into(), name: "a".into(), ..Default::default() };
        assert!(full.same_cluster(&bare));
        let other = ClusterRef { kind: "SveltosCluster".into(), ..full.clone() };
        assert!(!full.same_cluster(&other));
    }

    #[test]
    fn derived_names() {
        assert_eq!(mirrored_report_name("acme-x", "a"), "acme-x--a");
        assert_eq!(access_request_name(&ClusterRef::capi("fleet", "a")), "cluster-a");
    }
}
