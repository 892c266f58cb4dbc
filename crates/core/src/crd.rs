//! Custom resources: `Classifier` (cluster scoped), `ClassifierReport` and `AccessRequest` (namespaced).

use kube::CustomResource;
use serde::{Deserialize, Serialize};

use crate::{ClusterRef, Fingerprint};

/// Desired classification: resource predicates evaluated in every managed cluster plus the
/// labels to set on clusters where all predicates hold.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[kube(
    group = "classy.io",
    version = "v1alpha1",
    kind = "Classifier",
    status = "ClassifierStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ClassifierSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deployed_resource_constraints: Vec<DeployedResourceConstraint>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kubernetes_version_constraints: Vec<KubernetesVersionConstraint>,
    #[serde(default)]
    pub classifier_labels: Vec<ClassifierLabel>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployedResourceConstraint {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub label_filters: Vec<LabelFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_count: Option<u32>,
    /// Script evaluated by the agent against each matching resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelFilter {
    pub key: String,
    pub operation: LabelOperation,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelOperation {
    Equal,
    Different,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesVersionConstraint {
    pub version: String,
    pub comparison: VersionComparison,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionComparison {
    Equal,
    NotEqual,
    GreaterThan,
    LessThan,
    GreaterThanOrEqualTo,
    LessThanOrEqualTo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierLabel {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifierStatus {
    /// Deployment state, one entry per target cluster.
    #[serde(default)]
    pub cluster_info: Vec<ClusterInfo>,
    /// Clusters currently matching, rebuilt on every pass.
    #[serde(default)]
    pub matching_cluster_statuses: Vec<MatchingClusterStatus>,
    /// Why the last pass stopped early, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
}

impl ClassifierStatus {
    pub fn cluster_info_for(&self, cluster: &ClusterRef) -> Option<&ClusterInfo> {
        self.cluster_info.iter().find(|c| c.cluster.same_cluster(cluster))
    }
}

/// Convergence record for one (classifier, cluster) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterInfo {
    pub cluster: ClusterRef,
    /// Fingerprint of what was last dispatched to this cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<Fingerprint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<FeatureStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
}

impl ClusterInfo {
    pub fn new(cluster: ClusterRef) -> Self {
        Self { cluster, hash: None, status: None, failure_message: None }
    }

    pub fn is_provisioned(&self) -> bool {
        self.status == Some(FeatureStatus::Provisioned)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeatureStatus {
    Provisioning,
    Provisioned,
    Failed,
    Removing,
    Removed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchingClusterStatus {
    pub cluster_ref: ClusterRef,
    /// Label keys this classifier owns on the cluster.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub managed_labels: Vec<String>,
    /// Label keys wanted but owned by another classifier.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unmanaged_labels: Vec<UnmanagedLabel>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnmanagedLabel {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
}

/// Match observation for one (classifier, cluster) pair.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[kube(
    group = "classy.io",
    version = "v1alpha1",
    kind = "ClassifierReport",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ClassifierReportSpec {
    #[serde(default)]
    pub cluster_namespace: String,
    #[serde(default)]
    pub cluster_name: String,
    #[serde(default)]
    pub classifier_name: String,
    #[serde(rename = "match", default)]
    pub matched: bool,
}

impl ClassifierReport {
    /// Classifier named by the report's labels, if present.
    pub fn classifier_label(&self) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(crate::CLASSIFIER_NAME_LABEL))
            .map(String::as_str)
    }

    pub fn cluster_ref(&self) -> ClusterRef {
        ClusterRef::capi(self.spec.cluster_namespace.clone(), self.spec.cluster_name.clone())
    }
}

/// Request for a credential letting the agent in a managed cluster reach the management cluster.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[kube(
    group = "classy.io",
    version = "v1alpha1",
    kind = "AccessRequest",
    namespaced,
    status = "AccessRequestStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct AccessRequestSpec {
    pub namespace: String,
    pub name: String,
    #[serde(rename = "type")]
    pub request_type: String,
    pub control_plane_endpoint: ApiEndpoint,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiEndpoint {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessRequestStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
    pub namespace: String,
    pub name: String,
}

pub const ACCESS_REQUEST_TYPE_AGENT: &str = "ClassifierAgentRequest";
