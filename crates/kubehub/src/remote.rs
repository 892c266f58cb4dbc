//! Managed cluster access. Clients are built from the Cluster API kubeconfig secret
//! `<cluster>-kubeconfig` (key `value`) in the cluster's namespace.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use classy_core::{Classifier, ClassifierReport, ClusterRef, AGENT_SECRET_KEY, AGENT_SECRET_NAME, AGENT_SECRET_NAMESPACE};
use k8s_openapi::api::core::v1::{Namespace, Secret};
use k8s_openapi::ByteString;
use kube::{
    api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams},
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config,
};
use tracing::{debug, info};

use crate::fleet::FIELD_MANAGER;
use crate::{is_not_found, RemoteApi};

const KUBECONFIG_KEY: &str = "value";

#[derive(Clone)]
pub struct KubeRemoteApi {
    management: Client,
}

impl KubeRemoteApi {
    pub fn new(management: Client) -> Self {
        Self { management }
    }

    /// Client for `cluster`, built from its kubeconfig secret.
    pub async fn client_for(&self, cluster: &ClusterRef) -> Result<Client> {
        let secrets: Api<Secret> = Api::namespaced(self.management.clone(), &cluster.namespace);
        let name = format!("{}-kubeconfig", cluster.name);
        let secret = secrets
            .get_opt(&name)
            .await
            .with_context(|| format!("getting kubeconfig secret {}/{}", cluster.namespace, name))?
            .ok_or_else(|| anyhow!("kubeconfig secret {}/{} not found", cluster.namespace, name))?;
        let raw = secret
            .data
            .as_ref()
            .and_then(|d| d.get(KUBECONFIG_KEY))
            .ok_or_else(|| anyhow!("kubeconfig secret {}/{} has no {:?} key", cluster.namespace, name, KUBECONFIG_KEY))?;
        let text = std::str::from_utf8(&raw.0).context("kubeconfig is not utf-8")?;
        let kubeconfig = Kubeconfig::from_yaml(text).context("parsing kubeconfig")?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .with_context(|| format!("building client config for {}", cluster))?;
        Client::try_from(config).with_context(|| format!("building client for {}", cluster))
    }
}

#[async_trait::async_trait]
impl RemoteApi for KubeRemoteApi {
    async fn apply_classifier(&self, cluster: &ClusterRef, classifier: &Classifier) -> Result<()> {
        let name = classifier.metadata.name.clone().context("classifier without name")?;
        let client = self.client_for(cluster).await?;
        let api: Api<Classifier> = Api::all(client);
        let obj = Classifier::new(&name, classifier.spec.clone());
        api.patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&obj))
            .await
            .with_context(|| format!("applying classifier {} to {}", name, cluster))?;
        debug!(classifier = %name, cluster = %cluster, "classifier applied");
        Ok(())
    }

    async fn delete_classifier(&self, cluster: &ClusterRef, name: &str) -> Result<()> {
        let client = self.client_for(cluster).await?;
        let api: Api<Classifier> = Api::all(client);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                debug!(classifier = name, cluster = %cluster, "classifier removed");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("deleting classifier {} from {}", name, cluster)),
        }
    }

    async fn list_reports(&self, cluster: &ClusterRef) -> Result<Vec<ClassifierReport>> {
        let client = self.client_for(cluster).await?;
        let api: Api<ClassifierReport> = Api::all(client);
        let list = api.list(&ListParams::default()).await.with_context(|| format!("listing reports in {}", cluster))?;
        Ok(list.items)
    }

    async fn write_agent_kubeconfig(&self, cluster: &ClusterRef, kubeconfig: &[u8]) -> Result<()> {
        let client = self.client_for(cluster).await?;
        let pp = PatchParams::apply(FIELD_MANAGER).force();

        let namespaces: Api<Namespace> = Api::all(client.clone());
        if namespaces.get_opt(AGENT_SECRET_NAMESPACE).await?.is_none() {
            let ns = Namespace {
                metadata: ObjectMeta { name: Some(AGENT_SECRET_NAMESPACE.to_string()), ..Default::default() },
                ..Default::default()
            };
            namespaces.patch(AGENT_SECRET_NAMESPACE, &pp, &Patch::Apply(&ns)).await.context("creating agent namespace")?;
        }

        let secrets: Api<Secret> = Api::namespaced(client, AGENT_SECRET_NAMESPACE);
        if let Some(current) = secrets.get_opt(AGENT_SECRET_NAME).await? {
            let same = current.data.as_ref().and_then(|d| d.get(AGENT_SECRET_KEY)).map(|b| b.0.as_slice() == kubeconfig);
            if same == Some(true) {
                return Ok(());
            }
        }
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(AGENT_SECRET_NAME.to_string()),
                namespace: Some(AGENT_SECRET_NAMESPACE.to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(AGENT_SECRET_KEY.to_string(), ByteString(kubeconfig.to_vec()))])),
            ..Default::default()
        };
        secrets
            .patch(AGENT_SECRET_NAME, &pp, &Patch::Apply(&secret))
            .await
            .with_context(|| format!("writing agent kubeconfig in {}", cluster))?;
        info!(cluster = %cluster, "agent kubeconfig updated");
        Ok(())
    }
}
