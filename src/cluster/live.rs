//! Live cluster access through the Kubernetes API

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret};
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::APIService;
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::debug;

use super::{
    api_service_ca_bundle, meshed_snapshot, mutating_ca_bundle, secret_data, validating_ca_bundle,
    ClusterApi, MeshedProxySnapshot, SecretData, CONTROL_PLANE_NS_LABEL,
};
use crate::Result;

/// [`ClusterApi`] backed by a kube [`Client`]
///
/// The client is cheap to clone and safe to share between the concurrent
/// webhook resolutions of one upgrade.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Wrap the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(cm) => Ok(Some(cm.data.unwrap_or_default())),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(namespace, name, "configmap not found");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<SecretData>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(secret) => Ok(Some(secret_data(secret))),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(namespace, name, "secret not found");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn mutating_webhook_ca_bundle(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let api: Api<MutatingWebhookConfiguration> = Api::all(self.client.clone());
        match api.get(name).await {
            Ok(config) => mutating_ca_bundle(&config).map(Some),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn validating_webhook_ca_bundle(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let api: Api<ValidatingWebhookConfiguration> = Api::all(self.client.clone());
        match api.get(name).await {
            Ok(config) => validating_ca_bundle(&config).map(Some),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn api_service_ca_bundle(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let api: Api<APIService> = Api::all(self.client.clone());
        match api.get(name).await {
            Ok(service) => api_service_ca_bundle(&service).map(Some),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn meshed_proxies(&self) -> Result<Vec<MeshedProxySnapshot>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let pods = api
            .list(&ListParams::default().labels(CONTROL_PLANE_NS_LABEL))
            .await?;
        let snapshots: Vec<_> = pods.items.iter().filter_map(meshed_snapshot).collect();
        debug!(count = snapshots.len(), "listed meshed proxies");
        Ok(snapshots)
    }
}
