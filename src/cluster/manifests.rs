//! Cluster state read from YAML manifests instead of a live API server
//!
//! Used by `--from-manifests`, which lets an upgrade be computed from the
//! output of a previous install or upgrade, and by tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret};
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::APIService;
use serde::Deserialize;
use tracing::debug;

use super::{
    api_service_ca_bundle, meshed_snapshot, mutating_ca_bundle, secret_data, validating_ca_bundle,
    ClusterApi, MeshedProxySnapshot, SecretData,
};
use crate::{Error, Result};

/// A resource kind the manifest source understands
#[derive(Clone, Debug)]
pub enum ManifestObject {
    /// A ConfigMap
    ConfigMap(ConfigMap),
    /// A Secret
    Secret(Secret),
    /// A MutatingWebhookConfiguration
    MutatingWebhook(MutatingWebhookConfiguration),
    /// A ValidatingWebhookConfiguration
    ValidatingWebhook(ValidatingWebhookConfiguration),
    /// An APIService registration
    ApiService(APIService),
    /// A Pod
    Pod(Pod),
}

type Key = (String, String);

fn namespaced_key(namespace: Option<&String>, name: Option<&String>) -> Key {
    (
        namespace.cloned().unwrap_or_else(|| "default".to_string()),
        name.cloned().unwrap_or_default(),
    )
}

/// In-memory [`ClusterApi`] populated from manifests
#[derive(Clone, Debug, Default)]
pub struct ManifestCluster {
    config_maps: BTreeMap<Key, ConfigMap>,
    secrets: BTreeMap<Key, Secret>,
    mutating: BTreeMap<String, MutatingWebhookConfiguration>,
    validating: BTreeMap<String, ValidatingWebhookConfiguration>,
    api_services: BTreeMap<String, APIService>,
    pods: Vec<Pod>,
}

impl ManifestCluster {
    /// Build from already-typed objects
    pub fn from_objects(objects: impl IntoIterator<Item = ManifestObject>) -> Self {
        let mut cluster = Self::default();
        for object in objects {
            cluster.insert(object);
        }
        cluster
    }

    /// Parse a multi-document YAML stream
    ///
    /// Unrecognized kinds are skipped. `kind: List` documents are expanded.
    /// The pre-GA `v1beta1` admission and API registration versions are read
    /// as their `v1` equivalents.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let mut cluster = Self::default();
        for document in serde_yaml::Deserializer::from_str(yaml) {
            let value = serde_yaml::Value::deserialize(document)
                .map_err(|e| Error::serialization(format!("invalid manifest YAML: {}", e)))?;
            cluster.insert_value(value)?;
        }
        Ok(cluster)
    }

    /// Add one object, replacing any existing object with the same identity
    pub fn insert(&mut self, object: ManifestObject) {
        match object {
            ManifestObject::ConfigMap(cm) => {
                let key = namespaced_key(cm.metadata.namespace.as_ref(), cm.metadata.name.as_ref());
                self.config_maps.insert(key, cm);
            }
            ManifestObject::Secret(secret) => {
                let key = namespaced_key(
                    secret.metadata.namespace.as_ref(),
                    secret.metadata.name.as_ref(),
                );
                self.secrets.insert(key, secret);
            }
            ManifestObject::MutatingWebhook(config) => {
                let name = config.metadata.name.clone().unwrap_or_default();
                self.mutating.insert(name, config);
            }
            ManifestObject::ValidatingWebhook(config) => {
                let name = config.metadata.name.clone().unwrap_or_default();
                self.validating.insert(name, config);
            }
            ManifestObject::ApiService(service) => {
                let name = service.metadata.name.clone().unwrap_or_default();
                self.api_services.insert(name, service);
            }
            ManifestObject::Pod(pod) => self.pods.push(pod),
        }
    }

    fn insert_value(&mut self, mut value: serde_yaml::Value) -> Result<()> {
        if value.is_null() {
            return Ok(());
        }
        let kind = value
            .get("kind")
            .and_then(|k| k.as_str())
            .unwrap_or_default()
            .to_string();

        if kind == "List" {
            if let Some(serde_yaml::Value::Sequence(items)) =
                value.get_mut("items").map(std::mem::take)
            {
                for item in items {
                    self.insert_value(item)?;
                }
            }
            return Ok(());
        }

        let object = match kind.as_str() {
            "ConfigMap" => ManifestObject::ConfigMap(decode(value, &kind)?),
            "Secret" => ManifestObject::Secret(decode(value, &kind)?),
            "Pod" => ManifestObject::Pod(decode(value, &kind)?),
            "MutatingWebhookConfiguration" => {
                upgrade_api_version(&mut value, "admissionregistration.k8s.io/v1");
                ManifestObject::MutatingWebhook(decode(value, &kind)?)
            }
            "ValidatingWebhookConfiguration" => {
                upgrade_api_version(&mut value, "admissionregistration.k8s.io/v1");
                ManifestObject::ValidatingWebhook(decode(value, &kind)?)
            }
            "APIService" => {
                upgrade_api_version(&mut value, "apiregistration.k8s.io/v1");
                ManifestObject::ApiService(decode(value, &kind)?)
            }
            other => {
                debug!(kind = other, "skipping manifest object");
                return Ok(());
            }
        };
        self.insert(object);
        Ok(())
    }
}

fn upgrade_api_version(value: &mut serde_yaml::Value, v1: &str) {
    if let Some(map) = value.as_mapping_mut() {
        map.insert(
            serde_yaml::Value::String("apiVersion".to_string()),
            serde_yaml::Value::String(v1.to_string()),
        );
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: serde_yaml::Value, kind: &str) -> Result<T> {
    serde_yaml::from_value(value)
        .map_err(|e| Error::serialization(format!("invalid {} manifest: {}", kind, e)))
}

#[async_trait]
impl ClusterApi for ManifestCluster {
    async fn config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        Ok(self
            .config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .map(|cm| cm.data.clone().unwrap_or_default()))
    }

    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<SecretData>> {
        Ok(self
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .map(secret_data))
    }

    async fn mutating_webhook_ca_bundle(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.mutating
            .get(name)
            .map(mutating_ca_bundle)
            .transpose()
    }

    async fn validating_webhook_ca_bundle(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.validating
            .get(name)
            .map(validating_ca_bundle)
            .transpose()
    }

    async fn api_service_ca_bundle(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.api_services
            .get(name)
            .map(api_service_ca_bundle)
            .transpose()
    }

    async fn meshed_proxies(&self) -> Result<Vec<MeshedProxySnapshot>> {
        Ok(self.pods.iter().filter_map(meshed_snapshot).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFESTS: &str = r#"
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: linkerd-config
  namespace: linkerd
data:
  global: '{"linkerdNamespace":"linkerd"}'
---
apiVersion: v1
kind: Secret
type: kubernetes.io/tls
metadata:
  name: linkerd-tap-k8s-tls
  namespace: linkerd
data:
  tls.crt: Q1JU
  tls.key: S0VZ
---
apiVersion: v1
kind: Service
metadata:
  name: linkerd-tap
  namespace: linkerd
---
apiVersion: apiregistration.k8s.io/v1beta1
kind: APIService
metadata:
  name: v1alpha1.tap.linkerd.io
spec:
  group: tap.linkerd.io
  version: v1alpha1
  groupPriorityMinimum: 1000
  versionPriority: 100
  caBundle: QlVORExF
---
apiVersion: v1
kind: List
items:
- apiVersion: v1
  kind: Secret
  metadata:
    name: linkerd-identity-issuer
    namespace: linkerd
  stringData:
    crt.pem: ISSUER
"#;

    #[tokio::test]
    async fn manifests_are_indexed_by_kind() {
        let cluster = ManifestCluster::from_yaml(MANIFESTS).unwrap();

        let cm = cluster
            .config_map("linkerd", "linkerd-config")
            .await
            .unwrap()
            .unwrap();
        assert!(cm["global"].contains("linkerdNamespace"));

        let tls = cluster
            .secret("linkerd", "linkerd-tap-k8s-tls")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tls["tls.crt"], b"CRT");
        assert_eq!(tls["tls.key"], b"KEY");

        let bundle = cluster
            .api_service_ca_bundle("v1alpha1.tap.linkerd.io")
            .await
            .unwrap();
        assert_eq!(bundle.as_deref(), Some(&b"BUNDLE"[..]));

        let issuer = cluster
            .secret("linkerd", "linkerd-identity-issuer")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(issuer["crt.pem"], b"ISSUER");
    }

    #[tokio::test]
    async fn absent_objects_are_none() {
        let cluster = ManifestCluster::from_yaml(MANIFESTS).unwrap();
        assert!(cluster
            .secret("linkerd", "linkerd-tap-tls")
            .await
            .unwrap()
            .is_none());
        assert!(cluster
            .mutating_webhook_ca_bundle("linkerd-proxy-injector-webhook-config")
            .await
            .unwrap()
            .is_none());
        assert!(cluster.meshed_proxies().await.unwrap().is_empty());
    }

    #[test]
    fn invalid_yaml_is_a_serialization_error() {
        let err = ManifestCluster::from_yaml("kind: Secret\n  bad: [indent").unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
