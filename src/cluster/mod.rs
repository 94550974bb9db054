//! Read-only cluster access for upgrade reconciliation
//!
//! [`ClusterApi`] is the one seam between the reconciliation engine and the
//! cluster. Two implementations exist: [`KubeCluster`] talks to a live API
//! server, [`ManifestCluster`] answers from a set of YAML manifests. A 404
//! is reported as `Ok(None)` so callers can apply their fallbacks locally.

mod live;
mod manifests;

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use k8s_openapi::api::core::v1::{Pod, Secret};
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::APIService;

#[cfg(test)]
use mockall::automock;

pub use live::KubeCluster;
pub use manifests::{ManifestCluster, ManifestObject};

use crate::{Error, Result};

/// Label carried by every pod enrolled in the mesh
pub const CONTROL_PLANE_NS_LABEL: &str = "linkerd.io/control-plane-ns";

/// Name of the injected proxy container
pub const PROXY_CONTAINER_NAME: &str = "linkerd-proxy";

/// Proxy env var holding the trust anchors the proxy was started with
pub const TRUST_ANCHORS_ENV: &str = "LINKERD2_PROXY_IDENTITY_TRUST_ANCHORS";

/// Decoded secret payload, `data` merged with `stringData`
pub type SecretData = BTreeMap<String, Vec<u8>>;

/// Trust anchors observed on one live meshed workload
///
/// Read once per verification pass and never written back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MeshedProxySnapshot {
    /// Workload namespace
    pub namespace: String,
    /// Pod name
    pub name: String,
    /// PEM anchors the proxy trusts; empty if none were found
    pub anchors_pem: String,
}

/// Read-only view of the cluster state an upgrade depends on
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// `data` of a ConfigMap, or `None` if it does not exist
    async fn config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>>;

    /// Decoded data of a Secret, or `None` if it does not exist
    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<SecretData>>;

    /// CA bundle of a MutatingWebhookConfiguration's first webhook
    async fn mutating_webhook_ca_bundle(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// CA bundle of a ValidatingWebhookConfiguration's first webhook
    async fn validating_webhook_ca_bundle(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// CA bundle of an APIService registration
    async fn api_service_ca_bundle(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Trust anchors of every live meshed proxy, across all namespaces
    async fn meshed_proxies(&self) -> Result<Vec<MeshedProxySnapshot>>;
}

pub(crate) fn secret_data(secret: Secret) -> SecretData {
    let mut data: SecretData = secret
        .data
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, v.0))
        .collect();
    for (k, v) in secret.string_data.unwrap_or_default() {
        data.insert(k, v.into_bytes());
    }
    data
}

fn non_empty_bundle(kind: &str, name: &str, bundle: Option<Vec<u8>>) -> Result<Vec<u8>> {
    match bundle {
        Some(bytes) if !bytes.is_empty() => Ok(bytes),
        _ => Err(Error::malformed_registration(format!(
            "{} {} has no CA bundle",
            kind, name
        ))),
    }
}

// Only one service is ever registered per webhook configuration.
pub(crate) fn mutating_ca_bundle(config: &MutatingWebhookConfiguration) -> Result<Vec<u8>> {
    let name = config.metadata.name.as_deref().unwrap_or_default();
    let bundle = config
        .webhooks
        .as_ref()
        .and_then(|hooks| hooks.first())
        .and_then(|hook| hook.client_config.ca_bundle.as_ref())
        .map(|b| b.0.clone());
    non_empty_bundle("MutatingWebhookConfiguration", name, bundle)
}

pub(crate) fn validating_ca_bundle(config: &ValidatingWebhookConfiguration) -> Result<Vec<u8>> {
    let name = config.metadata.name.as_deref().unwrap_or_default();
    let bundle = config
        .webhooks
        .as_ref()
        .and_then(|hooks| hooks.first())
        .and_then(|hook| hook.client_config.ca_bundle.as_ref())
        .map(|b| b.0.clone());
    non_empty_bundle("ValidatingWebhookConfiguration", name, bundle)
}

pub(crate) fn api_service_ca_bundle(service: &APIService) -> Result<Vec<u8>> {
    let name = service.metadata.name.as_deref().unwrap_or_default();
    let bundle = service
        .spec
        .as_ref()
        .and_then(|spec| spec.ca_bundle.as_ref())
        .map(|b| b.0.clone());
    non_empty_bundle("APIService", name, bundle)
}

fn is_terminated(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

/// Snapshot a pod's proxy anchors; `None` for unmeshed or finished pods
pub(crate) fn meshed_snapshot(pod: &Pod) -> Option<MeshedProxySnapshot> {
    let meshed = pod
        .metadata
        .labels
        .as_ref()
        .is_some_and(|labels| labels.contains_key(CONTROL_PLANE_NS_LABEL));
    if !meshed || is_terminated(pod) {
        return None;
    }

    let spec = pod.spec.as_ref()?;
    let anchors_pem = spec
        .init_containers
        .iter()
        .flatten()
        .chain(spec.containers.iter())
        .filter(|c| c.name == PROXY_CONTAINER_NAME)
        .flat_map(|c| c.env.iter().flatten())
        .find(|env| env.name == TRUST_ANCHORS_ENV)
        .and_then(|env| env.value.as_deref())
        .map(|v| v.trim().to_string())
        .unwrap_or_default();

    Some(MeshedProxySnapshot {
        namespace: pod
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string()),
        name: pod.metadata.name.clone().unwrap_or_default(),
        anchors_pem,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::meshed_pod;
    use k8s_openapi::api::admissionregistration::v1::{MutatingWebhook, WebhookClientConfig};
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;

    #[test]
    fn snapshot_reads_proxy_anchors() {
        let pod = meshed_pod("emojivoto", "web-1", Some("  ANCHORS\n"));
        let snapshot = meshed_snapshot(&pod).unwrap();
        assert_eq!(snapshot.namespace, "emojivoto");
        assert_eq!(snapshot.name, "web-1");
        assert_eq!(snapshot.anchors_pem, "ANCHORS");
    }

    #[test]
    fn snapshot_without_anchor_env_is_empty() {
        let pod = meshed_pod("emojivoto", "web-1", None);
        assert_eq!(meshed_snapshot(&pod).unwrap().anchors_pem, "");
    }

    #[test]
    fn unmeshed_and_finished_pods_are_skipped() {
        let mut pod = meshed_pod("emojivoto", "web-1", Some("A"));
        pod.metadata.labels = None;
        assert!(meshed_snapshot(&pod).is_none());

        let mut pod = meshed_pod("emojivoto", "job-1", Some("A"));
        pod.status = Some(PodStatus {
            phase: Some("Succeeded".to_string()),
            ..Default::default()
        });
        assert!(meshed_snapshot(&pod).is_none());
    }

    #[test]
    fn secret_string_data_overrides_data() {
        let secret = Secret {
            data: Some(
                [
                    ("tls.crt".to_string(), ByteString(b"old".to_vec())),
                    ("tls.key".to_string(), ByteString(b"key".to_vec())),
                ]
                .into(),
            ),
            string_data: Some([("tls.crt".to_string(), "new".to_string())].into()),
            ..Default::default()
        };
        let data = secret_data(secret);
        assert_eq!(data["tls.crt"], b"new");
        assert_eq!(data["tls.key"], b"key");
    }

    #[test]
    fn mutating_bundle_requires_a_webhook_entry() {
        let mut config = MutatingWebhookConfiguration {
            metadata: ObjectMeta {
                name: Some("linkerd-proxy-injector-webhook-config".to_string()),
                ..Default::default()
            },
            webhooks: Some(vec![]),
        };
        let err = mutating_ca_bundle(&config).unwrap_err();
        assert!(matches!(err, Error::MalformedRegistration(_)));

        config.webhooks = Some(vec![MutatingWebhook {
            name: "linkerd-proxy-injector.linkerd.io".to_string(),
            client_config: WebhookClientConfig {
                ca_bundle: Some(ByteString(b"BUNDLE".to_vec())),
                ..Default::default()
            },
            ..Default::default()
        }]);
        assert_eq!(mutating_ca_bundle(&config).unwrap(), b"BUNDLE");
    }
}
