//! Webhook TLS material for the control-plane admission webhooks
//!
//! Each webhook keeps its serving key pair in a secret and is registered with
//! the API server together with a CA bundle. An upgrade must render the same
//! key pair and the CA bundle the API server actually holds, otherwise the
//! API server stops trusting the webhook.
//!
//! Secrets come in two layouts:
//! - Current: `<service>-k8s-tls` with `tls.key` / `tls.crt`
//! - Legacy: `<service>-tls` with `key.pem` / `crt.pem`
//!
//! The legacy layout is only consulted when the current one does not exist.

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::cluster::{ClusterApi, SecretData};
use crate::context::CallContext;
use crate::pki::{unix_now, verify_certificate, CertPool};
use crate::{Error, Result};

/// The webhooks whose TLS material survives an upgrade
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WebhookKind {
    /// Mutating webhook injecting proxies
    ProxyInjector,
    /// Validating webhook for service profiles
    ProfileValidator,
    /// Tap aggregated API server
    Tap,
}

impl WebhookKind {
    /// All kinds, in bundle order
    pub const ALL: [WebhookKind; 3] = [
        WebhookKind::ProxyInjector,
        WebhookKind::ProfileValidator,
        WebhookKind::Tap,
    ];

    /// Service name, also the prefix of the secret names
    pub fn service_name(&self) -> &'static str {
        match self {
            WebhookKind::ProxyInjector => "linkerd-proxy-injector",
            WebhookKind::ProfileValidator => "linkerd-sp-validator",
            WebhookKind::Tap => "linkerd-tap",
        }
    }

    /// Name of the registration holding the CA bundle
    pub fn registration_name(&self) -> &'static str {
        match self {
            WebhookKind::ProxyInjector => "linkerd-proxy-injector-webhook-config",
            WebhookKind::ProfileValidator => "linkerd-sp-validator-webhook-config",
            WebhookKind::Tap => "v1alpha1.tap.linkerd.io",
        }
    }

    /// Strategy reading this kind's registered CA bundle
    pub fn ca_bundle_source(&self) -> &'static dyn CaBundleSource {
        match self {
            WebhookKind::ProxyInjector => &MutatingWebhookBundle,
            WebhookKind::ProfileValidator => &ValidatingWebhookBundle,
            WebhookKind::Tap => &ApiServiceBundle,
        }
    }

    /// Secret name in the current layout
    pub fn secret_name(&self) -> String {
        format!("{}-k8s-tls", self.service_name())
    }

    /// Secret name in the legacy layout
    pub fn legacy_secret_name(&self) -> String {
        format!("{}-tls", self.service_name())
    }

    /// In-cluster DNS name the serving certificate must carry
    pub fn dns_name(&self, namespace: &str) -> String {
        format!("{}.{}.svc", self.service_name(), namespace)
    }
}

impl fmt::Display for WebhookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.service_name())
    }
}

/// Reads the CA bundle the API server holds for one webhook
#[async_trait]
pub trait CaBundleSource: Send + Sync {
    /// Resource kind the bundle lives on, for messages
    fn registration_kind(&self) -> &'static str;

    /// Registered bundle, or `None` if the webhook was never registered
    async fn fetch(&self, cluster: &dyn ClusterApi, name: &str) -> Result<Option<Vec<u8>>>;
}

/// Bundle of a MutatingWebhookConfiguration
pub struct MutatingWebhookBundle;

#[async_trait]
impl CaBundleSource for MutatingWebhookBundle {
    fn registration_kind(&self) -> &'static str {
        "MutatingWebhookConfiguration"
    }

    async fn fetch(&self, cluster: &dyn ClusterApi, name: &str) -> Result<Option<Vec<u8>>> {
        cluster.mutating_webhook_ca_bundle(name).await
    }
}

/// Bundle of a ValidatingWebhookConfiguration
pub struct ValidatingWebhookBundle;

#[async_trait]
impl CaBundleSource for ValidatingWebhookBundle {
    fn registration_kind(&self) -> &'static str {
        "ValidatingWebhookConfiguration"
    }

    async fn fetch(&self, cluster: &dyn ClusterApi, name: &str) -> Result<Option<Vec<u8>>> {
        cluster.validating_webhook_ca_bundle(name).await
    }
}

/// Bundle of an APIService registration
pub struct ApiServiceBundle;

#[async_trait]
impl CaBundleSource for ApiServiceBundle {
    fn registration_kind(&self) -> &'static str {
        "APIService"
    }

    async fn fetch(&self, cluster: &dyn ClusterApi, name: &str) -> Result<Option<Vec<u8>>> {
        cluster.api_service_ca_bundle(name).await
    }
}

/// Serving key pair and the CA bundle registered for it
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct WebhookTls {
    /// PEM private key
    #[serde(rename = "keyPEM")]
    pub key_pem: String,
    /// PEM serving certificate
    #[serde(rename = "crtPEM")]
    pub crt_pem: String,
    /// CA bundle the API server trusts for this webhook
    #[serde(rename = "caBundlePEM")]
    pub ca_bundle_pem: String,
}

/// TLS material of one webhook, as rendered into the bundle
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookIdentity {
    /// Service name of the webhook
    pub webhook_name: String,
    /// Key pair and CA bundle
    #[serde(rename = "TLS")]
    pub tls: WebhookTls,
}

impl WebhookIdentity {
    /// Identity with no material, for a webhook installed for the first time
    pub fn empty(kind: WebhookKind) -> Self {
        Self {
            webhook_name: kind.service_name().to_string(),
            tls: WebhookTls::default(),
        }
    }

    /// Whether no material was found
    pub fn is_empty(&self) -> bool {
        self.tls.crt_pem.is_empty() && self.tls.key_pem.is_empty()
    }
}

struct SecretLayout {
    name: String,
    key_field: &'static str,
    crt_field: &'static str,
}

impl SecretLayout {
    fn current(kind: WebhookKind) -> Self {
        Self {
            name: kind.secret_name(),
            key_field: "tls.key",
            crt_field: "tls.crt",
        }
    }

    fn legacy(kind: WebhookKind) -> Self {
        Self {
            name: kind.legacy_secret_name(),
            key_field: "key.pem",
            crt_field: "crt.pem",
        }
    }

    fn field(&self, data: &SecretData, field: &str) -> Result<String> {
        data.get(field)
            .filter(|v| !v.is_empty())
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .ok_or_else(|| {
                Error::malformed_secret(format!(
                    "secret {} is missing required field {}",
                    self.name, field
                ))
            })
    }
}

/// Fetches webhook key pairs and injects their registered CA bundles
pub struct WebhookSecretResolver<'a> {
    cluster: &'a dyn ClusterApi,
    namespace: &'a str,
}

impl<'a> WebhookSecretResolver<'a> {
    /// Resolver for webhooks installed in `namespace`
    pub fn new(cluster: &'a dyn ClusterApi, namespace: &'a str) -> Self {
        Self { cluster, namespace }
    }

    /// Resolve the TLS material of `kind`
    ///
    /// Returns `None` when neither secret layout exists.
    #[instrument(skip_all, fields(webhook = %kind))]
    pub async fn resolve(
        &self,
        ctx: &CallContext,
        kind: WebhookKind,
    ) -> Result<Option<WebhookIdentity>> {
        let Some((key_pem, crt_pem)) = self.fetch_key_pair(ctx, kind).await? else {
            debug!("no existing webhook secret");
            return Ok(None);
        };

        let ca_bundle_pem = self.fetch_ca_bundle(ctx, kind, &crt_pem).await?;
        let identity = WebhookIdentity {
            webhook_name: kind.service_name().to_string(),
            tls: WebhookTls {
                key_pem,
                crt_pem,
                ca_bundle_pem,
            },
        };
        self.verify(kind, &identity)?;
        Ok(Some(identity))
    }

    async fn fetch_key_pair(
        &self,
        ctx: &CallContext,
        kind: WebhookKind,
    ) -> Result<Option<(String, String)>> {
        for layout in [SecretLayout::current(kind), SecretLayout::legacy(kind)] {
            let secret = ctx
                .run(
                    &format!("fetch secret {}/{}", self.namespace, layout.name),
                    self.cluster.secret(self.namespace, &layout.name),
                )
                .await?;
            if let Some(data) = secret {
                debug!(secret = %layout.name, "found webhook secret");
                let key = layout.field(&data, layout.key_field)?;
                let crt = layout.field(&data, layout.crt_field)?;
                return Ok(Some((key, crt)));
            }
        }
        Ok(None)
    }

    async fn fetch_ca_bundle(
        &self,
        ctx: &CallContext,
        kind: WebhookKind,
        crt_pem: &str,
    ) -> Result<String> {
        let source = kind.ca_bundle_source();
        let name = kind.registration_name();
        let bundle = ctx
            .run(
                &format!("fetch {} {}", source.registration_kind(), name),
                source.fetch(self.cluster, name),
            )
            .await?;

        match bundle {
            Some(bytes) => String::from_utf8(bytes).map_err(|_| {
                Error::malformed_registration(format!(
                    "{} {} has a CA bundle that is not PEM text",
                    source.registration_kind(),
                    name
                ))
            }),
            None => {
                debug!(registration = name, "webhook not registered; trusting its own certificate");
                Ok(crt_pem.to_string())
            }
        }
    }

    fn verify(&self, kind: WebhookKind, identity: &WebhookIdentity) -> Result<()> {
        let fail = |e: crate::pki::PkiError| Error::webhook_trust(kind.service_name(), e.to_string());
        let pool = CertPool::from_pem(&identity.tls.crt_pem).map_err(fail)?;
        verify_certificate(
            &identity.tls.crt_pem,
            &pool,
            Some(&kind.dns_name(self.namespace)),
            unix_now(),
        )
        .map_err(fail)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ManifestCluster, ManifestObject, MockClusterApi};
    use crate::pki::TrustRoot;
    use crate::testing::secret;
    use k8s_openapi::api::admissionregistration::v1::{
        MutatingWebhook, MutatingWebhookConfiguration, WebhookClientConfig,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;

    fn serving_pair(kind: WebhookKind) -> (String, String) {
        let root = TrustRoot::new("webhook-ca").unwrap();
        let dns_name = kind.dns_name("linkerd");
        root.issue_server_cert(&[dns_name.as_str()]).unwrap()
    }

    fn injector_registration(bundle: &[u8]) -> ManifestObject {
        ManifestObject::MutatingWebhook(MutatingWebhookConfiguration {
            metadata: ObjectMeta {
                name: Some(WebhookKind::ProxyInjector.registration_name().to_string()),
                ..Default::default()
            },
            webhooks: Some(vec![MutatingWebhook {
                name: "linkerd-proxy-injector.linkerd.io".to_string(),
                client_config: WebhookClientConfig {
                    ca_bundle: Some(ByteString(bundle.to_vec())),
                    ..Default::default()
                },
                ..Default::default()
            }]),
        })
    }

    async fn resolve(cluster: &ManifestCluster, kind: WebhookKind) -> Result<Option<WebhookIdentity>> {
        WebhookSecretResolver::new(cluster, "linkerd")
            .resolve(&CallContext::background(), kind)
            .await
    }

    #[test]
    fn kinds_map_to_registrations() {
        assert_eq!(WebhookKind::Tap.secret_name(), "linkerd-tap-k8s-tls");
        assert_eq!(WebhookKind::Tap.legacy_secret_name(), "linkerd-tap-tls");
        assert_eq!(
            WebhookKind::ProfileValidator.ca_bundle_source().registration_kind(),
            "ValidatingWebhookConfiguration"
        );
        assert_eq!(
            WebhookKind::ProxyInjector.dns_name("linkerd"),
            "linkerd-proxy-injector.linkerd.svc"
        );
    }

    #[tokio::test]
    async fn registered_bundle_is_used_verbatim() {
        let kind = WebhookKind::ProxyInjector;
        let (crt, key) = serving_pair(kind);
        let cluster = ManifestCluster::from_objects([
            ManifestObject::Secret(secret(
                "linkerd",
                &kind.secret_name(),
                Some("kubernetes.io/tls"),
                &[("tls.crt", &crt), ("tls.key", &key)],
            )),
            injector_registration(b"REGISTERED BUNDLE"),
        ]);

        let identity = resolve(&cluster, kind).await.unwrap().unwrap();
        assert_eq!(identity.webhook_name, "linkerd-proxy-injector");
        assert_eq!(identity.tls.ca_bundle_pem, "REGISTERED BUNDLE");
        assert_eq!(identity.tls.crt_pem, crt);
        assert_eq!(identity.tls.key_pem, key);
    }

    #[tokio::test]
    async fn unregistered_webhook_trusts_its_own_certificate() {
        let kind = WebhookKind::Tap;
        let (crt, key) = serving_pair(kind);
        let cluster = ManifestCluster::from_objects([ManifestObject::Secret(secret(
            "linkerd",
            &kind.secret_name(),
            None,
            &[("tls.crt", &crt), ("tls.key", &key)],
        ))]);

        let identity = resolve(&cluster, kind).await.unwrap().unwrap();
        assert_eq!(identity.tls.ca_bundle_pem, crt);
    }

    #[tokio::test]
    async fn legacy_layout_is_used_when_current_is_absent() {
        let kind = WebhookKind::ProfileValidator;
        let (crt, key) = serving_pair(kind);
        let cluster = ManifestCluster::from_objects([ManifestObject::Secret(secret(
            "linkerd",
            &kind.legacy_secret_name(),
            None,
            &[("crt.pem", &crt), ("key.pem", &key)],
        ))]);

        let identity = resolve(&cluster, kind).await.unwrap().unwrap();
        assert_eq!(identity.tls.key_pem, key);
    }

    #[tokio::test]
    async fn malformed_current_secret_does_not_fall_back() {
        let kind = WebhookKind::ProfileValidator;
        let (crt, key) = serving_pair(kind);
        let cluster = ManifestCluster::from_objects([
            ManifestObject::Secret(secret(
                "linkerd",
                &kind.secret_name(),
                None,
                &[("tls.crt", &crt)],
            )),
            ManifestObject::Secret(secret(
                "linkerd",
                &kind.legacy_secret_name(),
                None,
                &[("crt.pem", &crt), ("key.pem", &key)],
            )),
        ]);

        let err = resolve(&cluster, kind).await.unwrap_err();
        assert!(matches!(err, Error::MalformedSecret(_)));
        assert!(err.to_string().contains("tls.key"));
    }

    #[tokio::test]
    async fn current_layout_wins_over_legacy() {
        let kind = WebhookKind::Tap;
        let (crt, key) = serving_pair(kind);
        let (old_crt, old_key) = serving_pair(kind);
        let cluster = ManifestCluster::from_objects([
            ManifestObject::Secret(secret(
                "linkerd",
                &kind.secret_name(),
                None,
                &[("tls.crt", &crt), ("tls.key", &key)],
            )),
            ManifestObject::Secret(secret(
                "linkerd",
                &kind.legacy_secret_name(),
                None,
                &[("crt.pem", &old_crt), ("key.pem", &old_key)],
            )),
        ]);

        let identity = resolve(&cluster, kind).await.unwrap().unwrap();
        assert_eq!(identity.tls.crt_pem, crt);
    }

    #[tokio::test]
    async fn missing_secrets_resolve_to_none() {
        let cluster = ManifestCluster::default();
        assert!(resolve(&cluster, WebhookKind::Tap).await.unwrap().is_none());
        assert!(WebhookIdentity::empty(WebhookKind::Tap).is_empty());
    }

    #[tokio::test]
    async fn certificate_for_another_service_is_a_webhook_trust_error() {
        let kind = WebhookKind::Tap;
        let (crt, key) = serving_pair(WebhookKind::ProxyInjector);
        let cluster = ManifestCluster::from_objects([ManifestObject::Secret(secret(
            "linkerd",
            &kind.secret_name(),
            None,
            &[("tls.crt", &crt), ("tls.key", &key)],
        ))]);

        let err = resolve(&cluster, kind).await.unwrap_err();
        assert!(matches!(err, Error::WebhookTrust { .. }));
        assert!(err.to_string().contains("linkerd-tap"));
    }

    #[tokio::test]
    async fn secret_lookup_errors_do_not_fall_back() {
        let mut cluster = MockClusterApi::new();
        cluster
            .expect_secret()
            .times(1)
            .returning(|_, _| Err(Error::validation("forbidden")));

        let err = WebhookSecretResolver::new(&cluster, "linkerd")
            .resolve(&CallContext::background(), WebhookKind::Tap)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
