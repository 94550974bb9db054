//! Upgrade orchestration
//!
//! Composes configuration reconciliation, identity resolution and webhook
//! TLS resolution into one [`UpgradeBundle`]. Identity is resolved before the
//! bundle is assembled because the persisted config embeds the final
//! anchors. If any stage fails nothing is returned.

use std::collections::BTreeMap;
use std::fmt;

use futures::future::try_join_all;
use serde::{Serialize, Serializer};
use tracing::{info, instrument};

use crate::cluster::ClusterApi;
use crate::config::{ConfigReconciler, Defaults, FlagSet, InstallFlag, InstallOptions};
use crate::context::CallContext;
use crate::identity::{IdentityOverrides, IdentityResolver, IssuerCredential, TrustContext};
use crate::pki::RootGenerator;
use crate::webhook::{WebhookIdentity, WebhookKind, WebhookSecretResolver};
use crate::{Error, Result};

/// Part of the control plane an upgrade renders
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Stage {
    /// Cluster-scoped resources requiring elevated privileges
    Config,
    /// Namespaced control-plane resources
    ControlPlane,
    /// Both
    #[default]
    Full,
}

impl Stage {
    /// Stage name as used on the command line; empty for [`Stage::Full`]
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Config => "config",
            Stage::ControlPlane => "control-plane",
            Stage::Full => "",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Stage {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

/// Options of one upgrade invocation that are not recordable flags
#[derive(Clone, Debug, Default)]
pub struct UpgradeOptions {
    /// Skip the fleet check on issuer rotation
    pub force: bool,
    /// Passed through to the add-on config merge
    pub addon_overwrite: bool,
    /// Identity material supplied through files
    pub overrides: IdentityOverrides,
    /// Stage to render
    pub stage: Stage,
}

/// Everything the renderer needs to produce upgraded manifests
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeBundle {
    /// Stage the bundle was built for
    pub stage: Stage,
    /// Resolved trust context
    pub trust: TrustContext,
    /// Resolved issuer credential
    pub issuer: IssuerCredential,
    /// Webhook TLS material, one entry per [`WebhookKind`] in order
    pub webhooks: Vec<WebhookIdentity>,
    /// Flags to record for the next upgrade
    pub recorded_flags: Vec<InstallFlag>,
    /// Typed install options
    pub options: InstallOptions,
    /// `linkerd-config` ConfigMap payload
    pub config: BTreeMap<String, String>,
    /// Whether add-on config overwrites the existing one
    pub addon_overwrite: bool,
    /// Whether the trust anchors were replaced on this run
    pub anchors_rotated: bool,
}

impl UpgradeBundle {
    /// Render as YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| Error::serialization(format!("failed to encode upgrade bundle: {}", e)))
    }
}

/// One upgrade computation against a cluster
pub struct Upgrade<'a> {
    cluster: &'a dyn ClusterApi,
    generator: &'a dyn RootGenerator,
    defaults: Defaults,
    options: UpgradeOptions,
}

impl<'a> Upgrade<'a> {
    /// Upgrade of the mesh found in `cluster`
    pub fn new(
        cluster: &'a dyn ClusterApi,
        generator: &'a dyn RootGenerator,
        defaults: Defaults,
        options: UpgradeOptions,
    ) -> Self {
        Self {
            cluster,
            generator,
            defaults,
            options,
        }
    }

    /// Validate inputs and build the bundle
    #[instrument(skip_all, fields(stage = %self.options.stage, namespace = %self.defaults.namespace))]
    pub async fn validate_and_build(&self, ctx: &CallContext, flags: FlagSet) -> Result<UpgradeBundle> {
        let reconciled = ConfigReconciler::new(self.cluster, &self.defaults)
            .reconcile(ctx, flags)
            .await?;

        let (identity, config) = IdentityResolver::new(
            self.cluster,
            self.generator,
            &self.defaults.namespace,
            &self.options.overrides,
            &reconciled.options,
        )
        .force(self.options.force)
        .resolve(ctx, reconciled.config)
        .await?;

        let webhooks = self.resolve_webhooks(ctx).await?;
        let config_data = config.to_config_map_data()?;

        info!(
            trust_domain = %identity.trust.trust_domain,
            scheme = %identity.issuer.scheme,
            generated = identity.generated,
            "upgrade bundle built"
        );
        Ok(UpgradeBundle {
            stage: self.options.stage,
            trust: identity.trust,
            issuer: identity.issuer,
            webhooks,
            recorded_flags: config.install.flags,
            options: reconciled.options,
            config: config_data,
            addon_overwrite: self.options.addon_overwrite,
            anchors_rotated: identity.anchors_rotated,
        })
    }

    async fn resolve_webhooks(&self, ctx: &CallContext) -> Result<Vec<WebhookIdentity>> {
        let resolver = WebhookSecretResolver::new(self.cluster, &self.defaults.namespace);
        try_join_all(WebhookKind::ALL.into_iter().map(|kind| {
            let resolver = &resolver;
            async move {
                resolver
                    .resolve(ctx, kind)
                    .await
                    .map(|found| found.unwrap_or_else(|| WebhookIdentity::empty(kind)))
            }
        }))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ManifestCluster, ManifestObject};
    use crate::config::CONFIG_MAP_NAME;
    use crate::pki::RcgenRootGenerator;
    use crate::testing::config_map;

    fn defaults() -> Defaults {
        Defaults {
            version: "stable-2.9.0".to_string(),
            ..Defaults::default()
        }
    }

    #[test]
    fn stage_names() {
        assert_eq!(Stage::Config.to_string(), "config");
        assert_eq!(Stage::ControlPlane.to_string(), "control-plane");
        assert_eq!(Stage::Full.to_string(), "");
    }

    #[tokio::test]
    async fn pre_identity_install_gets_a_generated_identity() {
        let cluster = ManifestCluster::from_objects([ManifestObject::ConfigMap(config_map(
            "linkerd",
            CONFIG_MAP_NAME,
            &[("global", r#"{"linkerdNamespace":"linkerd","version":"stable-2.2.0"}"#)],
        ))]);
        let generator = RcgenRootGenerator::new("linkerd");
        let upgrade = Upgrade::new(
            &cluster,
            &generator,
            defaults(),
            UpgradeOptions {
                stage: Stage::Config,
                addon_overwrite: true,
                ..Default::default()
            },
        );

        let bundle = upgrade
            .validate_and_build(&CallContext::background(), FlagSet::recordable("stable-2.9.0"))
            .await
            .unwrap();

        assert_eq!(bundle.stage, Stage::Config);
        assert!(bundle.addon_overwrite);
        assert_eq!(bundle.webhooks.len(), 3);
        assert!(bundle.webhooks.iter().all(WebhookIdentity::is_empty));
        assert_eq!(bundle.webhooks[2].webhook_name, "linkerd-tap");
        assert!(bundle.config["global"].contains(&serde_json::to_string(&bundle.trust.trust_anchors_pem).unwrap()));

        let yaml = bundle.to_yaml().unwrap();
        assert!(yaml.contains("stage: config"));
        assert!(yaml.contains("addonOverwrite: true"));
    }

    #[tokio::test]
    async fn lone_issuer_file_is_judged_against_the_persisted_scheme() {
        let cluster = ManifestCluster::from_objects([ManifestObject::ConfigMap(config_map(
            "linkerd",
            CONFIG_MAP_NAME,
            &[(
                "global",
                r#"{"linkerdNamespace":"linkerd","identityContext":{"trustDomain":"cluster.local","trustAnchorsPem":"anchors","scheme":"kubernetes.io/tls"}}"#,
            )],
        ))]);
        let generator = RcgenRootGenerator::new("linkerd");
        let upgrade = Upgrade::new(
            &cluster,
            &generator,
            defaults(),
            UpgradeOptions {
                overrides: IdentityOverrides {
                    issuer_key_file: Some("issuer.key".into()),
                    ..Default::default()
                },
                ..Default::default()
            },
        );

        let err = upgrade
            .validate_and_build(&CallContext::background(), FlagSet::recordable("v"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SchemeConflict(_)));
    }

    #[tokio::test]
    async fn cancelled_context_fails_the_upgrade() {
        let cluster = ManifestCluster::default();
        let generator = RcgenRootGenerator::new("linkerd");
        let ctx = CallContext::background();
        ctx.cancel();

        let err = Upgrade::new(&cluster, &generator, defaults(), UpgradeOptions::default())
            .validate_and_build(&ctx, FlagSet::recordable("v"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ContextCanceled { .. }));
    }
}
