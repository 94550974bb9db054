//! Configuration reconciliation
//!
//! Persisted config, recorded flags and this invocation's flags are merged
//! into one [`ReconciledConfig`]. Fetching is separate from merging so the
//! merge can be tested without a cluster.

use tracing::{debug, instrument};

use super::{
    ControlPlaneConfig, Defaults, FlagSet, InstallOptions, PersistedConfig, CONFIG_MAP_NAME,
};
use crate::cluster::ClusterApi;
use crate::context::CallContext;
use crate::{Error, Result};

/// Output of configuration reconciliation
#[derive(Clone, Debug)]
pub struct ReconciledConfig {
    /// Repaired configuration with the install options layered on top
    pub config: ControlPlaneConfig,
    /// Final flag set, recorded values re-applied
    pub flags: FlagSet,
    /// Typed view of `flags`
    pub options: InstallOptions,
}

/// Fetches and merges the persisted control-plane configuration
pub struct ConfigReconciler<'a> {
    cluster: &'a dyn ClusterApi,
    defaults: &'a Defaults,
}

impl<'a> ConfigReconciler<'a> {
    /// Reconciler reading from `cluster`
    pub fn new(cluster: &'a dyn ClusterApi, defaults: &'a Defaults) -> Self {
        Self { cluster, defaults }
    }

    /// Read the persisted configuration from the configured namespace
    ///
    /// A missing or unreadable config map is fatal.
    pub async fn fetch(&self, ctx: &CallContext) -> Result<PersistedConfig> {
        let namespace = self.defaults.namespace.as_str();
        let data = ctx
            .run(
                &format!("fetch configmap {}/{}", namespace, CONFIG_MAP_NAME),
                self.cluster.config_map(namespace, CONFIG_MAP_NAME),
            )
            .await
            .map_err(|e| match e {
                Error::Kube(err) => Error::config_fetch(err.to_string()),
                other => other,
            })?
            .ok_or_else(|| {
                Error::config_fetch(format!(
                    "configmaps \"{}\" not found in namespace {}",
                    CONFIG_MAP_NAME, namespace
                ))
            })?;
        PersistedConfig::from_config_map_data(&data)
    }

    /// Fetch, then [`merge`] with this invocation's flags
    #[instrument(skip_all, fields(namespace = %self.defaults.namespace))]
    pub async fn reconcile(&self, ctx: &CallContext, flags: FlagSet) -> Result<ReconciledConfig> {
        let persisted = self.fetch(ctx).await?;
        merge(persisted, flags, self.defaults)
    }
}

/// Repair `persisted`, re-apply its recorded flags and layer the result
pub fn merge(
    persisted: PersistedConfig,
    mut flags: FlagSet,
    defaults: &Defaults,
) -> Result<ReconciledConfig> {
    let config = ControlPlaneConfig::repair(persisted, defaults);

    flags.apply_recorded(&config.install.flags);
    let recorded = flags.record();
    debug!(count = recorded.len(), "recorded install flags");

    let options = InstallOptions::from_flags(&flags)?;
    let config = options.apply(config, recorded);
    Ok(ReconciledConfig {
        config,
        flags,
        options,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ManifestCluster, ManifestObject, MockClusterApi};
    use crate::config::flags::{
        CONTROLLER_REPLICAS, IDENTITY_ISSUANCE_LIFETIME, PROXY_LOG_LEVEL, SKIP_INBOUND_PORTS,
    };
    use crate::config::{InstallConfig, InstallFlag};
    use crate::testing::config_map;

    fn defaults() -> Defaults {
        Defaults {
            version: "stable-2.9.0".to_string(),
            ..Defaults::default()
        }
    }

    fn persisted_with(flags: Vec<InstallFlag>) -> PersistedConfig {
        PersistedConfig {
            install: Some(InstallConfig {
                cli_version: "stable-2.8.1".to_string(),
                flags,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn reconciliation_is_idempotent() {
        let defaults = defaults();
        let recorded = vec![
            InstallFlag::new(CONTROLLER_REPLICAS, "3"),
            InstallFlag::new(SKIP_INBOUND_PORTS, "[25,587]"),
        ];

        let first = merge(
            persisted_with(recorded.clone()),
            FlagSet::recordable(&defaults.version),
            &defaults,
        )
        .unwrap();
        let second = merge(
            persisted_with(first.config.install.flags.clone()),
            FlagSet::recordable(&defaults.version),
            &defaults,
        )
        .unwrap();

        assert_eq!(first.config.install.flags, recorded);
        assert_eq!(second.config.install.flags, first.config.install.flags);
        assert_eq!(second.options, first.options);
    }

    #[test]
    fn overflowing_recorded_duration_is_skipped() {
        let defaults = defaults();
        let merged = merge(
            persisted_with(vec![
                InstallFlag::new(IDENTITY_ISSUANCE_LIFETIME, "99999999999999999999h"),
                InstallFlag::new(CONTROLLER_REPLICAS, "3"),
            ]),
            FlagSet::recordable(&defaults.version),
            &defaults,
        )
        .unwrap();

        assert_eq!(
            merged.config.install.flags,
            vec![InstallFlag::new(CONTROLLER_REPLICAS, "3")]
        );
    }

    #[test]
    fn explicit_override_wins_and_is_re_recorded() {
        let defaults = defaults();
        let mut flags = FlagSet::recordable(&defaults.version);
        flags.set(PROXY_LOG_LEVEL, "debug").unwrap();

        let merged = merge(
            persisted_with(vec![InstallFlag::new(PROXY_LOG_LEVEL, "warn")]),
            flags,
            &defaults,
        )
        .unwrap();

        assert_eq!(
            merged.config.install.flags,
            vec![InstallFlag::new(PROXY_LOG_LEVEL, "debug")]
        );
        assert_eq!(merged.options.proxy_log_level, "debug");
        assert_eq!(merged.config.proxy.log_level.unwrap().level, "debug");
        assert_eq!(merged.config.install.cli_version, "stable-2.9.0");
    }

    #[tokio::test]
    async fn fetch_reads_the_config_map() {
        let cluster = ManifestCluster::from_objects([ManifestObject::ConfigMap(config_map(
            "linkerd",
            CONFIG_MAP_NAME,
            &[("install", r#"{"flags":[{"name":"ha","value":"true"}]}"#)],
        ))]);
        let defaults = defaults();

        let reconciled = ConfigReconciler::new(&cluster, &defaults)
            .reconcile(&CallContext::background(), FlagSet::recordable("v"))
            .await
            .unwrap();
        assert!(reconciled.options.high_availability);
    }

    #[tokio::test]
    async fn missing_config_map_is_a_config_fetch_error() {
        let cluster = ManifestCluster::default();
        let defaults = defaults();

        let err = ConfigReconciler::new(&cluster, &defaults)
            .fetch(&CallContext::background())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConfigFetch(_)));
        assert!(err.to_string().contains("linkerd-config"));
    }

    #[tokio::test]
    async fn api_failure_is_a_config_fetch_error() {
        let mut cluster = MockClusterApi::new();
        cluster.expect_config_map().returning(|_, _| {
            Err(Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: "forbidden".to_string(),
                reason: "Forbidden".to_string(),
                code: 403,
            })))
        });
        let defaults = defaults();

        let err = ConfigReconciler::new(&cluster, &defaults)
            .fetch(&CallContext::background())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConfigFetch(_)));
    }
}
