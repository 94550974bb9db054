//! Issuer verification against anchors and against the running fleet

use tracing::{debug, instrument, warn};

use super::IssuerCredential;
use crate::cluster::ClusterApi;
use crate::context::CallContext;
use crate::error::{FleetReport, WorkloadRef};
use crate::pki::{unix_now, verify_certificate, verify_key_matches, CertPool};
use crate::{Error, Result};

/// Checks that an issuer credential is usable with a set of trust anchors
#[derive(Clone, Copy, Debug, Default)]
pub struct TrustVerifier {
    now: Option<i64>,
}

impl TrustVerifier {
    /// Verifier using the wall clock
    pub fn new() -> Self {
        Self::default()
    }

    /// Verify as of a fixed Unix time instead of the wall clock
    pub fn at(now: i64) -> Self {
        Self { now: Some(now) }
    }

    fn now(&self) -> i64 {
        self.now.unwrap_or_else(unix_now)
    }

    /// Check the issuer chains to `anchors_pem` and its key matches
    ///
    /// No identity constraint is applied; only the chain is checked.
    pub fn verify(&self, credential: &IssuerCredential, anchors_pem: &str) -> Result<()> {
        let pool =
            CertPool::from_pem(anchors_pem).map_err(|e| Error::trust_chain(e.to_string()))?;
        verify_certificate(&credential.crt_pem, &pool, None, self.now())
            .map_err(|e| Error::trust_chain(e.to_string()))?;
        verify_key_matches(&credential.crt_pem, &credential.key_pem)
            .map_err(|e| Error::trust_chain(e.to_string()))?;
        Ok(())
    }

    /// Check the issuer against the anchors of every live meshed proxy
    ///
    /// Every offending workload is collected before failing. With `force`
    /// the check is skipped and no pod is listed.
    #[instrument(skip_all, fields(force = force))]
    pub async fn verify_against_fleet(
        &self,
        ctx: &CallContext,
        credential: &IssuerCredential,
        cluster: &dyn ClusterApi,
        force: bool,
    ) -> Result<()> {
        if force {
            warn!("skipping verification of the new issuer against meshed proxies");
            return Ok(());
        }

        let proxies = ctx.run("list meshed pods", cluster.meshed_proxies()).await?;
        let now = self.now();

        let workloads: Vec<WorkloadRef> = proxies
            .iter()
            .filter(|proxy| {
                let accepted = CertPool::from_pem(&proxy.anchors_pem)
                    .and_then(|pool| verify_certificate(&credential.crt_pem, &pool, None, now));
                if let Err(e) = &accepted {
                    debug!(namespace = %proxy.namespace, name = %proxy.name, error = %e, "proxy rejects issuer");
                }
                accepted.is_err()
            })
            .map(|proxy| WorkloadRef::new(&proxy.namespace, &proxy.name))
            .collect();

        debug!(
            checked = proxies.len(),
            offending = workloads.len(),
            "verified issuer against meshed proxies"
        );
        if workloads.is_empty() {
            Ok(())
        } else {
            Err(Error::FleetIncompatibility(FleetReport { workloads }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ManifestCluster, ManifestObject, MockClusterApi};
    use crate::identity::issuer::load_from_files;
    use crate::identity::{IssuerFiles, IssuerScheme};
    use crate::pki::{parse_pem, CertificateInfo, TrustRoot};
    use crate::testing::meshed_pod;

    fn credential(root: &TrustRoot) -> IssuerCredential {
        let (crt_pem, key_pem) = root
            .issue_intermediate("identity.linkerd.cluster.local")
            .unwrap();
        IssuerCredential {
            scheme: IssuerScheme::SelfManaged,
            expiry: CertificateInfo::from_pem(&crt_pem)
                .unwrap()
                .expiry()
                .unwrap(),
            key_pem,
            crt_pem,
            ca_bundle_pem: root.cert_pem().to_string(),
        }
    }

    #[test]
    fn issuer_verifies_against_its_root() {
        let root = TrustRoot::new("root").unwrap();
        let cred = credential(&root);
        TrustVerifier::new().verify(&cred, root.cert_pem()).unwrap();
    }

    #[test]
    fn issuer_from_another_root_is_a_trust_chain_error() {
        let root = TrustRoot::new("root").unwrap();
        let other = TrustRoot::new("root").unwrap();
        let err = TrustVerifier::new()
            .verify(&credential(&root), other.cert_pem())
            .unwrap_err();
        assert!(matches!(err, Error::TrustChain(_)));
    }

    #[test]
    fn mismatched_key_is_a_trust_chain_error() {
        let root = TrustRoot::new("root").unwrap();
        let mut cred = credential(&root);
        cred.key_pem = credential(&root).key_pem;
        let err = TrustVerifier::new()
            .verify(&cred, root.cert_pem())
            .unwrap_err();
        assert!(matches!(err, Error::TrustChain(_)));
    }

    #[test]
    fn expired_issuer_is_rejected_at_a_later_time() {
        let root = TrustRoot::new("root").unwrap();
        let cred = credential(&root);
        let later = cred.expiry.timestamp() + 1;
        assert!(TrustVerifier::at(later).verify(&cred, root.cert_pem()).is_err());
    }

    #[test]
    fn file_loaded_issuer_verifies() {
        let root = TrustRoot::new("root").unwrap();
        let cred = credential(&root);
        let dir = tempfile::tempdir().unwrap();
        let files = IssuerFiles {
            crt: dir.path().join("crt"),
            key: dir.path().join("key"),
        };
        std::fs::write(&files.crt, &cred.crt_pem).unwrap();
        std::fs::write(&files.key, &cred.key_pem).unwrap();

        let loaded = load_from_files(&files, root.cert_pem()).unwrap();
        TrustVerifier::new().verify(&loaded, root.cert_pem()).unwrap();
        assert!(!parse_pem(&loaded.crt_pem).unwrap().is_empty());
    }

    /// Story: rotating to an issuer from a new root breaks proxies that
    /// still trust the old root
    ///
    /// Every such proxy is listed, not just the first. A proxy without
    /// anchors is reported too.
    #[tokio::test]
    async fn story_fleet_check_lists_every_offending_workload() {
        let old_root = TrustRoot::new("root").unwrap();
        let new_root = TrustRoot::new("root").unwrap();
        let cluster = ManifestCluster::from_objects([
            ManifestObject::Pod(meshed_pod("emojivoto", "web", Some(new_root.cert_pem()))),
            ManifestObject::Pod(meshed_pod("emojivoto", "voting", Some(old_root.cert_pem()))),
            ManifestObject::Pod(meshed_pod("booksapp", "authors", None)),
        ]);
        let cred = credential(&new_root);

        let err = TrustVerifier::new()
            .verify_against_fleet(&CallContext::background(), &cred, &cluster, false)
            .await
            .unwrap_err();

        let report = err.fleet_report().unwrap();
        assert_eq!(
            report.workloads,
            vec![
                WorkloadRef::new("emojivoto", "voting"),
                WorkloadRef::new("booksapp", "authors"),
            ]
        );
    }

    #[tokio::test]
    async fn force_skips_the_fleet_check() {
        let root = TrustRoot::new("root").unwrap();
        let mut cluster = MockClusterApi::new();
        cluster.expect_meshed_proxies().times(0);

        TrustVerifier::new()
            .verify_against_fleet(&CallContext::background(), &credential(&root), &cluster, true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cancellation_is_not_swallowed_by_the_fleet_check() {
        let root = TrustRoot::new("root").unwrap();
        let cluster = ManifestCluster::default();
        let ctx = CallContext::background();
        ctx.cancel();

        let err = TrustVerifier::new()
            .verify_against_fleet(&ctx, &credential(&root), &cluster, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ContextCanceled { .. }));
    }

    #[tokio::test]
    async fn pod_listing_failure_propagates_without_force() {
        let root = TrustRoot::new("root").unwrap();
        let mut cluster = MockClusterApi::new();
        cluster
            .expect_meshed_proxies()
            .returning(|| Err(Error::validation("list failed")));

        let err = TrustVerifier::new()
            .verify_against_fleet(&CallContext::background(), &credential(&root), &cluster, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
