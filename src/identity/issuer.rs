//! Loading the issuer credential from files or the cluster

use tracing::{debug, info};

use super::{IssuerCredential, IssuerFiles, IssuerScheme, ISSUER_SECRET_NAME};
use crate::cluster::{ClusterApi, SecretData};
use crate::context::CallContext;
use crate::pki::CertificateInfo;
use crate::{Error, Result};

const SELF_MANAGED_CRT_KEY: &str = "crt.pem";
const SELF_MANAGED_KEY_KEY: &str = "key.pem";
const EXTERNAL_CRT_KEY: &str = "tls.crt";
const EXTERNAL_KEY_KEY: &str = "tls.key";
const EXTERNAL_CA_KEY: &str = "ca.crt";

/// Reads issuer material and normalizes it into an [`IssuerCredential`]
pub struct IssuerSource<'a> {
    cluster: &'a dyn ClusterApi,
    namespace: &'a str,
}

impl<'a> IssuerSource<'a> {
    /// Source reading issuer secrets from `namespace`
    pub fn new(cluster: &'a dyn ClusterApi, namespace: &'a str) -> Self {
        Self { cluster, namespace }
    }

    /// Load the issuer for `scheme`
    ///
    /// With `files` the credential comes from disk and is self-managed. An
    /// externally managed scheme never accepts files.
    pub async fn load(
        &self,
        ctx: &CallContext,
        trust_anchors_pem: &str,
        scheme: IssuerScheme,
        files: Option<&IssuerFiles>,
    ) -> Result<IssuerCredential> {
        match (scheme, files) {
            (IssuerScheme::ExternallyManaged, Some(_)) => Err(Error::scheme_conflict(format!(
                "cannot update issuer certificates if you are using an external cert manager; the issuer scheme is {}",
                scheme
            ))),
            (_, Some(files)) => load_from_files(files, trust_anchors_pem),
            (IssuerScheme::ExternallyManaged, None) => self.fetch_external(ctx).await,
            (IssuerScheme::SelfManaged, None) => {
                self.fetch_self_managed(ctx, trust_anchors_pem).await
            }
        }
    }

    async fn fetch_secret(&self, ctx: &CallContext) -> Result<SecretData> {
        ctx.run(
            &format!("fetch secret {}/{}", self.namespace, ISSUER_SECRET_NAME),
            self.cluster.secret(self.namespace, ISSUER_SECRET_NAME),
        )
        .await
        .map_err(|e| match e {
            Error::Kube(err) => Error::issuer_fetch(err.to_string()),
            other => other,
        })?
        .ok_or_else(|| {
            Error::issuer_fetch(format!(
                "secrets \"{}\" not found in namespace {}",
                ISSUER_SECRET_NAME, self.namespace
            ))
        })
    }

    async fn fetch_external(&self, ctx: &CallContext) -> Result<IssuerCredential> {
        let data = self.fetch_secret(ctx).await?;
        let crt_pem = required(&data, EXTERNAL_CRT_KEY)?;
        let key_pem = required(&data, EXTERNAL_KEY_KEY)?;
        let ca_bundle_pem = required(&data, EXTERNAL_CA_KEY)?;
        info!(scheme = %IssuerScheme::ExternallyManaged, "using externally managed issuer");
        credential(IssuerScheme::ExternallyManaged, key_pem, crt_pem, ca_bundle_pem)
    }

    async fn fetch_self_managed(
        &self,
        ctx: &CallContext,
        trust_anchors_pem: &str,
    ) -> Result<IssuerCredential> {
        let data = self.fetch_secret(ctx).await?;
        let crt_pem = required(&data, SELF_MANAGED_CRT_KEY)?;
        let key_pem = required(&data, SELF_MANAGED_KEY_KEY)?;

        // Cached anchors in the secret are never authoritative.
        if let Some(cached) = optional(&data, EXTERNAL_CA_KEY) {
            if cached.trim() != trust_anchors_pem.trim() {
                debug!("replacing cached issuer anchors with effective trust anchors");
            }
        }
        credential(
            IssuerScheme::SelfManaged,
            key_pem,
            crt_pem,
            trust_anchors_pem.to_string(),
        )
    }
}

/// Load a self-managed issuer from a certificate and key file pair
pub fn load_from_files(files: &IssuerFiles, trust_anchors_pem: &str) -> Result<IssuerCredential> {
    let crt_pem = std::fs::read_to_string(&files.crt)?;
    let key_pem = std::fs::read_to_string(&files.key)?;
    debug!(crt = %files.crt.display(), "loaded issuer from files");
    credential(
        IssuerScheme::SelfManaged,
        key_pem,
        crt_pem,
        trust_anchors_pem.to_string(),
    )
}

fn credential(
    scheme: IssuerScheme,
    key_pem: String,
    crt_pem: String,
    ca_bundle_pem: String,
) -> Result<IssuerCredential> {
    let expiry = CertificateInfo::from_pem(&crt_pem)
        .and_then(|info| info.expiry())
        .map_err(|e| Error::trust_chain(format!("failed to decode issuer certificate: {}", e)))?;
    Ok(IssuerCredential {
        scheme,
        key_pem,
        crt_pem,
        ca_bundle_pem,
        expiry,
    })
}

fn optional(data: &SecretData, key: &str) -> Option<String> {
    data.get(key)
        .filter(|v| !v.is_empty())
        .map(|v| String::from_utf8_lossy(v).into_owned())
}

fn required(data: &SecretData, key: &str) -> Result<String> {
    optional(data, key).ok_or_else(|| {
        Error::malformed_secret(format!(
            "secret {} is missing required field {}",
            ISSUER_SECRET_NAME, key
        ))
    })
}
