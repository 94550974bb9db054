//! Mesh identity: trust anchors and the issuer credential
//!
//! [`IdentityResolver`] decides whether an upgrade generates, reuses or
//! rotates the identity material. It obtains issuer credentials through
//! [`IssuerSource`] and checks them with [`TrustVerifier`].

pub mod issuer;
pub mod resolver;
pub mod verifier;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::config::{format_duration, parse_duration, IdentityContext};
use crate::{Error, Result};

pub use issuer::IssuerSource;
pub use resolver::{IdentityResolver, ResolvedIdentity, ResolverState};
pub use verifier::TrustVerifier;

/// Name of the issuer secret in the control-plane namespace
pub const ISSUER_SECRET_NAME: &str = "linkerd-identity-issuer";

/// Default issuance lifetime for workload certificates
pub const DEFAULT_ISSUANCE_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Default clock skew allowance
pub const DEFAULT_CLOCK_SKEW_ALLOWANCE: Duration = Duration::from_secs(20);

/// Who owns the issuer key material
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IssuerScheme {
    /// The control plane owns the issuer secret (`linkerd.io/tls`)
    #[default]
    SelfManaged,
    /// An external controller such as cert-manager owns it (`kubernetes.io/tls`)
    ExternallyManaged,
}

impl IssuerScheme {
    /// Scheme value as persisted in the identity context
    pub fn as_str(&self) -> &'static str {
        match self {
            IssuerScheme::SelfManaged => "linkerd.io/tls",
            IssuerScheme::ExternallyManaged => "kubernetes.io/tls",
        }
    }

    /// Parse a persisted scheme; empty means an install predating schemes
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "" | "linkerd.io/tls" => Ok(IssuerScheme::SelfManaged),
            "kubernetes.io/tls" => Ok(IssuerScheme::ExternallyManaged),
            other => Err(Error::validation(format!(
                "unknown identity issuer scheme '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for IssuerScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for IssuerScheme {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

fn serialize_duration<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&format_duration(*d))
}

/// Trust domain, anchors and issuance timing
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustContext {
    /// Trust domain of workload identities
    pub trust_domain: String,
    /// PEM trust anchors
    #[serde(rename = "trustAnchorsPEM")]
    pub trust_anchors_pem: String,
    /// Allowed clock skew
    #[serde(serialize_with = "serialize_duration")]
    pub clock_skew_allowance: Duration,
    /// Workload certificate lifetime
    #[serde(serialize_with = "serialize_duration")]
    pub issuance_lifetime: Duration,
}

impl TrustContext {
    /// Build from a persisted identity context; unset durations use defaults
    pub fn from_identity_context(context: &IdentityContext) -> Result<Self> {
        let duration_or = |value: &Option<String>, default: Duration| match value.as_deref() {
            None | Some("") => Ok(default),
            Some(s) => parse_duration(s),
        };
        Ok(Self {
            trust_domain: context.trust_domain.clone(),
            trust_anchors_pem: context.trust_anchors_pem.clone(),
            clock_skew_allowance: duration_or(
                &context.clock_skew_allowance,
                DEFAULT_CLOCK_SKEW_ALLOWANCE,
            )?,
            issuance_lifetime: duration_or(&context.issuance_lifetime, DEFAULT_ISSUANCE_LIFETIME)?,
        })
    }
}

/// Issuer certificate and key, plus the anchors bundled with them
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuerCredential {
    /// Who owns the key material
    pub scheme: IssuerScheme,
    /// PEM private key
    #[serde(rename = "keyPEM")]
    pub key_pem: String,
    /// PEM certificate, optionally followed by intermediates
    #[serde(rename = "crtPEM")]
    pub crt_pem: String,
    /// Anchors the issuer is distributed with
    #[serde(rename = "caBundlePEM")]
    pub ca_bundle_pem: String,
    /// `NotAfter` of the issuer certificate
    pub expiry: DateTime<Utc>,
}

/// Identity material supplied through local files
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdentityOverrides {
    /// Replacement trust anchors
    pub trust_anchors_file: Option<PathBuf>,
    /// Replacement issuer certificate
    pub issuer_crt_file: Option<PathBuf>,
    /// Replacement issuer key
    pub issuer_key_file: Option<PathBuf>,
}

/// Issuer certificate and key file pair
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuerFiles {
    /// Certificate path
    pub crt: PathBuf,
    /// Private key path
    pub key: PathBuf,
}

impl IdentityOverrides {
    /// Check that the issuer files come as a pair and every file exists
    pub fn validate(&self) -> Result<()> {
        self.issuer_files()?;
        for path in [
            &self.trust_anchors_file,
            &self.issuer_crt_file,
            &self.issuer_key_file,
        ]
        .into_iter()
        .flatten()
        {
            std::fs::metadata(path).map_err(|e| {
                std::io::Error::new(e.kind(), format!("{}: {}", path.display(), e))
            })?;
        }
        Ok(())
    }

    /// The issuer file pair, if supplied; one file alone is an error
    pub fn issuer_files(&self) -> Result<Option<IssuerFiles>> {
        match (&self.issuer_crt_file, &self.issuer_key_file) {
            (Some(crt), Some(key)) => Ok(Some(IssuerFiles {
                crt: crt.clone(),
                key: key.clone(),
            })),
            (None, None) => Ok(None),
            _ => Err(Error::incomplete_override(
                "a private key file and a certificate file must be specified together",
            )),
        }
    }

    /// Whether the issuer is being rotated from files
    pub fn updates_issuer(&self) -> bool {
        self.issuer_crt_file.is_some() || self.issuer_key_file.is_some()
    }

    /// Read the replacement trust anchors, if supplied
    pub fn read_trust_anchors(&self) -> Result<Option<String>> {
        self.trust_anchors_file
            .as_ref()
            .map(|path| std::fs::read_to_string(path).map_err(Error::from))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_scheme_means_self_managed() {
        assert_eq!(IssuerScheme::parse("").unwrap(), IssuerScheme::SelfManaged);
        assert_eq!(
            IssuerScheme::parse("kubernetes.io/tls").unwrap(),
            IssuerScheme::ExternallyManaged
        );
        assert!(IssuerScheme::parse("vault").is_err());
        assert_eq!(IssuerScheme::ExternallyManaged.to_string(), "kubernetes.io/tls");
    }

    #[test]
    fn lone_issuer_file_is_incomplete() {
        let overrides = IdentityOverrides {
            issuer_crt_file: Some(PathBuf::from("issuer.crt")),
            ..Default::default()
        };
        assert!(matches!(
            overrides.validate(),
            Err(Error::IncompleteOverride(_))
        ));
        assert!(overrides.updates_issuer());
    }

    #[test]
    fn missing_override_file_is_io() {
        let dir = tempfile::tempdir().unwrap();
        let overrides = IdentityOverrides {
            trust_anchors_file: Some(dir.path().join("ca.crt")),
            ..Default::default()
        };
        let err = overrides.validate().unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("ca.crt"));
    }

    #[test]
    fn complete_overrides_validate() {
        let dir = tempfile::tempdir().unwrap();
        let crt = dir.path().join("issuer.crt");
        let key = dir.path().join("issuer.key");
        std::fs::write(&crt, "CRT").unwrap();
        std::fs::write(&key, "KEY").unwrap();

        let overrides = IdentityOverrides {
            issuer_crt_file: Some(crt.clone()),
            issuer_key_file: Some(key.clone()),
            ..Default::default()
        };
        overrides.validate().unwrap();
        assert_eq!(
            overrides.issuer_files().unwrap(),
            Some(IssuerFiles { crt, key })
        );
        assert_eq!(overrides.read_trust_anchors().unwrap(), None);
    }

    #[test]
    fn trust_context_reads_persisted_durations() {
        let context = IdentityContext {
            trust_domain: "cluster.local".to_string(),
            trust_anchors_pem: "PEM".to_string(),
            issuance_lifetime: Some("86400s".to_string()),
            clock_skew_allowance: None,
            ..Default::default()
        };
        let trust = TrustContext::from_identity_context(&context).unwrap();
        assert_eq!(trust.issuance_lifetime, Duration::from_secs(86400));
        assert_eq!(trust.clock_skew_allowance, DEFAULT_CLOCK_SKEW_ALLOWANCE);
    }
}
