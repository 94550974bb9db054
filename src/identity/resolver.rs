//! Identity resolution state machine
//!
//! ```text
//! NoIdentity ──► GenerateNew ─────────────────────────┐
//! (start) ─────► ReuseExisting ───────────────────────┤
//!          ├───► RotateFromCluster (new anchors) ─────┼──► Resolved
//!          └───► RotateFromFiles (new issuer) ────────┘
//!                     any step ──► Failed
//! ```
//!
//! Nothing is persisted on failure; the caller receives the error and the
//! configuration it passed in is dropped.

use tracing::{debug, info, instrument, warn};

use super::{
    IdentityOverrides, IssuerCredential, IssuerFiles, IssuerScheme, IssuerSource, TrustContext,
    TrustVerifier,
};
use crate::cluster::ClusterApi;
use crate::config::{format_proto_duration, ControlPlaneConfig, IdentityContext, InstallOptions};
use crate::context::CallContext;
use crate::pki::{CertificateInfo, RootGenerator};
use crate::{Error, Result};

/// Trust context and issuer an upgrade proceeds with
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedIdentity {
    /// Trust context to render
    pub trust: TrustContext,
    /// Issuer to render
    pub issuer: IssuerCredential,
    /// The identity was generated on this run
    pub generated: bool,
    /// The trust anchors were replaced from a file on this run
    pub anchors_rotated: bool,
}

/// States of [`IdentityResolver`]
#[derive(Debug)]
pub enum ResolverState {
    /// The persisted config carries no usable identity
    NoIdentity,
    /// A fresh root and issuer will be generated
    GenerateNew,
    /// The cluster issuer is kept and re-verified
    ReuseExisting {
        /// Effective trust context
        trust: TrustContext,
        /// Persisted issuer scheme
        scheme: IssuerScheme,
    },
    /// The cluster issuer is re-verified against replacement anchors
    RotateFromCluster {
        /// Effective trust context
        trust: TrustContext,
        /// Persisted issuer scheme
        scheme: IssuerScheme,
    },
    /// The issuer is replaced from files
    RotateFromFiles {
        /// Effective trust context
        trust: TrustContext,
        /// Persisted issuer scheme
        scheme: IssuerScheme,
        /// Replacement issuer files
        files: IssuerFiles,
        /// The anchors were also replaced
        anchors_rotated: bool,
    },
    /// Terminal: identity resolved
    Resolved(ResolvedIdentity),
    /// Terminal: resolution failed
    Failed(Error),
}

impl ResolverState {
    fn name(&self) -> &'static str {
        match self {
            ResolverState::NoIdentity => "NoIdentity",
            ResolverState::GenerateNew => "GenerateNew",
            ResolverState::ReuseExisting { .. } => "ReuseExisting",
            ResolverState::RotateFromCluster { .. } => "RotateFromCluster",
            ResolverState::RotateFromFiles { .. } => "RotateFromFiles",
            ResolverState::Resolved(_) => "Resolved",
            ResolverState::Failed(_) => "Failed",
        }
    }
}

impl From<Result<ResolvedIdentity>> for ResolverState {
    fn from(result: Result<ResolvedIdentity>) -> Self {
        match result {
            Ok(identity) => ResolverState::Resolved(identity),
            Err(e) => ResolverState::Failed(e),
        }
    }
}

/// Decides whether identity is generated, reused or rotated
pub struct IdentityResolver<'a> {
    cluster: &'a dyn ClusterApi,
    generator: &'a dyn RootGenerator,
    namespace: &'a str,
    overrides: &'a IdentityOverrides,
    options: &'a InstallOptions,
    verifier: TrustVerifier,
    force: bool,
}

impl<'a> IdentityResolver<'a> {
    /// Resolver that does not tolerate fleet incompatibility
    pub fn new(
        cluster: &'a dyn ClusterApi,
        generator: &'a dyn RootGenerator,
        namespace: &'a str,
        overrides: &'a IdentityOverrides,
        options: &'a InstallOptions,
    ) -> Self {
        Self {
            cluster,
            generator,
            namespace,
            overrides,
            options,
            verifier: TrustVerifier::new(),
            force: false,
        }
    }

    /// Skip fleet verification when rotating the issuer
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Use a specific verifier, e.g. one pinned to a fixed time
    pub fn with_verifier(mut self, verifier: TrustVerifier) -> Self {
        self.verifier = verifier;
        self
    }

    /// Resolve identity for `config`, returning the config updated to match
    #[instrument(skip_all, fields(namespace = %self.namespace))]
    pub async fn resolve(
        &self,
        ctx: &CallContext,
        config: ControlPlaneConfig,
    ) -> Result<(ResolvedIdentity, ControlPlaneConfig)> {
        self.check_overrides(config.identity_context())?;
        let mut state = self.initial_state(config.identity_context());
        loop {
            debug!(state = state.name(), "identity resolution");
            state = match state {
                ResolverState::Resolved(identity) => {
                    let config = apply_identity(config, &identity);
                    return Ok((identity, config));
                }
                ResolverState::Failed(e) => return Err(e),
                other => self.step(ctx, other, config.identity_context()).await,
            };
        }
    }

    /// Reject override combinations the persisted scheme cannot accept
    ///
    /// The scheme is checked before the issuer files are, so a lone file
    /// under an external issuer is a conflict rather than an incomplete pair.
    fn check_overrides(&self, context: Option<&IdentityContext>) -> Result<()> {
        if self.overrides.updates_issuer() {
            let scheme = context
                .map(|c| IssuerScheme::parse(&c.scheme))
                .transpose()?
                .unwrap_or_default();
            if scheme == IssuerScheme::ExternallyManaged {
                return Err(Error::scheme_conflict(format!(
                    "cannot update issuer certificates if you are using an external cert manager; the issuer scheme is {}",
                    scheme
                )));
            }
        }
        self.overrides.validate()
    }

    fn initial_state(&self, context: Option<&IdentityContext>) -> ResolverState {
        match context {
            Some(context) if context.is_complete() => self
                .existing_identity_state(context)
                .unwrap_or_else(ResolverState::Failed),
            _ => ResolverState::NoIdentity,
        }
    }

    fn existing_identity_state(&self, context: &IdentityContext) -> Result<ResolverState> {
        let mut trust = TrustContext::from_identity_context(context)?;
        let scheme = IssuerScheme::parse(&context.scheme)?;
        let files = self.overrides.issuer_files()?;

        let anchors_rotated = match self.overrides.read_trust_anchors()? {
            Some(_) if scheme == IssuerScheme::ExternallyManaged => {
                return Err(Error::scheme_conflict(format!(
                    "cannot update trust anchors when the issuer scheme is {}; they are managed externally",
                    scheme
                )))
            }
            Some(anchors) => {
                trust.trust_anchors_pem = anchors;
                true
            }
            None => false,
        };

        Ok(match (files, anchors_rotated) {
            (Some(files), _) => ResolverState::RotateFromFiles {
                trust,
                scheme,
                files,
                anchors_rotated,
            },
            (None, true) => ResolverState::RotateFromCluster { trust, scheme },
            (None, false) => ResolverState::ReuseExisting { trust, scheme },
        })
    }

    async fn step(
        &self,
        ctx: &CallContext,
        state: ResolverState,
        context: Option<&IdentityContext>,
    ) -> ResolverState {
        match state {
            ResolverState::NoIdentity => {
                if self.overrides.updates_issuer() || self.overrides.trust_anchors_file.is_some() {
                    warn!("no identity recorded in the cluster; ignoring identity file overrides");
                }
                ResolverState::GenerateNew
            }
            ResolverState::GenerateNew => self.generate(context).into(),
            ResolverState::ReuseExisting { trust, scheme } => {
                self.from_cluster(ctx, trust, scheme, false).await.into()
            }
            ResolverState::RotateFromCluster { trust, scheme } => {
                self.from_cluster(ctx, trust, scheme, true).await.into()
            }
            ResolverState::RotateFromFiles {
                trust,
                scheme,
                files,
                anchors_rotated,
            } => self
                .from_files(ctx, trust, scheme, &files, anchors_rotated)
                .await
                .into(),
            terminal => terminal,
        }
    }

    fn generate(&self, context: Option<&IdentityContext>) -> Result<ResolvedIdentity> {
        let trust_domain = context
            .map(|c| c.trust_domain.as_str())
            .filter(|d| !d.is_empty())
            .unwrap_or(self.options.identity_trust_domain.as_str())
            .to_string();
        let generated = self.generator.generate(&trust_domain)?;
        info!(trust_domain = %trust_domain, "generated new trust anchors and issuer");

        let expiry = CertificateInfo::from_pem(&generated.issuer_crt_pem)?.expiry()?;
        Ok(ResolvedIdentity {
            trust: TrustContext {
                trust_domain,
                trust_anchors_pem: generated.trust_anchors_pem.clone(),
                clock_skew_allowance: self.options.identity_clock_skew_allowance,
                issuance_lifetime: self.options.identity_issuance_lifetime,
            },
            issuer: IssuerCredential {
                scheme: IssuerScheme::SelfManaged,
                key_pem: generated.issuer_key_pem,
                crt_pem: generated.issuer_crt_pem,
                ca_bundle_pem: generated.trust_anchors_pem,
                expiry,
            },
            generated: true,
            anchors_rotated: false,
        })
    }

    async fn from_cluster(
        &self,
        ctx: &CallContext,
        trust: TrustContext,
        scheme: IssuerScheme,
        anchors_rotated: bool,
    ) -> Result<ResolvedIdentity> {
        let issuer = IssuerSource::new(self.cluster, self.namespace)
            .load(ctx, &trust.trust_anchors_pem, scheme, None)
            .await?;

        // An external issuer is checked against its own `ca.crt`; the
        // effective anchors are rendered unchanged.
        let anchors = match scheme {
            IssuerScheme::ExternallyManaged => issuer.ca_bundle_pem.as_str(),
            IssuerScheme::SelfManaged => trust.trust_anchors_pem.as_str(),
        };
        self.verifier.verify(&issuer, anchors)?;

        Ok(ResolvedIdentity {
            trust,
            issuer,
            generated: false,
            anchors_rotated,
        })
    }

    async fn from_files(
        &self,
        ctx: &CallContext,
        trust: TrustContext,
        scheme: IssuerScheme,
        files: &IssuerFiles,
        anchors_rotated: bool,
    ) -> Result<ResolvedIdentity> {
        let issuer = IssuerSource::new(self.cluster, self.namespace)
            .load(ctx, &trust.trust_anchors_pem, scheme, Some(files))
            .await?;
        self.verifier.verify(&issuer, &trust.trust_anchors_pem)?;
        self.verifier
            .verify_against_fleet(ctx, &issuer, self.cluster, self.force)
            .await?;
        info!(expiry = %issuer.expiry, "rotating issuer certificate");

        Ok(ResolvedIdentity {
            trust,
            issuer,
            generated: false,
            anchors_rotated,
        })
    }
}

/// Update `config` so it embeds the resolved identity
fn apply_identity(config: ControlPlaneConfig, identity: &ResolvedIdentity) -> ControlPlaneConfig {
    if identity.generated {
        return config.with_identity_context(IdentityContext {
            trust_domain: identity.trust.trust_domain.clone(),
            trust_anchors_pem: identity.trust.trust_anchors_pem.clone(),
            issuance_lifetime: Some(format_proto_duration(identity.trust.issuance_lifetime)),
            clock_skew_allowance: Some(format_proto_duration(identity.trust.clock_skew_allowance)),
            scheme: identity.issuer.scheme.as_str().to_string(),
            ..Default::default()
        });
    }

    let recorded = config
        .identity_context()
        .map(|c| c.trust_anchors_pem.as_str())
        .unwrap_or_default();
    if recorded != identity.trust.trust_anchors_pem {
        debug!("rewriting trust anchors in the persisted config");
        config.with_trust_anchors(&identity.trust.trust_anchors_pem)
    } else {
        config
    }
}
