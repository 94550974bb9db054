//! mesh-upgrade - identity and trust-anchor reconciliation for mesh control-plane upgrades
//!
//! Upgrading a running control plane must not silently break proxies that are
//! already running. This crate computes everything an upgrade renders from
//! the state of the cluster: the persisted configuration, the identity trust
//! anchors and issuer, and the webhook TLS material.
//!
//! # Flow
//!
//! ```text
//! ConfigReconciler ──► IdentityResolver ──► WebhookSecretResolver (x3) ──► UpgradeBundle
//!                      (IssuerSource,
//!                       TrustVerifier)
//! ```
//!
//! Nothing here writes to the cluster. All cluster reads go through the
//! [`cluster::ClusterApi`] trait and are bounded by a [`context::CallContext`].
//!
//! # Modules
//!
//! - [`cluster`] - Read-only cluster access (live or from manifests)
//! - [`config`] - Persisted configuration, repair and flag reconciliation
//! - [`context`] - Cancellation and deadlines for cluster calls
//! - [`identity`] - Trust anchors, issuer loading, verification and resolution
//! - [`webhook`] - Webhook key pairs and registered CA bundles
//! - [`upgrade`] - Orchestration into an [`upgrade::UpgradeBundle`]
//! - [`pki`] - Certificate decoding, verification and generation
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod cluster;
pub mod config;
pub mod context;
pub mod error;
pub mod identity;
pub mod pki;
pub mod upgrade;
pub mod webhook;

#[cfg(test)]
pub(crate) mod testing;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default control-plane namespace
pub const DEFAULT_NAMESPACE: &str = "linkerd";

/// Version of this tool, stamped into upgraded configuration
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
