//! Error types for mesh upgrades
//!
//! Every core operation returns [`Error`]. Not-found conditions never appear
//! here: cluster lookups return `Option` and the caller applies its fallback.

use std::fmt;

use thiserror::Error;

use crate::pki::PkiError;

/// Reference printed alongside any fatal upgrade error.
pub const TROUBLESHOOTING_URL: &str = "https://linkerd.io/upgrade/#troubleshooting";

/// Pointer appended to issuer verification failures.
pub const ROTATION_DOCS_URL: &str = "https://linkerd.io/2/tasks/rotating_identity_certificates/";

/// A live workload identified by namespace and name
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct WorkloadRef {
    /// Namespace of the workload
    pub namespace: String,
    /// Pod name
    pub name: String,
}

impl WorkloadRef {
    /// Create a reference from namespace and name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Workloads whose trust anchors reject a candidate issuer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FleetReport {
    /// Offending workloads, in enumeration order
    pub workloads: Vec<WorkloadRef>,
}

impl fmt::Display for FleetReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "You are attempting to use an issuer certificate which does not validate against the trust anchors of the following pods:"
        )?;
        for workload in &self.workloads {
            writeln!(f, "\t* {}", workload)?;
        }
        write!(
            f,
            "These pods do not have the current trust bundle and must be restarted.  Use the --force flag to proceed anyway (this will likely prevent those pods from sending or receiving traffic)."
        )
    }
}

/// Main error type for upgrade reconciliation
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The persisted control-plane configuration could not be read
    #[error("could not fetch configs from kubernetes: {0}")]
    ConfigFetch(String),

    /// Only one half of an issuer key/certificate pair was supplied
    #[error("{0}")]
    IncompleteOverride(String),

    /// The requested operation conflicts with the issuer scheme in use
    #[error("{0}")]
    SchemeConflict(String),

    /// The issuer does not chain to the stated trust anchors
    #[error("issuer certificate does not work with the provided anchors: {0}\nFor more information: {url}", url = ROTATION_DOCS_URL)]
    TrustChain(String),

    /// Rotating the issuer would break already-running workloads
    #[error("{0}")]
    FleetIncompatibility(FleetReport),

    /// A webhook's own TLS material is inconsistent
    #[error("webhook {webhook} TLS material is invalid: {message}")]
    WebhookTrust {
        /// Webhook service name
        webhook: String,
        /// Verification failure
        message: String,
    },

    /// A secret exists but lacks a required data field
    #[error("{0}")]
    MalformedSecret(String),

    /// A webhook registration exists but carries no usable CA bundle
    #[error("{0}")]
    MalformedRegistration(String),

    /// The issuer secret could not be found
    #[error("could not fetch issuer: {0}")]
    IssuerFetch(String),

    /// A cluster call was cancelled or ran past its deadline
    #[error("{operation}: {reason}")]
    ContextCanceled {
        /// Cluster call that was interrupted
        operation: String,
        /// `context canceled` or `deadline exceeded`
        reason: &'static str,
    },

    /// Invalid input outside the identity override rules
    #[error("validation error: {0}")]
    Validation(String),

    /// Certificate material could not be decoded or generated
    #[error(transparent)]
    Pki(#[from] PkiError),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// IO error while reading override files or manifests
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a config fetch error with the given message
    pub fn config_fetch(msg: impl Into<String>) -> Self {
        Self::ConfigFetch(msg.into())
    }

    /// Create an incomplete override error with the given message
    pub fn incomplete_override(msg: impl Into<String>) -> Self {
        Self::IncompleteOverride(msg.into())
    }

    /// Create a scheme conflict error with the given message
    pub fn scheme_conflict(msg: impl Into<String>) -> Self {
        Self::SchemeConflict(msg.into())
    }

    /// Create a trust chain error with the given message
    pub fn trust_chain(msg: impl Into<String>) -> Self {
        Self::TrustChain(msg.into())
    }

    /// Create a webhook trust error
    pub fn webhook_trust(webhook: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::WebhookTrust {
            webhook: webhook.into(),
            message: msg.into(),
        }
    }

    /// Create a malformed secret error with the given message
    pub fn malformed_secret(msg: impl Into<String>) -> Self {
        Self::MalformedSecret(msg.into())
    }

    /// Create a malformed registration error with the given message
    pub fn malformed_registration(msg: impl Into<String>) -> Self {
        Self::MalformedRegistration(msg.into())
    }

    /// Create an issuer fetch error with the given message
    pub fn issuer_fetch(msg: impl Into<String>) -> Self {
        Self::IssuerFetch(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Offending workloads if this is a fleet incompatibility
    pub fn fleet_report(&self) -> Option<&FleetReport> {
        match self {
            Self::FleetIncompatibility(report) => Some(report),
            _ => None,
        }
    }
}
