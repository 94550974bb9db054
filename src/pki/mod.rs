//! PKI operations for mesh identity
//!
//! This module decodes and verifies the certificates the upgrade engine
//! handles, and generates fresh trust roots when an installation predates
//! identity support.
//!
//! # Verification Model
//!
//! - A certificate is trusted when it chains, through any intermediates
//!   bundled with it, to one of the supplied anchors
//! - Every certificate on the path must be inside its validity window
//! - A leaf that is itself one of the anchors is trusted directly
//! - An optional DNS identity is matched against the leaf's SANs (falling
//!   back to the subject CN when the leaf has no SAN extension)

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use thiserror::Error;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::*;

/// Validity period for generated trust anchors and issuers (days)
pub const GENERATED_VALIDITY_DAYS: i64 = 365;

/// Longest intermediate chain followed while looking for an anchor
const MAX_CHAIN_DEPTH: usize = 8;

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),

    /// Certificate did not verify
    #[error("{0}")]
    Verification(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

fn compute_validity(days: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    let not_after = now + ::time::Duration::days(days);
    (now, not_after)
}

/// Current time as a Unix timestamp
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Parse PEM-encoded data and return the DER bytes of the first block
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// Decode every CERTIFICATE block in a PEM bundle, in order
///
/// Fails if the bundle contains no certificate or any block is not a valid
/// X.509 certificate.
pub fn decode_certificates(pem_data: &str) -> Result<Vec<Vec<u8>>> {
    let blocks = ::pem::parse_many(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;

    let ders: Vec<Vec<u8>> = blocks
        .into_iter()
        .filter(|block| block.tag() == "CERTIFICATE")
        .map(|block| block.into_contents())
        .collect();

    if ders.is_empty() {
        return Err(PkiError::ParseError(
            "no certificates found in PEM data".to_string(),
        ));
    }

    for der in &ders {
        X509Certificate::from_der(der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;
    }

    Ok(ders)
}

/// Information about a certificate's validity
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    /// When the certificate becomes valid (Unix timestamp)
    pub not_before: i64,
    /// When the certificate expires (Unix timestamp)
    pub not_after: i64,
    /// Subject common name
    pub common_name: String,
}

impl CertificateInfo {
    /// Parse certificate info from the first certificate in a PEM bundle
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        let ders = decode_certificates(pem_data)?;
        Self::from_der(&ders[0])
    }

    /// Parse certificate info from DER-encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;
        Ok(Self::from_cert(&cert))
    }

    fn from_cert(cert: &X509Certificate<'_>) -> Self {
        Self {
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            common_name: common_name(cert).to_string(),
        }
    }

    /// Expiry as a UTC timestamp
    pub fn expiry(&self) -> Result<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::from_timestamp(self.not_after, 0).ok_or_else(|| {
            PkiError::ParseError(format!("expiry {} is out of range", self.not_after))
        })
    }
}

fn common_name<'a>(cert: &'a X509Certificate<'_>) -> &'a str {
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or("")
}

/// A set of trusted root certificates
#[derive(Debug, Clone, Default)]
pub struct CertPool {
    ders: Vec<Vec<u8>>,
}

impl CertPool {
    /// Build a pool from a PEM bundle of one or more certificates
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        Ok(Self {
            ders: decode_certificates(pem_data)?,
        })
    }

    /// Number of certificates in the pool
    pub fn len(&self) -> usize {
        self.ders.len()
    }

    /// Whether the pool is empty
    pub fn is_empty(&self) -> bool {
        self.ders.is_empty()
    }

    fn contains(&self, der: &[u8]) -> bool {
        self.ders.iter().any(|d| d.as_slice() == der)
    }
}

fn check_validity(cert: &X509Certificate<'_>, now: i64) -> Result<()> {
    let not_before = cert.validity().not_before.timestamp();
    let not_after = cert.validity().not_after.timestamp();
    if now < not_before {
        return Err(PkiError::Verification(format!(
            "certificate {:?} is not yet valid",
            common_name(cert)
        )));
    }
    if now > not_after {
        return Err(PkiError::Verification(format!(
            "certificate {:?} has expired",
            common_name(cert)
        )));
    }
    Ok(())
}

fn signed_by(child: &X509Certificate<'_>, parent: &X509Certificate<'_>, now: i64) -> bool {
    child.issuer().as_raw() == parent.subject().as_raw()
        && child.verify_signature(Some(parent.public_key())).is_ok()
        && check_validity(parent, now).is_ok()
}

fn chains_to_anchor(
    cert: &X509Certificate<'_>,
    intermediates: &[X509Certificate<'_>],
    anchors: &[X509Certificate<'_>],
    depth: usize,
    now: i64,
) -> bool {
    if anchors.iter().any(|anchor| signed_by(cert, anchor, now)) {
        return true;
    }
    if depth >= MAX_CHAIN_DEPTH {
        return false;
    }
    intermediates.iter().any(|parent| {
        !std::ptr::eq(parent, cert)
            && signed_by(cert, parent, now)
            && chains_to_anchor(parent, intermediates, anchors, depth + 1, now)
    })
}

fn matches_dns_name(cert: &X509Certificate<'_>, dns_name: &str) -> bool {
    match cert.subject_alternative_name() {
        Ok(Some(san)) => san.value.general_names.iter().any(|name| match name {
            GeneralName::DNSName(n) => n.eq_ignore_ascii_case(dns_name),
            _ => false,
        }),
        _ => common_name(cert).eq_ignore_ascii_case(dns_name),
    }
}

/// Verify that the first certificate in `crt_pem` chains to `anchors`
///
/// Any further certificates in `crt_pem` are treated as intermediates. When
/// `dns_name` is set the leaf must also carry that identity.
pub fn verify_certificate(
    crt_pem: &str,
    anchors: &CertPool,
    dns_name: Option<&str>,
    now: i64,
) -> Result<CertificateInfo> {
    let chain = decode_certificates(crt_pem)?;
    let parsed = chain
        .iter()
        .map(|der| {
            X509Certificate::from_der(der)
                .map(|(_, cert)| cert)
                .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))
        })
        .collect::<Result<Vec<_>>>()?;
    let anchor_certs = anchors
        .ders
        .iter()
        .map(|der| {
            X509Certificate::from_der(der)
                .map(|(_, cert)| cert)
                .map_err(|e| PkiError::ParseError(format!("failed to parse anchor: {}", e)))
        })
        .collect::<Result<Vec<_>>>()?;

    let (leaf, intermediates) = parsed
        .split_first()
        .ok_or_else(|| PkiError::ParseError("empty certificate chain".to_string()))?;

    check_validity(leaf, now)?;

    if let Some(name) = dns_name {
        if !matches_dns_name(leaf, name) {
            return Err(PkiError::Verification(format!(
                "certificate is not valid for {}",
                name
            )));
        }
    }

    if anchors.contains(&chain[0]) || chains_to_anchor(leaf, intermediates, &anchor_certs, 0, now)
    {
        return Ok(CertificateInfo::from_cert(leaf));
    }

    Err(PkiError::Verification(
        "x509: certificate signed by unknown authority".to_string(),
    ))
}

/// Check that a private key belongs to the first certificate in `crt_pem`
pub fn verify_key_matches(crt_pem: &str, key_pem: &str) -> Result<()> {
    let key = KeyPair::from_pem(key_pem)
        .map_err(|e| PkiError::ParseError(format!("failed to parse private key: {}", e)))?;
    let der = parse_pem(crt_pem)?;
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

    if &*cert.public_key().subject_public_key.data != key.public_key_raw() {
        return Err(PkiError::Verification(
            "private key does not match certificate public key".to_string(),
        ));
    }
    Ok(())
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn
}

/// Self-signed trust root able to issue issuer and server certificates
#[derive(Clone)]
pub struct TrustRoot {
    /// Root key pair serialized as PEM (KeyPair isn't Clone)
    key_pem: String,
    /// PEM-encoded root certificate, distributed as a trust anchor
    cert_pem: String,
}

impl TrustRoot {
    /// Create a new self-signed root
    pub fn new(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let (not_before, not_after) = compute_validity(GENERATED_VALIDITY_DAYS);
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate root key: {}", e))
        })?;
        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create root cert: {}", e))
        })?;

        Ok(Self {
            key_pem: key_pair.serialize_pem(),
            cert_pem: cert.pem(),
        })
    }

    /// Root certificate in PEM format
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Root private key in PEM format
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    fn sign(&self, params: CertificateParams) -> Result<(String, String)> {
        let key = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate key: {}", e))
        })?;
        let root_key = KeyPair::from_pem(&self.key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load root key: {}", e)))?;
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &root_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;
        let cert = params.signed_by(&key, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign certificate: {}", e))
        })?;
        Ok((cert.pem(), key.serialize_pem()))
    }

    /// Issue an intermediate CA certificate, returning `(crt_pem, key_pem)`
    pub fn issue_intermediate(&self, common_name: &str) -> Result<(String, String)> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let (not_before, not_after) = compute_validity(GENERATED_VALIDITY_DAYS);
        params.not_before = not_before;
        params.not_after = not_after;
        self.sign(params)
    }

    /// Issue a TLS server certificate for the given DNS names
    pub fn issue_server_cert(&self, dns_names: &[&str]) -> Result<(String, String)> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(dns_names.first().copied().unwrap_or(""));
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];
        let (not_before, not_after) = compute_validity(GENERATED_VALIDITY_DAYS);
        params.not_before = not_before;
        params.not_after = not_after;
        params.subject_alt_names = dns_names
            .iter()
            .map(|name| {
                Ia5String::try_from(name.to_string())
                    .map(SanType::DnsName)
                    .map_err(|e| {
                        PkiError::CertificateGenerationFailed(format!(
                            "invalid DNS name '{}': {}",
                            name, e
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        self.sign(params)
    }
}

/// Trust anchors and issuer produced for an installation without identity
#[derive(Debug, Clone)]
pub struct GeneratedIdentity {
    /// PEM bundle of the new trust anchors
    pub trust_anchors_pem: String,
    /// PEM issuer certificate, signed by the anchors
    pub issuer_crt_pem: String,
    /// PEM issuer private key
    pub issuer_key_pem: String,
}

/// Capability that synthesizes a new root of trust
pub trait RootGenerator: Send + Sync {
    /// Generate anchors and a matching issuer for `trust_domain`
    fn generate(&self, trust_domain: &str) -> Result<GeneratedIdentity>;
}

/// [`RootGenerator`] backed by rcgen
///
/// The root and issuer share the common name `identity.<ns>.<trust domain>`;
/// the root key is dropped once the issuer is signed.
#[derive(Debug, Clone)]
pub struct RcgenRootGenerator {
    namespace: String,
}

impl RcgenRootGenerator {
    /// Create a generator for the control plane in `namespace`
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }
}

impl RootGenerator for RcgenRootGenerator {
    fn generate(&self, trust_domain: &str) -> Result<GeneratedIdentity> {
        let common_name = format!("identity.{}.{}", self.namespace, trust_domain);
        let root = TrustRoot::new(&common_name)?;
        let (issuer_crt_pem, issuer_key_pem) = root.issue_intermediate(&common_name)?;
        Ok(GeneratedIdentity {
            trust_anchors_pem: root.cert_pem().to_string(),
            issuer_crt_pem,
            issuer_key_pem,
        })
    }
}
