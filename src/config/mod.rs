//! Persisted control-plane configuration
//!
//! The control plane records its configuration in the `linkerd-config`
//! ConfigMap as three JSON documents (`global`, `proxy`, `install`). Older
//! releases may omit whole sections or fields, so reads go through
//! [`PersistedConfig`] (everything optional) and [`ControlPlaneConfig::repair`]
//! turns that into a fully populated record using an explicit [`Defaults`]
//! table. Fields this crate does not model survive the round trip.

pub mod flags;
pub mod reconcile;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Error, Result};

pub use flags::{FlagKind, FlagSet, FlagValue, InstallOptions};
pub use reconcile::{ConfigReconciler, ReconciledConfig};

/// Name of the ConfigMap holding the persisted configuration
pub const CONFIG_MAP_NAME: &str = "linkerd-config";

/// Cluster domain used when none was recorded
pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";

/// Debug sidecar image used when none was recorded
pub const DEFAULT_DEBUG_IMAGE: &str = "cr.l5d.io/linkerd/debug";

const GLOBAL_KEY: &str = "global";
const PROXY_KEY: &str = "proxy";
const INSTALL_KEY: &str = "install";

/// Values applied by the repair pass; nothing is read from process state
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Defaults {
    /// Control-plane namespace
    pub namespace: String,
    /// Cluster DNS domain
    pub cluster_domain: String,
    /// Debug sidecar image name
    pub debug_image: String,
    /// Version of this tool, stamped into `install.cliVersion`
    pub version: String,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            namespace: crate::DEFAULT_NAMESPACE.to_string(),
            cluster_domain: DEFAULT_CLUSTER_DOMAIN.to_string(),
            debug_image: DEFAULT_DEBUG_IMAGE.to_string(),
            version: crate::VERSION.to_string(),
        }
    }
}

/// Identity section of the global config
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityContext {
    /// Trust domain of workload identities
    #[serde(default)]
    pub trust_domain: String,
    /// PEM trust anchors
    #[serde(default)]
    pub trust_anchors_pem: String,
    /// Lifetime of issued workload certificates, e.g. `86400s`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuance_lifetime: Option<String>,
    /// Allowed clock skew, e.g. `20s`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock_skew_allowance: Option<String>,
    /// Issuer secret scheme; empty on releases predating schemes
    #[serde(default)]
    pub scheme: String,
    /// Fields this crate does not model
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl IdentityContext {
    /// Whether both a trust domain and trust anchors are recorded
    pub fn is_complete(&self) -> bool {
        !self.trust_domain.is_empty() && !self.trust_anchors_pem.is_empty()
    }
}

/// `global` section
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    /// Control-plane namespace
    #[serde(default)]
    pub linkerd_namespace: String,
    /// Whether the CNI plugin replaces proxy-init
    #[serde(default)]
    pub cni_enabled: bool,
    /// Installed control-plane version
    #[serde(default)]
    pub version: String,
    /// Identity settings; absent on installs predating identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_context: Option<IdentityContext>,
    /// Omit `sideEffects` on webhook registrations
    #[serde(default)]
    pub omit_webhook_side_effects: bool,
    /// Cluster DNS domain
    #[serde(default)]
    pub cluster_domain: String,
    /// Fields this crate does not model
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Container image reference
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    /// Image repository
    #[serde(default)]
    pub image_name: String,
    /// Pull policy, if set
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pull_policy: String,
    /// Fields this crate does not model
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Proxy log filter
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LogLevel {
    /// Filter directive, e.g. `warn,linkerd=info`
    #[serde(default)]
    pub level: String,
}

/// A port or port range skipped by the proxy
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortRange {
    /// A port (`25`) or range (`3000-3100`)
    pub port_range: String,
}

/// `proxy` section
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    /// Proxy image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_image: Option<Image>,
    /// Proxy init container image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_init_image: Option<Image>,
    /// Debug sidecar image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_image: Option<Image>,
    /// Debug sidecar image tag
    #[serde(default)]
    pub debug_image_version: String,
    /// Proxy log filter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<LogLevel>,
    /// Proxy image tag
    #[serde(default)]
    pub proxy_version: String,
    /// Inbound ports bypassing the proxy
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore_inbound_ports: Vec<PortRange>,
    /// Outbound ports bypassing the proxy
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore_outbound_ports: Vec<PortRange>,
    /// Fields this crate does not model
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One flag value recorded by a previous install or upgrade
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallFlag {
    /// Flag name without leading dashes
    pub name: String,
    /// String-encoded value
    pub value: String,
}

impl InstallFlag {
    /// Create a recorded flag
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// `install` section
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallConfig {
    /// Version of the tool that last wrote the config
    #[serde(default)]
    pub cli_version: String,
    /// Flags recorded by the last install or upgrade
    #[serde(default)]
    pub flags: Vec<InstallFlag>,
    /// Fields this crate does not model
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Configuration as read from the cluster, before repair
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PersistedConfig {
    /// `global` section, if present
    pub global: Option<GlobalConfig>,
    /// `proxy` section, if present
    pub proxy: Option<ProxyConfig>,
    /// `install` section, if present
    pub install: Option<InstallConfig>,
}

fn parse_section<T: serde::de::DeserializeOwned>(
    data: &BTreeMap<String, String>,
    key: &str,
) -> Result<Option<T>> {
    match data.get(key).map(|s| s.trim()) {
        None | Some("") => Ok(None),
        Some(json) => serde_json::from_str(json)
            .map(Some)
            .map_err(|e| Error::config_fetch(format!("invalid {} config: {}", key, e))),
    }
}

impl PersistedConfig {
    /// Decode the ConfigMap payload
    pub fn from_config_map_data(data: &BTreeMap<String, String>) -> Result<Self> {
        Ok(Self {
            global: parse_section(data, GLOBAL_KEY)?,
            proxy: parse_section(data, PROXY_KEY)?,
            install: parse_section(data, INSTALL_KEY)?,
        })
    }
}

/// Fully populated control-plane configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    /// Global settings
    pub global: GlobalConfig,
    /// Proxy defaults
    pub proxy: ProxyConfig,
    /// Install metadata
    pub install: InstallConfig,
}

impl ControlPlaneConfig {
    /// Fill missing sections and fields so older configs stay valid
    ///
    /// `install.cliVersion` is always overwritten with the current version.
    pub fn repair(persisted: PersistedConfig, defaults: &Defaults) -> Self {
        let mut global = persisted.global.unwrap_or_default();
        if global.cluster_domain.is_empty() {
            global.cluster_domain = defaults.cluster_domain.clone();
        }
        if global.linkerd_namespace.is_empty() {
            global.linkerd_namespace = defaults.namespace.clone();
        }

        let mut install = persisted.install.unwrap_or_default();
        install.cli_version = defaults.version.clone();

        let mut proxy = persisted.proxy.unwrap_or_default();
        let debug_image = proxy.debug_image.get_or_insert_with(Image::default);
        if debug_image.image_name.is_empty() {
            debug_image.image_name = defaults.debug_image.clone();
        }
        if proxy.debug_image_version.is_empty() {
            proxy.debug_image_version = defaults.version.clone();
        }

        Self {
            global,
            proxy,
            install,
        }
    }

    /// Identity context, if one was recorded
    pub fn identity_context(&self) -> Option<&IdentityContext> {
        self.global.identity_context.as_ref()
    }

    /// Replace the identity context
    pub fn with_identity_context(mut self, context: IdentityContext) -> Self {
        self.global.identity_context = Some(context);
        self
    }

    /// Rewrite the recorded trust anchors, keeping the rest of the context
    pub fn with_trust_anchors(mut self, trust_anchors_pem: &str) -> Self {
        let context = self
            .global
            .identity_context
            .get_or_insert_with(IdentityContext::default);
        context.trust_anchors_pem = trust_anchors_pem.to_string();
        self
    }

    /// Encode back into the ConfigMap payload
    pub fn to_config_map_data(&self) -> Result<BTreeMap<String, String>> {
        Ok(BTreeMap::from([
            (GLOBAL_KEY.to_string(), encode_section(&self.global)?),
            (PROXY_KEY.to_string(), encode_section(&self.proxy)?),
            (INSTALL_KEY.to_string(), encode_section(&self.install)?),
        ]))
    }
}

fn encode_section<T: Serialize>(section: &T) -> Result<String> {
    serde_json::to_string(section)
        .map_err(|e| Error::serialization(format!("failed to encode config: {}", e)))
}

/// Parse a duration in either protobuf JSON (`86400s`) or Go (`24h0m0s`) form
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::validation("empty duration"));
    }

    let invalid = || Error::validation(format!("invalid duration '{}'", s));
    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        if number_len == 0 {
            return Err(invalid());
        }
        let number: f64 = rest[..number_len].parse().map_err(|_| invalid())?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "h" => 3600.0,
            "m" => 60.0,
            "s" => 1.0,
            "ms" => 1e-3,
            "us" | "µs" => 1e-6,
            "ns" => 1e-9,
            _ => return Err(invalid()),
        };
        total += number * scale;
        rest = &rest[unit_len..];
    }
    Duration::try_from_secs_f64(total).map_err(|_| invalid())
}

/// Format a duration the way Go prints one, e.g. `24h0m0s` or `20s`
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let nanos = d.subsec_nanos();
    let seconds = if nanos == 0 {
        format!("{}", total % 60)
    } else {
        let frac = format!("{:09}", nanos);
        format!("{}.{}", total % 60, frac.trim_end_matches('0'))
    };

    if hours > 0 {
        format!("{}h{}m{}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Format a duration as protobuf JSON, e.g. `86400s`
pub fn format_proto_duration(d: Duration) -> String {
    if d.subsec_nanos() == 0 {
        format!("{}s", d.as_secs())
    } else {
        let frac = format!("{:09}", d.subsec_nanos());
        format!("{}.{}s", d.as_secs(), frac.trim_end_matches('0'))
    }
}
