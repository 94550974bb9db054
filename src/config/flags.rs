//! Recordable install flags
//!
//! Every install and upgrade records the flags the operator set explicitly
//! into `install.flags`, so a later upgrade can reproduce them. A [`FlagSet`]
//! tracks, per flag, whether it was set on this invocation; only flags that
//! were not are filled from the recorded values.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use super::{
    format_duration, parse_duration, ControlPlaneConfig, InstallFlag, LogLevel, PortRange,
};
use crate::{Error, Result};

/// Log level of the control-plane controllers
pub const CONTROLLER_LOG_LEVEL: &str = "controller-log-level";
/// Replicas per control-plane controller
pub const CONTROLLER_REPLICAS: &str = "controller-replicas";
/// High-availability mode
pub const HA: &str = "ha";
/// Trust domain for a newly generated identity
pub const IDENTITY_TRUST_DOMAIN: &str = "identity-trust-domain";
/// Lifetime of workload certificates
pub const IDENTITY_ISSUANCE_LIFETIME: &str = "identity-issuance-lifetime";
/// Clock skew tolerated when validating certificates
pub const IDENTITY_CLOCK_SKEW_ALLOWANCE: &str = "identity-clock-skew-allowance";
/// Proxy log filter
pub const PROXY_LOG_LEVEL: &str = "proxy-log-level";
/// Proxy image tag
pub const PROXY_VERSION: &str = "proxy-version";
/// Inbound ports that bypass the proxy
pub const SKIP_INBOUND_PORTS: &str = "skip-inbound-ports";
/// Outbound ports that bypass the proxy
pub const SKIP_OUTBOUND_PORTS: &str = "skip-outbound-ports";
/// Omit `sideEffects` on webhook registrations
pub const OMIT_WEBHOOK_SIDE_EFFECTS: &str = "omit-webhook-side-effects";
/// Control-plane version override
pub const CONTROL_PLANE_VERSION: &str = "control-plane-version";

/// Value type of a flag
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlagKind {
    /// `true` / `false`
    Bool,
    /// Free-form string
    String,
    /// Unsigned integer
    Uint,
    /// Duration such as `24h0m0s`
    Duration,
    /// Comma-separated list
    StringSlice,
}

/// A typed flag value
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlagValue {
    /// Boolean value
    Bool(bool),
    /// String value
    String(String),
    /// Unsigned value
    Uint(u64),
    /// Duration value
    Duration(Duration),
    /// List value
    StringSlice(Vec<String>),
}

impl FlagValue {
    /// Parse the command-line form of a value
    pub fn parse(kind: FlagKind, raw: &str) -> Result<Self> {
        let invalid = |e: &dyn fmt::Display| {
            Error::validation(format!("invalid {:?} value '{}': {}", kind, raw, e))
        };
        Ok(match kind {
            FlagKind::Bool => FlagValue::Bool(raw.trim().parse().map_err(|e| invalid(&e))?),
            FlagKind::String => FlagValue::String(raw.to_string()),
            FlagKind::Uint => FlagValue::Uint(raw.trim().parse().map_err(|e| invalid(&e))?),
            FlagKind::Duration => FlagValue::Duration(parse_duration(raw)?),
            FlagKind::StringSlice => FlagValue::StringSlice(
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
        })
    }
}

impl fmt::Display for FlagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlagValue::Bool(v) => write!(f, "{}", v),
            FlagValue::String(v) => f.write_str(v),
            FlagValue::Uint(v) => write!(f, "{}", v),
            FlagValue::Duration(v) => f.write_str(&format_duration(*v)),
            FlagValue::StringSlice(v) => write!(f, "[{}]", v.join(",")),
        }
    }
}

#[derive(Clone, Debug)]
struct Flag {
    kind: FlagKind,
    value: FlagValue,
    changed: bool,
}

/// The recordable flags of one invocation
#[derive(Clone, Debug)]
pub struct FlagSet {
    flags: BTreeMap<&'static str, Flag>,
}

impl FlagSet {
    /// The recordable flags at their defaults; `version` is the proxy default
    pub fn recordable(version: &str) -> Self {
        let defaults: [(&'static str, FlagValue); 12] = [
            (CONTROLLER_LOG_LEVEL, FlagValue::String("info".to_string())),
            (CONTROLLER_REPLICAS, FlagValue::Uint(1)),
            (HA, FlagValue::Bool(false)),
            (
                IDENTITY_TRUST_DOMAIN,
                FlagValue::String(super::DEFAULT_CLUSTER_DOMAIN.to_string()),
            ),
            (
                IDENTITY_ISSUANCE_LIFETIME,
                FlagValue::Duration(Duration::from_secs(24 * 60 * 60)),
            ),
            (
                IDENTITY_CLOCK_SKEW_ALLOWANCE,
                FlagValue::Duration(Duration::from_secs(20)),
            ),
            (
                PROXY_LOG_LEVEL,
                FlagValue::String("warn,linkerd=info".to_string()),
            ),
            (PROXY_VERSION, FlagValue::String(version.to_string())),
            (SKIP_INBOUND_PORTS, FlagValue::StringSlice(Vec::new())),
            (SKIP_OUTBOUND_PORTS, FlagValue::StringSlice(Vec::new())),
            (OMIT_WEBHOOK_SIDE_EFFECTS, FlagValue::Bool(false)),
            (CONTROL_PLANE_VERSION, FlagValue::String(String::new())),
        ];

        let flags = defaults
            .into_iter()
            .map(|(name, value)| {
                let kind = match &value {
                    FlagValue::Bool(_) => FlagKind::Bool,
                    FlagValue::String(_) => FlagKind::String,
                    FlagValue::Uint(_) => FlagKind::Uint,
                    FlagValue::Duration(_) => FlagKind::Duration,
                    FlagValue::StringSlice(_) => FlagKind::StringSlice,
                };
                (
                    name,
                    Flag {
                        kind,
                        value,
                        changed: false,
                    },
                )
            })
            .collect();
        Self { flags }
    }

    fn flag(&self, name: &str) -> Result<&Flag> {
        self.flags
            .get(name)
            .ok_or_else(|| Error::validation(format!("unknown flag '{}'", name)))
    }

    /// Set a flag explicitly, as if typed on the command line
    pub fn set(&mut self, name: &str, raw: &str) -> Result<()> {
        let flag = self
            .flags
            .get_mut(name)
            .ok_or_else(|| Error::validation(format!("unknown flag '{}'", name)))?;
        flag.value = FlagValue::parse(flag.kind, raw).map_err(|e| match e {
            Error::Validation(msg) => Error::validation(format!("--{}: {}", name, msg)),
            other => other,
        })?;
        flag.changed = true;
        Ok(())
    }

    /// Whether a flag was set on this invocation or re-applied from a record
    pub fn is_changed(&self, name: &str) -> bool {
        self.flags.get(name).is_some_and(|f| f.changed)
    }

    /// Current value of a flag
    pub fn value(&self, name: &str) -> Result<&FlagValue> {
        Ok(&self.flag(name)?.value)
    }

    /// Re-apply recorded values to every flag not set on this invocation
    ///
    /// Recorded string slices are stored bracketed (`[a,b]`) and are
    /// un-bracketed first. Unknown names and unparsable values are skipped.
    pub fn apply_recorded(&mut self, recorded: &[InstallFlag]) {
        for entry in recorded {
            let Some(flag) = self.flags.get_mut(entry.name.as_str()) else {
                debug!(flag = %entry.name, "ignoring unknown recorded flag");
                continue;
            };
            if flag.changed {
                continue;
            }

            let raw = if flag.kind == FlagKind::StringSlice {
                entry.value.trim_start_matches('[').trim_end_matches(']')
            } else {
                entry.value.as_str()
            };
            match FlagValue::parse(flag.kind, raw) {
                Ok(value) => {
                    flag.value = value;
                    flag.changed = true;
                }
                Err(e) => warn!(flag = %entry.name, error = %e, "ignoring recorded flag"),
            }
        }
    }

    /// Flags to persist, ordered by name
    pub fn record(&self) -> Vec<InstallFlag> {
        self.flags
            .iter()
            .filter(|(_, flag)| flag.changed)
            .map(|(name, flag)| InstallFlag::new(*name, flag.value.to_string()))
            .collect()
    }

    fn string(&self, name: &str) -> Result<String> {
        match self.value(name)? {
            FlagValue::String(v) => Ok(v.clone()),
            other => Err(type_mismatch(name, other)),
        }
    }

    fn boolean(&self, name: &str) -> Result<bool> {
        match self.value(name)? {
            FlagValue::Bool(v) => Ok(*v),
            other => Err(type_mismatch(name, other)),
        }
    }

    fn uint(&self, name: &str) -> Result<u64> {
        match self.value(name)? {
            FlagValue::Uint(v) => Ok(*v),
            other => Err(type_mismatch(name, other)),
        }
    }

    fn duration(&self, name: &str) -> Result<Duration> {
        match self.value(name)? {
            FlagValue::Duration(v) => Ok(*v),
            other => Err(type_mismatch(name, other)),
        }
    }

    fn string_slice(&self, name: &str) -> Result<Vec<String>> {
        match self.value(name)? {
            FlagValue::StringSlice(v) => Ok(v.clone()),
            other => Err(type_mismatch(name, other)),
        }
    }
}

fn type_mismatch(name: &str, value: &FlagValue) -> Error {
    Error::validation(format!("flag '{}' has unexpected value {:?}", name, value))
}

/// Typed view of a resolved [`FlagSet`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallOptions {
    /// Controller log level
    pub controller_log_level: String,
    /// Replicas per controller
    pub controller_replicas: u64,
    /// High-availability mode
    pub high_availability: bool,
    /// Trust domain used when identity is generated
    pub identity_trust_domain: String,
    /// Workload certificate lifetime
    #[serde(serialize_with = "serialize_duration")]
    pub identity_issuance_lifetime: Duration,
    /// Allowed clock skew
    #[serde(serialize_with = "serialize_duration")]
    pub identity_clock_skew_allowance: Duration,
    /// Proxy log filter
    pub proxy_log_level: String,
    /// Proxy image tag
    pub proxy_version: String,
    /// Inbound ports bypassing the proxy
    pub skip_inbound_ports: Vec<String>,
    /// Outbound ports bypassing the proxy
    pub skip_outbound_ports: Vec<String>,
    /// Omit `sideEffects` on webhook registrations
    pub omit_webhook_side_effects: bool,
    /// Control-plane version override; empty keeps the recorded one
    pub control_plane_version: String,
}

fn serialize_duration<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&format_duration(*d))
}

impl InstallOptions {
    /// Read the typed options out of a flag set
    pub fn from_flags(flags: &FlagSet) -> Result<Self> {
        Ok(Self {
            controller_log_level: flags.string(CONTROLLER_LOG_LEVEL)?,
            controller_replicas: flags.uint(CONTROLLER_REPLICAS)?,
            high_availability: flags.boolean(HA)?,
            identity_trust_domain: flags.string(IDENTITY_TRUST_DOMAIN)?,
            identity_issuance_lifetime: flags.duration(IDENTITY_ISSUANCE_LIFETIME)?,
            identity_clock_skew_allowance: flags.duration(IDENTITY_CLOCK_SKEW_ALLOWANCE)?,
            proxy_log_level: flags.string(PROXY_LOG_LEVEL)?,
            proxy_version: flags.string(PROXY_VERSION)?,
            skip_inbound_ports: flags.string_slice(SKIP_INBOUND_PORTS)?,
            skip_outbound_ports: flags.string_slice(SKIP_OUTBOUND_PORTS)?,
            omit_webhook_side_effects: flags.boolean(OMIT_WEBHOOK_SIDE_EFFECTS)?,
            control_plane_version: flags.string(CONTROL_PLANE_VERSION)?,
        })
    }

    /// Layer these options and the recorded flags over a configuration
    pub fn apply(&self, mut config: ControlPlaneConfig, recorded: Vec<InstallFlag>) -> ControlPlaneConfig {
        if !self.control_plane_version.is_empty() {
            config.global.version = self.control_plane_version.clone();
        }
        config.global.omit_webhook_side_effects = self.omit_webhook_side_effects;
        config.proxy.log_level = Some(LogLevel {
            level: self.proxy_log_level.clone(),
        });
        config.proxy.proxy_version = self.proxy_version.clone();
        config.proxy.ignore_inbound_ports = port_ranges(&self.skip_inbound_ports);
        config.proxy.ignore_outbound_ports = port_ranges(&self.skip_outbound_ports);
        config.install.flags = recorded;
        config
    }
}

fn port_ranges(ports: &[String]) -> Vec<PortRange> {
    ports
        .iter()
        .map(|p| PortRange {
            port_range: p.clone(),
        })
        .collect()
}
