//! mesh-upgrade - compute the upgrade bundle for a running control plane

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio::io::AsyncReadExt;
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mesh_upgrade::cluster::{ClusterApi, KubeCluster, ManifestCluster};
use mesh_upgrade::config::{flags, Defaults, FlagSet};
use mesh_upgrade::context::CallContext;
use mesh_upgrade::error::TROUBLESHOOTING_URL;
use mesh_upgrade::identity::IdentityOverrides;
use mesh_upgrade::pki::RcgenRootGenerator;
use mesh_upgrade::upgrade::{Stage, Upgrade, UpgradeOptions};

/// Output the upgraded control-plane configuration for a running mesh
///
/// Reads the installed configuration, identity and webhook TLS material
/// from the cluster and writes the bundle the renderer needs to stdout.
#[derive(Parser, Debug)]
#[command(name = "mesh-upgrade", version, about, args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    args: UpgradeArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Output the cluster-level resources, which need cluster-admin
    Config(UpgradeArgs),

    /// Output the namespaced control-plane resources
    ControlPlane(UpgradeArgs),
}

#[derive(Args, Debug, Clone)]
struct UpgradeArgs {
    /// Path to the kubeconfig file
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use
    #[arg(long, env = "MESH_UPGRADE_CONTEXT")]
    context: Option<String>,

    /// Namespace of the control plane
    #[arg(short = 'L', long = "linkerd-namespace", env = "MESH_UPGRADE_NAMESPACE", default_value = mesh_upgrade::DEFAULT_NAMESPACE)]
    namespace: String,

    /// Read cluster state from a manifest file instead of the cluster ("-" for stdin)
    #[arg(long)]
    from_manifests: Option<PathBuf>,

    /// Seconds to wait for each cluster call
    #[arg(long, default_value_t = 120)]
    timeout: u64,

    /// Rotate the issuer even if running proxies do not trust it
    #[arg(long)]
    force: bool,

    /// Replace the existing add-on config instead of merging into it
    #[arg(long)]
    addon_overwrite: bool,

    /// Replacement trust anchors (PEM)
    #[arg(long)]
    identity_trust_anchors_file: Option<PathBuf>,

    /// Replacement issuer certificate (PEM)
    #[arg(long)]
    identity_issuer_certificate_file: Option<PathBuf>,

    /// Replacement issuer private key (PEM)
    #[arg(long)]
    identity_issuer_key_file: Option<PathBuf>,

    #[command(flatten)]
    install: InstallFlagArgs,
}

/// Flags recorded in the installed configuration
///
/// Any of these left unset falls back to the value recorded by the previous
/// install or upgrade.
#[derive(Args, Debug, Clone, Default)]
struct InstallFlagArgs {
    /// Log level for the control-plane controllers
    #[arg(long)]
    controller_log_level: Option<String>,

    /// Replicas of each control-plane controller
    #[arg(long)]
    controller_replicas: Option<u64>,

    /// Run the control plane in high-availability mode
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    ha: Option<bool>,

    /// Trust domain for workload identities
    #[arg(long)]
    identity_trust_domain: Option<String>,

    /// Lifetime of workload certificates, e.g. 24h0m0s
    #[arg(long)]
    identity_issuance_lifetime: Option<String>,

    /// Clock skew allowed when issuing certificates, e.g. 20s
    #[arg(long)]
    identity_clock_skew_allowance: Option<String>,

    /// Log level for the proxies
    #[arg(long)]
    proxy_log_level: Option<String>,

    /// Proxy version to inject
    #[arg(long)]
    proxy_version: Option<String>,

    /// Inbound ports the proxy should not handle
    #[arg(long, value_delimiter = ',')]
    skip_inbound_ports: Vec<String>,

    /// Outbound ports the proxy should not handle
    #[arg(long, value_delimiter = ',')]
    skip_outbound_ports: Vec<String>,

    /// Omit the sideEffects flag on webhook registrations
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    omit_webhook_side_effects: Option<bool>,

    /// Control-plane version to install
    #[arg(long)]
    control_plane_version: Option<String>,
}

impl InstallFlagArgs {
    /// Set every flag given on the command line
    fn apply(&self, flag_set: &mut FlagSet) -> mesh_upgrade::Result<()> {
        let join = |v: &[String]| (!v.is_empty()).then(|| v.join(","));
        let explicit = [
            (flags::CONTROLLER_LOG_LEVEL, self.controller_log_level.clone()),
            (
                flags::CONTROLLER_REPLICAS,
                self.controller_replicas.map(|v| v.to_string()),
            ),
            (flags::HA, self.ha.map(|v| v.to_string())),
            (flags::IDENTITY_TRUST_DOMAIN, self.identity_trust_domain.clone()),
            (
                flags::IDENTITY_ISSUANCE_LIFETIME,
                self.identity_issuance_lifetime.clone(),
            ),
            (
                flags::IDENTITY_CLOCK_SKEW_ALLOWANCE,
                self.identity_clock_skew_allowance.clone(),
            ),
            (flags::PROXY_LOG_LEVEL, self.proxy_log_level.clone()),
            (flags::PROXY_VERSION, self.proxy_version.clone()),
            (flags::SKIP_INBOUND_PORTS, join(&self.skip_inbound_ports)),
            (flags::SKIP_OUTBOUND_PORTS, join(&self.skip_outbound_ports)),
            (
                flags::OMIT_WEBHOOK_SIDE_EFFECTS,
                self.omit_webhook_side_effects.map(|v| v.to_string()),
            ),
            (flags::CONTROL_PLANE_VERSION, self.control_plane_version.clone()),
        ];
        for (name, value) in explicit {
            if let Some(value) = value {
                flag_set.set(name, &value)?;
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    // stdout carries the bundle
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    let (stage, args) = match cli.command {
        Some(Commands::Config(args)) => (Stage::Config, args),
        Some(Commands::ControlPlane(args)) => (Stage::ControlPlane, args),
        None => (Stage::Full, cli.args),
    };

    match run(stage, &args).await {
        Ok(yaml) => {
            print!("{}", yaml);
            if stage == Stage::Config {
                eprintln!("\nDon't forget to run `mesh-upgrade control-plane`!");
            }
            Ok(())
        }
        Err(e) => {
            eprintln!(
                "Failed to build upgrade configuration: {}\nFor troubleshooting suggestions, consult the upgrade documentation: {}",
                e, TROUBLESHOOTING_URL
            );
            std::process::exit(1);
        }
    }
}

async fn run(stage: Stage, args: &UpgradeArgs) -> anyhow::Result<String> {
    let mut flag_set = FlagSet::recordable(mesh_upgrade::VERSION);
    args.install.apply(&mut flag_set)?;

    let overrides = IdentityOverrides {
        trust_anchors_file: args.identity_trust_anchors_file.clone(),
        issuer_crt_file: args.identity_issuer_certificate_file.clone(),
        issuer_key_file: args.identity_issuer_key_file.clone(),
    };

    let ctx = CallContext::with_timeout(Duration::from_secs(args.timeout));
    let token = ctx.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("interrupted; cancelling cluster calls");
            token.cancel();
        }
    });

    let cluster = cluster(args).await?;
    let generator = RcgenRootGenerator::new(&args.namespace);
    let defaults = Defaults {
        namespace: args.namespace.clone(),
        ..Defaults::default()
    };
    let options = UpgradeOptions {
        force: args.force,
        addon_overwrite: args.addon_overwrite,
        overrides,
        stage,
    };

    let bundle = Upgrade::new(cluster.as_ref(), &generator, defaults, options)
        .validate_and_build(&ctx, flag_set)
        .await?;

    if bundle.anchors_rotated {
        eprintln!(
            "Warning: the trust anchors are changing. Restart every meshed workload so it picks up the new anchors before the issuer is rotated."
        );
    }
    Ok(bundle.to_yaml()?)
}

async fn cluster(args: &UpgradeArgs) -> anyhow::Result<Box<dyn ClusterApi>> {
    if let Some(path) = &args.from_manifests {
        let yaml = read_manifests(path).await?;
        return Ok(Box::new(ManifestCluster::from_yaml(&yaml)?));
    }

    let options = KubeConfigOptions {
        context: args.context.clone(),
        ..Default::default()
    };
    let config = match &args.kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .map_err(|e| anyhow::anyhow!("Failed to read kubeconfig {:?}: {}", path, e))?;
            Config::from_custom_kubeconfig(kubeconfig, &options).await?
        }
        None => Config::from_kubeconfig(&options).await?,
    };
    let client = Client::try_from(config)?;
    Ok(Box::new(KubeCluster::new(client)))
}

async fn read_manifests(path: &Path) -> anyhow::Result<String> {
    if path == Path::new("-") {
        let mut yaml = String::new();
        tokio::io::stdin().read_to_string(&mut yaml).await?;
        return Ok(yaml);
    }
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read manifests {:?}: {}", path, e))
}
