use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use registry_apply::RetryPolicy;
use registry_controller::RunConfig;
use registry_core::Registry;
use registry_kubehub::{get_kube_client, KubeEventSink, KubeStore};
use registry_manifests::BuildParams;
use registry_store::MemoryStore;
use registry_upgrade::{upgrade_managed_instances, MigrationChain, VersionInfo};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "registry-operator", version, about = "Registry operator")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(flatten)]
    config: OperatorConfig,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

/// Operator settings; every flag falls back to its environment variable.
#[derive(Args, Debug, Clone)]
struct OperatorConfig {
    /// Only manage registries in this namespace (default: all namespaces)
    #[arg(long = "ns", env = "REGISTRY_NAMESPACE", global = true)]
    namespace: Option<String>,

    /// Attempts per object before a write conflict is reported
    #[arg(long, env = "REGISTRY_RETRY_ATTEMPTS", default_value_t = 5, global = true)]
    retry_attempts: u32,

    /// Base backoff between conflict retries, in milliseconds
    #[arg(long, env = "REGISTRY_RETRY_BACKOFF_MS", default_value_t = 10, global = true)]
    retry_backoff_ms: u64,

    /// Delay before retrying a failed pass, in seconds
    #[arg(long, env = "REGISTRY_REQUEUE_SECS", default_value_t = 30, global = true)]
    requeue_secs: u64,

    /// Regular expressions; matching instance labels are not propagated
    #[arg(long, env = "REGISTRY_LABEL_FILTERS", value_delimiter = ',', global = true)]
    label_filters: Vec<String>,

    /// Regular expressions; matching instance annotations are not propagated
    #[arg(long, env = "REGISTRY_ANNOTATION_FILTERS", value_delimiter = ',', global = true)]
    annotation_filters: Vec<String>,
}

impl OperatorConfig {
    fn retry(&self) -> RetryPolicy {
        RetryPolicy { attempts: self.retry_attempts.max(1), backoff: Duration::from_millis(self.retry_backoff_ms) }
    }

    fn build_params(&self, versions: &VersionInfo) -> Result<BuildParams> {
        Ok(BuildParams::new(versions.image.clone()).with_filters(&self.label_filters, &self.annotation_filters)?)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upgrade stored instances, then run the controller
    Run,
    /// Upgrade stored instances to this release and exit
    Upgrade,
    /// Print the objects a Registry manifest would produce (offline)
    Render {
        /// Registry manifest (YAML)
        file: PathBuf,
    },
    /// Print operator and registry versions
    Version,
}

fn init_tracing() {
    let env = std::env::var("REGISTRY_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("REGISTRY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid REGISTRY_METRICS_ADDR; expected host:port");
        }
    }
}

async fn render(file: &Path, namespace: Option<&str>, params: &BuildParams, output: Output) -> Result<()> {
    let raw = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let mut registry: Registry = serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", file.display()))?;
    if registry.metadata.namespace.is_none() {
        registry.metadata.namespace = Some(namespace.unwrap_or("default").to_string());
    }
    let registry = registry.with_defaults();
    for w in registry.validate()? {
        warn!("{w}");
    }
    // Nothing to read Secrets from offline; S3 storage fails here.
    let objects = registry_manifests::build(&MemoryStore::new(), &registry, params).await?;
    match output {
        Output::Human => {
            for obj in &objects {
                println!("---");
                print!("{}", serde_yaml::to_string(obj)?);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&objects)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let versions = VersionInfo::embedded().context("embedded version values")?;
    let chain = MigrationChain::standard(&versions.registry)?;

    match cli.command {
        Commands::Run => {
            info!(version = %versions, "starting");
            let client = get_kube_client().await?;
            let config = RunConfig {
                namespace: cli.config.namespace.clone(),
                requeue: Duration::from_secs(cli.config.requeue_secs),
                retry: cli.config.retry(),
                params: cli.config.build_params(&versions)?,
                chain,
            };
            registry_controller::run(client, config).await?;
        }
        Commands::Upgrade => {
            let client = get_kube_client().await?;
            let store = KubeStore::new(client.clone());
            let events = KubeEventSink::new(client);
            let token = CancellationToken::new();
            let ns = cli.config.namespace.as_deref();
            let summary = tokio::select! {
                r = upgrade_managed_instances(&store, &events, &chain, ns, &token) => r?,
                _ = signal::ctrl_c() => {
                    token.cancel();
                    warn!("interrupted");
                    return Ok(());
                }
            };
            match cli.output {
                Output::Human => {
                    for key in &summary.upgraded {
                        println!("upgraded {key}");
                    }
                    for key in &summary.failed {
                        println!("failed   {key}");
                    }
                    println!("unchanged: {}", summary.unchanged);
                }
                Output::Json => {
                    let out = serde_json::json!({
                        "upgraded": summary.upgraded.iter().map(|k| k.to_string()).collect::<Vec<_>>(),
                        "failed": summary.failed.iter().map(|k| k.to_string()).collect::<Vec<_>>(),
                        "unchanged": summary.unchanged,
                    });
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
            }
            if !summary.failed.is_empty() {
                std::process::exit(1);
            }
        }
        Commands::Render { file } => {
            let params = cli.config.build_params(&versions)?;
            render(&file, cli.config.namespace.as_deref(), &params, cli.output).await?;
        }
        Commands::Version => match cli.output {
            Output::Human => println!("{versions}"),
            Output::Json => println!("{}", serde_json::to_string_pretty(&versions)?),
        },
    }
    Ok(())
}
