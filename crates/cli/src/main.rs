use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tracing::info;

use skiff_cluster::KubeGateway;
use skiff_ledger::{ConfigMapStore, HistoryStore, ReleaseStatus};
use skiff_rollout::{run_rollout, RolloutOutcome, RolloutRequest, ScaleTarget, Strategy};

#[derive(Parser, Debug)]
#[command(name = "skiffctl", version, about = "Skiff rollout orchestrator CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace the release lives in
    #[arg(long = "ns", global = true, default_value = "default")]
    namespace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Rolling deploy of a rendered manifest set
    Rolling {
        /// Release name the history is tracked under
        #[arg(long = "release")]
        release: String,
        /// Rendered manifest files (multi-document YAML)
        #[arg(required = true)]
        manifests: Vec<PathBuf>,
        /// Steady-state timeout in seconds
        #[arg(long = "timeout-secs", default_value_t = 600)]
        timeout_secs: u64,
        /// Releases to keep alive (default SKIFF_RETENTION or 2)
        #[arg(long = "retention")]
        retention: Option<usize>,
    },
    /// Canary deploy: a parallel, separately-sized copy of the workload
    Canary {
        #[arg(long = "release")]
        release: String,
        #[arg(required = true)]
        manifests: Vec<PathBuf>,
        /// Replica count for the canary copy
        #[arg(long = "instances", default_value_t = 1)]
        instances: i32,
        #[arg(long = "timeout-secs", default_value_t = 600)]
        timeout_secs: u64,
        #[arg(long = "retention")]
        retention: Option<usize>,
    },
    /// Scale a workload to an absolute count or a percentage
    Scale {
        #[arg(long = "release")]
        release: String,
        /// Target workload as Kind/name, e.g. "Deployment/web"
        #[arg(long = "workload")]
        workload: String,
        /// Absolute replica count
        #[arg(long = "replicas", conflicts_with = "percent")]
        replicas: Option<i32>,
        /// Percentage of --max-instances (or of the current count)
        #[arg(long = "percent")]
        percent: Option<u32>,
        #[arg(long = "max-instances", requires = "percent")]
        max_instances: Option<i32>,
        /// Do not wait for the workload to settle
        #[arg(long = "skip-steady-check", action = ArgAction::SetTrue)]
        skip_steady_check: bool,
        #[arg(long = "timeout-secs", default_value_t = 600)]
        timeout_secs: u64,
    },
    /// Print the persisted release history
    History {
        #[arg(long = "release")]
        release: String,
    },
}

fn init_tracing() {
    let env = std::env::var("SKIFF_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("SKIFF_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid SKIFF_METRICS_ADDR; expected host:port");
        }
    }
}

fn default_retention() -> usize {
    std::env::var("SKIFF_RETENTION").ok().and_then(|s| s.parse().ok()).unwrap_or(2)
}

fn read_manifests(paths: &[PathBuf]) -> Result<String> {
    let mut docs = Vec::with_capacity(paths.len());
    for path in paths {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading manifest {}", path.display()))?;
        docs.push(text);
    }
    Ok(docs.join("\n---\n"))
}

fn print_outcome(outcome: &RolloutOutcome, output: Output) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(outcome)?),
        Output::Human => {
            println!("release number: {}", outcome.release_number);
            println!("status:         {:?}", outcome.status);
            if let Some(n) = outcome.previous_replica_count {
                println!("replicas before: {}", n);
            }
            if let Some(pods) = &outcome.pods {
                println!("pods observed:  {}", pods.len());
                for pod in pods {
                    println!("  {}/{}", pod.namespace, pod.name);
                }
            }
            if let Some(err) = &outcome.error {
                println!("error:          {}", err);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let client = kube::Client::try_default().await.context("building kube client")?;
    let gateway = KubeGateway::new(client.clone());
    let store = ConfigMapStore::new(client, cli.namespace.clone());

    let request = match &cli.command {
        Commands::Rolling { release, manifests, timeout_secs, retention } => RolloutRequest {
            release_name: release.clone(),
            namespace: cli.namespace.clone(),
            manifest_yaml: read_manifests(manifests)?,
            strategy: Strategy::Rolling,
            timeout: Duration::from_secs(*timeout_secs),
            retention: retention.unwrap_or_else(default_retention),
        },
        Commands::Canary { release, manifests, instances, timeout_secs, retention } => {
            RolloutRequest {
                release_name: release.clone(),
                namespace: cli.namespace.clone(),
                manifest_yaml: read_manifests(manifests)?,
                strategy: Strategy::Canary { instances: *instances },
                timeout: Duration::from_secs(*timeout_secs),
                retention: retention.unwrap_or_else(default_retention),
            }
        }
        Commands::Scale {
            release,
            workload,
            replicas,
            percent,
            max_instances,
            skip_steady_check,
            timeout_secs,
        } => {
            let target = match (replicas, percent) {
                (Some(n), None) => ScaleTarget::Count(*n),
                (None, Some(p)) => ScaleTarget::Percent { percent: *p, max_instances: *max_instances },
                _ => bail!("one of --replicas or --percent is required"),
            };
            RolloutRequest {
                release_name: release.clone(),
                namespace: cli.namespace.clone(),
                manifest_yaml: String::new(),
                strategy: Strategy::Scale {
                    workload: workload.clone(),
                    target,
                    skip_steady_check: *skip_steady_check,
                },
                timeout: Duration::from_secs(*timeout_secs),
                retention: default_retention(),
            }
        }
        Commands::History { release } => {
            let history = store.load(release).await?;
            match cli.output {
                Output::Json => println!("{}", serde_json::to_string_pretty(&history)?),
                Output::Human => {
                    println!("NUMBER  STATUS      CREATED                    MANAGED");
                    for r in &history.releases {
                        let managed = r
                            .managed_workload
                            .as_ref()
                            .map(|id| id.kind_name_ref())
                            .unwrap_or_else(|| "-".to_string());
                        println!("{:<7} {:<11} {:<26} {}", r.number, format!("{:?}", r.status), r.created_at, managed);
                    }
                }
            }
            return Ok(());
        }
    };

    info!(release = %request.release_name, ns = %cli.namespace, "starting rollout");
    let outcome = run_rollout(&gateway, &store, &request).await?;
    print_outcome(&outcome, cli.output)?;
    if outcome.status != ReleaseStatus::Succeeded {
        std::process::exit(1);
    }
    Ok(())
}
