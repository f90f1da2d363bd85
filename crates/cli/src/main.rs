use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use kubeinit_apply::UpsertOutcome;
use kubeinit_kubehub::{ClientOptions, ClientSource, KubeCluster};
use kubeinit_ops::{
    migration, reconcile_once, workload, FreshnessDecision, MigrationJobSpec, PassReport, ReconcileConfig, ServiceSpec,
    WorkloadSpec,
};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod bump;
mod pretty;

use pretty::Printer;

#[derive(Parser, Debug)]
#[command(name = "kubeinit", version, about = "Keep the migration job, deployment and load balancer converged")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Disable colored output
    #[arg(long = "no-color", global = true, action = ArgAction::SetTrue)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json, Yaml }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one reconciliation pass, or one per interval until Ctrl-C
    Reconcile {
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        conn: ConnArgs,
        /// Repeat the pass every N seconds instead of exiting
        #[arg(long = "interval-secs", env = "KUBEINIT_INTERVAL_SECS")]
        interval_secs: Option<u64>,
    },
    /// Print the desired Job, Deployment and Service without touching the cluster
    Render {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Print the next semantic version
    Bump {
        /// Current version, e.g. v1.0.13
        version: String,
        /// major, minor or patch
        #[arg(short = 'i', long = "increment", default_value = "patch")]
        increment: String,
    },
}

#[derive(Args, Debug, Clone)]
struct TargetArgs {
    #[arg(short = 'n', long = "namespace", env = "KUBEINIT_NAMESPACE", default_value = "default")]
    namespace: String,
    #[arg(long = "deployment-name", env = "KUBEINIT_DEPLOYMENT", default_value = "go-infra")]
    deployment_name: String,
    #[arg(long = "service-name", env = "KUBEINIT_SERVICE", default_value = "go-infra-service")]
    service_name: String,
    #[arg(long = "replicas", env = "KUBEINIT_REPLICAS", default_value_t = 1)]
    replicas: i32,
    /// Application image, e.g. ghcr.io/acme/go-infra:v1.0.13
    #[arg(long = "image", env = "KUBEINIT_IMAGE")]
    image: String,
    #[arg(long = "container-port", env = "KUBEINIT_CONTAINER_PORT", default_value_t = 8993)]
    container_port: i32,
    /// Port the load balancer exposes
    #[arg(long = "service-port", env = "KUBEINIT_SERVICE_PORT", default_value_t = 80)]
    service_port: i32,
    #[arg(long = "deploy-service", env = "KUBEINIT_DEPLOY_SERVICE", default_value_t = true, action = ArgAction::Set)]
    deploy_service: bool,
    #[arg(long = "allocate-node-ports", env = "KUBEINIT_ALLOCATE_NODE_PORTS", default_value_t = true, action = ArgAction::Set)]
    allocate_node_ports: bool,
    /// Migration image; defaults to --image
    #[arg(long = "migration-image", env = "KUBEINIT_MIGRATION_IMAGE")]
    migration_image: Option<String>,
    #[arg(long = "migration-job-name", env = "KUBEINIT_MIGRATION_JOB", default_value = "go-infra-migration")]
    migration_job_name: String,
    /// Secret holding the migration .env file
    #[arg(long = "migration-secret", env = "KUBEINIT_MIGRATION_SECRET", default_value = "k3s-env")]
    migration_secret: String,
    #[arg(long = "skip-migration", action = ArgAction::SetTrue)]
    skip_migration: bool,
    /// Age after which the last successful migration is rerun
    #[arg(long = "staleness-secs", env = "KUBEINIT_STALENESS_SECS", default_value_t = 120)]
    staleness_secs: u64,
}

#[derive(Args, Debug, Clone)]
struct ConnArgs {
    /// Kubeconfig file; kube defaults apply when omitted
    #[arg(long = "kubeconfig", env = "KUBEINIT_KUBECONFIG", conflicts_with = "in_cluster")]
    kubeconfig: Option<PathBuf>,
    #[arg(long = "context", env = "KUBEINIT_CONTEXT")]
    context: Option<String>,
    /// Use the pod's service account
    #[arg(long = "in-cluster", action = ArgAction::SetTrue)]
    in_cluster: bool,
    /// Deadline for each API request
    #[arg(long = "timeout-secs", env = "KUBEINIT_TIMEOUT_SECS", default_value_t = 10)]
    timeout_secs: u64,
}

impl TargetArgs {
    fn migration(&self) -> MigrationJobSpec {
        let image = self.migration_image.clone().unwrap_or_else(|| self.image.clone());
        let mut spec = MigrationJobSpec::new(&self.namespace, &self.migration_job_name, image);
        spec.labels.insert("app".to_string(), self.deployment_name.clone());
        spec.secret_name = self.migration_secret.clone();
        spec.volume_name = self.migration_secret.clone();
        spec
    }

    fn workload(&self) -> WorkloadSpec {
        let mut spec = WorkloadSpec::new(&self.namespace, &self.deployment_name, &self.image);
        spec.replicas = self.replicas;
        spec.container_port = self.container_port;
        if self.deploy_service {
            spec.service = Some(ServiceSpec {
                name: self.service_name.clone(),
                port: self.service_port,
                allocate_node_ports: self.allocate_node_ports,
            });
        }
        spec
    }

    fn config(&self) -> ReconcileConfig {
        ReconcileConfig {
            migration: (!self.skip_migration).then(|| self.migration()),
            workload: Some(self.workload()),
            staleness: Duration::from_secs(self.staleness_secs),
        }
    }
}

impl ConnArgs {
    fn options(&self) -> ClientOptions {
        let source = match (&self.kubeconfig, self.in_cluster) {
            (_, true) => ClientSource::InCluster,
            (Some(path), false) => ClientSource::Kubeconfig(path.clone()),
            (None, false) => ClientSource::Infer,
        };
        ClientOptions { source, context: self.context.clone(), request_timeout: Duration::from_secs(self.timeout_secs) }
    }
}

/// Log to stderr so `render -o json` stays pipeable; filter from `KUBEINIT_LOG`.
fn init_tracing() {
    let filter = EnvFilter::try_from_env("KUBEINIT_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

/// Serve Prometheus metrics when `KUBEINIT_METRICS_ADDR` names a socket address.
fn init_metrics() {
    let Ok(addr) = std::env::var("KUBEINIT_METRICS_ADDR") else { return };
    let sock = match addr.parse::<SocketAddr>() {
        Ok(sock) => sock,
        Err(e) => {
            warn!(addr = %addr, error = %e, "metrics disabled: KUBEINIT_METRICS_ADDR is not host:port");
            return;
        }
    };
    if let Err(e) = PrometheusBuilder::new().with_http_listener(sock).install() {
        warn!(addr = %sock, error = %e, "metrics disabled: exporter failed to start");
        return;
    }
    info!(addr = %sock, "serving /metrics");
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let printer = if cli.no_color { Printer::plain() } else { Printer::default() };

    match run(cli, printer).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = ?e, "kubeinit failed");
            printer.error(format!("{:#}", e));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, printer: Printer) -> Result<()> {
    match cli.command {
        Commands::Bump { version, increment } => {
            let next = bump::bump_version(&version, &increment).context("bumping version")?;
            println!("{}", next);
        }
        Commands::Render { target } => render(&target, cli.output)?,
        Commands::Reconcile { target, conn, interval_secs } => {
            let opts = conn.options();
            let client = kubeinit_kubehub::connect(&opts).await?;
            match kubeinit_kubehub::server_version(&client).await {
                Ok(v) => info!(version = %v, "connected to api server"),
                Err(e) => warn!(error = %e, "api server version probe failed"),
            }
            let cluster = KubeCluster::new(client, opts.request_timeout);
            let config = target.config();

            match interval_secs {
                None => {
                    let report = reconcile_once(&cluster, &config, Utc::now()).await.context("reconcile pass failed")?;
                    print_report(&report, cli.output, &printer)?;
                }
                Some(secs) => {
                    let mut tick = tokio::time::interval(Duration::from_secs(secs.max(1)));
                    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    info!(interval_secs = secs, "reconciling on interval; Ctrl-C to stop");
                    loop {
                        tokio::select! {
                            _ = tick.tick() => {
                                counter!("reconcile_passes", 1u64);
                                match reconcile_once(&cluster, &config, Utc::now()).await {
                                    Ok(report) => print_report(&report, cli.output, &printer)?,
                                    Err(e) => {
                                        counter!("reconcile_pass_err", 1u64);
                                        let e = anyhow::Error::new(e).context("reconcile pass failed");
                                        error!(error = ?e, "pass failed; retrying on next tick");
                                        printer.error(format!("{:#}", e));
                                    }
                                }
                            }
                            _ = signal::ctrl_c() => {
                                info!("Ctrl-C received; stopping");
                                break;
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

fn render(target: &TargetArgs, output: Output) -> Result<()> {
    let config = target.config();
    let job = config.migration.as_ref().map(migration::job);
    let workload = config.workload.as_ref();
    let deployment = workload.map(workload::deployment);
    let service = workload.and_then(|w| w.service.as_ref().map(|s| workload::load_balancer(w, s)));

    match output {
        Output::Json => {
            let mut docs = Vec::new();
            if let Some(j) = &job { docs.push(serde_json::to_value(j)?); }
            if let Some(d) = &deployment { docs.push(serde_json::to_value(d)?); }
            if let Some(s) = &service { docs.push(serde_json::to_value(s)?); }
            println!("{}", serde_json::to_string_pretty(&docs)?);
        }
        Output::Human | Output::Yaml => {
            let mut docs = Vec::new();
            if let Some(j) = &job { docs.push(serde_yaml::to_string(j)?); }
            if let Some(d) = &deployment { docs.push(serde_yaml::to_string(d)?); }
            if let Some(s) = &service { docs.push(serde_yaml::to_string(s)?); }
            print!("{}", docs.join("---\n"));
        }
    }
    Ok(())
}

fn print_report(report: &PassReport, output: Output, printer: &Printer) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(report)?),
        Output::Yaml => print!("{}", serde_yaml::to_string(report)?),
        Output::Human => {
            if let Some(m) = &report.migration {
                let latest = printer.dim(m.latest.as_deref().unwrap_or("-"));
                match (m.decision, &m.created) {
                    (FreshnessDecision::AmbiguousCompletion, created) => printer.warning(format!(
                        "migration: {} reported success without a completion time; dispatched {}",
                        latest,
                        created.as_deref().unwrap_or("-")
                    )),
                    (decision, Some(created)) => {
                        printer.info(format!("migration: {} ({}); created job {}", decision, latest, created))
                    }
                    (decision, None) => printer.info(format!("migration: {} ({}); nothing to do", decision, latest)),
                }
            }
            if let Some(w) = &report.workload {
                printer.info(format!("deployment: {}", describe(&w.deployment)));
                if let Some(s) = &w.service {
                    printer.info(format!("service: {}", describe(s)));
                }
            }
        }
    }
    Ok(())
}

fn describe(outcome: &UpsertOutcome) -> String {
    let rv = outcome.resource_version().unwrap_or("-");
    match outcome {
        UpsertOutcome::Created { .. } => format!("created (rv {})", rv),
        UpsertOutcome::Updated { summary, .. } if summary.is_empty() => format!("unchanged (rv {})", rv),
        UpsertOutcome::Updated { summary, .. } => format!(
            "updated (rv {}; +{} ~{} -{})",
            rv, summary.adds, summary.updates, summary.removes
        ),
    }
}
