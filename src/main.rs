//! corral - Cluster and Machine controllers with a GCE actuator

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;

use corral_cluster::controller::cluster::{self, ClusterContext};
use corral_cluster::controller::machine::{self, MachineContext};
use corral_cluster::{error_policy, ClusterActuator, Context, KubeClient, KubeClientImpl, MachineActuator};
use corral_common::crd::{Cluster, Machine};
use corral_common::events::{EventPublisher, KubeEventPublisher};
use corral_common::retry::PollConfig;
use corral_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use corral_gce::compute::rest::GceComputeClient;
use corral_gce::compute::ComputeService;
use corral_gce::iam::gcloud::GcloudIamClient;
use corral_gce::setup::{ClusterParams, ConfigWatch, MachineParams, SetupSource};
use corral_gce::{GceClusterActuator, GceMachineActuator};

/// corral - cluster-api style controllers provisioning GCE infrastructure
#[derive(Parser, Debug)]
#[command(name = "corral", version, about, long_about = None)]
struct Cli {
    /// Print the Cluster and Machine CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Log line encoding
    #[arg(long, value_enum, env = "CORRAL_LOG_FORMAT", default_value = "json", global = true)]
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the reconcile controllers
    Controller(ControllerArgs),

    /// Inspect setup tables
    #[command(subcommand)]
    Setup(SetupCommand),
}

#[derive(Subcommand, Debug)]
enum SetupCommand {
    /// Print the canonical YAML of a machine setup table
    Print {
        /// Machine setup table to load
        #[arg(long, env = "CORRAL_MACHINE_SETUP_CONFIG")]
        machine_setup_config: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ControllerKind {
    Cluster,
    Machine,
    All,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormatArg {
    Json,
    Text,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Json => LogFormat::Json,
            LogFormatArg::Text => LogFormat::Text,
        }
    }
}

/// Controller mode arguments
#[derive(Args, Debug)]
struct ControllerArgs {
    /// Which controllers to run
    #[arg(long, value_enum, env = "CORRAL_KIND", default_value = "all")]
    kind: ControllerKind,

    /// Only watch this namespace; all namespaces when unset
    #[arg(long, env = "CORRAL_NAMESPACE")]
    namespace: Option<String>,

    /// Cluster setup table; every cluster project must match one entry
    #[arg(long, env = "CORRAL_CLUSTER_SETUP_CONFIG")]
    cluster_setup_config: Option<PathBuf>,

    /// Machine setup table with images and startup scripts
    #[arg(long, env = "CORRAL_MACHINE_SETUP_CONFIG")]
    machine_setup_config: Option<PathBuf>,

    /// Delay before the second poll of a cloud operation
    #[arg(long, env = "CORRAL_POLL_INTERVAL_SECS", default_value = "2")]
    poll_interval_secs: u64,

    /// Give up waiting for a cloud operation after this long
    #[arg(long, env = "CORRAL_OPERATION_TIMEOUT_SECS", default_value = "600")]
    operation_timeout_secs: u64,

    /// Create controller service accounts and import their keys as secrets
    #[arg(long, env = "CORRAL_PROVISION_CONTROLLER_CREDENTIALS")]
    provision_controller_credentials: bool,

    /// gcloud binary used for IAM operations
    #[arg(long, env = "CORRAL_GCLOUD", default_value = "gcloud")]
    gcloud: PathBuf,

    /// Timeout for a single gcloud invocation
    #[arg(long, env = "CORRAL_GCLOUD_TIMEOUT_SECS", default_value = "120")]
    gcloud_timeout_secs: u64,
}

impl ControllerArgs {
    fn poll_config(&self) -> anyhow::Result<PollConfig> {
        let poll = PollConfig::new(
            Duration::from_secs(self.poll_interval_secs),
            Duration::from_secs(self.operation_timeout_secs),
        );
        poll.validate()
            .context("invalid --poll-interval-secs / --operation-timeout-secs")?;
        Ok(poll)
    }

    fn runs(&self, kind: ControllerKind) -> bool {
        self.kind == ControllerKind::All || self.kind == kind
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("failed to install crypto provider: {e:?}");
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        let cluster = serde_yaml::to_string(&Cluster::crd()).context("serializing Cluster CRD")?;
        let machine = serde_yaml::to_string(&Machine::crd()).context("serializing Machine CRD")?;
        println!("{cluster}---\n{machine}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        log_format: cli.log_format.into(),
        ..Default::default()
    })?;

    match cli.command {
        Some(Commands::Setup(SetupCommand::Print {
            machine_setup_config,
        })) => print_setup(machine_setup_config).await,
        Some(Commands::Controller(args)) => run_controllers(args).await,
        None => anyhow::bail!("no command given; try `corral controller --help`"),
    }
}

async fn print_setup(path: PathBuf) -> anyhow::Result<()> {
    let table = ConfigWatch::<MachineParams>::new(&path)?.setup_config().await?;
    print!("{}", table.get_yaml()?);
    Ok(())
}

/// Shared clients for both controllers
struct Providers {
    client: Client,
    kube: Arc<dyn KubeClient>,
    compute: Arc<dyn ComputeService>,
}

async fn run_controllers(args: ControllerArgs) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .context("creating Kubernetes client")?;
    let providers = Providers {
        kube: Arc::new(KubeClientImpl::new(client.clone())),
        compute: Arc::new(GceComputeClient::new().await?),
        client,
    };

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested, cancelling in-flight operations");
                shutdown.cancel();
            }
        }
    });

    let cluster_ctx = if args.runs(ControllerKind::Cluster) {
        Some(cluster_context(&args, &providers, shutdown.clone())?)
    } else {
        None
    };
    let machine_ctx = if args.runs(ControllerKind::Machine) {
        Some(machine_context(&args, &providers, shutdown.clone())?)
    } else {
        None
    };

    tracing::info!(kind = ?args.kind, namespace = ?args.namespace, "starting controllers");
    let clusters = async {
        if let Some(ctx) = cluster_ctx {
            run_cluster_controller(scoped_api(&providers.client, &args.namespace), ctx).await;
        }
    };
    let machines = async {
        if let Some(ctx) = machine_ctx {
            run_machine_controller(scoped_api(&providers.client, &args.namespace), ctx).await;
        }
    };
    tokio::join!(clusters, machines);

    shutdown.cancel();
    tracing::info!("controllers stopped");
    Ok(())
}

fn scoped_api<K>(client: &Client, namespace: &Option<String>) -> Api<K>
where
    K: kube::Resource<Scope = kube::core::NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

fn cluster_context(
    args: &ControllerArgs,
    providers: &Providers,
    shutdown: CancellationToken,
) -> anyhow::Result<Arc<ClusterContext>> {
    let events: Arc<dyn EventPublisher> = Arc::new(KubeEventPublisher::new(
        providers.client.clone(),
        "corral-cluster-controller",
    ));
    let iam = Arc::new(GcloudIamClient::new(
        args.gcloud.clone(),
        Duration::from_secs(args.gcloud_timeout_secs),
    ));

    let mut actuator = GceClusterActuator::new(
        providers.compute.clone(),
        iam,
        providers.kube.clone(),
        events.clone(),
        args.poll_config()?,
    )
    .with_credentials(args.provision_controller_credentials);
    if let Some(path) = &args.cluster_setup_config {
        let source: Arc<dyn SetupSource<ClusterParams>> = Arc::new(ConfigWatch::<ClusterParams>::new(path)?);
        actuator = actuator.with_cluster_setup(source);
    }

    let actuator: Arc<dyn ClusterActuator> = Arc::new(actuator);
    Ok(Arc::new(Context::new(
        providers.kube.clone(),
        actuator,
        events,
        shutdown,
    )))
}

fn machine_context(
    args: &ControllerArgs,
    providers: &Providers,
    shutdown: CancellationToken,
) -> anyhow::Result<Arc<MachineContext>> {
    let path = args
        .machine_setup_config
        .as_ref()
        .context("--machine-setup-config is required to run the machine controller")?;
    let setup: Arc<dyn SetupSource<MachineParams>> =
        Arc::new(ConfigWatch::<MachineParams>::new(path)?);

    let actuator: Arc<dyn MachineActuator> = Arc::new(GceMachineActuator::new(
        providers.compute.clone(),
        providers.kube.clone(),
        setup,
        args.poll_config()?,
    ));
    let events: Arc<dyn EventPublisher> = Arc::new(KubeEventPublisher::new(
        providers.client.clone(),
        "corral-machine-controller",
    ));
    Ok(Arc::new(Context::new(
        providers.kube.clone(),
        actuator,
        events,
        shutdown,
    )))
}

async fn run_cluster_controller(api: Api<Cluster>, ctx: Arc<ClusterContext>) {
    tracing::info!("  - Cluster controller");
    Controller::new(api, WatcherConfig::default())
        .shutdown_on_signal()
        .run(cluster::reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => tracing::debug!(?action, "Cluster reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "Cluster reconciliation error"),
            }
        })
        .await;
}

async fn run_machine_controller(api: Api<Machine>, ctx: Arc<MachineContext>) {
    tracing::info!("  - Machine controller");
    Controller::new(api, WatcherConfig::default())
        .shutdown_on_signal()
        .run(machine::reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => tracing::debug!(?action, "Machine reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "Machine reconciliation error"),
            }
        })
        .await;
}
