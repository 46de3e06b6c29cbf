//! Service Mirror - mirrors services from a remote cluster named by a Link

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use kube::CustomResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::info;

use service_mirror::admin::start_admin_server;
use service_mirror::config::{EngineSettings, DEFAULT_REQUEUE_LIMIT};
use service_mirror::crd::Link;
use service_mirror::kube_utils::create_client;
use service_mirror::link_watch::{run_link_watch, LinkWatchConfig};
use service_mirror::remote::KubeRemoteConnector;
use service_mirror::shutdown::ShutdownSignals;
use service_mirror::store::{purge_cluster, KubeMirrorStore};
use service_mirror::supervisor::Supervisor;
use service_mirror::telemetry::{init_telemetry, TelemetryConfig};

/// Service Mirror - mirror remote cluster services into this cluster
#[derive(Parser, Debug)]
#[command(name = "service-mirror", version, about, long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Mirror services for a Link (default mode)
    Run(RunArgs),

    /// Print the Link CRD manifest and exit
    Crd,

    /// Delete every mirror service and endpoint set of a remote cluster
    ///
    /// Deleting a Link leaves its mirrors in place; this is the explicit
    /// cleanup step.
    Purge {
        /// Remote cluster name (the Link's targetClusterName)
        cluster: String,

        /// Path to a kubeconfig for the local cluster (in-cluster config if unset)
        #[arg(long)]
        kubeconfig: Option<PathBuf>,
    },
}

/// Arguments of the mirroring mode
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Path to a kubeconfig for the local cluster (in-cluster config if unset)
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Namespace holding the Link and its credentials secret
    #[arg(long, env = "SERVICE_MIRROR_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Retries for a failing event before it is abandoned
    #[arg(long, default_value_t = DEFAULT_REQUEUE_LIMIT)]
    event_requeue_limit: u32,

    /// Period of the endpoint repair pass, in seconds
    #[arg(long, default_value_t = 60, value_parser = clap::value_parser!(u64).range(1..))]
    endpoint_refresh_period_secs: u64,

    /// How often the credentials secret is re-read, in seconds
    #[arg(long, default_value_t = 300, value_parser = clap::value_parser!(u64).range(1..))]
    credentials_refresh_secs: u64,

    /// Address of the admin server (/live, /ready, /stats)
    #[arg(long, env = "SERVICE_MIRROR_ADMIN_ADDR", default_value = "0.0.0.0:9999")]
    admin_addr: SocketAddr,

    /// Name of the Link to mirror
    #[arg(value_name = "LINK_NAME")]
    link_name: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider - FIPS-validated aws-lc-rs
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install FIPS-validated crypto provider: {:?}",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Crd) => {
            let crd = serde_yaml::to_string(&Link::crd())
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("{crd}");
            Ok(())
        }
        Some(Commands::Purge {
            cluster,
            kubeconfig,
        }) => {
            let _telemetry = init_telemetry(TelemetryConfig::default())?;
            run_purge(kubeconfig, &cluster).await
        }
        Some(Commands::Run(args)) => run_mirror(args).await,
        None => run_mirror(cli.run).await,
    }
}

/// Mirror services for one Link until interrupted
async fn run_mirror(args: RunArgs) -> anyhow::Result<()> {
    let link_name = args
        .link_name
        .clone()
        .ok_or_else(|| anyhow::anyhow!("LINK_NAME is required"))?;

    let _telemetry = init_telemetry(TelemetryConfig {
        link_name: Some(link_name.clone()),
        ..Default::default()
    })?;

    let mut signals = ShutdownSignals::install()
        .map_err(|e| anyhow::anyhow!("Failed to install shutdown signal handlers: {}", e))?;

    let client = create_client(args.kubeconfig.as_deref())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create local cluster client: {}", e))?;

    let settings = EngineSettings::new(
        args.event_requeue_limit,
        Duration::from_secs(args.endpoint_refresh_period_secs),
    );
    info!(
        link = %link_name,
        namespace = %args.namespace,
        requeue_limit = settings.requeue_limit,
        repair_period_secs = settings.repair_period.as_secs(),
        "starting service mirror"
    );

    let supervisor = Arc::new(Supervisor::new(
        Arc::new(KubeRemoteConnector),
        Arc::new(KubeMirrorStore::new(client.clone())),
        settings,
    ));

    let shutdown = CancellationToken::new();

    let admin = tokio::spawn(start_admin_server(
        args.admin_addr,
        supervisor.clone(),
        shutdown.clone(),
    ));

    let watch = tokio::spawn(run_link_watch(
        client,
        supervisor.clone(),
        LinkWatchConfig {
            namespace: args.namespace,
            link_name,
            credentials_refresh: Duration::from_secs(args.credentials_refresh_secs),
        },
        shutdown.clone(),
    ));

    signals.recv().await;

    shutdown.cancel();
    // Before joining the watch: a Link handler may be waiting on an
    // engine's initial sync
    supervisor.shutdown().await;
    let _ = watch.await;
    let _ = admin.await;

    info!("service mirror stopped");
    Ok(())
}

/// Remove all mirrors of a remote cluster
async fn run_purge(kubeconfig: Option<PathBuf>, cluster: &str) -> anyhow::Result<()> {
    let client = create_client(kubeconfig.as_deref())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create local cluster client: {}", e))?;
    let store = KubeMirrorStore::new(client);

    let removed = purge_cluster(&store, cluster)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to purge mirrors of {}: {}", cluster, e))?;
    info!(cluster = %cluster, removed, "purged mirror services");
    Ok(())
}
