use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use clusterjobs::accounting::{AccountingClient, HttpAccountingClient, StateReporter};
use clusterjobs::cli::{apply_overrides, format_dry_run, Args};
use clusterjobs::config::{load_or_default, Config, RuntimeBackend};
use clusterjobs::jobs::{
    spawn_monitoring, ExpiryFeature, FeatureRegistry, JobCache, JobManager, LoggingFeature,
    TaskFeature,
};
use clusterjobs::k8s::{resolve, ResourceClient};
use clusterjobs::runtime::batch::BatchRuntime;
use clusterjobs::runtime::pods::PodRuntime;
use clusterjobs::runtime::scheduled::{spawn_scheduling_loop, ScheduledRuntime};
use clusterjobs::runtime::{ContainerRuntime, TunnelOpener};
use clusterjobs::server::{create_router, AppState};

struct Service {
    manager: Arc<JobManager>,
    accounting: Arc<dyn AccountingClient>,
    background: Vec<watch::Sender<bool>>,
}

async fn build_service(config: &Config) -> anyhow::Result<Service> {
    let k8s = &config.kubernetes;
    let connection = resolve(&k8s.connection, k8s.use_proxy)
        .context("Failed to resolve the cluster connection")?;
    info!("Using cluster API at {}", connection.master_url);
    let client = Arc::new(ResourceClient::new(connection).context("Failed to build the cluster client")?);
    let tunnels = TunnelOpener::new(&k8s.namespace, k8s.port_forward_tunnels);

    let accounting: Arc<dyn AccountingClient> = Arc::new(
        HttpAccountingClient::new(
            &config.accounting.base_url,
            config.accounting_token()?,
            Duration::from_secs(config.accounting.timeout_secs),
        )
        .context("Failed to build the accounting client")?,
    );
    let cache = Arc::new(JobCache::new());
    let reporter = Arc::new(StateReporter::new(accounting.clone(), cache));

    let mut background = Vec::new();
    let runtime: Arc<dyn ContainerRuntime> = match config.runtime.backend {
        RuntimeBackend::Batch => Arc::new(BatchRuntime::new(client, &k8s.namespace, tunnels)),
        RuntimeBackend::Pods => Arc::new(PodRuntime::new(client, &k8s.namespace, tunnels)),
        RuntimeBackend::Scheduled => {
            let runtime = Arc::new(
                ScheduledRuntime::new(client, &k8s.namespace, tunnels, config.scheduled_runtime())
                    .with_status_sink(reporter.clone()),
            );
            background.push(spawn_scheduling_loop(runtime.clone()));
            runtime
        }
    };

    let features = FeatureRegistry::new()
        .with(
            TaskFeature::new(k8s.category_selectors.clone())
                .with_node_type_label(&k8s.node_type_label),
        )
        .with(ExpiryFeature::new(
            config.jobs.default_max_time_secs.map(Duration::from_secs),
        ))
        .with(LoggingFeature);
    info!("Job features: {}", features.names().join(", "));

    let manager = Arc::new(JobManager::new(runtime, reporter, features, config.job_manager()));
    background.push(spawn_monitoring(manager.clone()));

    Ok(Service {
        manager,
        accounting,
        background,
    })
}

/// Report every job the authority believes is active but this cluster lost
fn spawn_startup_verification(manager: Arc<JobManager>, accounting: Arc<dyn AccountingClient>) {
    tokio::spawn(async move {
        let jobs = match accounting.browse_active().await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!("Could not list active jobs for verification: {}", e);
                return;
            }
        };
        match manager.verify_jobs(&jobs).await {
            Ok(lost) => info!("Verified {} active jobs, {} lost", jobs.len(), lost),
            Err(e) => warn!("Job verification failed: {}", e),
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    // Load .env file if specified
    if let Some(ref env_file) = args.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
    }

    let mut config = match load_or_default(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config {}: {}", args.config_path().display(), e);
            process::exit(1);
        }
    };
    apply_overrides(&mut config, &args);
    if let Err(e) = config.validate() {
        error!("{}", e);
        process::exit(1);
    }

    // Dry-run mode: print the resolved configuration and exit
    if args.dry_run {
        println!("{}", format_dry_run(&config, &args));
        return;
    }

    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    info!(
        "Starting clusterjobs v{} on {} ({:?} runtime, namespace {})",
        env!("CARGO_PKG_VERSION"),
        host,
        config.runtime.backend,
        config.kubernetes.namespace
    );

    let service = match build_service(&config).await {
        Ok(service) => service,
        Err(e) => {
            error!("{:#}", e);
            process::exit(1);
        }
    };
    if args.paused {
        service.manager.set_maintenance(true);
    }
    spawn_startup_verification(service.manager.clone(), service.accounting.clone());

    let state = AppState::new(service.manager.clone())
        .with_concurrency_limit(config.server.max_concurrent_requests);
    let app = create_router(state);

    let addr = format!("{}:{}", config.server.bind_addr, config.server.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            process::exit(1);
        }
    };

    info!("Server listening on {}", addr);
    info!("Endpoints:");
    info!("  GET    /health                         - Health check");
    info!("  GET    /v1/status                      - Service status");
    info!("  POST   /v1/jobs                        - Register and create a job");
    info!("  POST   /v1/jobs/create                 - Create a registered job");
    info!("  POST   /v1/jobs/verify                 - Verify active jobs");
    info!("  DELETE /v1/jobs/{{id}}                   - Cancel a job");
    info!("  POST   /v1/jobs/{{id}}/extend            - Extend a job's time allowance");
    info!("  GET    /v1/jobs/{{id}}/{{rank}}/logs       - Replica logs");
    info!("  GET    /v1/jobs/{{id}}/{{rank}}/shell      - Interactive shell (websocket)");
    info!("  POST   /v1/jobs/{{id}}/{{rank}}/tunnel     - Open a tunnel to a replica port");
    info!("  DELETE /v1/tunnels/{{id}}                - Close a tunnel");
    info!("  GET    /v1/nodes                       - Compute nodes");
    info!("  PUT    /v1/maintenance                 - Toggle maintenance mode");

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    for tx in &service.background {
        let _ = tx.send(true);
    }

    if let Err(e) = result {
        error!("Server error: {}", e);
        process::exit(1);
    }
}
