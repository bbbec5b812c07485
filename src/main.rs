//! Local Storage Operator
//!
//! Per-node daemon of the local storage CSI driver. Publishes the node's
//! disk inventory as a NodeDevice document, keeps every node's document
//! present, and removes orphaned volumes and partitions.
//!
//! With `--standalone` it runs a single discovery pass against an in-memory
//! registry and prints the resulting document, which is handy for checking
//! selectors on a host without a cluster.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use local_storage_operator::{
    metrics, ClusterStateRef, ConfigHandle, ConfigWatcher, DeviceManager, DiskConfig, Error,
    EventDispatcher, EventQueue, JitterConfig, KubeClusterState, NodeDeviceReconciler, NodeInfo,
    NodeRegistry, NotifyConfig, OrphanReconciler, Result, SystemExecutor, Trigger,
    VolumeScheduler,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Local Storage Operator - node-local disk inventory and orphan cleanup
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name of the node this daemon runs on
    #[arg(long, env = "NODE_NAME")]
    node_name: String,

    /// Disk selector and scheduler configuration file (YAML or JSON)
    #[arg(long, env = "CONFIG_PATH", default_value = "/etc/local-storage/config.yaml")]
    config: PathBuf,

    /// How often the configuration file is checked for changes, in seconds
    #[arg(long, env = "CONFIG_POLL_INTERVAL", default_value = "10")]
    config_poll_secs: u64,

    /// Override the disk scan interval from the config file at startup
    #[arg(long, env = "DISK_SCAN_INTERVAL")]
    disk_scan_interval: Option<u64>,

    /// Override the orphan sweep interval from the config file at startup
    #[arg(long, env = "ORPHAN_SWEEP_INTERVAL")]
    orphan_sweep_interval: Option<u64>,

    /// Override the scheduler strategy (binpack, spreadout) at startup
    #[arg(long, env = "SCHEDULER_STRATEGY")]
    scheduler_strategy: Option<String>,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Run one discovery pass without Kubernetes and print the result
    #[arg(long, env = "STANDALONE")]
    standalone: bool,

    /// In standalone mode, also place a raw volume of this many bytes
    #[arg(long, requires = "standalone")]
    place_bytes: Option<u64>,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting Local Storage Operator");
    info!("  Version: {}", local_storage_operator::VERSION);
    info!("  Node: {}", args.node_name);
    info!("  Config: {}", args.config.display());
    info!("  Standalone mode: {}", args.standalone);

    let config = ConfigHandle::new(load_config(&args)?);
    let devices = DeviceManager::new(Arc::new(SystemExecutor::new()));

    if args.standalone {
        return run_standalone(&args, config, devices).await;
    }

    metrics::init();
    let ready = Arc::new(AtomicBool::new(false));

    let health_addr = args.health_addr.clone();
    let health_ready = ready.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_ready).await {
            error!("Health server error: {}", e);
        }
    });

    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    let cluster: ClusterStateRef = KubeClusterState::try_default().await?;
    info!("Connected to Kubernetes API");

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let (dispatcher, events) = EventDispatcher::new(NotifyConfig::default());

    let inventory = NodeDeviceReconciler::new(
        args.node_name.clone(),
        cluster.clone(),
        devices.clone(),
        config.clone(),
    );
    let orphans = OrphanReconciler::new(
        args.node_name.clone(),
        cluster,
        devices,
        events.clone(),
        config.clone(),
    );

    let mut tasks = vec![
        tokio::spawn(inventory.run(events.subscribe(), shutdown_tx.subscribe())),
        tokio::spawn(orphans.run(shutdown_tx.subscribe())),
        tokio::spawn(watch_config(
            ConfigWatcher::new(&args.config, config),
            events.clone(),
            Duration::from_secs(args.config_poll_secs.max(1)),
            shutdown_tx.subscribe(),
        )),
    ];
    tasks.push(tokio::spawn(dispatcher.run(shutdown_tx.subscribe())));

    ready.store(true, Ordering::Relaxed);
    info!("Operator running");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    ready.store(false, Ordering::Relaxed);
    let _ = shutdown_tx.send(());

    for result in futures::future::join_all(tasks).await {
        if let Err(e) = result {
            error!("Task ended abnormally: {}", e);
        }
    }

    info!("Operator shutdown complete");
    Ok(())
}

// =============================================================================
// Configuration
// =============================================================================

fn load_config(args: &Args) -> Result<DiskConfig> {
    let mut config = if args.config.exists() {
        DiskConfig::load(&args.config)?
    } else {
        warn!(
            "Config file {} not found, starting without disk selectors",
            args.config.display()
        );
        DiskConfig::default()
    };

    if let Some(interval) = args.disk_scan_interval {
        config.disk_scan_interval = interval;
    }
    if let Some(interval) = args.orphan_sweep_interval {
        config.orphan_sweep_interval = interval;
    }
    if let Some(strategy) = &args.scheduler_strategy {
        config.scheduler_strategy = strategy.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Poll the config file and announce effective changes
async fn watch_config(
    mut watcher: ConfigWatcher,
    events: EventQueue,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = interval.tick() => match watcher.poll() {
                Ok(true) => {
                    if let Err(e) = events.send(Trigger::ConfigModify) {
                        warn!("Cannot announce config change: {}", e);
                    }
                }
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Config reload failed, keeping previous config"),
            },
            _ = shutdown.recv() => break,
        }
    }
}

// =============================================================================
// Standalone Mode
// =============================================================================

async fn run_standalone(args: &Args, config: ConfigHandle, devices: DeviceManager) -> Result<()> {
    let registry = NodeRegistry::new();
    registry.upsert_node(NodeInfo {
        name: args.node_name.clone(),
        ready: true,
        ..Default::default()
    });

    let reconciler = NodeDeviceReconciler::new(
        args.node_name.clone(),
        registry.clone(),
        devices,
        config.clone(),
    );
    reconciler.ensure_node_devices().await?;
    reconciler.reconcile().await?;

    let doc = registry
        .document(&args.node_name)
        .ok_or_else(|| Error::Internal(format!("no NodeDevice for {}", args.node_name)))?;
    println!("{}", serde_json::to_string_pretty(&doc)?);

    if let Some(request) = args.place_bytes {
        let scheduler =
            VolumeScheduler::new(registry, config).with_jitter(JitterConfig::disabled());
        match scheduler.select_node_device(request, "", None, false).await {
            Ok(placement) => println!("{}", serde_json::to_string_pretty(&placement)?),
            Err(e) if e.is_not_found() => warn!("No placement for {} bytes: {}", request, e),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("kube=info".parse().unwrap())
        .add_directive("tower=warn".parse().unwrap());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health and Metrics Servers
// =============================================================================

fn respond(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

fn bind_addr(addr: &str, server: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|e| Error::Configuration(format!("Invalid {} server address: {}", server, e)))
}

async fn run_health_server(addr: &str, ready: Arc<AtomicBool>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let ready = ready.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ready = ready.load(Ordering::Relaxed);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => respond(StatusCode::OK, "ok"),
                        "/readyz" if ready => respond(StatusCode::OK, "ok"),
                        "/readyz" => respond(StatusCode::SERVICE_UNAVAILABLE, "starting"),
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr = bind_addr(addr, "health")?;
    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))
}

async fn run_metrics_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{header, Body, Request, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let mut buffer = Vec::new();
                    match encoder.encode(&prometheus::gather(), &mut buffer) {
                        Ok(()) => {
                            let mut response = respond(StatusCode::OK, buffer);
                            if let Ok(value) = header::HeaderValue::from_str(encoder.format_type()) {
                                response.headers_mut().insert(header::CONTENT_TYPE, value);
                            }
                            response
                        }
                        Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                    }
                }
                _ => respond(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr = bind_addr(addr, "metrics")?;
    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))
}
