//! Jiva CSI driver
//!
//! One binary for both halves of the driver: `--mode controller` runs next
//! to the orchestrator's provisioner sidecars, `--mode node` runs on every
//! host that attaches volumes, `--mode all` runs both in one process.

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use jiva_csi::{
    crd, BackendControlRef, ControllerService, DriverConfig, Error, HostConfig, HostOpsRef,
    IdentityService, JivaBackend, KubeVolumeStore, LinuxHost, MemoryVolumeStore, Metrics,
    NodeService, PublishRecords, QuorumPolicy, Result, RpcServer, Services, VolumeLocks,
    VolumeStoreRef,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Which services this process serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Controller,
    Node,
    All,
}

impl Mode {
    fn runs_controller(self) -> bool {
        matches!(self, Mode::Controller | Mode::All)
    }

    fn runs_node(self) -> bool {
        matches!(self, Mode::Node | Mode::All)
    }
}

/// Jiva CSI driver - replicated block volumes over iSCSI
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Services to run
    #[arg(long, env = "CSI_MODE", value_enum, default_value = "all")]
    mode: Mode,

    /// YAML configuration file; flags below override it
    #[arg(long, env = "CSI_CONFIG")]
    config: Option<PathBuf>,

    /// Identity of this node (node mode)
    #[arg(long, env = "NODE_ID")]
    node_id: Option<String>,

    /// RPC listen address
    #[arg(long, env = "CSI_ENDPOINT")]
    endpoint: Option<SocketAddr>,

    /// Namespace of the JivaVolume resources
    #[arg(long, env = "JIVA_NAMESPACE")]
    namespace: Option<String>,

    /// Jiva management API base URL
    #[arg(long, env = "JIVA_MANAGEMENT_URL")]
    management_url: Option<String>,

    /// Replica quorum: `majority` or a replica count
    #[arg(long, env = "JIVA_QUORUM")]
    quorum: Option<QuorumPolicy>,

    /// Seconds CreateVolume waits for quorum
    #[arg(long, env = "CREATE_TIMEOUT")]
    create_timeout_secs: Option<u64>,

    /// Seconds ControllerExpandVolume waits for the resize
    #[arg(long, env = "EXPAND_TIMEOUT")]
    expand_timeout_secs: Option<u64>,

    /// Directory for persisted publish records (node mode)
    #[arg(long, env = "CSI_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:9808")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9809")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Run in standalone mode (in-memory volume store, no Kubernetes)
    #[arg(long, env = "STANDALONE")]
    standalone: bool,

    /// Print the JivaVolume CRD manifest and exit
    #[arg(long)]
    print_crd: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crd {
        print!("{}", crd::crd_manifest()?);
        return Ok(());
    }

    init_logging(&args);
    let config = load_config(&args)?;

    info!("Starting Jiva CSI driver");
    info!("  Version: {}", jiva_csi::VERSION);
    info!("  Mode: {:?}", args.mode);
    info!("  Driver: {}", config.driver_name);
    info!("  Endpoint: {}", config.server.endpoint);
    info!("  Quorum: {}", config.reconciler.policy);
    info!("  Standalone mode: {}", args.standalone);

    let store: VolumeStoreRef = if args.standalone {
        warn!("Standalone mode: volumes live in memory only");
        Arc::new(MemoryVolumeStore::new())
    } else {
        let client = kube::Client::try_default().await?;
        Arc::new(KubeVolumeStore::new(client, &config.namespace))
    };

    let locks = VolumeLocks::new();
    let metrics = Arc::new(Metrics::new()?);
    let shutdown = CancellationToken::new();

    let controller = if args.mode.runs_controller() {
        let backend: BackendControlRef = Arc::new(JivaBackend::new(config.backend.clone())?);
        info!("Controller service enabled, backend at {}", config.backend.management_url);
        Some(Arc::new(ControllerService::new(
            store.clone(),
            backend,
            locks.clone(),
            &config,
        )))
    } else {
        None
    };

    let node = if args.mode.runs_node() {
        let node_id = config.node.node_id.clone().ok_or_else(|| {
            Error::Configuration("--node-id is required to run the node service".into())
        })?;
        let records = Arc::new(match &config.node.state_dir {
            Some(dir) => PublishRecords::with_state_dir(dir),
            None => PublishRecords::new(),
        });
        records.recover().await?;

        let host: HostOpsRef = Arc::new(LinuxHost::new(HostConfig {
            login_attempts: config.node.login_attempts,
            login_retry: config.node.login_retry(),
            ..Default::default()
        }));
        info!("Node service enabled as {}", node_id);
        Some(Arc::new(NodeService::new(
            node_id,
            store.clone(),
            host,
            locks.clone(),
            records,
            &config.node,
        )))
    } else {
        None
    };

    let identity = Arc::new(IdentityService::new(
        config.driver_name.clone(),
        store.clone(),
        controller.is_some(),
    ));

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_identity = identity.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_identity).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let exported = metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, exported).await {
            error!("Metrics server error: {}", e);
        }
    });

    // Stop on SIGINT / SIGTERM
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        signal_token.cancel();
    });

    let services = Services {
        identity,
        controller,
        node,
    };
    RpcServer::new(config.server.clone(), services, metrics, shutdown)
        .run()
        .await?;

    info!("Driver shutdown complete");
    Ok(())
}

// =============================================================================
// Configuration
// =============================================================================

/// File configuration (or defaults) with command line overrides applied
fn load_config(args: &Args) -> Result<DriverConfig> {
    let mut config = match &args.config {
        Some(path) => DriverConfig::from_file(path)?,
        None => DriverConfig::default(),
    };

    if let Some(node_id) = &args.node_id {
        config.node.node_id = Some(node_id.clone());
    }
    if let Some(endpoint) = args.endpoint {
        config.server.endpoint = endpoint;
    }
    if let Some(namespace) = &args.namespace {
        config.namespace = namespace.clone();
    }
    if let Some(url) = &args.management_url {
        config.backend.management_url = url.clone();
    }
    if let Some(policy) = args.quorum {
        config.reconciler.policy = policy;
    }
    if let Some(secs) = args.create_timeout_secs {
        config.controller.create_timeout_secs = secs;
    }
    if let Some(secs) = args.expand_timeout_secs {
        config.controller.expand_timeout_secs = secs;
    }
    if let Some(dir) = &args.state_dir {
        config.node.state_dir = Some(dir.clone());
    }

    config.validate()?;
    Ok(config)
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

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn", "reqwest=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

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

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str, identity: Arc<IdentityService>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let identity = identity.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let identity = identity.clone();
                async move {
                    let (status, body) = match req.uri().path() {
                        "/healthz" | "/livez" => (StatusCode::OK, "ok"),
                        "/readyz" => match identity.probe().await {
                            Ok(probe) if probe.ready => (StatusCode::OK, "ok"),
                            _ => (StatusCode::SERVICE_UNAVAILABLE, "not ready"),
                        },
                        _ => (StatusCode::NOT_FOUND, "not found"),
                    };
                    let mut response = Response::new(Body::from(body));
                    *response.status_mut() = status;
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, metrics: Arc<Metrics>) -> Result<()> {
    use hyper::header::CONTENT_TYPE;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let response = match (req.uri().path(), metrics.encode()) {
                        ("/metrics", Ok((content_type, buffer))) => {
                            let mut response = Response::new(Body::from(buffer));
                            if let Ok(value) = content_type.parse() {
                                response.headers_mut().insert(CONTENT_TYPE, value);
                            }
                            response
                        }
                        ("/metrics", Err(e)) => {
                            let mut response = Response::new(Body::from(e.to_string()));
                            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                            response
                        }
                        _ => {
                            let mut response = Response::new(Body::from("not found"));
                            *response.status_mut() = StatusCode::NOT_FOUND;
                            response
                        }
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
