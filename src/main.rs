// src/main.rs
use anyhow::{Context, Result};
use clap::Parser;
use hyper::{Body, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use rotor_lb::{
    config::{self, Config},
    health::HealthChecker,
    metrics::MetricsRegistry,
    proxy::{Backend, BackendPool, Proxy},
    server::{RequestHandler, ServerBuilder},
};

#[derive(Parser, Debug)]
#[command(name = "rotor-lb", version, about = "Round-robin HTTP load balancer")]
struct Cli {
    /// Load balanced backends, use comma to separate
    #[arg(long)]
    backends: Option<String>,

    /// Port to serve on
    #[arg(long, default_value_t = 3030)]
    port: u16,

    /// Read settings from a YAML or JSON file instead of flags
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rotor_lb=debug".parse()?)
                .add_directive("hyper=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            config::load_config(path).await?
        }
        None => Config::from_backend_list(cli.backends.as_deref().unwrap_or(""), cli.port)
            .context("provide --backends or --config")?,
    };

    // Build the backend pool once; it is shared from here on and fixed in
    // size for the process lifetime.
    let mut pool = BackendPool::empty();
    for backend in &config.backends {
        pool.add_backend(Arc::new(Backend::new(backend.url.clone())));
    }
    let pool = Arc::new(pool);
    info!("Balancing across {} backends", pool.len());

    // Initialize metrics
    let metrics_registry = MetricsRegistry::new()?;
    let metrics = metrics_registry.collector();
    metrics.update_backend_counts(pool.len(), pool.len());

    // Create the router
    let proxy = Arc::new(Proxy::new(
        config.retry.clone(),
        pool.clone(),
        Some(metrics.clone()),
    ));

    // Start health checker
    let checker = Arc::new(HealthChecker::new(
        config.health_check.clone(),
        pool.clone(),
        Some(metrics.clone()),
    ));
    tokio::spawn(checker.clone().start());

    // Start metrics server if enabled
    if config.metrics.enabled {
        let metrics_addr: SocketAddr = ([0, 0, 0, 0], config.metrics.port).into();
        start_metrics_server(metrics_addr, metrics_registry, config.metrics.path.clone()).await?;
    }

    // Start main server
    let addr: SocketAddr = ([0, 0, 0, 0], config.listen_port).into();
    info!("Starting load balancer on {}", addr);

    let handler = RequestHandler::new(proxy);
    tokio::select! {
        result = ServerBuilder::new(addr).with_handler(handler).serve() => result?,
        _ = shutdown_signal() => {
            checker.shutdown();
        }
    }

    Ok(())
}

async fn start_metrics_server(
    addr: SocketAddr,
    registry: MetricsRegistry,
    path: String,
) -> Result<()> {
    let registry = Arc::new(registry);
    let path = Arc::new(path);
    let endpoint = path.clone();

    let make_service = hyper::service::make_service_fn(move |_| {
        let registry = registry.clone();
        let path = path.clone();

        async move {
            Ok::<_, Infallible>(hyper::service::service_fn(move |req: Request<Body>| {
                let registry = registry.clone();
                let path = path.clone();

                async move { Ok::<_, Infallible>(scrape_response(&registry, &path, &req)) }
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_service);
    info!("Metrics endpoint at http://{}{}", addr, endpoint);

    tokio::spawn(async move {
        if let Err(err) = server.await {
            error!("Metrics server error: {}", err);
        }
    });

    Ok(())
}

fn scrape_response(registry: &MetricsRegistry, path: &str, req: &Request<Body>) -> Response<Body> {
    if req.uri().path() == path {
        Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(Body::from(registry.gather()))
            .unwrap()
    } else {
        Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("Not Found"))
            .unwrap()
    }
}

// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
