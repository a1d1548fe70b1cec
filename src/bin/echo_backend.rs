//! Dev upstream for manual runs: serves JSON echoes with injectable latency
//! and failures, plus an always-fast `/health` route.
//! Run: cargo run --bin echo_backend -- --port 8001

use clap::Parser;
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server, StatusCode,
};
use rand::Rng;
use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::sleep;

#[derive(Parser, Debug)]
#[command(name = "echo_backend", about = "Dev backend with failure injection")]
struct Cli {
    #[arg(long, default_value_t = 8001)]
    port: u16,

    /// Name reported in responses; defaults to backend-<port>
    #[arg(long)]
    name: Option<String>,

    /// Fixed latency added to every response
    #[arg(long, default_value_t = 0)]
    base_delay_ms: u64,

    /// Extra random latency, 0..=jitter
    #[arg(long, default_value_t = 0)]
    jitter_ms: u64,

    /// Percentage of requests answered with a 500
    #[arg(long, default_value_t = 0.0)]
    fail_pct: f64,
}

#[derive(Clone)]
struct BackendState {
    port: u16,
    name: String,
    req_counter: Arc<AtomicU64>,
    healthy_flag: Arc<AtomicBool>,
    base_delay: u64,
    jitter_ms: u64,
    fail_pct: f64,
}

async fn handle(
    req: Request<Body>,
    state: BackendState,
) -> Result<Response<Body>, Infallible> {
    let n = state.req_counter.fetch_add(1, Ordering::SeqCst) + 1;
    let path = req.uri().path().to_owned();

    // /health is always fast
    if path == "/health" {
        if state.healthy_flag.load(Ordering::SeqCst) {
            return Ok(Response::new(Body::from("OK")));
        } else {
            return Ok(Response::builder()
                .status(StatusCode::SERVICE_UNAVAILABLE)
                .body(Body::from("Unhealthy"))
                .unwrap());
        }
    }

    // Flip the /health answer to exercise the balancer's http probe.
    if path == "/toggle" {
        let now = !state.healthy_flag.fetch_xor(true, Ordering::SeqCst);
        return Ok(Response::new(Body::from(format!("healthy={}", now))));
    }

    // Simulate latency
    let delay = state.base_delay + rand::thread_rng().gen_range(0..=state.jitter_ms);
    if delay > 0 {
        sleep(Duration::from_millis(delay)).await;
    }

    // Simulate failure
    if state.fail_pct > 0.0 && rand::thread_rng().gen_bool(state.fail_pct / 100.0) {
        return Ok(Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::from("Injected failure"))
            .unwrap());
    }

    let body = serde_json::json!({
        "backend": state.name,
        "port": state.port,
        "req": n,
        "path": path,
        "delay_ms": delay,
    });

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .header("X-Backend-Name", state.name.clone())
        .body(Body::from(body.to_string()))
        .unwrap())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let name = cli
        .name
        .unwrap_or_else(|| format!("backend-{}", cli.port));

    let state = BackendState {
        port: cli.port,
        name: name.clone(),
        req_counter: Arc::new(AtomicU64::new(0)),
        healthy_flag: Arc::new(AtomicBool::new(true)),
        base_delay: cli.base_delay_ms,
        jitter_ms: cli.jitter_ms,
        fail_pct: cli.fail_pct,
    };

    let make_service = make_service_fn(move |_| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| handle(req, state.clone())))
        }
    });

    let addr: SocketAddr = ([127, 0, 0, 1], cli.port).into();
    println!("{} listening on http://{}", name, addr);

    Server::bind(&addr).serve(make_service).await?;
    Ok(())
}
