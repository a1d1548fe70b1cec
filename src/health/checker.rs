// src/health/checker.rs
use crate::config::{HealthCheckConfig, ProbeKind};
use crate::metrics::MetricsCollector;
use crate::proxy::{Backend, BackendPool};
use reqwest::Client;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Background liveness prober. One instance per process; ticks on a fixed
/// interval and runs the configured probe sweep against every backend.
pub struct HealthChecker {
    config: HealthCheckConfig,
    pool: Arc<BackendPool>,
    client: Client,
    metrics: Option<Arc<MetricsCollector>>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
}

#[derive(Debug)]
pub struct HealthCheckResult {
    pub address: String,
    pub healthy: bool,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

impl HealthChecker {
    pub fn new(
        config: HealthCheckConfig,
        pool: Arc<BackendPool>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .expect("Failed to create HTTP client");

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        Self {
            config,
            pool,
            client,
            metrics,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub async fn start(self: Arc<Self>) {
        let mut interval = interval(self.config.interval());
        let mut shutdown_rx = self.shutdown_rx.clone();

        info!(
            "Starting health checker with interval: {:?}",
            self.config.interval()
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.clone().run_once().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Health checker shutting down");
                        break;
                    }
                }
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// One full probe cycle. Exposed so startup code or tests can force a
    /// sweep without waiting for the ticker.
    pub async fn run_once(self: Arc<Self>) {
        info!("Starting health check");

        match self.config.probe {
            ProbeKind::Tcp => self.pool.health_check(self.config.timeout()).await,
            ProbeKind::Http => self.clone().check_all_http().await,
        }

        let mut alive = 0;
        for backend in self.pool.backends() {
            let healthy = backend.is_alive().await;
            if healthy {
                alive += 1;
            }
            if let Some(metrics) = &self.metrics {
                metrics.update_backend_health(backend.address(), healthy);
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.update_backend_counts(alive, self.pool.len());
        }

        info!(
            "Health check completed: {}/{} backends alive",
            alive,
            self.pool.len()
        );
    }

    async fn check_all_http(self: Arc<Self>) {
        let mut tasks = Vec::new();

        for backend in self.pool.backends() {
            let checker = self.clone();
            let backend = backend.clone();
            tasks.push(tokio::spawn(async move {
                checker.check_backend_http(backend).await
            }));
        }

        for result in futures::future::join_all(tasks).await {
            match result {
                Ok(check) => {
                    if check.healthy {
                        debug!(
                            backend = %check.address,
                            elapsed_ms = check.response_time_ms,
                            "backend is healthy"
                        );
                    } else {
                        warn!(
                            backend = %check.address,
                            error = ?check.error,
                            "backend is unhealthy"
                        );
                    }
                }
                Err(err) => {
                    error!("Health probe task failed: {}", err);
                }
            }
        }
    }

    async fn check_backend_http(&self, backend: Arc<Backend>) -> HealthCheckResult {
        let start = Instant::now();

        let (healthy, error) = match backend.url().join(&self.config.path) {
            Ok(url) => match self.client.get(url.as_str()).send().await {
                Ok(response) if response.status().is_success() => (true, None),
                Ok(response) => (false, Some(format!("HTTP {}", response.status()))),
                Err(err) => (false, Some(err.to_string())),
            },
            Err(err) => (false, Some(format!("invalid probe path: {}", err))),
        };

        backend.record_health_check(healthy).await;

        HealthCheckResult {
            address: backend.address().to_string(),
            healthy,
            response_time_ms: start.elapsed().as_millis() as u64,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn checker(pool: Arc<BackendPool>, config: HealthCheckConfig) -> Arc<HealthChecker> {
        Arc::new(HealthChecker::new(config, pool, None))
    }

    #[tokio::test]
    async fn tcp_sweep_revives_backend_when_listener_returns() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let config = Config::from_backend_list(&format!("http://{}", addr), 3030).unwrap();
        let pool = Arc::new(BackendPool::new(&config.backends));
        pool.mark_backend_status(pool.backends()[0].address(), false)
            .await;

        checker(pool.clone(), HealthCheckConfig::default())
            .run_once()
            .await;
        assert!(pool.backends()[0].is_alive().await);
    }

    #[tokio::test]
    async fn http_probe_uses_status_code() {
        let mut server = mockito::Server::new_async().await;
        let healthy = server
            .mock("GET", "/health")
            .with_status(200)
            .create_async()
            .await;

        let config = Config::from_backend_list(&server.url(), 3030).unwrap();
        let pool = Arc::new(BackendPool::new(&config.backends));
        pool.mark_backend_status(pool.backends()[0].address(), false)
            .await;

        let health_config = HealthCheckConfig {
            probe: ProbeKind::Http,
            ..HealthCheckConfig::default()
        };
        checker(pool.clone(), health_config.clone())
            .run_once()
            .await;
        assert!(pool.backends()[0].is_alive().await);
        healthy.assert_async().await;

        // A 5xx from the probe path demotes the backend.
        server
            .mock("GET", "/health")
            .with_status(503)
            .create_async()
            .await;
        checker(pool.clone(), health_config).run_once().await;
        assert!(!pool.backends()[0].is_alive().await);
    }
}
