// src/proxy/proxy.rs
// Request router: peer selection, bounded same-backend retries, failover.

use super::pool::BackendPool;
use crate::config::RetryConfig;
use crate::metrics::MetricsCollector;
use crate::retry::{DispatchState, RetryPolicy};
use hyper::header::HeaderValue;
use hyper::{Body, Request, Response, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct Proxy {
    pool: Arc<BackendPool>,
    policy: RetryPolicy,
    metrics: Option<Arc<MetricsCollector>>,
}

impl Proxy {
    pub fn new(
        retry: RetryConfig,
        pool: Arc<BackendPool>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        Self {
            pool,
            policy: RetryPolicy::new(retry),
            metrics,
        }
    }

    /// Route one inbound request. Every outcome, including exhaustion, is
    /// returned as a response; nothing propagates as an error past here.
    pub async fn dispatch(
        &self,
        request: Request<Body>,
        client_addr: Option<SocketAddr>,
    ) -> Response<Body> {
        let started = Instant::now();
        let request_id = Uuid::new_v4();
        let (mut parts, body) = request.into_parts();

        // Buffer the body once so each forward can replay it.
        let body = match hyper::body::to_bytes(body).await {
            Ok(body) => body,
            Err(err) => {
                warn!(%request_id, error = %err, "failed to read request body");
                return ProxyError::InvalidRequest(err.to_string()).into();
            }
        };

        if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
            parts.headers.insert("x-request-id", value);
        }

        let method = parts.method.to_string();
        let path = parts.uri.path().to_string();
        let mut state = DispatchState::new();

        loop {
            if self.policy.attempts_exhausted(state) {
                warn!(
                    %request_id,
                    %path,
                    attempts = self.policy.max_attempts(),
                    "max attempts reached, terminating request"
                );
                self.record_request(&method, StatusCode::SERVICE_UNAVAILABLE, "none", started);
                return ProxyError::AttemptsExhausted.into();
            }

            let peer = match self.pool.next_peer().await {
                Some(peer) => peer,
                None => {
                    warn!(%request_id, %path, "no alive backend available");
                    self.record_request(&method, StatusCode::SERVICE_UNAVAILABLE, "none", started);
                    return ProxyError::NoHealthyBackends.into();
                }
            };

            debug!(
                %request_id,
                backend = peer.address(),
                attempt = state.attempts,
                "forwarding request"
            );

            loop {
                match peer.serve(&parts, body.clone(), client_addr).await {
                    Ok(response) => {
                        if let Some(metrics) = &self.metrics {
                            metrics.record_backend_request(peer.address(), true);
                        }
                        self.record_request(&method, response.status(), peer.address(), started);
                        return response;
                    }
                    Err(err) => {
                        warn!(
                            %request_id,
                            backend = peer.address(),
                            retry = state.retries,
                            error = %err,
                            "forwarding error"
                        );
                        if let Some(metrics) = &self.metrics {
                            metrics.record_backend_request(peer.address(), false);
                        }

                        if self.policy.should_retry(state) {
                            sleep(self.policy.retry_delay()).await;
                            state = state.retried();
                            if let Some(metrics) = &self.metrics {
                                metrics.record_retry(peer.address());
                            }
                            debug!(
                                %request_id,
                                backend = peer.address(),
                                retry = state.retries,
                                "re-forwarding to same backend"
                            );
                        } else {
                            self.pool.mark_backend_status(peer.address(), false).await;
                            state = state.escalated();
                            if let Some(metrics) = &self.metrics {
                                metrics.record_failover();
                            }
                            info!(
                                %request_id,
                                backend = peer.address(),
                                attempt = state.attempts,
                                "retries exhausted, backend demoted, attempting failover"
                            );
                            break;
                        }
                    }
                }
            }
        }
    }

    fn record_request(&self, method: &str, status: StatusCode, backend: &str, started: Instant) {
        if let Some(metrics) = &self.metrics {
            metrics.record_request(method, status.as_u16(), backend, started.elapsed());
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("no alive backend available")]
    NoHealthyBackends,

    #[error("request attempts exhausted")]
    AttemptsExhausted,

    #[error("forwarding to {backend} failed: {source}")]
    Forward {
        backend: String,
        #[source]
        source: hyper::Error,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<ProxyError> for Response<Body> {
    fn from(err: ProxyError) -> Self {
        let (status, message) = match err {
            ProxyError::NoHealthyBackends | ProxyError::AttemptsExhausted => {
                (StatusCode::SERVICE_UNAVAILABLE, "Service not available")
            }
            ProxyError::Forward { .. } => (StatusCode::BAD_GATEWAY, "Bad gateway"),
            ProxyError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "Bad request"),
        };

        Response::builder()
            .status(status)
            .body(Body::from(message))
            .unwrap()
    }
}
