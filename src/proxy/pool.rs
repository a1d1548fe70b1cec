// src/proxy/pool.rs

use super::backend::Backend;
use crate::config::BackendConfig;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};
use url::Url;

/// Ordered, fixed-at-startup set of backends plus the rotation cursor.
///
/// `add_backend` takes `&mut self`, so the pool cannot grow once it is
/// shared behind an `Arc` with the router and health checker.
pub struct BackendPool {
    backends: Vec<Arc<Backend>>,
    current: AtomicUsize,
}

impl BackendPool {
    pub fn new(configs: &[BackendConfig]) -> Self {
        let mut pool = Self::empty();
        for config in configs {
            pool.add_backend(Arc::new(Backend::new(config.url.clone())));
        }
        pool
    }

    pub fn empty() -> Self {
        Self {
            backends: Vec::new(),
            current: AtomicUsize::new(0),
        }
    }

    pub fn add_backend(&mut self, backend: Arc<Backend>) {
        debug!(backend = backend.address(), "registered backend");
        self.backends.push(backend);
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Advance the cursor by one and return the first alive backend within a
    /// full wrap of the pool, publishing its index so the next rotation
    /// resumes just past it. `None` once every candidate was probed dead.
    pub async fn next_peer(&self) -> Option<Arc<Backend>> {
        let len = self.backends.len();
        if len == 0 {
            return None;
        }

        let start = self.current.fetch_add(1, Ordering::Relaxed).wrapping_add(1) % len;
        for offset in 0..len {
            let index = (start + offset) % len;
            if self.backends[index].is_alive().await {
                self.current.store(index, Ordering::Relaxed);
                return Some(self.backends[index].clone());
            }
        }
        None
    }

    /// Set the liveness of the backend whose canonical address matches.
    /// First match wins; unknown addresses are ignored.
    pub async fn mark_backend_status(&self, address: &str, alive: bool) {
        for backend in &self.backends {
            if backend.address() == address {
                backend.set_alive(alive).await;
                if alive {
                    debug!(backend = address, "backend marked alive");
                } else {
                    warn!(backend = address, "backend marked dead");
                }
                return;
            }
        }
        debug!(backend = address, "liveness update for unknown backend ignored");
    }

    /// Probe every backend with a TCP connect-and-close and set its liveness
    /// to the result. Individual writes are independent, so overlapping
    /// sweeps commute.
    pub async fn health_check(&self, probe_timeout: Duration) {
        for backend in &self.backends {
            let alive = is_backend_alive(backend.url(), probe_timeout).await;
            backend.record_health_check(alive).await;
        }
    }
}

/// Connect-and-close reachability probe of the target's host:port.
pub async fn is_backend_alive(url: &Url, probe_timeout: Duration) -> bool {
    let host = match url.host_str() {
        Some(host) => host,
        None => return false,
    };
    let port = match url.port_or_known_default() {
        Some(port) => port,
        None => return false,
    };

    match timeout(probe_timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(err)) => {
            warn!(backend = %url, error = %err, "backend unreachable");
            false
        }
        Err(_) => {
            warn!(backend = %url, "health probe timed out");
            false
        }
    }
}
