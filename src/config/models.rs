// src/config/models.rs
use anyhow::{bail, Result};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub url: Url,
}

impl Config {
    /// Build a configuration from the `--backends` comma-separated list and
    /// the listen port. This is the flag-driven startup path; file-driven
    /// startup goes through `load_config`.
    pub fn from_backend_list(list: &str, port: u16) -> Result<Self> {
        let mut backends = Vec::new();
        for token in list.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match Url::parse(token) {
                Ok(url) => backends.push(BackendConfig { url }),
                Err(err) => bail!("invalid backend address {:?}: {}", token, err),
            }
        }

        let config = Self {
            listen_port: port,
            backends,
            health_check: HealthCheckConfig::default(),
            retry: RetryConfig::default(),
            metrics: MetricsConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            bail!("no backends to balance; provide at least one backend address");
        }
        for backend in &self.backends {
            let url = &backend.url;
            if url.scheme() != "http" && url.scheme() != "https" {
                bail!("backend {} has unsupported scheme {:?}", url, url.scheme());
            }
            if url.host_str().is_none() {
                bail!("backend {} has no host", url);
            }
        }
        if self.retry.max_attempts == 0 || self.retry.max_retries == 0 {
            bail!("retry limits must be at least 1");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub probe: ProbeKind,
    /// Path requested by the `http` probe; ignored by the `tcp` probe.
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    Tcp,
    Http,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_secs: 120,
            timeout_secs: 2,
            probe: ProbeKind::Tcp,
            path: "/health".to_string(),
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Full routing attempts per request; each failed attempt demotes the
    /// backend it was forwarded to.
    pub max_attempts: u32,
    /// Forwards to the same backend within one attempt.
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_retries: 3,
            retry_delay_ms: 10,
        }
    }
}

impl RetryConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9091,
            path: "/metrics".to_string(),
        }
    }
}

fn default_listen_port() -> u16 {
    3030
}
