use anyhow::{Context, Result};
use murmur_core::BusConfig;
use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;

// Server configuration sourced from environment variables, with an
// optional YAML override file for ops-managed deployments.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    // HTTP listener (REST control plane + /ws upgrade).
    pub http_bind: SocketAddr,
    // Prometheus exporter listener.
    pub metrics_bind: SocketAddr,
    // Per-topic ingress queue capacity.
    pub queue_capacity: usize,
    // Per-topic replay ring capacity.
    pub ring_capacity: usize,
    // Delivery batch size.
    pub batch_size: usize,
    // Max delay before flushing a partial batch.
    pub batch_timeout_ms: u64,
    // Wall-clock bound on a single send to one subscriber.
    pub send_deadline_ms: u64,
    // Total bound on draining all topics at shutdown.
    pub shutdown_timeout_ms: u64,
    // Per-connection publish rate, tokens per second.
    pub rate_limit_per_sec: u64,
    // Per-connection publish burst allowance.
    pub rate_limit_burst: u64,
}

const DEFAULT_CONFIG_PATH: &str = "/usr/local/murmur/config.yml";
const DEFAULT_QUEUE_CAPACITY: usize = 1000;
const DEFAULT_RING_CAPACITY: usize = 100;
const DEFAULT_BATCH_SIZE: usize = 10;
const DEFAULT_BATCH_TIMEOUT_MS: u64 = 20;
const DEFAULT_SEND_DEADLINE_MS: u64 = 500;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5000;
const DEFAULT_RATE_LIMIT_PER_SEC: u64 = 1000;
const DEFAULT_RATE_LIMIT_BURST: u64 = 500;

#[derive(Debug, Deserialize)]
struct ServiceConfigOverride {
    http_bind: Option<String>,
    metrics_bind: Option<String>,
    queue_capacity: Option<usize>,
    ring_capacity: Option<usize>,
    batch_size: Option<usize>,
    batch_timeout_ms: Option<u64>,
    send_deadline_ms: Option<u64>,
    shutdown_timeout_ms: Option<u64>,
    rate_limit_per_sec: Option<u64>,
    rate_limit_burst: Option<u64>,
}

fn env_number<T: std::str::FromStr + PartialOrd + Default>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .filter(|value| *value > T::default())
        .unwrap_or(default)
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        // Environment variables provide defaults for local development.
        let http_bind = std::env::var("MURMUR_HTTP_BIND")
            .unwrap_or_else(|_| "0.0.0.0:8000".to_string())
            .parse()
            .with_context(|| "parse MURMUR_HTTP_BIND")?;
        let metrics_bind = std::env::var("MURMUR_METRICS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:9100".to_string())
            .parse()
            .with_context(|| "parse MURMUR_METRICS_BIND")?;
        Ok(Self {
            http_bind,
            metrics_bind,
            queue_capacity: env_number("MURMUR_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY),
            ring_capacity: env_number("MURMUR_RING_CAPACITY", DEFAULT_RING_CAPACITY),
            batch_size: env_number("MURMUR_BATCH_SIZE", DEFAULT_BATCH_SIZE),
            batch_timeout_ms: env_number("MURMUR_BATCH_TIMEOUT_MS", DEFAULT_BATCH_TIMEOUT_MS),
            send_deadline_ms: env_number("MURMUR_SEND_DEADLINE_MS", DEFAULT_SEND_DEADLINE_MS),
            shutdown_timeout_ms: env_number(
                "MURMUR_SHUTDOWN_TIMEOUT_MS",
                DEFAULT_SHUTDOWN_TIMEOUT_MS,
            ),
            rate_limit_per_sec: env_number("MURMUR_RATE_LIMIT_PER_SEC", DEFAULT_RATE_LIMIT_PER_SEC),
            rate_limit_burst: env_number("MURMUR_RATE_LIMIT_BURST", DEFAULT_RATE_LIMIT_BURST),
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        let override_path = std::env::var("MURMUR_CONFIG").ok();
        let config_path = override_path
            .clone()
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
        let contents = match fs::read_to_string(&config_path) {
            Ok(contents) => Some(contents),
            Err(err) if err.kind() == ErrorKind::NotFound && override_path.is_none() => None,
            Err(err) => {
                return Err(err).with_context(|| format!("read config file: {config_path}"));
            }
        };
        if let Some(contents) = contents {
            // YAML overrides allow ops-friendly config files.
            let overrides: ServiceConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse config yaml")?;
            if let Some(value) = overrides.http_bind {
                config.http_bind = value.parse().with_context(|| "parse http_bind")?;
            }
            if let Some(value) = overrides.metrics_bind {
                config.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
            }
            if let Some(value) = overrides.queue_capacity.filter(|v| *v > 0) {
                config.queue_capacity = value;
            }
            if let Some(value) = overrides.ring_capacity.filter(|v| *v > 0) {
                config.ring_capacity = value;
            }
            if let Some(value) = overrides.batch_size.filter(|v| *v > 0) {
                config.batch_size = value;
            }
            if let Some(value) = overrides.batch_timeout_ms.filter(|v| *v > 0) {
                config.batch_timeout_ms = value;
            }
            if let Some(value) = overrides.send_deadline_ms.filter(|v| *v > 0) {
                config.send_deadline_ms = value;
            }
            if let Some(value) = overrides.shutdown_timeout_ms.filter(|v| *v > 0) {
                config.shutdown_timeout_ms = value;
            }
            if let Some(value) = overrides.rate_limit_per_sec.filter(|v| *v > 0) {
                config.rate_limit_per_sec = value;
            }
            if let Some(value) = overrides.rate_limit_burst {
                config.rate_limit_burst = value;
            }
        }
        Ok(config)
    }

    /// Engine tuning derived from the service configuration.
    pub fn bus_config(&self) -> BusConfig {
        BusConfig {
            queue_capacity: self.queue_capacity,
            ring_capacity: self.ring_capacity,
            batch_size: self.batch_size,
            batch_timeout: Duration::from_millis(self.batch_timeout_ms),
            send_deadline: Duration::from_millis(self.send_deadline_ms),
            shutdown_deadline: Duration::from_millis(self.shutdown_timeout_ms),
            rate_limit_per_sec: self.rate_limit_per_sec,
            rate_limit_burst: self.rate_limit_burst,
        }
    }
}
