use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

/// Configuration for the standalone worker binary. The api binary nests the
/// same sections so an all-in-one process reads identical knobs.
#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3301")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub store: StoreConfig,

    #[envconfig(nested = true)]
    pub dispatch: DispatchConfig,

    #[envconfig(nested = true)]
    pub queue: QueueManagerConfig,

    #[envconfig(nested = true)]
    pub monitor: MonitorConfig,

    #[envconfig(nested = true)]
    pub webhook: WebhookConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Envconfig, Clone)]
pub struct StoreConfig {
    #[envconfig(from = "STORE_BACKEND", default = "memory")]
    pub backend: StoreBackend,

    #[envconfig(from = "REDIS_URL", default = "redis://localhost:6379")]
    pub redis_url: String,

    #[envconfig(from = "STORE_KEY_PREFIX", default = "render:")]
    pub key_prefix: String,

    #[envconfig(from = "MAX_WORKERS", default = "3")]
    pub max_workers: u32,

    #[envconfig(from = "JOB_TTL_SEC", default = "86400")]
    pub job_ttl_secs: u64,
}

#[derive(Envconfig, Clone)]
pub struct DispatchConfig {
    #[envconfig(from = "GPU_WORKER_URL", default = "http://localhost:8000")]
    pub gpu_url: String,

    #[envconfig(from = "CPU_WORKER_URL", default = "http://localhost:8001")]
    pub cpu_url: String,

    #[envconfig(from = "WORKER_API_KEY")]
    pub api_key: Option<String>,

    #[envconfig(from = "SUBMIT_TIMEOUT_MS", default = "30000")]
    pub submit_timeout: EnvMsDuration,

    #[envconfig(from = "STATUS_TIMEOUT_MS", default = "10000")]
    pub status_timeout: EnvMsDuration,
}

#[derive(Envconfig, Clone)]
pub struct QueueManagerConfig {
    #[envconfig(from = "QUEUE_TICK_MS", default = "5000")]
    pub tick: EnvMsDuration,

    #[envconfig(from = "SPLIT_THRESHOLD", default = "50")]
    pub split_threshold: usize,

    /// Upper bound on chunks per split job; defaults to MAX_WORKERS.
    #[envconfig(from = "SPLIT_MAX_CHUNKS")]
    pub split_max_chunks: Option<u32>,
}

#[derive(Envconfig, Clone)]
pub struct MonitorConfig {
    #[envconfig(from = "MONITOR_POLL_MS", default = "8000")]
    pub poll_interval: EnvMsDuration,

    #[envconfig(from = "EXECUTION_TIMEOUT_MS", default = "2400000")]
    pub execution_timeout: EnvMsDuration,

    #[envconfig(from = "RECOVERY_INTERVAL_MS", default = "300000")]
    pub recovery_interval: EnvMsDuration,

    /// Polls tolerating an external id the service claims not to know,
    /// before the sub-job is treated as lost.
    #[envconfig(from = "STATUS_NOT_FOUND_GRACE", default = "3")]
    pub not_found_grace: u32,
}

#[derive(Envconfig, Clone)]
pub struct WebhookConfig {
    #[envconfig(from = "WEBHOOK_TIMEOUT_MS", default = "10000")]
    pub request_timeout: EnvMsDuration,

    #[envconfig(from = "WEBHOOK_MAX_ATTEMPTS", default = "4")]
    pub max_attempts: u32,

    #[envconfig(from = "WEBHOOK_RETRY_DELAYS_MS", default = "1000,5000,15000")]
    pub retry_delays: EnvDelayList,

    #[envconfig(from = "WEBHOOK_SECRET")]
    pub secret: Option<String>,

    #[envconfig(from = "WEBHOOK_MAX_CONCURRENT", default = "16")]
    pub max_concurrent: usize,
}

/// Which `JobStore` backend a binary runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    DurableKv,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseStoreBackendError(pub String);

impl FromStr for StoreBackend {
    type Err = ParseStoreBackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(StoreBackend::Memory),
            "durable-kv" | "redis" => Ok(StoreBackend::DurableKv),
            invalid => Err(ParseStoreBackendError(invalid.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

/// A comma-separated list of millisecond delays, e.g. "1000,5000,15000".
#[derive(Debug, Clone)]
pub struct EnvDelayList(pub Vec<time::Duration>);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvDelayListError(pub String);

impl FromStr for EnvDelayList {
    type Err = ParseEnvDelayListError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut delays = Vec::new();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let ms = part
                .parse::<u64>()
                .map_err(|_| ParseEnvDelayListError(part.to_owned()))?;
            delays.push(time::Duration::from_millis(ms));
        }
        Ok(EnvDelayList(delays))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_list_parses_commas_and_whitespace() {
        let parsed = EnvDelayList::from_str("1000, 5000,15000").unwrap();
        assert_eq!(
            parsed.0,
            vec![
                time::Duration::from_millis(1000),
                time::Duration::from_millis(5000),
                time::Duration::from_millis(15000),
            ]
        );

        assert!(EnvDelayList::from_str("1000,soon").is_err());
    }

    #[test]
    fn test_store_backend_names() {
        assert_eq!(StoreBackend::from_str("memory"), Ok(StoreBackend::Memory));
        assert_eq!(
            StoreBackend::from_str("durable-kv"),
            Ok(StoreBackend::DurableKv)
        );
        assert_eq!(StoreBackend::from_str("redis"), Ok(StoreBackend::DurableKv));
        assert!(StoreBackend::from_str("postgres").is_err());
    }

    #[test]
    fn test_ms_duration_parses_millis() {
        assert_eq!(
            EnvMsDuration::from_str("2500").unwrap().0,
            time::Duration::from_millis(2500)
        );
        assert!(EnvMsDuration::from_str("2.5s").is_err());
    }
}
