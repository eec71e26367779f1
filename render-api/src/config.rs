use envconfig::Envconfig;

use render_worker::config::{
    DispatchConfig, MonitorConfig, QueueManagerConfig, StoreConfig, WebhookConfig,
};

/// Configuration for the all-in-one orchestrator process. The background
/// loop sections are shared with the standalone worker binary so both read
/// the same environment.
#[derive(Envconfig)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3300")]
    pub port: u16,

    /// Clients must present this in the X-Api-Key header. Unset disables
    /// the check, for local development only.
    #[envconfig(from = "API_KEY")]
    pub api_key: Option<String>,

    #[envconfig(from = "MAX_BODY_SIZE", default = "5242880")]
    pub max_body_size: usize,

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
