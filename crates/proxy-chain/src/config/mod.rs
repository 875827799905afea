//! Configuration file for the proxy-chain binary.

mod listen;
mod upstream;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use listen::{AdminConfig, ListenConfig, TlsConfig};
pub use upstream::{UpstreamConfig, UpstreamScheme};

use crate::chain::ChainOptions;
use crate::handler::Verbosity;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChainConfig {
    pub listen: ListenConfig,

    /// Default upstream proxy. Without one every request is refused unless
    /// an embedding application installs a router.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<UpstreamConfig>,

    /// Time allowed for the upstream to answer; 0 disables the timeout.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// Inactivity limit for upstream sockets; 0 disables it.
    #[serde(default)]
    pub idle_timeout_ms: u64,

    /// 0 silent, 1 warnings, 2 trace
    #[serde(default)]
    pub debug: u8,

    #[serde(default)]
    pub statistics: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin: Option<AdminConfig>,
}

fn default_connection_timeout_ms() -> u64 {
    60_000
}

impl ChainConfig {
    /// A config listening on `port` with every other setting defaulted.
    pub fn with_port(port: u16) -> Self {
        Self {
            listen: ListenConfig {
                host: "0.0.0.0".to_string(),
                port,
                tls: None,
            },
            upstream: None,
            connection_timeout_ms: default_connection_timeout_ms(),
            idle_timeout_ms: 0,
            debug: 0,
            statistics: false,
            proxy_id: None,
            admin: None,
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {e}", path.display()))?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, anyhow::Error> {
        let config: ChainConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        self.listen.socket_addr().map_err(|e| {
            anyhow::anyhow!("Invalid listen host '{}': {e}", self.listen.host)
        })?;

        if let Some(tls) = &self.listen.tls {
            if tls.cert_path.is_empty() || tls.key_path.is_empty() {
                anyhow::bail!(
                    "TLS listener requires both 'listen.tls.cert_path' and 'listen.tls.key_path'"
                );
            }
        }

        if let Some(upstream) = &self.upstream {
            upstream.validate().map_err(|e| anyhow::anyhow!(e))?;
        }

        if let Some(admin) = &self.admin {
            admin
                .socket_addr()
                .map_err(|e| anyhow::anyhow!("Invalid admin host '{}': {e}", admin.host))?;
            if admin.port != 0 && admin.port == self.listen.port {
                anyhow::bail!("Admin port {} collides with the listen port", admin.port);
            }
        }

        if self.debug > 2 {
            anyhow::bail!("debug must be 0, 1 or 2 (got {})", self.debug);
        }

        Ok(())
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }

    /// Chain options for this configuration, using the default router.
    pub fn to_options(&self) -> Result<ChainOptions, anyhow::Error> {
        let listen_addr = self
            .listen
            .socket_addr()
            .map_err(|e| anyhow::anyhow!("Invalid listen host '{}': {e}", self.listen.host))?;
        let mut options = ChainOptions::new(listen_addr);
        if let Some(upstream) = &self.upstream {
            options.proxy_url = Some(upstream.url.clone());
            options.proxy_username = upstream.username.clone();
            options.proxy_password = upstream.password.clone();
        }
        options.verbosity = Verbosity::from(self.debug);
        options.connection_timeout = self.connection_timeout();
        options.idle_timeout = self.idle_timeout();
        options.tls = self.listen.tls.clone();
        options.statistics = self.statistics;
        options.proxy_id = self.proxy_id.clone();
        Ok(options)
    }
}
