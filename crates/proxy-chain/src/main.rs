use clap::Parser;
use proxy_chain::admin::{AdminServer, AdminState};
use proxy_chain::config::{AdminConfig, ChainConfig, TlsConfig, UpstreamConfig};
use proxy_chain::ProxyChain;
use tracing::{error, info};

/// Relay HTTP and CONNECT traffic through an upstream proxy
#[derive(Parser, Debug)]
#[command(name = "proxy-chain")]
#[command(author, version, about)]
struct Args {
    /// YAML configuration file; flags override its values
    #[arg(short, long, env = "PROXY_CHAIN_CONFIG")]
    config: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "PROXY_CHAIN_PORT")]
    port: Option<u16>,

    /// Address to bind
    #[arg(long, env = "PROXY_CHAIN_HOST")]
    host: Option<String>,

    /// Upstream proxy URL (http, https, socks, socks4, socks5)
    #[arg(short = 'u', long, env = "PROXY_CHAIN_UPSTREAM")]
    proxy_url: Option<String>,

    #[arg(long, env = "PROXY_CHAIN_UPSTREAM_USERNAME")]
    proxy_username: Option<String>,

    #[arg(long, env = "PROXY_CHAIN_UPSTREAM_PASSWORD")]
    proxy_password: Option<String>,

    /// 0 silent, 1 warnings, 2 trace
    #[arg(short, long, env = "PROXY_CHAIN_DEBUG")]
    debug: Option<u8>,

    /// 0 disables the timeout
    #[arg(long, env = "PROXY_CHAIN_CONNECTION_TIMEOUT_MS")]
    connection_timeout_ms: Option<u64>,

    #[arg(long, env = "PROXY_CHAIN_IDLE_TIMEOUT_MS")]
    idle_timeout_ms: Option<u64>,

    /// Count relayed bytes
    #[arg(long, env = "PROXY_CHAIN_STATISTICS")]
    statistics: bool,

    #[arg(long, env = "PROXY_CHAIN_PROXY_ID")]
    proxy_id: Option<String>,

    /// PEM certificate for a TLS listener
    #[arg(long, env = "PROXY_CHAIN_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<String>,

    #[arg(long, env = "PROXY_CHAIN_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<String>,

    /// Serve /health, /metrics and /stats on this port
    #[arg(long, env = "PROXY_CHAIN_ADMIN_PORT")]
    admin_port: Option<u16>,
}

impl Args {
    fn into_config(self) -> Result<ChainConfig, anyhow::Error> {
        let mut config = match &self.config {
            Some(path) => ChainConfig::from_file(path)?,
            None => ChainConfig::with_port(self.port.unwrap_or(8000)),
        };

        if let Some(port) = self.port {
            config.listen.port = port;
        }
        if let Some(host) = self.host {
            config.listen.host = host;
        }
        if let Some(url) = self.proxy_url {
            config.upstream = Some(UpstreamConfig {
                url,
                username: None,
                password: None,
            });
        }
        if let Some(upstream) = config.upstream.as_mut() {
            if self.proxy_username.is_some() {
                upstream.username = self.proxy_username;
            }
            if self.proxy_password.is_some() {
                upstream.password = self.proxy_password;
            }
        }
        if let Some(debug) = self.debug {
            config.debug = debug;
        }
        if let Some(ms) = self.connection_timeout_ms {
            config.connection_timeout_ms = ms;
        }
        if let Some(ms) = self.idle_timeout_ms {
            config.idle_timeout_ms = ms;
        }
        config.statistics |= self.statistics;
        if self.proxy_id.is_some() {
            config.proxy_id = self.proxy_id;
        }
        if let (Some(cert_path), Some(key_path)) = (self.tls_cert, self.tls_key) {
            config.listen.tls = Some(TlsConfig {
                cert_path,
                key_path,
            });
        }
        if let Some(port) = self.admin_port {
            let admin = config.admin.get_or_insert_with(|| AdminConfig {
                host: "127.0.0.1".to_string(),
                port,
            });
            admin.port = port;
        }

        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(debug: u8) {
    // Handler logs are gated by the debug level itself.
    let level = if debug >= 2 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();
}

async fn run(config: ChainConfig) -> Result<(), anyhow::Error> {
    let mut chain = ProxyChain::new(config.to_options()?)?;
    chain.listen().await?;

    let admin = match &config.admin {
        Some(admin) => {
            let server = AdminServer::bind(admin.socket_addr()?, AdminState::new(&chain)).await?;
            Some(tokio::spawn(server.run()))
        }
        None => None,
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    if let Some(task) = admin {
        task.abort();
    }
    chain.close().await;
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            std::process::exit(2);
        }
    };
    init_tracing(config.debug);

    if let Err(e) = run(config).await {
        error!("proxy-chain failed: {:#}", e);
        std::process::exit(1);
    }
}
