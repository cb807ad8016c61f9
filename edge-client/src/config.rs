use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser};
use reqwest::Url;

use crate::crypto::{parse_time_to_seconds, KeyPaths};
use crate::net::RetryPolicy;
use crate::proxy::{ProxySettings, TlsPaths};
use crate::session::{ReconnectPolicy, SessionSettings};

#[derive(Parser, Debug, Clone)]
#[command(name = "carpool-edge-client")]
#[command(about = "AI Carpool edge node", long_about = None)]
#[command(args_override_self = true)]
pub struct EdgeConfig {
    #[command(flatten)]
    pub node: NodeArgs,

    #[command(flatten)]
    pub server: ServerArgs,

    #[command(flatten)]
    pub central: CentralArgs,

    #[command(flatten)]
    pub security: SecurityArgs,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(flatten)]
    pub reporters: ReporterArgs,

    #[command(flatten)]
    pub proxy: ProxyArgs,
}

#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// Node name (defaults to system hostname)
    #[arg(long = "node-name", env = "NODE_NAME")]
    pub name: Option<String>,

    #[arg(long = "node-location", env = "NODE_LOCATION", default_value = "unknown")]
    pub location: String,

    /// Endpoint advertised at registration (defaults to http://<bind>)
    #[arg(long = "node-endpoint", env = "NODE_ENDPOINT")]
    pub endpoint: Option<String>,

    #[arg(long, env = "NODE_MAX_CONNECTIONS", default_value_t = 1000)]
    pub max_connections: u32,

    #[arg(long, env = "NODE_NETWORK_MBPS", default_value_t = 1000)]
    pub network_mbps: u32,
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Bind address for the local proxy server
    #[arg(long, env = "PROXY_BIND", default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,

    #[arg(long, env = "TLS_CERT_PATH")]
    pub tls_cert: Option<PathBuf>,

    #[arg(long, env = "TLS_KEY_PATH")]
    pub tls_key: Option<PathBuf>,

    /// CA for client certificates; enables mTLS
    #[arg(long, env = "TLS_CA_PATH")]
    pub tls_ca: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct CentralArgs {
    /// Central server URL
    #[arg(long = "central-url", env = "CENTRAL_SERVER_URL", default_value = "http://localhost:3000")]
    pub url: String,

    /// Control channel URL (defaults to <central-url>/ws with a ws scheme)
    #[arg(long = "central-ws-url", env = "CENTRAL_SERVER_WS_URL")]
    pub ws_url: Option<String>,

    #[arg(long = "central-timeout-secs", env = "CENTRAL_SERVER_TIMEOUT_SECS", default_value_t = 30)]
    pub timeout_secs: u64,

    #[arg(long = "central-retry-attempts", env = "CENTRAL_SERVER_RETRY_ATTEMPTS", default_value_t = 3)]
    pub retry_attempts: u32,

    #[arg(long = "central-retry-delay-ms", env = "CENTRAL_SERVER_RETRY_DELAY_MS", default_value_t = 1000)]
    pub retry_delay_ms: u64,

    #[arg(long, env = "WS_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    pub ws_connect_timeout_secs: u64,

    #[arg(long, env = "RECONNECT_BASE_DELAY_MS", default_value_t = 1000)]
    pub reconnect_base_delay_ms: u64,

    #[arg(long, env = "MAX_RECONNECT_ATTEMPTS", default_value_t = 10)]
    pub max_reconnect_attempts: u32,
}

#[derive(Args, Debug, Clone)]
pub struct SecurityArgs {
    #[arg(long, env = "PRIVATE_KEY_PATH", default_value = "./keys/private.pem")]
    pub private_key_path: PathBuf,

    #[arg(long, env = "PUBLIC_KEY_PATH", default_value = "./keys/public.pem")]
    pub public_key_path: PathBuf,

    /// Lifetime of issued tokens: <integer>[smhd]
    #[arg(long, env = "TOKEN_TTL", default_value = "1h")]
    pub token_ttl: String,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Also write JSON logs here
    #[arg(long, env = "LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// never, minutely, hourly or daily
    #[arg(long, env = "LOG_ROTATION", default_value = "daily")]
    pub log_rotation: String,
}

#[derive(Args, Debug, Clone)]
pub struct ReporterArgs {
    #[arg(long, env = "HEARTBEAT_INTERVAL_SECS", default_value_t = 60)]
    pub heartbeat_interval_secs: u64,

    #[arg(long, env = "HEALTH_CHECK_INTERVAL_SECS", default_value_t = 30)]
    pub health_check_interval_secs: u64,

    #[arg(long, env = "METRICS_INTERVAL_SECS", default_value_t = 60)]
    pub metrics_interval_secs: u64,

    #[arg(long, env = "METRICS_RETENTION_HOURS", default_value_t = 24)]
    pub metrics_retention_hours: u64,

    #[arg(long, env = "CONFIG_SYNC_INTERVAL_SECS", default_value_t = 300)]
    pub config_sync_interval_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ProxyArgs {
    #[arg(long, env = "PROXY_TIMEOUT_SECS", default_value_t = 60)]
    pub proxy_timeout_secs: u64,

    #[arg(long, env = "PROXY_RETRY_ATTEMPTS", default_value_t = 2)]
    pub proxy_retry_attempts: u32,

    #[arg(long, env = "PROXY_RETRY_DELAY_MS", default_value_t = 500)]
    pub proxy_retry_delay_ms: u64,

    #[arg(long, env = "RATE_LIMIT_WINDOW_SECS", default_value_t = 60)]
    pub rate_limit_window_secs: u64,

    #[arg(long, env = "RATE_LIMIT_MAX_REQUESTS", default_value_t = 600)]
    pub rate_limit_max_requests: u32,
}

impl EdgeConfig {
    /// Reject combinations that would only fail later, mid-startup.
    pub fn validate(&self) -> Result<()> {
        let central = Url::parse(&self.central.url)
            .with_context(|| format!("Invalid central server URL: {}", self.central.url))?;
        if !matches!(central.scheme(), "http" | "https") {
            bail!("Central server URL must be http or https: {}", self.central.url);
        }

        let ws_url = self.ws_url()?;
        let ws = Url::parse(&ws_url).with_context(|| format!("Invalid WebSocket URL: {}", ws_url))?;
        if !matches!(ws.scheme(), "ws" | "wss") {
            bail!("WebSocket URL must be ws or wss: {}", ws_url);
        }

        parse_time_to_seconds(&self.security.token_ttl)
            .with_context(|| format!("Invalid TOKEN_TTL: {}", self.security.token_ttl))?;

        let intervals = [
            ("HEARTBEAT_INTERVAL_SECS", self.reporters.heartbeat_interval_secs),
            ("HEALTH_CHECK_INTERVAL_SECS", self.reporters.health_check_interval_secs),
            ("METRICS_INTERVAL_SECS", self.reporters.metrics_interval_secs),
            ("CONFIG_SYNC_INTERVAL_SECS", self.reporters.config_sync_interval_secs),
            ("RATE_LIMIT_WINDOW_SECS", self.proxy.rate_limit_window_secs),
            ("WS_CONNECT_TIMEOUT_SECS", self.central.ws_connect_timeout_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                bail!("{} must be greater than zero", name);
            }
        }

        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            bail!("TLS_CERT_PATH and TLS_KEY_PATH must be set together");
        }
        if self.server.tls_ca.is_some() && self.server.tls_cert.is_none() {
            bail!("TLS_CA_PATH requires TLS_CERT_PATH and TLS_KEY_PATH");
        }

        Ok(())
    }

    pub fn node_name(&self) -> Result<String> {
        if let Some(name) = &self.node.name {
            return Ok(name.clone());
        }
        Ok(hostname::get()
            .context("Failed to get system hostname")?
            .to_string_lossy()
            .to_string())
    }

    /// Advertised endpoint; derived from the address actually bound unless
    /// set explicitly.
    pub fn endpoint(&self, bound: SocketAddr) -> String {
        self.node.endpoint.clone().unwrap_or_else(|| {
            let scheme = if self.server.tls_cert.is_some() { "https" } else { "http" };
            format!("{}://{}", scheme, bound)
        })
    }

    /// Configured control channel URL, or one derived from the central URL.
    pub fn ws_url(&self) -> Result<String> {
        if let Some(ws_url) = &self.central.ws_url {
            return Ok(ws_url.clone());
        }

        let mut url = Url::parse(&self.central.url)
            .with_context(|| format!("Invalid central server URL: {}", self.central.url))?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        if url.set_scheme(scheme).is_err() {
            bail!("Cannot derive a WebSocket URL from {}", self.central.url);
        }
        let path = format!("{}/ws", url.path().trim_end_matches('/'));
        url.set_path(&path);
        Ok(url.to_string())
    }

    pub fn central_timeout(&self) -> Duration {
        Duration::from_secs(self.central.timeout_secs)
    }

    pub fn central_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.central.retry_attempts,
            Duration::from_millis(self.central.retry_delay_ms),
        )
    }

    pub fn session_settings(&self) -> Result<SessionSettings> {
        Ok(SessionSettings {
            ws_url: self.ws_url()?,
            connect_timeout: Duration::from_secs(self.central.ws_connect_timeout_secs),
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(self.central.reconnect_base_delay_ms),
                max_attempts: self.central.max_reconnect_attempts,
            },
            token_ttl: self.security.token_ttl.clone(),
        })
    }

    pub fn key_paths(&self) -> KeyPaths {
        KeyPaths {
            private_key: self.security.private_key_path.clone(),
            public_key: self.security.public_key_path.clone(),
        }
    }

    pub fn tls_paths(&self) -> Option<TlsPaths> {
        match (&self.server.tls_cert, &self.server.tls_key) {
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert: cert.clone(),
                key: key.clone(),
                client_ca: self.server.tls_ca.clone(),
            }),
            _ => None,
        }
    }

    pub fn proxy_settings(&self) -> ProxySettings {
        ProxySettings {
            timeout: Duration::from_secs(self.proxy.proxy_timeout_secs),
            retry: RetryPolicy::new(
                self.proxy.proxy_retry_attempts,
                Duration::from_millis(self.proxy.proxy_retry_delay_ms),
            ),
        }
    }
}
