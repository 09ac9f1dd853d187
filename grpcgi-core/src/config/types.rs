use super::defaults::*;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Address the gRPC listener binds, `host:port`.
    pub listen: String,
    /// Optional plain-HTTP health endpoint, bound separately from the
    /// RPC listener.
    #[serde(default)]
    pub health_listen: Option<String>,
    /// Instance identity attached to startup log events.
    pub instance_name: String,
    /// Raises the default log level to debug when no filter overrides it.
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    pub target: TargetConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LogConfig {
    /// EnvFilter directive for log output ("info", "grpcgid=debug,h2=warn",
    /// ...). A RUST_LOG environment variable overrides it.
    #[serde(default = "default_log_filter", alias = "level")]
    pub filter: String,
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Log to this file instead of stderr when set.
    #[serde(default)]
    pub file: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            format: default_log_format(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub worker_threads: Option<usize>,
    #[serde(default = "default_tcp_backlog")]
    pub tcp_backlog: i32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            tcp_backlog: default_tcp_backlog(),
        }
    }
}

/// The FastCGI backend this gateway fronts. Read once at startup and
/// immutable afterwards.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TargetConfig {
    pub host: String,
    pub port: u16,
    pub script_path: String,
    pub script_name: String,
    /// Used as REMOTE_ADDR when the peer address cannot be resolved and no
    /// x-forwarded-for hop is present.
    pub client_ip: String,
    /// Surface backend-supplied error descriptions to callers.
    #[serde(default)]
    pub return_error: bool,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: usize,
}
