use anyhow::{anyhow, Result};
use std::net::SocketAddr;

use super::types::Config;

pub(super) fn validate_config(config: &Config) -> Result<()> {
    config
        .listen
        .parse::<SocketAddr>()
        .map_err(|_| anyhow!("listen must be a host:port socket address: {}", config.listen))?;

    if let Some(health) = &config.health_listen {
        health
            .parse::<SocketAddr>()
            .map_err(|_| anyhow!("health_listen must be a host:port socket address: {health}"))?;
    }

    if config.instance_name.is_empty() {
        return Err(anyhow!("instance_name must not be empty"));
    }

    match config.log.format.as_str() {
        "json" | "text" => {}
        other => return Err(anyhow!("log.format must be json or text, got {other:?}")),
    }

    if let Some(tls) = &config.tls {
        if tls.cert_file.is_empty() || tls.key_file.is_empty() {
            return Err(anyhow!("tls requires both cert_file and key_file"));
        }
    }

    if let Some(workers) = config.runtime.worker_threads {
        if workers == 0 {
            return Err(anyhow!("runtime.worker_threads must be at least 1"));
        }
    }
    if config.runtime.tcp_backlog <= 0 {
        return Err(anyhow!("runtime.tcp_backlog must be positive"));
    }

    let target = &config.target;
    if target.host.is_empty() {
        return Err(anyhow!("target.host must not be empty"));
    }
    if target.port == 0 {
        return Err(anyhow!("target.port must not be zero"));
    }
    if target.script_path.is_empty() || target.script_name.is_empty() {
        return Err(anyhow!("target.script_path and target.script_name are required"));
    }
    if target.script_name.contains('/') {
        return Err(anyhow!(
            "target.script_name must be a bare file name, got {:?}",
            target.script_name
        ));
    }
    if target.client_ip.is_empty() {
        return Err(anyhow!("target.client_ip fallback must not be empty"));
    }
    if target.retry_attempts == 0 {
        return Err(anyhow!("target.retry_attempts must be at least 1"));
    }

    Ok(())
}
