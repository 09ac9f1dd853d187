use anyhow::{Context, Result};
use grpcgi_core::config::RuntimeConfig;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use tokio::net::TcpListener;

pub fn worker_threads(cfg: &RuntimeConfig) -> usize {
    cfg.worker_threads.unwrap_or_else(default_parallelism)
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

pub fn bind_listener(addr: SocketAddr, backlog: i32) -> Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .context("failed to create listener socket")?;
    socket
        .set_reuse_address(true)
        .context("failed to set SO_REUSEADDR")?;
    socket
        .set_nonblocking(true)
        .context("failed to set nonblocking")?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("failed to bind {addr}"))?;
    socket
        .listen(backlog)
        .with_context(|| format!("failed to listen on {addr}"))?;
    TcpListener::from_std(socket.into()).context("failed to register listener with runtime")
}
