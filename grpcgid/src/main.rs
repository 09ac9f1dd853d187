use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use grpcgi_core::config::{load_config, Config};
use grpcgi_core::observability::init_logging;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod fastcgi_client;
mod grpc;
mod health;
mod net;
mod proxy;

#[derive(Parser)]
#[command(name = "grpcgid", about = "gRPC-to-FastCGI gateway daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Run {
        #[arg(short, long, default_value = "grpcgi.yaml")]
        config: PathBuf,
    },
    Check {
        #[arg(short, long, default_value = "grpcgi.yaml")]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { config } => run_with_runtime(config),
        Command::Check { config } => check(config),
    }
}

fn check(path: PathBuf) -> Result<()> {
    let config = load_config(&path)?;
    if let Some(tls) = &config.tls {
        grpcgi_core::tls::load_server_config(Path::new(&tls.cert_file), Path::new(&tls.key_file))?;
    }
    println!("config ok");
    Ok(())
}

fn run_with_runtime(path: PathBuf) -> Result<()> {
    let config = load_config(&path)?;
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder
        .worker_threads(net::worker_threads(&config.runtime))
        .enable_all();
    let runtime = builder.build()?;
    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    let _log_guards = init_logging(&config.log, config.debug)?;
    info!(instance_name = %config.instance_name, "gateway is starting up");

    let tls = match &config.tls {
        Some(tls) => {
            info!(cert = %tls.cert_file, key = %tls.key_file, "using tls");
            let server_config = grpcgi_core::tls::load_server_config(
                Path::new(&tls.cert_file),
                Path::new(&tls.key_file),
            )?;
            Some(TlsAcceptor::from(server_config))
        }
        None => None,
    };

    let listen: SocketAddr = config
        .listen
        .parse()
        .with_context(|| format!("invalid listen address {}", config.listen))?;
    let listener = net::bind_listener(listen, config.runtime.tcp_backlog)?;
    info!(%listen, "binding successful");

    if let Some(health_listen) = &config.health_listen {
        let addr: SocketAddr = health_listen
            .parse()
            .with_context(|| format!("invalid health_listen address {health_listen}"))?;
        tokio::spawn(async move {
            if let Err(err) = health::serve(addr).await {
                error!(error = %err, "health endpoint failed");
            }
        });
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    let target = Arc::new(config.target.clone());
    info!("starting serve");
    match proxy::serve(listener, tls, target, shutdown).await {
        Ok(()) => {
            info!("successful application shutdown, goodbye");
            Ok(())
        }
        Err(err) => Err(err).context("failed to serve"),
    }
}

async fn shutdown_on_signal(shutdown: CancellationToken) {
    wait_for_signal().await;
    info!("shutdown signal received, draining");
    shutdown.cancel();
    wait_for_signal().await;
    error!("second shutdown signal, exiting immediately");
    std::process::exit(1);
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(err) => {
            error!(error = %err, "failed to install SIGINT handler");
            return std::future::pending().await;
        }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            error!(error = %err, "failed to install SIGTERM handler");
            return std::future::pending().await;
        }
    };
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
