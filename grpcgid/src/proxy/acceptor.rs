use super::transport::supervise;
use anyhow::{Context, Result};
use grpcgi_core::config::TargetConfig;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Accept loop: every connection becomes one supervised server transport.
/// Per-connection failures (TLS or h2 handshake) are logged and drop only
/// that connection; a listener-level accept failure terminates the loop and
/// propagates. On shutdown the loop stops accepting and waits for the
/// supervisors to drain.
pub async fn serve(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    target: Arc<TargetConfig>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut transports: JoinSet<()> = JoinSet::new();

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
            Some(joined) = transports.join_next(), if !transports.is_empty() => {
                if let Err(err) = joined {
                    if err.is_panic() {
                        error!(error = %err, "transport supervisor panicked");
                    }
                }
                continue;
            }
        };

        let (stream, peer) = accepted.context("failed to accept connection")?;
        debug!(%peer, "accepted connection");
        let _ = stream.set_nodelay(true);

        let tls = tls.clone();
        let target = target.clone();
        let shutdown = shutdown.clone();
        transports.spawn(async move {
            match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => supervise(tls_stream, peer, target, shutdown).await,
                    Err(err) => warn!(%peer, error = %err, "tls handshake failed"),
                },
                None => supervise(stream, peer, target, shutdown).await,
            }
        });
    }

    info!("listener stopped, waiting for transports to drain");
    while let Some(joined) = transports.join_next().await {
        if let Err(err) = joined {
            if err.is_panic() {
                error!(error = %err, "transport supervisor panicked");
            }
        }
    }
    Ok(())
}
