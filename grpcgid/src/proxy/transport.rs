use super::stream::handle_stream;
use bytes::Bytes;
use grpcgi_core::config::TargetConfig;
use h2::Reason;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// How long draining transports wait for in-flight handlers before the
/// backend context is cancelled.
const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

const MAX_CONCURRENT_STREAMS: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Serving,
    Draining,
    Closing,
}

/// Owns one server transport bound to one accepted connection.
///
/// Two independent cancellation contexts are in play: `shutdown` is the
/// transport context (stop serving this connection), while the locally owned
/// backend token governs in-flight FastCGI calls. Inbound cancellation never
/// cancels the backend implicitly; only the drain deadline does.
pub(super) async fn supervise<T>(
    io: T,
    peer: SocketAddr,
    target: Arc<TargetConfig>,
    shutdown: CancellationToken,
) where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut builder = h2::server::Builder::new();
    builder.max_concurrent_streams(MAX_CONCURRENT_STREAMS);
    let mut conn = match builder.handshake::<_, Bytes>(io).await {
        Ok(conn) => conn,
        Err(err) => {
            error!(%peer, error = %err, "failed to create rpc transport");
            return;
        }
    };

    let backend = CancellationToken::new();
    let mut handlers: JoinSet<()> = JoinSet::new();
    let mut state = State::Serving;

    // Armed when the transport enters Draining.
    let drain_timer = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(drain_timer);

    // The accept future borrows the connection, so state transitions that
    // also need the connection run after the select resolves.
    enum Event {
        Shutdown,
        DeadlineExpired,
        Accepted(Option<Result<(http::Request<h2::RecvStream>, h2::server::SendResponse<Bytes>), h2::Error>>),
        HandlerDone,
    }

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled(), if state == State::Serving => Event::Shutdown,
            _ = drain_timer.as_mut(), if state == State::Draining => Event::DeadlineExpired,
            accepted = conn.accept() => Event::Accepted(accepted),
            Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                if let Err(err) = joined {
                    if err.is_panic() {
                        error!(%peer, error = %err, "stream handler panicked");
                    }
                }
                Event::HandlerDone
            }
        };

        match event {
            Event::Shutdown => {
                debug!(%peer, "draining transport");
                conn.graceful_shutdown();
                drain_timer.as_mut().reset(Instant::now() + DRAIN_DEADLINE);
                state = State::Draining;
            }
            Event::DeadlineExpired => {
                warn!(%peer, "drain deadline elapsed, cancelling backend requests");
                backend.cancel();
                conn.abrupt_shutdown(Reason::NO_ERROR);
                state = State::Closing;
            }
            Event::Accepted(Some(Ok((request, mut respond)))) => {
                if state == State::Serving {
                    handlers.spawn(handle_stream(
                        target.clone(),
                        request,
                        respond,
                        Some(peer),
                        backend.child_token(),
                    ));
                } else {
                    respond.send_reset(Reason::REFUSED_STREAM);
                }
            }
            Event::Accepted(Some(Err(err))) => {
                debug!(%peer, error = %err, "transport terminated");
                break;
            }
            Event::Accepted(None) => break,
            Event::HandlerDone => {}
        }
    }

    // The connection is gone but handlers may still be talking to the
    // backend. They keep the remainder of the drain window before the backend
    // context is cancelled.
    if !handlers.is_empty() {
        let deadline = match state {
            State::Serving => Instant::now() + DRAIN_DEADLINE,
            State::Draining | State::Closing => drain_timer.deadline(),
        };
        if tokio::time::timeout_at(deadline, drain_handlers(&mut handlers))
            .await
            .is_err()
        {
            warn!(%peer, "drain deadline elapsed, cancelling backend requests");
            backend.cancel();
            drain_handlers(&mut handlers).await;
        }
    }
    debug!(%peer, "transport closed");
}

async fn drain_handlers(handlers: &mut JoinSet<()>) {
    while let Some(joined) = handlers.join_next().await {
        if let Err(err) = joined {
            if err.is_panic() {
                error!(error = %err, "stream handler panicked");
            }
        }
    }
}
