use anyhow::{Context, Result};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tracing::warn;

const READ_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_REQUEST_BYTES: usize = 8 * 1024;

const OK_RESPONSE: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok";
const NOT_ALLOWED_RESPONSE: &[u8] = b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 45\r\nConnection: close\r\n\r\nThis is an rpc entry point, use grpc requests";

/// Plain-HTTP health responder, bound separately from the RPC listener.
/// Answers `GET /health` with 200 and everything else with 405.
pub async fn serve(listen: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind health listener on {listen}"))?;
    loop {
        let (mut stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(error = %err, "health accept failed");
                continue;
            }
        };
        tokio::spawn(async move {
            let line = match timeout(READ_TIMEOUT, read_request_line(&mut stream)).await {
                Ok(Ok(Some(line))) => line,
                _ => return,
            };
            let response = if is_health_request(&line) {
                OK_RESPONSE
            } else {
                NOT_ALLOWED_RESPONSE
            };
            let _ = stream.write_all(response).await;
            let _ = stream.shutdown().await;
        });
    }
}

async fn read_request_line(stream: &mut TcpStream) -> std::io::Result<Option<String>> {
    let mut chunk = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        data.extend_from_slice(&chunk[..n]);
        if let Some(pos) = data.windows(2).position(|w| w == b"\r\n") {
            return Ok(Some(String::from_utf8_lossy(&data[..pos]).to_string()));
        }
        if data.len() > MAX_REQUEST_BYTES {
            return Ok(None);
        }
    }
}

fn is_health_request(line: &str) -> bool {
    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("");
    method == "GET" && (path == "/health" || path.starts_with("/health?"))
}
