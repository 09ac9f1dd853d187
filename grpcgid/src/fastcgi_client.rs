use bytes::{BufMut, Bytes, BytesMut};
use grpcgi_core::config::TargetConfig;
use http::header::HeaderName;
use http::HeaderMap;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::warn;

// FastCGI constants.
const FCGI_VERSION: u8 = 1;
const FCGI_BEGIN_REQUEST: u8 = 1;
const FCGI_END_REQUEST: u8 = 3;
const FCGI_PARAMS: u8 = 4;
const FCGI_STDIN: u8 = 5;
const FCGI_STDOUT: u8 = 6;
const FCGI_STDERR: u8 = 7;
const FCGI_RESPONDER: u16 = 1;
const FCGI_REQUEST_COMPLETE: u8 = 0;

const MAX_RECORD_CONTENT: usize = 65535;
const MAX_STDERR_BYTES: usize = 64 * 1024;

const SERVER_SOFTWARE: &str = "grpcgi/fcgiclient";
const SERVER_NAME: &str = "grpcgi/1.0";

/// Metadata keys are forwarded to the backend under this prefix.
const METADATA_PARAM_PREFIX: &str = "X-GRPC-";

/// Any failure during the backend exchange. The stream handler treats every
/// variant the same way (retry, then UNAVAILABLE); the variants exist so the
/// cause survives into the logs.
#[derive(Debug, Error)]
pub enum FcgiError {
    #[error("failed to connect to fastcgi backend {addr}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("fastcgi record i/o failed")]
    Record(#[from] std::io::Error),
    #[error("fastcgi protocol violation: {0}")]
    Protocol(String),
    #[error("failed to parse fastcgi response header")]
    HeaderParse(String),
    #[error("failed to decode chunked fastcgi response body")]
    Dechunk(String),
    #[error("fastcgi request cancelled")]
    Cancelled,
}

/// One unary call handed to the requester: everything is already buffered, so
/// CONTENT_LENGTH is known up front.
#[derive(Clone, Copy)]
pub struct UnaryCall<'a> {
    /// Canonicalized method name, placed under query-string key `r`.
    pub method: &'a str,
    pub metadata: &'a HeaderMap,
    pub body: &'a [u8],
    pub client_ip: &'a str,
    pub client_port: &'a str,
}

#[derive(Debug)]
pub struct FcgiResponse {
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Executes unary FastCGI requests against one configured backend. A fresh
/// TCP connection is opened per call and closed when the exchange completes.
#[derive(Debug, Clone)]
pub struct FcgiRequester {
    host: String,
    port: u16,
    script_path: String,
    script_name: String,
}

impl FcgiRequester {
    pub fn new(target: &TargetConfig) -> Self {
        Self {
            host: target.host.clone(),
            port: target.port,
            script_path: target.script_path.clone(),
            script_name: target.script_name.clone(),
        }
    }

    /// Runs one exchange. The token is the backend cancellation context: it
    /// aborts the call at the next suspension point, independent of the
    /// inbound stream's fate.
    pub async fn dispatch(
        &self,
        call: UnaryCall<'_>,
        cancel: &CancellationToken,
    ) -> Result<FcgiResponse, FcgiError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(FcgiError::Cancelled),
            res = self.exchange(call) => res,
        }
    }

    async fn exchange(&self, call: UnaryCall<'_>) -> Result<FcgiResponse, FcgiError> {
        let addr = format!("{}:{}", self.host, self.port);
        let mut stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| FcgiError::Connect { addr, source })?;
        let _ = stream.set_nodelay(true);

        let request_id: u16 = 1;
        write_begin_request(&mut stream, request_id).await?;

        let params = self.build_params(&call);
        for chunk in params.chunks(MAX_RECORD_CONTENT) {
            write_record(&mut stream, FCGI_PARAMS, request_id, chunk).await?;
        }
        write_record(&mut stream, FCGI_PARAMS, request_id, &[]).await?;

        for chunk in call.body.chunks(MAX_RECORD_CONTENT) {
            write_record(&mut stream, FCGI_STDIN, request_id, chunk).await?;
        }
        write_record(&mut stream, FCGI_STDIN, request_id, &[]).await?;
        stream.flush().await?;

        let stdout = read_response_records(&mut stream, request_id).await?;
        parse_response(&stdout)
    }

    fn build_params(&self, call: &UnaryCall<'_>) -> BytesMut {
        let script = format!("{}/{}", self.script_path, self.script_name);
        let uri = format!("/{}", self.script_name);
        let query: String = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("r", call.method)
            .finish();
        let port = self.port.to_string();
        let content_length = call.body.len().to_string();

        let mut params = BytesMut::new();
        put_nv_pair(&mut params, b"GATEWAY_INTERFACE", b"FastCGI/1.0");
        put_nv_pair(&mut params, b"REQUEST_METHOD", b"POST");
        put_nv_pair(&mut params, b"SCRIPT_FILENAME", script.as_bytes());
        put_nv_pair(&mut params, b"SCRIPT_NAME", script.as_bytes());
        put_nv_pair(&mut params, b"QUERY_STRING", query.as_bytes());
        put_nv_pair(&mut params, b"REQUEST_URI", uri.as_bytes());
        put_nv_pair(&mut params, b"DOCUMENT_URI", uri.as_bytes());
        put_nv_pair(&mut params, b"SERVER_SOFTWARE", SERVER_SOFTWARE.as_bytes());
        put_nv_pair(&mut params, b"REMOTE_ADDR", call.client_ip.as_bytes());
        put_nv_pair(&mut params, b"REMOTE_PORT", call.client_port.as_bytes());
        put_nv_pair(&mut params, b"SERVER_ADDR", self.host.as_bytes());
        put_nv_pair(&mut params, b"SERVER_PORT", port.as_bytes());
        put_nv_pair(&mut params, b"SERVER_NAME", SERVER_NAME.as_bytes());
        put_nv_pair(&mut params, b"SERVER_PROTOCOL", b"HTTP/1.1");
        put_nv_pair(&mut params, b"CONTENT_TYPE", b"application/octet-stream");
        put_nv_pair(&mut params, b"CONTENT_LENGTH", content_length.as_bytes());

        // Inbound metadata rides along, prefixed; duplicate values are written
        // as repeated pairs in their original order.
        for key in call.metadata.keys() {
            let name = format!("{METADATA_PARAM_PREFIX}{key}");
            for value in call.metadata.get_all(key) {
                put_nv_pair(&mut params, name.as_bytes(), value.as_bytes());
            }
        }

        params
    }
}

fn put_nv_len(buf: &mut BytesMut, len: usize) {
    if len < 128 {
        buf.put_u8(len as u8);
    } else {
        buf.put_u32((len as u32) | 0x8000_0000);
    }
}

fn put_nv_pair(buf: &mut BytesMut, name: &[u8], value: &[u8]) {
    put_nv_len(buf, name.len());
    put_nv_len(buf, value.len());
    buf.extend_from_slice(name);
    buf.extend_from_slice(value);
}

async fn write_record(
    stream: &mut TcpStream,
    record_type: u8,
    request_id: u16,
    content: &[u8],
) -> Result<(), FcgiError> {
    debug_assert!(content.len() <= MAX_RECORD_CONTENT);
    let padding = (8 - (content.len() % 8)) % 8;
    let header = [
        FCGI_VERSION,
        record_type,
        (request_id >> 8) as u8,
        (request_id & 0xff) as u8,
        (content.len() >> 8) as u8,
        (content.len() & 0xff) as u8,
        padding as u8,
        0,
    ];
    stream.write_all(&header).await?;
    if !content.is_empty() {
        stream.write_all(content).await?;
    }
    if padding > 0 {
        const PAD: [u8; 8] = [0u8; 8];
        stream.write_all(&PAD[..padding]).await?;
    }
    Ok(())
}

async fn write_begin_request(stream: &mut TcpStream, request_id: u16) -> Result<(), FcgiError> {
    // Role responder, keep-connection off: the connection dies with the call.
    let mut body = [0u8; 8];
    body[0] = (FCGI_RESPONDER >> 8) as u8;
    body[1] = (FCGI_RESPONDER & 0xff) as u8;
    write_record(stream, FCGI_BEGIN_REQUEST, request_id, &body).await
}

/// Reads records until END_REQUEST, accumulating STDOUT. STDERR is captured
/// (bounded) and logged; management records are ignored.
async fn read_response_records(
    stream: &mut TcpStream,
    request_id: u16,
) -> Result<Bytes, FcgiError> {
    let mut stdout = BytesMut::new();
    let mut stderr = BytesMut::new();

    loop {
        let mut header = [0u8; 8];
        stream.read_exact(&mut header).await?;
        let record_type = header[1];
        let record_id = u16::from_be_bytes([header[2], header[3]]);
        if record_id != request_id && record_id != 0 {
            return Err(FcgiError::Protocol(format!(
                "unexpected request id in response record: {record_id}"
            )));
        }
        let content_len = u16::from_be_bytes([header[4], header[5]]) as usize;
        let padding_len = header[6] as usize;

        let mut content = vec![0u8; content_len + padding_len];
        if !content.is_empty() {
            stream.read_exact(&mut content).await?;
        }
        content.truncate(content_len);

        match record_type {
            FCGI_STDOUT => stdout.extend_from_slice(&content),
            FCGI_STDERR => {
                let room = MAX_STDERR_BYTES.saturating_sub(stderr.len());
                let take = room.min(content.len());
                stderr.extend_from_slice(&content[..take]);
            }
            FCGI_END_REQUEST => {
                if content_len < 8 {
                    return Err(FcgiError::Protocol("short END_REQUEST record".to_string()));
                }
                if content[4] != FCGI_REQUEST_COMPLETE {
                    return Err(FcgiError::Protocol(format!(
                        "request not completed, protocol status {}",
                        content[4]
                    )));
                }
                break;
            }
            _ => {}
        }
    }

    if !stderr.is_empty() {
        warn!(stderr = %String::from_utf8_lossy(&stderr), "fastcgi backend stderr");
    }
    Ok(stdout.freeze())
}

/// Splits the STDOUT payload into an HTTP-style header block and a body,
/// dechunking the body when the backend declared `Transfer-Encoding: chunked`.
fn parse_response(stdout: &[u8]) -> Result<FcgiResponse, FcgiError> {
    let (boundary, separator_len) = find_header_boundary(stdout)
        .ok_or_else(|| FcgiError::HeaderParse("missing header/body boundary".to_string()))?;
    let headers = parse_headers(&stdout[..boundary])?;
    let raw_body = &stdout[boundary + separator_len..];

    let body = if is_chunked(&headers) {
        dechunk(raw_body)?
    } else {
        Bytes::copy_from_slice(raw_body)
    };

    Ok(FcgiResponse { headers, body })
}

fn find_header_boundary(data: &[u8]) -> Option<(usize, usize)> {
    for i in 0..data.len() {
        if data[i..].starts_with(b"\r\n\r\n") {
            return Some((i + 2, 2));
        }
        if data[i..].starts_with(b"\n\n") {
            return Some((i + 1, 1));
        }
    }
    None
}

fn parse_headers(data: &[u8]) -> Result<HeaderMap, FcgiError> {
    let text = std::str::from_utf8(data)
        .map_err(|_| FcgiError::HeaderParse("header block is not utf-8".to_string()))?;
    let mut headers = HeaderMap::new();
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| FcgiError::HeaderParse(format!("malformed header line: {line:?}")))?;
        let name = HeaderName::from_bytes(key.trim().as_bytes())
            .map_err(|_| FcgiError::HeaderParse(format!("invalid header name: {key:?}")))?;
        let value = value
            .trim()
            .parse()
            .map_err(|_| FcgiError::HeaderParse(format!("invalid header value for {key:?}")))?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get("transfer-encoding")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
}

/// Decodes an HTTP/1.1 chunked body held fully in memory. Chunk extensions
/// are ignored; trailers after the terminal chunk are discarded.
fn dechunk(mut data: &[u8]) -> Result<Bytes, FcgiError> {
    let mut out = BytesMut::new();
    loop {
        let line_end = data
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| FcgiError::Dechunk("missing chunk size line".to_string()))?;
        let line = std::str::from_utf8(&data[..line_end])
            .map_err(|_| FcgiError::Dechunk("chunk size line is not utf-8".to_string()))?
            .trim_end_matches('\r');
        let size_text = line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| FcgiError::Dechunk(format!("invalid chunk size: {size_text:?}")))?;
        data = &data[line_end + 1..];

        if size == 0 {
            break;
        }
        if data.len() < size {
            return Err(FcgiError::Dechunk("truncated chunk payload".to_string()));
        }
        out.extend_from_slice(&data[..size]);
        data = &data[size..];

        // Per-chunk CRLF terminator.
        if data.starts_with(b"\r\n") {
            data = &data[2..];
        } else if data.starts_with(b"\n") {
            data = &data[1..];
        } else {
            return Err(FcgiError::Dechunk("missing chunk terminator".to_string()));
        }
    }
    Ok(out.freeze())
}
