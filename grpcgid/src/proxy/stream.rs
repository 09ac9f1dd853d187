use crate::fastcgi_client::{FcgiError, FcgiRequester, FcgiResponse, UnaryCall};
use crate::grpc::frame;
use crate::grpc::metadata;
use crate::grpc::method;
use crate::grpc::status::{Code, Status, GRPC_CONTENT_TYPE};
use bytes::Bytes;
use grpcgi_core::config::TargetConfig;
use h2::server::SendResponse;
use h2::RecvStream;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, Request, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, warn, Instrument};

/// Runs one unary exchange: read a single framed message, dispatch it to the
/// FastCGI backend, write either a framed reply + OK or a bare error status.
pub async fn handle_stream(
    target: Arc<TargetConfig>,
    request: Request<RecvStream>,
    respond: SendResponse<Bytes>,
    peer: Option<SocketAddr>,
    backend: CancellationToken,
) {
    let method_name = method::from_path(request.uri().path()).to_string();
    let mut md = metadata::from_headers(request.headers());
    let request_id = metadata::generate_request_id();
    let global_id = metadata::resolve_global_id(&mut md, &request_id);

    let span = info_span!(
        "stream",
        method = %method_name,
        request_id = %request_id,
        global_request_id = %global_id,
    );
    handle_inner(target, request, respond, peer, backend, md, method_name)
        .instrument(span)
        .await
}

async fn handle_inner(
    target: Arc<TargetConfig>,
    request: Request<RecvStream>,
    mut respond: SendResponse<Bytes>,
    peer: Option<SocketAddr>,
    backend: CancellationToken,
    md: HeaderMap,
    method_name: String,
) {
    let mut body = request.into_body();
    let message = match frame::read_message(&mut body).await {
        Ok(frame) => frame,
        Err(err) => {
            error!(error = %err, "failed to receive a message");
            write_status(&mut respond, &Status::new(Code::Unknown, "Failed to parse message"));
            return;
        }
    };

    let (client_ip, client_port) = metadata::client_host_port(peer, &md, &target.client_ip);
    let canonical = method::canonicalize(&method_name);
    debug!(
        r = %canonical,
        datalen = message.payload.len(),
        client_ip = %client_ip,
        "dispatching to fastcgi backend"
    );

    let requester = FcgiRequester::new(&target);
    let call = UnaryCall {
        method: &canonical,
        metadata: &md,
        body: &message.payload,
        client_ip: &client_ip,
        client_port: &client_port,
    };
    let response =
        match dispatch_with_retry(&requester, call, target.retry_attempts, &backend).await {
            Ok(response) => response,
            Err(err) => {
                error!(error = %err, "failed to handle a message");
                write_status(
                    &mut respond,
                    &Status::new(Code::Unavailable, "Failed to send a message"),
                );
                return;
            }
        };

    if let Some(status) = backend_status(&response.headers, target.return_error) {
        warn!(code = status.code.name(), "fastcgi backend returned an error");
        write_status(&mut respond, &status);
        return;
    }

    debug!(length = response.body.len(), "returning result from fastcgi");
    if let Err(err) = write_reply(&mut respond, frame::encode_frame(&response.body)) {
        if err.is_io() || err.is_go_away() {
            debug!(error = %err, "connection-level reply write failure");
        } else {
            debug!(error = %err, "stream-level reply write failure");
        }
        error!("failed to send message back");
        write_status(
            &mut respond,
            &Status::new(Code::Unknown, "Failed to send message back"),
        );
    }
}

/// Invokes the requester up to `attempts` times. Every failure opens the next
/// attempt on a fresh connection without delay; the final failure is returned.
async fn dispatch_with_retry(
    requester: &FcgiRequester,
    call: UnaryCall<'_>,
    attempts: usize,
    backend: &CancellationToken,
) -> Result<FcgiResponse, FcgiError> {
    let mut attempt = 1;
    loop {
        match requester.dispatch(call, backend).await {
            Ok(response) => return Ok(response),
            Err(err) if attempt < attempts => {
                warn!(attempt, error = %err, "fastcgi request failed, retrying");
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Decodes the backend control headers. `None` means success; `Some` carries
/// the status to surface instead of a payload.
fn backend_status(headers: &HeaderMap, return_error: bool) -> Option<Status> {
    let is_error = headers
        .get("x-grpc-status")
        .map(|value| value.as_bytes() == b"ERROR")
        .unwrap_or(false);
    if !is_error {
        return None;
    }

    let code = match headers.get("x-grpc-error-code") {
        None => Code::Unknown,
        Some(value) => match value.to_str().ok().and_then(|s| s.trim().parse::<i64>().ok()) {
            Some(number) => Code::from_i64(number),
            None => {
                warn!("could not parse x-grpc-error-code, using internal code");
                Code::Internal
            }
        },
    };

    let message = if return_error {
        error_description(code, headers)
    } else {
        code.name().to_string()
    };
    Some(Status::new(code, message))
}

fn error_description(code: Code, headers: &HeaderMap) -> String {
    if code == Code::Internal {
        return "Internal service error".to_string();
    }
    match headers
        .get("x-grpc-error-description")
        .and_then(|value| value.to_str().ok())
        .filter(|description| !description.is_empty())
    {
        Some(description) => description.to_string(),
        None => "Description of error has not been transfered".to_string(),
    }
}

fn grpc_response_head() -> Response<()> {
    let mut response = Response::new(());
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(GRPC_CONTENT_TYPE));
    response
}

/// Sends the framed reply followed by OK trailers. When the reply is already
/// under way and a later step fails, the failure status can only travel as
/// trailers on the same stream.
fn write_reply(respond: &mut SendResponse<Bytes>, payload: Bytes) -> Result<(), h2::Error> {
    let mut stream = respond.send_response(grpc_response_head(), false)?;
    if let Err(err) = stream.send_data(payload, false) {
        let _ = stream.send_trailers(
            Status::new(Code::Unknown, "Failed to send message back").to_trailers(),
        );
        return Err(err);
    }
    stream.send_trailers(Status::ok().to_trailers())
}

/// Writes a bare status with no payload: a trailers-only response. Best
/// effort; if the reply already started this is a no-op at the h2 layer.
fn write_status(respond: &mut SendResponse<Bytes>, status: &Status) {
    let mut response = grpc_response_head();
    response.headers_mut().extend(status.to_trailers());
    let _ = respond.send_response(response, true);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error_headers(code: Option<&'static str>, description: Option<&'static str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-grpc-status", HeaderValue::from_static("ERROR"));
        if let Some(code) = code {
            headers.insert("x-grpc-error-code", HeaderValue::from_static(code));
        }
        if let Some(description) = description {
            headers.insert("x-grpc-error-description", HeaderValue::from_static(description));
        }
        headers
    }

    #[test]
    fn success_without_error_marker() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        assert!(backend_status(&headers, true).is_none());

        headers.insert("x-grpc-status", HeaderValue::from_static("OK"));
        assert!(backend_status(&headers, true).is_none());
    }

    #[test]
    fn error_with_description_surfaced_when_enabled() {
        let headers = error_headers(Some("5"), Some("not found"));
        let status = backend_status(&headers, true).expect("error status");
        assert_eq!(status.code, Code::NotFound);
        assert_eq!(status.message, "not found");
    }

    #[test]
    fn error_description_hidden_when_disabled() {
        let headers = error_headers(Some("5"), Some("not found"));
        let status = backend_status(&headers, false).expect("error status");
        assert_eq!(status.code, Code::NotFound);
        assert_eq!(status.message, "NotFound");
    }

    #[test]
    fn missing_code_maps_to_unknown() {
        let headers = error_headers(None, None);
        let status = backend_status(&headers, true).expect("error status");
        assert_eq!(status.code, Code::Unknown);
    }

    #[test]
    fn unparseable_code_maps_to_internal_with_fixed_message() {
        let headers = error_headers(Some("not-a-number"), Some("whatever"));
        let status = backend_status(&headers, true).expect("error status");
        assert_eq!(status.code, Code::Internal);
        assert_eq!(status.message, "Internal service error");
    }

    #[test]
    fn missing_description_gets_placeholder() {
        let headers = error_headers(Some("5"), None);
        let status = backend_status(&headers, true).expect("error status");
        assert_eq!(status.code, Code::NotFound);
        assert_eq!(status.message, "Description of error has not been transfered");
    }

    #[test]
    fn control_headers_are_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::HeaderName::from_static("x-grpc-status"),
            HeaderValue::from_static("ERROR"),
        );
        headers.insert(
            http::header::HeaderName::from_static("x-grpc-error-code"),
            HeaderValue::from_static("7"),
        );
        let status = backend_status(&headers, false).expect("error status");
        assert_eq!(status.code, Code::PermissionDenied);
        assert_eq!(status.message, "PermissionDenied");
    }
}
