use http::header::HeaderName;
use http::HeaderMap;
use rand::Rng;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

pub const GLOBAL_REQUEST_ID: &str = "global_request_id";

/// REMOTE_PORT used when the transport peer address is unavailable.
const FALLBACK_CLIENT_PORT: &str = "9985";

/// Transport-level headers that never enter the call metadata.
fn is_reserved(name: &HeaderName) -> bool {
    matches!(name.as_str(), "content-type" | "te")
}

/// Copies the inbound h2 headers into the call metadata map. Keys stay
/// case-insensitive, duplicate values keep their order. Pseudo-headers never
/// appear here; h2 strips them before the request surfaces.
pub fn from_headers(headers: &HeaderMap) -> HeaderMap {
    let mut metadata = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_reserved(name) {
            continue;
        }
        metadata.append(name.clone(), value.clone());
    }
    metadata
}

/// A fresh request-id: microseconds since the epoch, a dot, and a random
/// integer below 500. The RNG is the process-wide thread-local one; it is
/// never reseeded per call.
pub fn generate_request_id() -> String {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros();
    let entropy: u32 = rand::thread_rng().gen_range(0..500);
    format!("{micros}.{entropy}")
}

/// Adopts the caller-supplied `global_request_id` when present and non-empty;
/// otherwise promotes `request_id` to global and injects it into the metadata
/// so the backend sees it.
pub fn resolve_global_id(metadata: &mut HeaderMap, request_id: &str) -> String {
    if let Some(value) = metadata.get(GLOBAL_REQUEST_ID) {
        if let Ok(s) = value.to_str() {
            if !s.is_empty() {
                return s.to_string();
            }
        }
    }
    if let Ok(value) = request_id.parse() {
        metadata.insert(HeaderName::from_static(GLOBAL_REQUEST_ID), value);
    }
    request_id.to_string()
}

/// Effective client address for the CGI parameter set: the IP comes from the
/// first `x-forwarded-for` hop when present, else from the transport peer,
/// else from the configured fallback. The port always reflects the transport
/// peer when known.
pub fn client_host_port(
    peer: Option<SocketAddr>,
    metadata: &HeaderMap,
    fallback_ip: &str,
) -> (String, String) {
    let (mut host, port) = match peer {
        Some(addr) => (addr.ip().to_string(), addr.port().to_string()),
        None => (fallback_ip.to_string(), FALLBACK_CLIENT_PORT.to_string()),
    };

    if let Some(forwarded) = metadata.get("x-forwarded-for") {
        if let Ok(s) = forwarded.to_str() {
            if let Some(first) = s.split(',').next() {
                let first = first.trim();
                if !first.is_empty() {
                    host = first.to_string();
                }
            }
        }
    }

    (host, port)
}
