use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;

pub const GRPC_STATUS: &str = "grpc-status";
pub const GRPC_MESSAGE: &str = "grpc-message";
pub const GRPC_CONTENT_TYPE: &str = "application/grpc";

/// Canonical RPC status codes, numbered per the gRPC wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Code {
    /// Decodes a numeric code; values outside the canonical range collapse to
    /// `Unknown`.
    pub fn from_i64(value: i64) -> Code {
        match value {
            0 => Code::Ok,
            1 => Code::Cancelled,
            2 => Code::Unknown,
            3 => Code::InvalidArgument,
            4 => Code::DeadlineExceeded,
            5 => Code::NotFound,
            6 => Code::AlreadyExists,
            7 => Code::PermissionDenied,
            8 => Code::ResourceExhausted,
            9 => Code::FailedPrecondition,
            10 => Code::Aborted,
            11 => Code::OutOfRange,
            12 => Code::Unimplemented,
            13 => Code::Internal,
            14 => Code::Unavailable,
            15 => Code::DataLoss,
            16 => Code::Unauthenticated,
            _ => Code::Unknown,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Code::Ok => "OK",
            Code::Cancelled => "Canceled",
            Code::Unknown => "Unknown",
            Code::InvalidArgument => "InvalidArgument",
            Code::DeadlineExceeded => "DeadlineExceeded",
            Code::NotFound => "NotFound",
            Code::AlreadyExists => "AlreadyExists",
            Code::PermissionDenied => "PermissionDenied",
            Code::ResourceExhausted => "ResourceExhausted",
            Code::FailedPrecondition => "FailedPrecondition",
            Code::Aborted => "Aborted",
            Code::OutOfRange => "OutOfRange",
            Code::Unimplemented => "Unimplemented",
            Code::Internal => "Internal",
            Code::Unavailable => "Unavailable",
            Code::DataLoss => "DataLoss",
            Code::Unauthenticated => "Unauthenticated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(Code::Ok, "")
    }

    /// Renders the status as an HTTP/2 trailer block.
    pub fn to_trailers(&self) -> HeaderMap {
        let mut trailers = HeaderMap::with_capacity(2);
        trailers.insert(
            HeaderName::from_static(GRPC_STATUS),
            HeaderValue::from(self.code as u32),
        );
        if !self.message.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&percent_encode(&self.message)) {
                trailers.insert(HeaderName::from_static(GRPC_MESSAGE), value);
            }
        }
        trailers
    }
}

/// Percent-encodes a status message per the gRPC convention: printable ASCII
/// except `%` passes through, everything else becomes `%XX` per byte.
fn percent_encode(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    for &b in message.as_bytes() {
        if (0x20..=0x7e).contains(&b) && b != b'%' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_names_match_canonical_spelling() {
        assert_eq!(Code::NotFound.name(), "NotFound");
        assert_eq!(Code::Unavailable.name(), "Unavailable");
        assert_eq!(Code::from_i64(5), Code::NotFound);
        assert_eq!(Code::from_i64(99), Code::Unknown);
        assert_eq!(Code::from_i64(-1), Code::Unknown);
    }

    #[test]
    fn trailers_carry_status_and_message() {
        let trailers = Status::new(Code::Unavailable, "Failed to send a message").to_trailers();
        assert_eq!(trailers.get(GRPC_STATUS).unwrap(), "14");
        assert_eq!(
            trailers.get(GRPC_MESSAGE).unwrap(),
            "Failed to send a message"
        );

        let ok = Status::ok().to_trailers();
        assert_eq!(ok.get(GRPC_STATUS).unwrap(), "0");
        assert!(ok.get(GRPC_MESSAGE).is_none());
    }

    #[test]
    fn message_is_percent_encoded() {
        assert_eq!(percent_encode("plain text"), "plain text");
        assert_eq!(percent_encode("50%"), "50%25");
        assert_eq!(percent_encode("a\nb"), "a%0Ab");
    }
}
