//! Error taxonomy for object operations
//!
//! Every public operation returns one of these. `Transport` and `Throttled`
//! are the only retryable kinds; everything else propagates untouched.

use hyper::StatusCode;
use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

/// S3 client errors
#[derive(Error, Debug)]
pub enum S3Error {
    #[error("Object not found: {key}")]
    NotFound { key: String },

    #[error("Authorization failed: {status} - {message}")]
    Auth { status: StatusCode, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Range error: {0}")]
    Range(String),

    #[error("Truncated response: expected {expected} bytes, got {actual}")]
    TruncatedResponse { expected: u64, actual: u64 },

    #[error("Upload failed for {key}: {reason}")]
    Upload { key: String, reason: String },

    #[error("Upload sink is closed")]
    SinkClosed,

    #[error("Client is closed")]
    ClientClosed,

    #[error("Throttled: {status} - {message}")]
    Throttled { status: StatusCode, message: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("S3 error: {status} - {message}")]
    Status { status: StatusCode, message: String },
}

pub type Result<T> = std::result::Result<T, S3Error>;

impl S3Error {
    /// Transient failures worth another attempt after backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, S3Error::Transport(_) | S3Error::Throttled { .. })
    }

    /// Wrap a failure from the multipart path as an upload failure for `key`.
    pub(crate) fn into_upload(self, key: &str) -> S3Error {
        match self {
            S3Error::Upload { .. } | S3Error::ClientClosed | S3Error::SinkClosed => self,
            other => S3Error::Upload {
                key: key.to_string(),
                reason: other.to_string(),
            },
        }
    }

    /// Classify a non-success response into the error taxonomy.
    ///
    /// `body` is the (possibly empty) S3 XML error document.
    pub(crate) fn from_response(status: StatusCode, key: &str, body: &[u8]) -> S3Error {
        let (code, message) = parse_error_body(body);
        let message = match (code, message) {
            (Some(code), Some(message)) => format!("{}: {}", code, message),
            (Some(code), None) => code,
            (None, Some(message)) => message,
            (None, None) => status
                .canonical_reason()
                .unwrap_or("unknown status")
                .to_string(),
        };

        match status {
            StatusCode::NOT_FOUND => S3Error::NotFound {
                key: key.to_string(),
            },
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => S3Error::Auth { status, message },
            StatusCode::RANGE_NOT_SATISFIABLE => S3Error::Range(message),
            StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
                S3Error::Throttled { status, message }
            }
            StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::GATEWAY_TIMEOUT => {
                S3Error::Transport(format!("{} - {}", status, message))
            }
            _ => S3Error::Status { status, message },
        }
    }
}

impl From<hyper::http::Error> for S3Error {
    fn from(err: hyper::http::Error) -> Self {
        S3Error::InvalidConfig(format!("Request build error: {}", err))
    }
}

impl From<hyper_util::client::legacy::Error> for S3Error {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        S3Error::Transport(format!("Request failed: {}", err))
    }
}

impl From<hyper::Error> for S3Error {
    fn from(err: hyper::Error) -> Self {
        S3Error::Transport(format!("Body error: {}", err))
    }
}

impl From<quick_xml::Error> for S3Error {
    fn from(err: quick_xml::Error) -> Self {
        S3Error::InvalidResponse(format!("XML parse error: {}", err))
    }
}

/// Pull `<Code>` and `<Message>` out of an S3 error document.
///
/// Bodies that are not XML (HEAD responses, proxies) yield `(None, None)`.
fn parse_error_body(body: &[u8]) -> (Option<String>, Option<String>) {
    if body.is_empty() {
        return (None, None);
    }

    let mut reader = Reader::from_reader(body);
    reader.config_mut().trim_text_start = true;
    reader.config_mut().trim_text_end = true;

    let mut code = None;
    let mut message = None;
    let mut current_text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Text(e)) => {
                current_text.clear();
                if let Ok(text) = e.unescape() {
                    current_text.push_str(&text);
                }
            }
            Ok(Event::End(e)) => {
                match e.local_name().as_ref() {
                    b"Code" => code = Some(std::mem::take(&mut current_text)),
                    b"Message" => message = Some(std::mem::take(&mut current_text)),
                    _ => {}
                }
                current_text.clear();
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }

    (code, message)
}
