//! Request construction for object operations
//!
//! An [`ObjectRequest`] is the unsigned description of one HTTP exchange:
//! method, object path, query, headers and body source. The client signs it
//! and hands it to the transport, rebuilding the body for every attempt.

use crate::s3::error::{Result, S3Error};
use crate::s3::types::Range;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::Method;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;

/// Hex lookup table for URI encoding
static HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

/// Body type handed to hyper
pub(crate) type RequestBody = BoxBody<Bytes, Infallible>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// Object storage endpoint: scheme, host and port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl Endpoint {
    /// Parse `host[:port]` or `http(s)://host[:port]`.
    ///
    /// Without a scheme, port 443 selects https and anything else http.
    pub fn parse(endpoint: &str) -> Result<Self> {
        let trimmed = endpoint.trim().trim_end_matches('/');

        let (scheme, authority) = if let Some(rest) = trimmed.strip_prefix("https://") {
            (Some(Scheme::Https), rest)
        } else if let Some(rest) = trimmed.strip_prefix("http://") {
            (Some(Scheme::Http), rest)
        } else if trimmed.contains("://") {
            return Err(S3Error::InvalidConfig(format!(
                "unsupported endpoint scheme: {}",
                endpoint
            )));
        } else {
            (None, trimmed)
        };

        if authority.is_empty() || authority.contains('/') || authority.contains('?') {
            return Err(S3Error::InvalidConfig(format!("invalid endpoint: {:?}", endpoint)));
        }

        // "[::1]" has colons but no port
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) if !authority.ends_with(']') => {
                let port = port.parse::<u16>().map_err(|_| {
                    S3Error::InvalidConfig(format!("invalid port in endpoint: {:?}", endpoint))
                })?;
                (host, Some(port))
            }
            _ => (authority, None),
        };

        if host.is_empty() {
            return Err(S3Error::InvalidConfig(format!("missing host in endpoint: {:?}", endpoint)));
        }

        let scheme = scheme.unwrap_or(if port == Some(443) {
            Scheme::Https
        } else {
            Scheme::Http
        });
        let port = port.unwrap_or_else(|| scheme.default_port());

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `scheme://host:port` with no trailing slash
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base_url())
    }
}

/// Body source for uploads: nothing, one buffer, or an ordered list of
/// discontiguous buffers sent back to back without being copied together.
#[derive(Debug, Clone, Default)]
pub enum Payload {
    #[default]
    Empty,
    Single(Bytes),
    Chunked(Vec<Bytes>),
}

impl Payload {
    /// Total body length in bytes
    pub fn len(&self) -> u64 {
        self.chunks().iter().map(|c| c.len() as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn chunks(&self) -> &[Bytes] {
        match self {
            Payload::Empty => &[],
            Payload::Single(bytes) => std::slice::from_ref(bytes),
            Payload::Chunked(chunks) => chunks,
        }
    }

    /// Fresh hyper body; `Bytes` clones are reference-counted, not copies.
    pub(crate) fn to_body(&self) -> RequestBody {
        match self {
            Payload::Empty => Full::new(Bytes::new()).boxed(),
            Payload::Single(bytes) => Full::new(bytes.clone()).boxed(),
            Payload::Chunked(chunks) => {
                let frames = chunks
                    .clone()
                    .into_iter()
                    .map(|chunk| Ok::<_, Infallible>(Frame::data(chunk)));
                StreamBody::new(futures::stream::iter(frames)).boxed()
            }
        }
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Single(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Payload::Single(Bytes::from(data))
    }
}

impl From<&'static [u8]> for Payload {
    fn from(data: &'static [u8]) -> Self {
        Payload::Single(Bytes::from_static(data))
    }
}

impl From<Vec<Bytes>> for Payload {
    fn from(chunks: Vec<Bytes>) -> Self {
        Payload::Chunked(chunks)
    }
}

impl FromIterator<Bytes> for Payload {
    fn from_iter<I: IntoIterator<Item = Bytes>>(iter: I) -> Self {
        Payload::Chunked(iter.into_iter().collect())
    }
}

/// Unsigned description of a single object request
#[derive(Debug, Clone)]
pub(crate) struct ObjectRequest {
    pub method: Method,
    pub key: String,
    pub query: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub payload: Payload,
    /// Sign the SHA256 of the body even when the client sends UNSIGNED-PAYLOAD
    pub hash_payload: bool,
}

impl ObjectRequest {
    pub fn new(method: Method, key: &str) -> Self {
        Self {
            method,
            key: key.to_string(),
            query: None,
            headers: BTreeMap::new(),
            payload: Payload::Empty,
            hash_payload: false,
        }
    }

    pub fn get(key: &str) -> Self {
        Self::new(Method::GET, key)
    }

    pub fn head(key: &str) -> Self {
        Self::new(Method::HEAD, key)
    }

    pub fn delete(key: &str) -> Self {
        Self::new(Method::DELETE, key)
    }

    /// PUT/POST with `Content-Length` taken from the payload
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.headers
            .insert("content-length".to_string(), payload.len().to_string());
        self.payload = payload;
        self
    }

    /// Small bodies (XML documents) are always signed with their real hash.
    pub fn with_hashed_payload(mut self) -> Self {
        self.hash_payload = true;
        self
    }

    /// Header names are lowercased so they sort and sign canonically.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_headers<'a, I>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        for (name, value) in headers {
            self.headers.insert(name.to_ascii_lowercase(), value.clone());
        }
        self
    }

    pub fn with_range(self, range: &Range) -> Self {
        match range.header_value() {
            Some(value) => self.with_header("range", value),
            None => self,
        }
    }

    /// Query string; parameter values must already be URI-encoded.
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Full request URL against `endpoint`
    pub fn url(&self, endpoint: &Endpoint) -> String {
        let base = endpoint.base_url();
        let path = object_path(&self.key);
        let mut url = String::with_capacity(base.len() + path.len() + 64);
        url.push_str(&base);
        url.push_str(&path);
        if let Some(query) = &self.query {
            url.push('?');
            url.push_str(query);
        }
        url
    }
}

/// `/bucket/key` path for an object key, encoded and with one leading slash
pub(crate) fn object_path(key: &str) -> String {
    let key = key.trim_start_matches('/');
    let encoded = encode_s3_key(key);
    let mut path = String::with_capacity(encoded.len() + 1);
    path.push('/');
    path.push_str(&encoded);
    path
}

/// Encode an S3 key, preserving forward slashes
/// Returns Cow::Borrowed when no encoding is needed
pub(crate) fn encode_s3_key(key: &str) -> Cow<'_, str> {
    let needs_encoding = key.bytes().any(
        |b| !matches!(b, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/'),
    );

    if !needs_encoding {
        return Cow::Borrowed(key);
    }

    let mut result = String::with_capacity(key.len() + 32);
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                result.push(byte as char);
            }
            _ => {
                result.push('%');
                result.push(HEX_UPPER[(byte >> 4) as usize] as char);
                result.push(HEX_UPPER[(byte & 0xf) as usize] as char);
            }
        }
    }
    Cow::Owned(result)
}

/// Encode a query parameter value (RFC 3986) into an existing buffer
pub(crate) fn url_encode_into(buf: &mut String, s: &str) {
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                buf.push(byte as char);
            }
            _ => {
                buf.push('%');
                buf.push(HEX_UPPER[(byte >> 4) as usize] as char);
                buf.push(HEX_UPPER[(byte & 0xf) as usize] as char);
            }
        }
    }
}
