//! AWS Signature Version 4 signer for S3 requests
//!
//! Signing is a pure function of the credentials, the request and the
//! timestamp passed in, so one signer is shared by every in-flight request
//! without locking.
//!
//! - Pre-computed AWS4+secret_key bytes
//! - Constant empty payload hash (avoids SHA256 for empty bodies)
//! - Incremental payload hashing across discontiguous chunks
//! - Fixed-size [u8; 32] arrays instead of Vec<u8> for HMAC results

use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

type HmacSha256 = Hmac<Sha256>;

/// Hex lookup table for zero-allocation percent encoding
static HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

/// SHA256 of the empty payload
pub const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Payload hash marker for bodies that are not hashed
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

pub const DEFAULT_REGION: &str = "us-east-1";

/// Access credentials used to sign requests
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

impl Credentials {
    pub fn new(access_key: String, secret_key: String, region: Option<String>) -> Self {
        Self {
            access_key,
            secret_key,
            region: region.unwrap_or_else(|| DEFAULT_REGION.to_string()),
        }
    }
}

// Keep the secret out of logs.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("region", &self.region)
            .finish()
    }
}

/// Hex SHA256 over an ordered sequence of chunks, as if they were one body.
pub fn payload_sha256(chunks: &[Bytes]) -> String {
    if chunks.iter().all(|c| c.is_empty()) {
        return EMPTY_SHA256.to_string();
    }
    let mut hasher = Sha256::new();
    for chunk in chunks {
        hasher.update(chunk);
    }
    hex::encode(hasher.finalize())
}

/// AWS Signature Version 4 signer
#[derive(Clone)]
pub struct S3SignerV4 {
    credentials: Credentials,
    service: String,
    /// Pre-computed "AWS4" + secret_key as bytes
    aws4_key: Vec<u8>,
}

impl S3SignerV4 {
    /// Create a new S3 signer
    pub fn new(credentials: Credentials) -> Self {
        let aws4_key = format!("AWS4{}", credentials.secret_key).into_bytes();
        Self {
            credentials,
            service: "s3".to_string(),
            aws4_key,
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Sign a request whose body is fully in memory.
    pub fn sign(
        &self,
        method: &str,
        url: &str,
        headers: BTreeMap<String, String>,
        payload: &[u8],
        now: DateTime<Utc>,
    ) -> BTreeMap<String, String> {
        if payload.is_empty() {
            self.sign_with_hash(method, url, headers, EMPTY_SHA256, now)
        } else {
            let hash = hex::encode(Sha256::digest(payload));
            self.sign_with_hash(method, url, headers, &hash, now)
        }
    }

    /// Sign with UNSIGNED-PAYLOAD (for large PUT operations, avoids SHA256 of body)
    pub fn sign_unsigned_payload(
        &self,
        method: &str,
        url: &str,
        headers: BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> BTreeMap<String, String> {
        self.sign_with_hash(method, url, headers, UNSIGNED_PAYLOAD, now)
    }

    /// Sign with a pre-computed payload hash.
    ///
    /// Returns the input headers plus `host`, `x-amz-date`,
    /// `x-amz-content-sha256` and `authorization`. Header names must be
    /// lowercase.
    pub fn sign_with_hash(
        &self,
        method: &str,
        url: &str,
        mut headers: BTreeMap<String, String>,
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> BTreeMap<String, String> {
        let (host, path, query) = Self::parse_url_fast(url);

        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();

        headers.insert("host".to_string(), host.to_string());
        headers.insert("x-amz-date".to_string(), amz_date.clone());
        headers.insert("x-amz-content-sha256".to_string(), payload_hash.to_string());

        let canonical_query = Self::create_canonical_query_string(query);
        let canonical_headers = Self::create_canonical_headers(&headers);
        let signed_headers = Self::create_signed_headers(&headers);

        // Path is already URI-encoded by the request builder
        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, path, canonical_query, canonical_headers, signed_headers, payload_hash
        );

        tracing::trace!(%method, %url, canonical_request = %canonical_request, "sigv4 canonical request");

        let credential_scope = format!(
            "{}/{}/{}/aws4_request",
            date_stamp, self.credentials.region, self.service
        );
        let canonical_request_hash = hex::encode(Sha256::digest(canonical_request.as_bytes()));
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM, amz_date, credential_scope, canonical_request_hash
        );

        let signature = self.calculate_signature(&date_stamp, &string_to_sign);

        let authorization = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM, self.credentials.access_key, credential_scope, signed_headers, signature
        );
        headers.insert("authorization".to_string(), authorization);

        headers
    }

    /// Split a URL into (host_with_port, path, query) slices.
    ///
    /// Default ports (:443 for https, :80 for http) are stripped from the host,
    /// matching what hyper sends in the `Host` header.
    fn parse_url_fast(url: &str) -> (&str, &str, &str) {
        let after_scheme = if let Some(rest) = url.strip_prefix("https://") {
            rest
        } else if let Some(rest) = url.strip_prefix("http://") {
            rest
        } else {
            url
        };

        let (authority, path_and_query) = match after_scheme.find('/') {
            Some(pos) => (&after_scheme[..pos], &after_scheme[pos..]),
            None => (after_scheme, "/"),
        };

        let (path, query) = match path_and_query.find('?') {
            Some(pos) => (&path_and_query[..pos], &path_and_query[pos + 1..]),
            None => (path_and_query, ""),
        };

        let host = if url.starts_with("https") {
            authority.strip_suffix(":443").unwrap_or(authority)
        } else {
            authority.strip_suffix(":80").unwrap_or(authority)
        };

        (host, path, query)
    }

    /// Create canonical query string (sorted by parameter name)
    ///
    /// Valueless parameters such as `?uploads` become `uploads=`.
    fn create_canonical_query_string(query: &str) -> String {
        if query.is_empty() {
            return String::new();
        }

        let mut params: Vec<(String, String)> = Vec::new();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = match pair.find('=') {
                Some(pos) => (&pair[..pos], &pair[pos + 1..]),
                None => (pair, ""),
            };
            let decoded_key = urlencoding::decode(key).unwrap_or_else(|_| key.into());
            let decoded_value = urlencoding::decode(value).unwrap_or_else(|_| value.into());
            params.push((
                Self::uri_encode(&decoded_key, true),
                Self::uri_encode(&decoded_value, true),
            ));
        }

        params.sort_unstable();

        params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Create canonical headers - keys are lowercase and sorted by BTreeMap
    fn create_canonical_headers(headers: &BTreeMap<String, String>) -> String {
        let mut result = String::with_capacity(headers.len() * 64);
        for (k, v) in headers {
            result.push_str(k);
            result.push(':');
            result.push_str(v.trim());
            result.push('\n');
        }
        result
    }

    /// Create signed headers list
    fn create_signed_headers(headers: &BTreeMap<String, String>) -> String {
        headers.keys().map(String::as_str).collect::<Vec<_>>().join(";")
    }

    fn calculate_signature(&self, date_stamp: &str, string_to_sign: &str) -> String {
        let signing_key = self.derive_signing_key(date_stamp);
        hex::encode(Self::hmac_sha256(&signing_key, string_to_sign.as_bytes()))
    }

    /// Derive signing key from date stamp (4 chained HMAC operations)
    fn derive_signing_key(&self, date_stamp: &str) -> [u8; 32] {
        let k_date = Self::hmac_sha256(&self.aws4_key, date_stamp.as_bytes());
        let k_region = Self::hmac_sha256(&k_date, self.credentials.region.as_bytes());
        let k_service = Self::hmac_sha256(&k_region, self.service.as_bytes());
        Self::hmac_sha256(&k_service, b"aws4_request")
    }

    /// HMAC-SHA256 returning fixed-size array
    fn hmac_sha256(key: &[u8], msg: &[u8]) -> [u8; 32] {
        let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
        mac.update(msg);
        let result = mac.finalize().into_bytes();
        let mut output = [0u8; 32];
        output.copy_from_slice(&result);
        output
    }

    /// URI encode a string (RFC 3986) using hex lookup table
    pub(crate) fn uri_encode(s: &str, encode_slash: bool) -> String {
        let mut result = String::with_capacity(s.len() + 16);
        for byte in s.bytes() {
            match byte {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                    result.push(byte as char);
                }
                b'/' if !encode_slash => {
                    result.push('/');
                }
                _ => {
                    result.push('%');
                    result.push(HEX_UPPER[(byte >> 4) as usize] as char);
                    result.push(HEX_UPPER[(byte & 0xf) as usize] as char);
                }
            }
        }
        result
    }
}
