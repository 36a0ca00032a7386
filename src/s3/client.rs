//! Object client facade
//!
//! - One hyper transport per client, shared by every clone and adapter
//! - SigV4 signing per attempt (timestamps change between retries)
//! - UNSIGNED-PAYLOAD for bodies unless payload signing is configured
//! - Automatic retry with jitter for transport errors, 429 and 5xx
//! - A lifecycle gate so `close()` drains in-flight operations first

use crate::config::{ClientSettings, Profile};
use crate::s3::error::{Result, S3Error};
use crate::s3::readable_file::ReadableFile;
use crate::s3::request::{url_encode_into, Endpoint, ObjectRequest, Payload};
use crate::s3::retry::with_retry;
use crate::s3::signer::{payload_sha256, Credentials, S3SignerV4, EMPTY_SHA256};
use crate::s3::transport::{RawResponse, Transport};
use crate::s3::types::{
    CompleteMultipartUploadResponse, CompletedPart, CreateMultipartUploadResponse,
    MultipartConfig, Range,
};
use crate::s3::upload_sink::UploadSink;
use bytes::Bytes;
use chrono::Utc;
use hyper::header::{HeaderMap, CONTENT_LENGTH, CONTENT_RANGE, ETAG};
use hyper::{Method, Request, StatusCode};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Write as FmtWrite};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, info, warn};

/// Upper bound on concurrently running operations per client.
/// `close()` acquires all of them to wait for in-flight work.
const OPERATION_PERMITS: u32 = 1 << 20;

const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

struct ClientInner {
    endpoint: Endpoint,
    /// None for anonymous clients
    signer: Option<S3SignerV4>,
    transport: Transport,
    settings: ClientSettings,
    multipart: MultipartConfig,
    gate: Semaphore,
    closed: AtomicBool,
    /// Multipart uploads created but not yet completed or aborted, by upload id
    open_uploads: Mutex<HashMap<String, String>>,
}

impl ClientInner {
    fn open_uploads(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.open_uploads.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// S3-compatible object client
///
/// Clone is cheap: clones and every adapter created from the client share one
/// transport, so it lives as long as the longest holder.
#[derive(Clone)]
pub struct S3Client {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for S3Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Client")
            .field("endpoint", &self.inner.endpoint)
            .field("anonymous", &self.inner.signer.is_none())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl S3Client {
    /// Build a client for `endpoint` (`host[:port]` or `http(s)://host[:port]`).
    ///
    /// Without credentials every request is sent unsigned.
    pub fn new(endpoint: &str, credentials: Option<Credentials>) -> Result<Self> {
        Self::with_settings(endpoint, credentials, ClientSettings::default())
    }

    /// Build a client with explicit transport, retry and multipart settings.
    pub fn with_settings(
        endpoint: &str,
        credentials: Option<Credentials>,
        settings: ClientSettings,
    ) -> Result<Self> {
        let endpoint = Endpoint::parse(endpoint)?;

        if let Some(creds) = &credentials {
            if creds.access_key.is_empty() || creds.secret_key.is_empty() {
                return Err(S3Error::InvalidConfig(
                    "access key and secret key must not be empty".to_string(),
                ));
            }
            if creds.region.is_empty() {
                return Err(S3Error::InvalidConfig("region must not be empty".to_string()));
            }
        }

        let transport = Transport::new(&settings)?;
        let multipart = settings.multipart_config();

        debug!(
            endpoint = %endpoint,
            anonymous = credentials.is_none(),
            max_connections = settings.max_connections,
            "creating s3 client"
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                endpoint,
                signer: credentials.map(S3SignerV4::new),
                transport,
                settings,
                multipart,
                gate: Semaphore::new(OPERATION_PERMITS as usize),
                closed: AtomicBool::new(false),
                open_uploads: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Build a client from a configuration profile.
    pub fn from_profile(profile: &Profile, settings: &ClientSettings) -> anyhow::Result<Self> {
        let credentials = profile.credentials()?;
        Ok(Self::with_settings(&profile.endpoint, credentials, settings.clone())?)
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub fn is_anonymous(&self) -> bool {
        self.inner.signer.is_none()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Multipart settings given to sinks from [`S3Client::make_upload_sink`]
    pub fn multipart_config(&self) -> &MultipartConfig {
        &self.inner.multipart
    }

    /// Admission to the lifecycle gate; held for the whole operation.
    ///
    /// Operations never enter the gate while already holding a permit, so a
    /// pending `close()` cannot deadlock against them.
    async fn enter(&self) -> Result<SemaphorePermit<'_>> {
        if self.is_closed() {
            return Err(S3Error::ClientClosed);
        }
        self.inner
            .gate
            .acquire()
            .await
            .map_err(|_| S3Error::ClientClosed)
    }

    /// Wait for every outstanding operation, abort multipart uploads that
    /// are still open, then shut the transport.
    ///
    /// Later operations on this client, its clones and its adapters fail
    /// with `ClientClosed`. Closing twice is harmless.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        // Err means another close() already finished
        if let Ok(permits) = self.inner.gate.acquire_many(OPERATION_PERMITS).await {
            permits.forget();
            self.abort_open_uploads().await;
            self.inner.gate.close();
            self.inner.transport.close();
            info!(endpoint = %self.inner.endpoint, "s3 client closed");
        }
    }

    /// Runs with every gate permit held, so it sends without entering the gate.
    async fn abort_open_uploads(&self) {
        let open: Vec<(String, String)> = self.inner.open_uploads().drain().collect();
        for (upload_id, key) in open {
            match self.execute(&abort_request(&key, &upload_id)).await {
                Ok(_) | Err(S3Error::NotFound { .. }) => {
                    info!(key = %key, upload_id = %upload_id, "open multipart upload aborted on close")
                }
                Err(e) => {
                    warn!(key = %key, upload_id = %upload_id, error = %e, "failed to abort multipart upload on close")
                }
            }
        }
    }

    /// Random-access view of `key`; no I/O until the first read.
    pub fn make_readable_file(&self, key: &str) -> ReadableFile {
        ReadableFile::new(self.clone(), key.to_string())
    }

    /// Upload sink for `key` in the `Open` state; no I/O until data is flushed.
    pub fn make_upload_sink(&self, key: &str) -> UploadSink {
        self.make_upload_sink_with(key, self.inner.multipart.clone())
    }

    pub fn make_upload_sink_with(&self, key: &str, config: MultipartConfig) -> UploadSink {
        UploadSink::new(self.clone(), key.to_string(), config)
    }

    // =========================================================================
    // Request execution
    // =========================================================================

    fn sign(&self, request: &ObjectRequest, url: &str) -> BTreeMap<String, String> {
        let Some(signer) = &self.inner.signer else {
            return request.headers.clone();
        };

        let now = Utc::now();
        let method = request.method.as_str();
        let headers = request.headers.clone();

        if request.payload.is_empty() {
            signer.sign_with_hash(method, url, headers, EMPTY_SHA256, now)
        } else if request.hash_payload || self.inner.settings.sign_payload {
            let hash = payload_sha256(request.payload.chunks());
            signer.sign_with_hash(method, url, headers, &hash, now)
        } else {
            signer.sign_unsigned_payload(method, url, headers, now)
        }
    }

    /// Sign and send a single attempt; non-success statuses become errors.
    async fn execute_once(&self, request: &ObjectRequest) -> Result<RawResponse> {
        let url = request.url(&self.inner.endpoint);
        let headers = self.sign(request, &url);

        let mut builder = Request::builder().method(request.method.clone()).uri(&url);
        for (name, value) in headers.iter() {
            builder = builder.header(name, value);
        }
        let http_request = builder.body(request.payload.to_body())?;

        debug!(method = %request.method, key = %request.key, "s3 request");
        let response = self.inner.transport.send(http_request).await?;

        if !response.status.is_success() {
            debug!(
                method = %request.method,
                key = %request.key,
                status = %response.status,
                "s3 request failed"
            );
            return Err(S3Error::from_response(
                response.status,
                &request.key,
                &response.body,
            ));
        }

        Ok(response)
    }

    /// Send with automatic retry of transient failures.
    async fn execute(&self, request: &ObjectRequest) -> Result<RawResponse> {
        let what = format!("{} {}", request.method, request.key);
        with_retry(&what, self.inner.settings.max_retries, RETRY_BASE_DELAY, move || {
            self.execute_once(request)
        })
        .await
    }

    // =========================================================================
    // Object operations
    // =========================================================================

    /// Total size of `key` in bytes (HEAD request).
    pub async fn get_object_size(&self, key: &str) -> Result<u64> {
        let _permit = self.enter().await?;
        let response = self.execute(&ObjectRequest::head(key)).await?;
        content_length(&response.headers).ok_or_else(|| {
            S3Error::InvalidResponse(format!("HEAD {} returned no Content-Length", key))
        })
    }

    /// Whole object, or exactly `range` of it.
    ///
    /// The result always has the requested length; a short body is
    /// `TruncatedResponse` and a range past the end of the object is
    /// `RangeError`.
    pub async fn get_object_contiguous(&self, key: &str, range: Option<Range>) -> Result<Bytes> {
        let _permit = self.enter().await?;
        match range {
            None => self.fetch_whole(key).await,
            Some(range) => self.fetch_range(key, range).await,
        }
    }

    /// Ranged GET for a caller that already knows the object size, so an
    /// out-of-bounds range fails before any request is sent.
    pub(crate) async fn get_range_within(
        &self,
        key: &str,
        range: Range,
        object_size: u64,
    ) -> Result<Bytes> {
        range.validate(object_size)?;
        let _permit = self.enter().await?;
        self.fetch_range(key, range).await
    }

    async fn fetch_whole(&self, key: &str) -> Result<Bytes> {
        let response = self.execute(&ObjectRequest::get(key)).await?;
        if let Some(expected) = content_length(&response.headers) {
            check_length(expected, &response.body)?;
        }
        Ok(response.body)
    }

    async fn fetch_range(&self, key: &str, range: Range) -> Result<Bytes> {
        let end = range.end()?;
        if range.length == 0 {
            return Ok(Bytes::new());
        }

        let request = ObjectRequest::get(key).with_range(&range);
        let response = self.execute(&request).await?;

        if response.status == StatusCode::PARTIAL_CONTENT {
            if let Some(total) = content_range_total(&response.headers) {
                if end > total {
                    return Err(S3Error::Range(format!(
                        "range {}-{} exceeds object size {}",
                        range.offset, end, total
                    )));
                }
            }
            check_length(range.length, &response.body)?;
            return Ok(response.body);
        }

        // 200: the server ignored Range and sent the whole object
        if let Some(expected) = content_length(&response.headers) {
            check_length(expected, &response.body)?;
        }
        let size = response.body.len() as u64;
        if end > size {
            return Err(S3Error::Range(format!(
                "range {}-{} exceeds object size {}",
                range.offset, end, size
            )));
        }
        Ok(response.body.slice(range.offset as usize..end as usize))
    }

    /// Single PUT of one buffer.
    pub async fn put_object(&self, key: &str, data: Bytes) -> Result<()> {
        self.put_object_with_headers(key, Payload::Single(data), &BTreeMap::new())
            .await
    }

    /// Single PUT whose body is the ordered concatenation of `buffers`.
    ///
    /// The buffers are streamed one after another; they are never copied
    /// into one contiguous region.
    pub async fn put_object_buffers<I>(&self, key: &str, buffers: I) -> Result<()>
    where
        I: IntoIterator<Item = Bytes>,
    {
        let payload: Payload = buffers.into_iter().collect();
        self.put_object_with_headers(key, payload, &BTreeMap::new())
            .await
    }

    /// Single PUT with extra headers (`content-type`, `x-amz-meta-*`, ...)
    /// passed through unmodified and covered by the signature.
    pub async fn put_object_with_headers(
        &self,
        key: &str,
        payload: impl Into<Payload>,
        headers: &BTreeMap<String, String>,
    ) -> Result<()> {
        let _permit = self.enter().await?;
        let payload = payload.into();
        let size = payload.len();

        let request = ObjectRequest::new(Method::PUT, key)
            .with_headers(headers)
            .with_payload(payload);
        self.execute(&request).await?;

        debug!(key = %key, size, "put object");
        Ok(())
    }

    /// DELETE `key`. Deleting an object that does not exist succeeds.
    pub async fn delete_object(&self, key: &str) -> Result<()> {
        let _permit = self.enter().await?;
        match self.execute(&ObjectRequest::delete(key)).await {
            Ok(_) => Ok(()),
            Err(S3Error::NotFound { .. }) => {
                debug!(key = %key, "delete of absent object");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Multipart Upload Operations
    // =========================================================================

    /// Initiate a multipart upload (CreateMultipartUpload)
    pub async fn create_multipart_upload(&self, key: &str) -> Result<CreateMultipartUploadResponse> {
        let _permit = self.enter().await?;

        let request = ObjectRequest::new(Method::POST, key)
            .with_query("uploads")
            .with_header("content-type", "application/octet-stream")
            .with_payload(Payload::Empty);
        let response = self.execute(&request).await?;

        let created = parse_create_multipart_response(key, &response.body)?;
        self.inner
            .open_uploads()
            .insert(created.upload_id.clone(), key.to_string());
        Ok(created)
    }

    /// Upload one part (UploadPart), single attempt.
    ///
    /// Part numbers are 1-indexed. Retries are left to the caller so a sink
    /// can apply its own per-part policy.
    pub async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<CompletedPart> {
        let _permit = self.enter().await?;

        let mut query = String::with_capacity(upload_id.len() + 32);
        query.push_str("partNumber=");
        let _ = write!(query, "{}", part_number);
        query.push_str("&uploadId=");
        url_encode_into(&mut query, upload_id);

        let request = ObjectRequest::new(Method::PUT, key)
            .with_query(query)
            .with_payload(Payload::Single(data));
        let response = self.execute_once(&request).await?;

        let etag = response
            .headers
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim_matches('"').to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                S3Error::InvalidResponse(format!("part {} of {} returned no ETag", part_number, key))
            })?;

        Ok(CompletedPart::new(part_number, etag))
    }

    /// Complete a multipart upload (CompleteMultipartUpload)
    ///
    /// Parts must be sorted by part number.
    pub async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<CompleteMultipartUploadResponse> {
        let _permit = self.enter().await?;

        let mut query = String::with_capacity(upload_id.len() + 16);
        query.push_str("uploadId=");
        url_encode_into(&mut query, upload_id);

        let mut xml = String::with_capacity(parts.len() * 100 + 100);
        xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
        xml.push_str("<CompleteMultipartUpload>");
        for part in parts {
            xml.push_str("<Part><PartNumber>");
            let _ = write!(xml, "{}", part.part_number);
            xml.push_str("</PartNumber><ETag>\"");
            xml.push_str(part.etag.trim_matches('"'));
            xml.push_str("\"</ETag></Part>");
        }
        xml.push_str("</CompleteMultipartUpload>");

        let request = ObjectRequest::new(Method::POST, key)
            .with_query(query)
            .with_header("content-type", "application/xml")
            .with_payload(Payload::Single(Bytes::from(xml)))
            .with_hashed_payload();

        // A 200 can still carry an <Error> document, so parse inside the retry
        let what = format!("complete {}", key);
        let request = &request;
        let completed = with_retry(
            &what,
            self.inner.settings.max_retries,
            RETRY_BASE_DELAY,
            move || async move {
                let response = self.execute_once(request).await?;
                parse_complete_multipart_response(key, &response.body)
            },
        )
        .await?;

        self.inner.open_uploads().remove(upload_id);
        Ok(completed)
    }

    /// Abort a multipart upload (AbortMultipartUpload)
    ///
    /// Deletes all uploaded parts. An upload the server no longer knows is
    /// treated as already aborted.
    pub async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        let _permit = self.enter().await?;

        match self.execute(&abort_request(key, upload_id)).await {
            Ok(_) | Err(S3Error::NotFound { .. }) => {
                self.inner.open_uploads().remove(upload_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn abort_request(key: &str, upload_id: &str) -> ObjectRequest {
    let mut query = String::with_capacity(upload_id.len() + 16);
    query.push_str("uploadId=");
    url_encode_into(&mut query, upload_id);
    ObjectRequest::delete(key).with_query(query)
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Total object size from `Content-Range: bytes first-last/total`
fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}

fn check_length(expected: u64, body: &Bytes) -> Result<()> {
    let actual = body.len() as u64;
    if actual < expected {
        return Err(S3Error::TruncatedResponse { expected, actual });
    }
    if actual > expected {
        return Err(S3Error::InvalidResponse(format!(
            "expected {} bytes, server sent {}",
            expected, actual
        )));
    }
    Ok(())
}

/// S3 reports some failures as a 200 response carrying an `<Error>` document.
fn embedded_error(code: String, message: String) -> S3Error {
    let detail = format!("{}: {}", code, message);
    match code.as_str() {
        "InternalError" | "SlowDown" | "ServiceUnavailable" => S3Error::Transport(detail),
        _ => S3Error::Status {
            status: StatusCode::OK,
            message: detail,
        },
    }
}

/// Parse CreateMultipartUpload XML response
fn parse_create_multipart_response(
    key: &str,
    xml_data: &[u8],
) -> Result<CreateMultipartUploadResponse> {
    let mut reader = Reader::from_reader(xml_data);
    reader.config_mut().trim_text_start = true;
    reader.config_mut().trim_text_end = true;

    let mut upload_id = String::new();
    let mut current_text = String::with_capacity(256);

    loop {
        match reader.read_event() {
            Ok(Event::Text(e)) => {
                current_text.clear();
                current_text.push_str(&e.unescape()?);
            }
            Ok(Event::End(e)) => {
                if e.local_name().as_ref() == b"UploadId" {
                    upload_id = std::mem::take(&mut current_text);
                }
                current_text.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(S3Error::InvalidResponse(format!("XML parse error: {}", e))),
            _ => {}
        }
    }

    if upload_id.is_empty() {
        return Err(S3Error::InvalidResponse(
            "Missing UploadId in response".to_string(),
        ));
    }

    Ok(CreateMultipartUploadResponse::new(key.to_string(), upload_id))
}

/// Parse CompleteMultipartUpload XML response
fn parse_complete_multipart_response(
    key: &str,
    xml_data: &[u8],
) -> Result<CompleteMultipartUploadResponse> {
    let mut reader = Reader::from_reader(xml_data);
    reader.config_mut().trim_text_start = true;
    reader.config_mut().trim_text_end = true;

    let mut location = None;
    let mut etag = String::new();
    let mut error_code = None;
    let mut error_message = String::new();
    let mut in_error = false;
    let mut current_text = String::with_capacity(256);

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if e.local_name().as_ref() == b"Error" {
                    in_error = true;
                }
            }
            Ok(Event::Text(e)) => {
                current_text.clear();
                current_text.push_str(&e.unescape()?);
            }
            Ok(Event::End(e)) => {
                match e.local_name().as_ref() {
                    b"Location" => location = Some(std::mem::take(&mut current_text)),
                    b"ETag" => etag = current_text.trim_matches('"').to_string(),
                    b"Code" if in_error => error_code = Some(std::mem::take(&mut current_text)),
                    b"Message" if in_error => error_message = std::mem::take(&mut current_text),
                    _ => {}
                }
                current_text.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(S3Error::InvalidResponse(format!("XML parse error: {}", e))),
            _ => {}
        }
    }

    if let Some(code) = error_code {
        return Err(embedded_error(code, error_message));
    }

    let mut response = CompleteMultipartUploadResponse::new(key.to_string(), etag);
    response.location = location;
    Ok(response)
}
