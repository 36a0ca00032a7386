//! In-memory S3 stand-in for integration tests
//!
//! Serves path-style object requests over plain HTTP/1.1 on 127.0.0.1 and
//! implements enough of the protocol for the client: HEAD, ranged GET, PUT,
//! DELETE and the multipart upload calls. Failures can be injected.

#![allow(dead_code)]

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// One request as seen by the server
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub path: String,
    pub query: String,
    pub authorization: Option<String>,
    pub content_sha256: Option<String>,
}

struct PendingUpload {
    key: String,
    parts: BTreeMap<u32, Bytes>,
}

#[derive(Default)]
struct State {
    objects: Mutex<HashMap<String, Bytes>>,
    uploads: Mutex<HashMap<String, PendingUpload>>,
    next_upload_id: AtomicU64,
    requests: Mutex<Vec<Recorded>>,
    /// Access key every request must be signed with, if any
    required_access_key: Mutex<Option<String>>,
    /// Part uploads left to fail with 500
    failing_parts: AtomicU32,
    /// Requests left to reject with 503 SlowDown
    throttled_requests: AtomicU32,
    /// Answer ranged GETs with the whole object
    ignore_range: AtomicBool,
    /// Drop the last byte of ranged GET bodies
    truncate_ranges: AtomicBool,
    /// Completes left to answer with 200 and an embedded InternalError
    erroring_completes: AtomicU32,
    /// Hold every response this long after the request is recorded
    delay_ms: AtomicU64,
    aborted_uploads: AtomicU32,
}

pub struct FakeS3 {
    addr: SocketAddr,
    state: Arc<State>,
    server: JoinHandle<()>,
}

impl Drop for FakeS3 {
    fn drop(&mut self) {
        self.server.abort();
    }
}

impl FakeS3 {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(State::default());

        let server_state = Arc::clone(&state);
        let server = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => continue,
                };
                let state = Arc::clone(&server_state);

                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { Ok::<_, Infallible>(handle(&state, req).await) }
                    });
                    let _ = http1::Builder::new()
                        .keep_alive(true)
                        .serve_connection(io, service)
                        .await;
                });
            }
        });

        Self {
            addr,
            state,
            server,
        }
    }

    /// Same server, but unsigned requests (or a different key) get 403.
    pub async fn start_with_auth(access_key: &str) -> Self {
        let server = Self::start().await;
        *server.state.required_access_key.lock().unwrap() = Some(access_key.to_string());
        server
    }

    /// `host:port` endpoint for the client
    pub fn endpoint(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }

    pub fn insert(&self, key: &str, data: impl Into<Bytes>) {
        self.state
            .objects
            .lock()
            .unwrap()
            .insert(key.to_string(), data.into());
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.state.objects.lock().unwrap().get(key).cloned()
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn count(&self, method: Method, query_contains: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.method == method && r.query.contains(query_contains))
            .count()
    }

    pub fn pending_uploads(&self) -> usize {
        self.state.uploads.lock().unwrap().len()
    }

    pub fn aborted_uploads(&self) -> u32 {
        self.state.aborted_uploads.load(Ordering::SeqCst)
    }

    pub fn fail_next_parts(&self, n: u32) {
        self.state.failing_parts.store(n, Ordering::SeqCst);
    }

    pub fn throttle_next_requests(&self, n: u32) {
        self.state.throttled_requests.store(n, Ordering::SeqCst);
    }

    pub fn set_ignore_range(&self, on: bool) {
        self.state.ignore_range.store(on, Ordering::SeqCst);
    }

    pub fn set_truncate_ranges(&self, on: bool) {
        self.state.truncate_ranges.store(on, Ordering::SeqCst);
    }

    pub fn embed_error_in_next_completes(&self, n: u32) {
        self.state.erroring_completes.store(n, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

/// Decrement `counter` if it is positive; true when a unit was taken.
fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn etag_of(data: &[u8]) -> String {
    format!("\"{}\"", hex::encode(&Sha256::digest(data)[..16]))
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response<Full<Bytes>> {
    let body = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Error><Code>{}</Code><Message>{}</Message></Error>",
        code, message
    );
    Response::builder()
        .status(status)
        .header("content-type", "application/xml")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

fn empty(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (
                k.to_string(),
                urlencoding::decode(v).unwrap().into_owned(),
            ),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

/// `bytes=first-last` into an inclusive pair
fn parse_range(value: &str) -> Option<(u64, u64)> {
    let bounds = value.strip_prefix("bytes=")?;
    let (first, last) = bounds.split_once('-')?;
    Some((first.parse().ok()?, last.parse().ok()?))
}

fn part_numbers(xml: &str) -> Vec<u32> {
    xml.split("<PartNumber>")
        .skip(1)
        .filter_map(|s| s.split("</PartNumber>").next()?.parse().ok())
        .collect()
}

fn header(req: &Request<Incoming>, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn handle(state: &State, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    let authorization = header(&req, "authorization");
    let range = header(&req, "range");
    let content_sha256 = header(&req, "x-amz-content-sha256");

    state.requests.lock().unwrap().push(Recorded {
        method: method.clone(),
        path: path.clone(),
        query: query.clone(),
        authorization: authorization.clone(),
        content_sha256,
    });

    let body = req.into_body().collect().await.unwrap().to_bytes();

    let delay = state.delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    if let Some(access_key) = state.required_access_key.lock().unwrap().clone() {
        let expected = format!("AWS4-HMAC-SHA256 Credential={}/", access_key);
        if !authorization.as_deref().is_some_and(|a| a.starts_with(&expected)) {
            return error_response(StatusCode::FORBIDDEN, "AccessDenied", "Access Denied");
        }
    }

    if take_one(&state.throttled_requests) {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "SlowDown", "Please reduce your request rate.");
    }

    let key = urlencoding::decode(path.trim_start_matches('/'))
        .unwrap()
        .into_owned();
    let params = parse_query(&query);

    match method {
        Method::HEAD => match state.objects.lock().unwrap().get(&key) {
            // hyper skips the body for HEAD but keeps its length
            Some(data) => Response::new(Full::new(data.clone())),
            None => empty(StatusCode::NOT_FOUND),
        },

        Method::GET => {
            let Some(data) = state.objects.lock().unwrap().get(&key).cloned() else {
                return error_response(StatusCode::NOT_FOUND, "NoSuchKey", "The specified key does not exist.");
            };
            let size = data.len() as u64;

            let ranged = range
                .as_deref()
                .and_then(parse_range)
                .filter(|_| !state.ignore_range.load(Ordering::SeqCst));

            match ranged {
                None => Response::new(Full::new(data)),
                Some((first, _)) if first >= size => error_response(
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    "InvalidRange",
                    "The requested range is not satisfiable",
                ),
                Some((first, last)) => {
                    let last = last.min(size - 1);
                    let mut slice = data.slice(first as usize..=last as usize);
                    if state.truncate_ranges.load(Ordering::SeqCst) && !slice.is_empty() {
                        slice.truncate(slice.len() - 1);
                    }
                    Response::builder()
                        .status(StatusCode::PARTIAL_CONTENT)
                        .header("content-range", format!("bytes {}-{}/{}", first, last, size))
                        .body(Full::new(slice))
                        .unwrap()
                }
            }
        }

        Method::PUT => {
            if let (Some(part), Some(upload_id)) = (params.get("partNumber"), params.get("uploadId")) {
                if take_one(&state.failing_parts) {
                    return error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "InternalError",
                        "We encountered an internal error. Please try again.",
                    );
                }
                let part: u32 = part.parse().unwrap();
                let mut uploads = state.uploads.lock().unwrap();
                let Some(upload) = uploads.get_mut(upload_id) else {
                    return error_response(StatusCode::NOT_FOUND, "NoSuchUpload", "The specified upload does not exist.");
                };
                let etag = etag_of(&body);
                upload.parts.insert(part, body);
                return Response::builder()
                    .header("etag", etag)
                    .body(Full::new(Bytes::new()))
                    .unwrap();
            }

            let etag = etag_of(&body);
            state.objects.lock().unwrap().insert(key, body);
            Response::builder()
                .header("etag", etag)
                .body(Full::new(Bytes::new()))
                .unwrap()
        }

        Method::POST if params.contains_key("uploads") => {
            let id = format!("upload-{}", state.next_upload_id.fetch_add(1, Ordering::SeqCst));
            state.uploads.lock().unwrap().insert(
                id.clone(),
                PendingUpload {
                    key: key.clone(),
                    parts: BTreeMap::new(),
                },
            );
            let (bucket, object) = key.split_once('/').unwrap_or((&key, ""));
            let xml = format!(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                 <InitiateMultipartUploadResult xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
                 <Bucket>{}</Bucket><Key>{}</Key><UploadId>{}</UploadId>\
                 </InitiateMultipartUploadResult>",
                bucket, object, id
            );
            Response::new(Full::new(Bytes::from(xml)))
        }

        Method::POST if params.contains_key("uploadId") => {
            if take_one(&state.erroring_completes) {
                let xml = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                           <Error><Code>InternalError</Code><Message>We encountered an internal error.</Message></Error>";
                return Response::new(Full::new(Bytes::from(xml)));
            }
            let upload_id = &params["uploadId"];
            let Some(upload) = state.uploads.lock().unwrap().remove(upload_id) else {
                return error_response(StatusCode::NOT_FOUND, "NoSuchUpload", "The specified upload does not exist.");
            };

            let xml = String::from_utf8_lossy(&body);
            let numbers = part_numbers(&xml);
            if numbers.windows(2).any(|w| w[0] >= w[1]) {
                return error_response(StatusCode::BAD_REQUEST, "InvalidPartOrder", "Parts must be in ascending order.");
            }

            let mut assembled = Vec::new();
            for number in &numbers {
                match upload.parts.get(number) {
                    Some(part) => assembled.extend_from_slice(part),
                    None => return error_response(StatusCode::BAD_REQUEST, "InvalidPart", "Missing part."),
                }
            }

            let data = Bytes::from(assembled);
            let etag = etag_of(&data);
            state.objects.lock().unwrap().insert(upload.key.clone(), data);

            let xml = format!(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                 <CompleteMultipartUploadResult>\
                 <Location>http://127.0.0.1/{}</Location><Key>{}</Key><ETag>{}</ETag>\
                 </CompleteMultipartUploadResult>",
                upload.key,
                upload.key,
                etag.replace('"', "&quot;")
            );
            Response::new(Full::new(Bytes::from(xml)))
        }

        Method::DELETE if params.contains_key("uploadId") => {
            match state.uploads.lock().unwrap().remove(&params["uploadId"]) {
                Some(_) => {
                    state.aborted_uploads.fetch_add(1, Ordering::SeqCst);
                    empty(StatusCode::NO_CONTENT)
                }
                None => error_response(StatusCode::NOT_FOUND, "NoSuchUpload", "The specified upload does not exist."),
            }
        }

        Method::DELETE => match state.objects.lock().unwrap().remove(&key) {
            Some(_) => empty(StatusCode::NO_CONTENT),
            None => error_response(StatusCode::NOT_FOUND, "NoSuchKey", "The specified key does not exist."),
        },

        _ => error_response(StatusCode::METHOD_NOT_ALLOWED, "MethodNotAllowed", "Method not allowed"),
    }
}

/// Deterministic test data: byte `i` is `i mod 251`
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
