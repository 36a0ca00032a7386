//! HTTP transport shared by every operation of a client
//!
//! - HTTP/1.1 hyper client with a reusable idle connection pool
//! - TCP_NODELAY and keepalive on the connector
//! - native-tls (OpenSSL) for https endpoints
//! - at most `max_connections` requests in flight; the rest queue

use crate::config::ClientSettings;
use crate::s3::error::{Result, S3Error};
use crate::s3::request::RequestBody;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::header::HeaderMap;
use hyper::{Request, StatusCode};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use native_tls::TlsConnector;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Fully collected response
#[derive(Debug)]
pub(crate) struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub(crate) struct Transport {
    client: HyperClient<HttpsConnector<HttpConnector>, RequestBody>,
    /// One permit per request in flight
    slots: Semaphore,
    timeout: Duration,
}

impl Transport {
    pub fn new(settings: &ClientSettings) -> Result<Self> {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.enforce_http(false);
        http.set_connect_timeout(Some(Duration::from_secs(10)));
        http.set_keepalive(Some(Duration::from_secs(90)));

        let tls = if settings.insecure_tls {
            tracing::warn!("INSECURE TLS MODE ENABLED: Certificate verification is disabled!");
            TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
        } else {
            TlsConnector::new()
        };
        let tls = tls
            .map_err(|e| S3Error::InvalidConfig(format!("Failed to build TLS connector: {}", e)))?;

        let https = HttpsConnector::from((http, tls.into()));

        let client = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(settings.max_connections.max(1))
            .retry_canceled_requests(true)
            .set_host(true)
            .build(https);

        Ok(Self {
            client,
            slots: Semaphore::new(settings.max_connections.max(1)),
            timeout: settings.request_timeout(),
        })
    }

    /// Send one request and collect the whole response body.
    ///
    /// Waits for a free slot first; the timeout covers the exchange itself.
    pub async fn send(&self, request: Request<RequestBody>) -> Result<RawResponse> {
        let _slot = self.slots.acquire().await.map_err(|_| S3Error::ClientClosed)?;

        let exchange = async {
            let response = self.client.request(request).await?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.into_body().collect().await?.to_bytes();
            Ok::<_, S3Error>(RawResponse {
                status,
                headers,
                body,
            })
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(S3Error::Transport(format!(
                "request timed out after {}s",
                self.timeout.as_secs()
            ))),
        }
    }

    /// Refuse further requests; queued ones fail with `ClientClosed`.
    pub fn close(&self) {
        self.slots.close();
    }
}
