//! Streaming upload adapter
//!
//! Small objects go out as one PUT at finalize time. Once a full part is
//! buffered the sink switches to a multipart upload and streams parts
//! concurrently while the caller keeps writing.

use crate::s3::client::S3Client;
use crate::s3::error::{Result, S3Error};
use crate::s3::retry::with_retry;
use crate::s3::types::{CompletedPart, MultipartConfig, MAX_PART_NUMBER};
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Lifecycle of an [`UploadSink`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    /// Accepting writes
    Open,
    /// finalize() in progress
    Finalizing,
    /// Object is visible on the server
    Completed,
    /// Upload failed or was cancelled; nothing was committed
    Aborted,
}

impl fmt::Display for SinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SinkState::Open => "open",
            SinkState::Finalizing => "finalizing",
            SinkState::Completed => "completed",
            SinkState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Write-only sink that commits an object on [`UploadSink::finalize`].
///
/// Nothing becomes visible under the key until finalize succeeds. A sink
/// dropped with a multipart upload still open aborts it in the background.
pub struct UploadSink {
    client: S3Client,
    key: String,
    config: MultipartConfig,
    buffer: BytesMut,
    state: SinkState,
    upload_id: Option<String>,
    next_part_number: u32,
    in_flight: JoinSet<Result<CompletedPart>>,
    completed: Vec<CompletedPart>,
    bytes_written: u64,
}

impl fmt::Debug for UploadSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadSink")
            .field("key", &self.key)
            .field("state", &self.state)
            .field("upload_id", &self.upload_id)
            .field("bytes_written", &self.bytes_written)
            .field("parts_in_flight", &self.in_flight.len())
            .finish()
    }
}

impl UploadSink {
    pub(crate) fn new(client: S3Client, key: String, config: MultipartConfig) -> Self {
        let config = config.normalized();
        Self {
            client,
            key,
            buffer: BytesMut::with_capacity(config.part_size),
            config,
            state: SinkState::Open,
            upload_id: None,
            next_part_number: 1,
            in_flight: JoinSet::new(),
            completed: Vec::new(),
            bytes_written: 0,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> SinkState {
        self.state
    }

    /// Server-side upload id once the sink has gone multipart
    pub fn upload_id(&self) -> Option<&str> {
        self.upload_id.as_deref()
    }

    /// Bytes accepted so far
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state != SinkState::Open {
            return Err(S3Error::SinkClosed);
        }
        if self.client.is_closed() {
            return Err(S3Error::ClientClosed);
        }
        Ok(())
    }

    /// Append `data`. May upload full parts and wait for a free part slot.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.buffer.extend_from_slice(data);
        self.bytes_written += data.len() as u64;
        self.flush_full_parts().await
    }

    /// Append an owned buffer; whole parts are sliced off without copying
    /// when nothing is buffered yet.
    pub async fn write_bytes(&mut self, mut data: Bytes) -> Result<()> {
        self.ensure_open()?;
        self.bytes_written += data.len() as u64;

        while self.buffer.is_empty() && data.len() >= self.config.part_size {
            let part = data.split_to(self.config.part_size);
            self.send_part(part).await?;
        }

        self.buffer.extend_from_slice(&data);
        self.flush_full_parts().await
    }

    async fn flush_full_parts(&mut self) -> Result<()> {
        while self.buffer.len() >= self.config.part_size {
            let part = self.buffer.split_to(self.config.part_size).freeze();
            self.send_part(part).await?;
        }
        Ok(())
    }

    /// Dispatch one part; any failure aborts the whole upload.
    async fn send_part(&mut self, data: Bytes) -> Result<()> {
        match self.dispatch_part(data).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn dispatch_part(&mut self, data: Bytes) -> Result<()> {
        let upload_id = match &self.upload_id {
            Some(id) => id.clone(),
            None => {
                let created = self.client.create_multipart_upload(&self.key).await?;
                info!(key = %self.key, upload_id = %created.upload_id, "multipart upload started");
                self.upload_id = Some(created.upload_id.clone());
                created.upload_id
            }
        };

        if self.next_part_number > MAX_PART_NUMBER {
            return Err(S3Error::Upload {
                key: self.key.clone(),
                reason: format!(
                    "object needs more than {} parts of {} bytes",
                    MAX_PART_NUMBER, self.config.part_size
                ),
            });
        }

        // Backpressure: wait for a slot before starting another part
        while self.in_flight.len() >= self.config.concurrency {
            self.reap_one().await?;
        }

        let part_number = self.next_part_number;
        self.next_part_number += 1;
        debug!(key = %self.key, part_number, size = data.len(), "uploading part");

        self.in_flight.spawn(upload_part_with_retry(
            self.client.clone(),
            self.key.clone(),
            upload_id,
            part_number,
            data,
            self.config.max_part_retries,
            self.config.retry_base_delay,
        ));
        Ok(())
    }

    /// Wait for the next part task to finish and record its result.
    async fn reap_one(&mut self) -> Result<()> {
        match self.in_flight.join_next().await {
            Some(Ok(Ok(part))) => {
                self.completed.push(part);
                Ok(())
            }
            Some(Ok(Err(e))) => Err(e),
            Some(Err(e)) => Err(S3Error::Upload {
                key: self.key.clone(),
                reason: format!("part task failed: {}", e),
            }),
            None => Ok(()),
        }
    }

    /// Commit the object.
    ///
    /// Finalizing a completed sink is a no-op; finalizing an aborted one
    /// fails with `SinkClosed`.
    pub async fn finalize(&mut self) -> Result<()> {
        match self.state {
            SinkState::Completed => return Ok(()),
            SinkState::Finalizing | SinkState::Aborted => return Err(S3Error::SinkClosed),
            SinkState::Open => {}
        }
        if self.client.is_closed() {
            return Err(self.fail(S3Error::ClientClosed).await);
        }
        self.state = SinkState::Finalizing;

        if self.upload_id.is_none() {
            return self.put_single().await;
        }

        match self.complete_multipart().await {
            Ok(()) => {
                self.state = SinkState::Completed;
                info!(
                    key = %self.key,
                    parts = self.completed.len(),
                    bytes = self.bytes_written,
                    "multipart upload completed"
                );
                Ok(())
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn put_single(&mut self) -> Result<()> {
        let data = self.buffer.split().freeze();
        match self.client.put_object(&self.key, data).await {
            Ok(()) => {
                self.state = SinkState::Completed;
                debug!(key = %self.key, bytes = self.bytes_written, "single-part upload completed");
                Ok(())
            }
            Err(e) => {
                self.state = SinkState::Aborted;
                warn!(key = %self.key, error = %e, "upload failed");
                Err(e.into_upload(&self.key))
            }
        }
    }

    async fn complete_multipart(&mut self) -> Result<()> {
        let remaining = self.buffer.split().freeze();
        if !remaining.is_empty() {
            self.dispatch_part(remaining).await?;
        }

        while !self.in_flight.is_empty() {
            self.reap_one().await?;
        }

        let upload_id = self.upload_id.clone().ok_or_else(|| S3Error::Upload {
            key: self.key.clone(),
            reason: "no multipart upload in progress".to_string(),
        })?;

        self.completed.sort_by_key(|p| p.part_number);
        self.client
            .complete_multipart_upload(&self.key, &upload_id, &self.completed)
            .await?;
        Ok(())
    }

    /// Tear down after a failure: cancel parts, abort server-side, go `Aborted`.
    async fn fail(&mut self, err: S3Error) -> S3Error {
        self.cancel_parts().await;

        // A closed client has already aborted its open uploads
        if let Some(upload_id) = self.upload_id.as_ref().filter(|_| !self.client.is_closed()) {
            if let Err(abort_err) = self.client.abort_multipart_upload(&self.key, upload_id).await {
                warn!(key = %self.key, upload_id = %upload_id, error = %abort_err, "abort after failure failed");
            }
        }

        self.state = SinkState::Aborted;
        self.buffer.clear();
        self.completed.clear();
        warn!(key = %self.key, error = %err, "upload aborted");
        err.into_upload(&self.key)
    }

    async fn cancel_parts(&mut self) {
        self.in_flight.abort_all();
        while self.in_flight.join_next().await.is_some() {}
    }

    /// Cancel the upload. Nothing is committed under the key.
    ///
    /// A no-op on a sink that already completed or aborted.
    pub async fn abort(&mut self) -> Result<()> {
        if matches!(self.state, SinkState::Completed | SinkState::Aborted) {
            return Ok(());
        }

        self.cancel_parts().await;
        self.state = SinkState::Aborted;
        self.buffer.clear();
        self.completed.clear();

        if let Some(upload_id) = self.upload_id.as_ref().filter(|_| !self.client.is_closed()) {
            self.client.abort_multipart_upload(&self.key, upload_id).await?;
            info!(key = %self.key, upload_id = %upload_id, "multipart upload aborted");
        }
        Ok(())
    }
}

impl Drop for UploadSink {
    fn drop(&mut self) {
        if !matches!(self.state, SinkState::Open | SinkState::Finalizing) {
            return;
        }
        let Some(upload_id) = self.upload_id.take() else {
            return;
        };

        self.in_flight.abort_all();
        if self.client.is_closed() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let client = self.client.clone();
                let key = std::mem::take(&mut self.key);
                handle.spawn(async move {
                    match client.abort_multipart_upload(&key, &upload_id).await {
                        Ok(()) => debug!(key = %key, "abandoned multipart upload aborted"),
                        Err(e) => warn!(key = %key, upload_id = %upload_id, error = %e, "failed to abort abandoned upload"),
                    }
                });
            }
            Err(_) => {
                warn!(key = %self.key, upload_id = %upload_id, "sink dropped outside a runtime; multipart upload left open");
            }
        }
    }
}

/// One part, retried on transient errors with exponential backoff.
async fn upload_part_with_retry(
    client: S3Client,
    key: String,
    upload_id: String,
    part_number: u32,
    data: Bytes,
    max_retries: u32,
    base_delay: Duration,
) -> Result<CompletedPart> {
    let what = format!("part {} of {}", part_number, key);
    let (client, key, upload_id, data) = (&client, key.as_str(), upload_id.as_str(), &data);
    with_retry(&what, max_retries, base_delay, move || {
        client.upload_part(key, upload_id, part_number, data.clone())
    })
    .await
}
