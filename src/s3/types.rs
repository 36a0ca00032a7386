//! S3 types and response structures

use crate::s3::error::{Result, S3Error};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// S3 minimum size for every part except the last (5 MiB)
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// S3 maximum size of a single part (5 GiB)
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// S3 maximum part number
pub const MAX_PART_NUMBER: u32 = 10_000;

/// Byte range of an object: `length` bytes starting at `offset`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub offset: u64,
    pub length: u64,
}

impl Range {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Exclusive end offset, or a range error if it overflows.
    pub fn end(&self) -> Result<u64> {
        self.offset
            .checked_add(self.length)
            .ok_or_else(|| S3Error::Range(format!("range {}+{} overflows", self.offset, self.length)))
    }

    /// Check the range lies entirely within an object of `size` bytes.
    pub fn validate(&self, size: u64) -> Result<()> {
        let end = self.end()?;
        if end > size {
            return Err(S3Error::Range(format!(
                "range {}-{} exceeds object size {}",
                self.offset, end, size
            )));
        }
        Ok(())
    }

    /// `Range` header value (`bytes=first-last`, inclusive). None for empty ranges.
    pub fn header_value(&self) -> Option<String> {
        if self.length == 0 {
            return None;
        }
        Some(format!(
            "bytes={}-{}",
            self.offset,
            self.offset + (self.length - 1)
        ))
    }
}

/// Response from CreateMultipartUpload operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMultipartUploadResponse {
    /// Object key
    pub key: String,
    /// Upload ID for subsequent UploadPart and CompleteMultipartUpload requests
    pub upload_id: String,
}

impl CreateMultipartUploadResponse {
    pub fn new(key: String, upload_id: String) -> Self {
        Self { key, upload_id }
    }
}

/// Part information for CompleteMultipartUpload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    /// Part number (1-10000)
    pub part_number: u32,
    /// ETag returned from UploadPart
    pub etag: String,
}

impl CompletedPart {
    pub fn new(part_number: u32, etag: String) -> Self {
        Self { part_number, etag }
    }
}

/// Response from CompleteMultipartUpload operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteMultipartUploadResponse {
    /// Location URL of the completed object
    pub location: Option<String>,
    /// Object key
    pub key: String,
    /// ETag of the completed object
    pub etag: String,
}

impl CompleteMultipartUploadResponse {
    pub fn new(key: String, etag: String) -> Self {
        Self {
            location: None,
            key,
            etag,
        }
    }
}

/// Configuration for multipart uploads driven by an upload sink
#[derive(Debug, Clone)]
pub struct MultipartConfig {
    /// Part size in bytes; also the threshold above which a sink goes multipart
    pub part_size: usize,
    /// Maximum concurrent part uploads per sink
    pub concurrency: usize,
    /// Attempts per part after the first one
    pub max_part_retries: u32,
    /// Base delay for exponential backoff between part attempts
    pub retry_base_delay: Duration,
}

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            part_size: MIN_PART_SIZE,
            concurrency: 10,
            max_part_retries: 3,
            retry_base_delay: Duration::from_millis(100),
        }
    }
}

impl MultipartConfig {
    /// Set the part size, clamped to the S3 part size limits
    pub fn with_part_size(mut self, size: usize) -> Self {
        let max = usize::try_from(MAX_PART_SIZE).unwrap_or(usize::MAX);
        self.part_size = size.clamp(MIN_PART_SIZE, max);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Apply the part size and concurrency limits to a config built from
    /// its public fields.
    pub fn normalized(self) -> Self {
        let (part_size, concurrency) = (self.part_size, self.concurrency);
        self.with_part_size(part_size).with_concurrency(concurrency)
    }

    pub fn with_max_part_retries(mut self, retries: u32) -> Self {
        self.max_part_retries = retries;
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }
}
