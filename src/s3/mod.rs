//! S3-compatible object client
//!
//! - AWS Signature Version 4 signing
//! - Object operations (size, ranged get, put, delete)
//! - Multipart uploads driven by a streaming upload sink
//! - Random-access reads through a readable file handle

pub mod client;
pub mod error;
pub mod readable_file;
pub mod request;
mod retry;
pub mod signer;
mod transport;
pub mod types;
pub mod upload_sink;

// Re-export main types for convenience
pub use client::S3Client;
pub use error::{Result, S3Error};
pub use readable_file::ReadableFile;
pub use request::{Endpoint, Payload, Scheme};
pub use signer::{Credentials, S3SignerV4};
pub use types::{
    CompleteMultipartUploadResponse, CompletedPart, CreateMultipartUploadResponse,
    MultipartConfig, Range, MAX_PART_NUMBER, MAX_PART_SIZE, MIN_PART_SIZE,
};
pub use upload_sink::{SinkState, UploadSink};
