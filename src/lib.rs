//! s3link - async client for S3-compatible object storage
//!
//! A signed (or anonymous) object client with a random-access read adapter
//! and a streaming upload sink that switches to multipart uploads on its own.

pub mod cli;
pub mod config;
pub mod s3;

pub use config::Config;
pub use s3::{Credentials, ReadableFile, S3Client, S3Error, UploadSink};
