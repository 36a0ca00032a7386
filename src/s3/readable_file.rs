//! Random-access read adapter over a single object

use crate::s3::client::S3Client;
use crate::s3::error::{Result, S3Error};
use crate::s3::types::Range;
use bytes::Bytes;
use tokio::sync::OnceCell;
use tracing::debug;

/// Read-only, random-access view of one object.
///
/// Every read is an independent ranged GET; there is no cursor, so a single
/// handle can serve any number of concurrent reads.
#[derive(Debug)]
pub struct ReadableFile {
    client: S3Client,
    key: String,
    size: OnceCell<u64>,
}

impl ReadableFile {
    pub(crate) fn new(client: S3Client, key: String) -> Self {
        Self {
            client,
            key,
            size: OnceCell::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Object size; the first call issues a HEAD and the result is cached.
    pub async fn size(&self) -> Result<u64> {
        self.size
            .get_or_try_init(|| self.client.get_object_size(&self.key))
            .await
            .copied()
    }

    /// Size if it has already been fetched
    pub fn cached_size(&self) -> Option<u64> {
        self.size.get().copied()
    }

    /// Read up to `length` bytes at `offset`.
    ///
    /// The result is short only at end of file; reading at or past the end
    /// returns an empty buffer.
    pub async fn read(&self, offset: u64, length: u64) -> Result<Bytes> {
        if self.client.is_closed() {
            return Err(S3Error::ClientClosed);
        }

        let size = self.size().await?;
        if offset >= size || length == 0 {
            return Ok(Bytes::new());
        }

        let length = length.min(size - offset);
        let range = Range::new(offset, length);
        debug!(key = %self.key, offset, length, "ranged read");

        self.client.get_range_within(&self.key, range, size).await
    }

    /// Release the handle. Nothing is sent to the server.
    pub fn close(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_after_client_close() {
        let client = S3Client::new("127.0.0.1:9", None).unwrap();
        let file = client.make_readable_file("bucket/object");
        assert_eq!(file.key(), "bucket/object");
        assert_eq!(file.cached_size(), None);

        client.close().await;
        assert!(matches!(file.read(0, 10).await, Err(S3Error::ClientClosed)));
        assert!(matches!(file.size().await, Err(S3Error::ClientClosed)));
        file.close();
    }
}
