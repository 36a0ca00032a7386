mod common;

use bytes::Bytes;
use common::{pattern, FakeS3};
use hyper::Method;
use s3link::s3::{Credentials, MultipartConfig, S3Client, S3Error, SinkState, MIN_PART_SIZE};
use std::time::Duration;

fn client_for(server: &FakeS3) -> S3Client {
    let credentials = Credentials::new("AKIDEXAMPLE".to_string(), "secret".to_string(), None);
    S3Client::new(&server.endpoint(), Some(credentials)).unwrap()
}

fn fast_parts() -> MultipartConfig {
    MultipartConfig::default()
        .with_max_part_retries(1)
        .with_retry_base_delay(Duration::from_millis(1))
}

#[tokio::test]
async fn test_small_upload_is_single_put() {
    let server = FakeS3::start().await;
    let client = client_for(&server);
    let data = pattern(10_000);

    let mut sink = client.make_upload_sink("bucket/small.bin");
    for chunk in data.chunks(333) {
        sink.write(chunk).await.unwrap();
    }
    assert!(server.requests().is_empty());

    sink.finalize().await.unwrap();
    assert_eq!(sink.state(), SinkState::Completed);
    assert_eq!(sink.upload_id(), None);
    assert_eq!(&server.object("bucket/small.bin").unwrap()[..], &data[..]);
    assert_eq!(server.count(Method::POST, "uploads"), 0);
}

#[tokio::test]
async fn test_empty_upload_creates_empty_object() {
    let server = FakeS3::start().await;
    let client = client_for(&server);

    let mut sink = client.make_upload_sink("bucket/empty");
    sink.finalize().await.unwrap();
    assert_eq!(server.object("bucket/empty").unwrap().len(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_large_upload_goes_multipart() {
    let server = FakeS3::start().await;
    let client = client_for(&server);
    let data = pattern(12 * 1024 * 1024);

    let mut sink = client.make_upload_sink("bucket/large.bin");
    for chunk in data.chunks(64 * 1024) {
        sink.write(chunk).await.unwrap();
    }
    assert!(sink.upload_id().is_some());

    sink.finalize().await.unwrap();
    assert_eq!(sink.state(), SinkState::Completed);
    assert_eq!(sink.bytes_written(), data.len() as u64);

    // 5 MiB + 5 MiB + 2 MiB
    assert_eq!(server.count(Method::PUT, "partNumber"), 3);
    assert_eq!(server.count(Method::POST, "uploadId"), 1);
    assert_eq!(server.pending_uploads(), 0);
    assert_eq!(&server.object("bucket/large.bin").unwrap()[..], &data[..]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_multipart_and_single_put_store_same_bytes() {
    let server = FakeS3::start().await;
    let client = client_for(&server);
    let data = Bytes::from(pattern(11 * 1024 * 1024 + 17));

    client.put_object("bucket/single", data.clone()).await.unwrap();

    let mut sink = client.make_upload_sink("bucket/multi");
    sink.write_bytes(data.clone()).await.unwrap();
    sink.finalize().await.unwrap();

    let mut sink = client.make_upload_sink("bucket/small-writes");
    for chunk in data.chunks(4099) {
        sink.write(chunk).await.unwrap();
    }
    sink.finalize().await.unwrap();

    let single = server.object("bucket/single").unwrap();
    assert_eq!(single, server.object("bucket/multi").unwrap());
    assert_eq!(single, server.object("bucket/small-writes").unwrap());
    assert_eq!(server.count(Method::PUT, "partNumber"), 6);
}

#[tokio::test]
async fn test_exact_part_size_upload() {
    let server = FakeS3::start().await;
    let client = client_for(&server);
    let data = pattern(MIN_PART_SIZE);

    let mut sink = client.make_upload_sink("bucket/exact");
    sink.write(&data).await.unwrap();
    sink.finalize().await.unwrap();

    assert_eq!(server.count(Method::PUT, "partNumber"), 1);
    assert_eq!(&server.object("bucket/exact").unwrap()[..], &data[..]);
}

#[tokio::test]
async fn test_transient_part_failures_are_retried() {
    let server = FakeS3::start().await;
    let client = client_for(&server);
    server.fail_next_parts(2);

    let config = MultipartConfig::default()
        .with_concurrency(1)
        .with_max_part_retries(3)
        .with_retry_base_delay(Duration::from_millis(1));
    let data = pattern(6 * 1024 * 1024);

    let mut sink = client.make_upload_sink_with("bucket/flaky", config);
    sink.write(&data).await.unwrap();
    sink.finalize().await.unwrap();

    assert_eq!(&server.object("bucket/flaky").unwrap()[..], &data[..]);
    assert_eq!(server.aborted_uploads(), 0);
}

#[tokio::test]
async fn test_persistent_part_failure_aborts_upload() {
    let server = FakeS3::start().await;
    let client = client_for(&server);
    server.fail_next_parts(100);

    let data = pattern(6 * 1024 * 1024);
    let mut sink = client.make_upload_sink_with("bucket/broken", fast_parts());

    let result = match sink.write(&data).await {
        Ok(()) => sink.finalize().await,
        Err(e) => Err(e),
    };

    assert!(matches!(result, Err(S3Error::Upload { .. })), "{:?}", result);
    assert_eq!(sink.state(), SinkState::Aborted);
    assert_eq!(server.aborted_uploads(), 1);
    assert_eq!(server.pending_uploads(), 0);
    assert!(server.object("bucket/broken").is_none());

    assert!(matches!(sink.write(b"x").await, Err(S3Error::SinkClosed)));
    assert!(matches!(sink.finalize().await, Err(S3Error::SinkClosed)));
}

#[tokio::test]
async fn test_explicit_abort_discards_upload() {
    let server = FakeS3::start().await;
    let client = client_for(&server);

    let mut sink = client.make_upload_sink("bucket/cancelled");
    sink.write(&pattern(6 * 1024 * 1024)).await.unwrap();
    assert!(sink.upload_id().is_some());

    sink.abort().await.unwrap();
    assert_eq!(sink.state(), SinkState::Aborted);
    assert_eq!(server.aborted_uploads(), 1);
    assert!(server.object("bucket/cancelled").is_none());

    // Aborting again is a no-op
    sink.abort().await.unwrap();
    assert_eq!(server.count(Method::DELETE, "uploadId"), 1);
}

#[tokio::test]
async fn test_dropped_sink_aborts_in_background() {
    let server = FakeS3::start().await;
    let client = client_for(&server);

    let mut sink = client.make_upload_sink("bucket/abandoned");
    sink.write(&pattern(6 * 1024 * 1024)).await.unwrap();
    drop(sink);

    for _ in 0..200 {
        if server.aborted_uploads() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.aborted_uploads(), 1);
    assert!(server.object("bucket/abandoned").is_none());
}

#[tokio::test]
async fn test_finalize_twice_and_write_after_finalize() {
    let server = FakeS3::start().await;
    let client = client_for(&server);

    let mut sink = client.make_upload_sink("bucket/once");
    sink.write(b"payload").await.unwrap();
    sink.finalize().await.unwrap();
    let sent = server.requests().len();

    sink.finalize().await.unwrap();
    assert!(matches!(sink.write(b"more").await, Err(S3Error::SinkClosed)));
    sink.abort().await.unwrap();

    assert_eq!(sink.state(), SinkState::Completed);
    assert_eq!(server.requests().len(), sent);
    assert_eq!(&server.object("bucket/once").unwrap()[..], b"payload");
}

#[tokio::test]
async fn test_sink_after_client_close() {
    let server = FakeS3::start().await;
    let client = client_for(&server);

    let mut sink = client.make_upload_sink("bucket/late");
    client.close().await;

    assert!(matches!(sink.write(b"buffered").await, Err(S3Error::ClientClosed)));
    assert!(matches!(
        sink.write_bytes(Bytes::from_static(b"owned")).await,
        Err(S3Error::ClientClosed)
    ));
    assert_eq!(sink.bytes_written(), 0);
    assert!(matches!(sink.finalize().await, Err(S3Error::ClientClosed)));
    assert_eq!(sink.state(), SinkState::Aborted);
    assert!(server.object("bucket/late").is_none());
    assert!(server.requests().is_empty());
}

#[tokio::test]
async fn test_close_aborts_open_multipart_upload() {
    let server = FakeS3::start().await;
    let client = client_for(&server);

    let mut sink = client.make_upload_sink("bucket/interrupted");
    sink.write(&pattern(6 * 1024 * 1024)).await.unwrap();
    assert!(sink.upload_id().is_some());
    assert_eq!(server.pending_uploads(), 1);

    client.close().await;
    assert_eq!(server.pending_uploads(), 0);
    assert_eq!(server.aborted_uploads(), 1);

    assert!(matches!(sink.finalize().await, Err(S3Error::ClientClosed)));
    assert_eq!(sink.state(), SinkState::Aborted);
    drop(sink);

    assert_eq!(server.count(Method::DELETE, "uploadId"), 1);
    assert!(server.object("bucket/interrupted").is_none());
}

#[tokio::test]
async fn test_completed_upload_not_aborted_on_close() {
    let server = FakeS3::start().await;
    let client = client_for(&server);
    let data = pattern(6 * 1024 * 1024);

    let mut sink = client.make_upload_sink("bucket/kept");
    sink.write(&data).await.unwrap();
    sink.finalize().await.unwrap();
    client.close().await;

    assert_eq!(server.count(Method::DELETE, "uploadId"), 0);
    assert_eq!(&server.object("bucket/kept").unwrap()[..], &data[..]);
}

#[tokio::test]
async fn test_embedded_complete_error_is_retried() {
    let server = FakeS3::start().await;
    let client = client_for(&server);
    server.embed_error_in_next_completes(1);
    let data = pattern(6 * 1024 * 1024);

    let mut sink = client.make_upload_sink("bucket/retried-complete");
    sink.write(&data).await.unwrap();
    sink.finalize().await.unwrap();

    assert_eq!(sink.state(), SinkState::Completed);
    assert_eq!(server.count(Method::POST, "uploadId"), 2);
    assert_eq!(server.aborted_uploads(), 0);
    assert_eq!(&server.object("bucket/retried-complete").unwrap()[..], &data[..]);
}

#[tokio::test]
async fn test_zero_part_size_and_concurrency_still_upload() {
    let server = FakeS3::start().await;
    let client = client_for(&server);
    let config = MultipartConfig {
        part_size: 0,
        concurrency: 0,
        ..fast_parts()
    };
    let data = pattern(6 * 1024 * 1024);

    let mut sink = client.make_upload_sink_with("bucket/zeroes", config);
    sink.write(&data).await.unwrap();
    sink.finalize().await.unwrap();

    // Clamped to one 5 MiB part plus the 1 MiB tail
    assert_eq!(server.count(Method::PUT, "partNumber"), 2);
    assert_eq!(&server.object("bucket/zeroes").unwrap()[..], &data[..]);
}
