use anyhow::{Context, Result};
use std::io::Write;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::cli::args::parse_object_path;
use crate::s3::{MultipartConfig, S3Client};

/// Chunk size for streaming reads from local files and from objects
const COPY_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let bytes_f64 = bytes as f64;
    let exponent = (bytes_f64.ln() / 1024_f64.ln()).floor() as usize;
    let exponent = exponent.min(UNITS.len() - 1);

    let value = bytes_f64 / 1024_f64.powi(exponent as i32);

    if exponent == 0 {
        format!("{} {}", bytes, UNITS[exponent])
    } else {
        format!("{:.2} {}", value, UNITS[exponent])
    }
}

/// Show object size
pub async fn cmd_stat(client: &S3Client, path: &str) -> Result<()> {
    let key = parse_object_path(path)?;
    let size = client.get_object_size(&key).await?;

    println!("Object: {}", key);
    println!("Size: {} ({})", format_bytes(size), size);
    Ok(())
}

/// Write object bytes to stdout, optionally a window of them
pub async fn cmd_cat(
    client: &S3Client,
    path: &str,
    offset: u64,
    length: Option<u64>,
) -> Result<()> {
    let key = parse_object_path(path)?;
    let file = client.make_readable_file(&key);

    let size = file.size().await?;
    let end = match length {
        Some(length) => offset.saturating_add(length).min(size),
        None => size,
    };
    debug!(key = %key, offset, end, "cat");

    let mut stdout = std::io::stdout().lock();
    let mut position = offset;
    while position < end {
        let chunk_len = (end - position).min(COPY_CHUNK_SIZE as u64);
        let chunk = file.read(position, chunk_len).await?;
        if chunk.is_empty() {
            break;
        }
        stdout.write_all(&chunk)?;
        position += chunk.len() as u64;
    }
    stdout.flush()?;

    file.close();
    Ok(())
}

/// Upload a local file through an upload sink
pub async fn cmd_put(
    client: &S3Client,
    source: &str,
    dest: &str,
    part_size: Option<usize>,
) -> Result<()> {
    let key = parse_object_path(dest)?;

    let mut config: MultipartConfig = client.multipart_config().clone();
    if let Some(part_size) = part_size {
        config = config.with_part_size(part_size);
    }

    let mut file = tokio::fs::File::open(source)
        .await
        .with_context(|| format!("Failed to open {}", source))?;

    let mut sink = client.make_upload_sink_with(&key, config);
    let mut buf = vec![0u8; COPY_CHUNK_SIZE];

    loop {
        let n = match file.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                if let Err(abort_err) = sink.abort().await {
                    warn!(key = %key, error = %abort_err, "abort failed");
                }
                return Err(e).with_context(|| format!("Failed to read {}", source));
            }
        };
        if n == 0 {
            break;
        }
        sink.write(&buf[..n]).await?;
    }

    sink.finalize().await?;

    let uploaded = sink.bytes_written();
    println!("Uploaded: {} -> {} ({})", source, key, format_bytes(uploaded));
    Ok(())
}

/// Delete an object
pub async fn cmd_rm(client: &S3Client, path: &str) -> Result<()> {
    let key = parse_object_path(path)?;
    client.delete_object(&key).await?;
    println!("Deleted: {}", key);
    Ok(())
}
