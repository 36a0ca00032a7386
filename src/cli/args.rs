use anyhow::Result;

/// Parse an object path into the `bucket/key` form used by the client.
///
/// Accepts `s3://bucket/key` or a bare `bucket/key`.
pub fn parse_object_path(path: &str) -> Result<String> {
    let path = path.trim();
    let stripped = path.strip_prefix("s3://").unwrap_or(path);
    let stripped = stripped.trim_start_matches('/');

    let (bucket, key) = match stripped.split_once('/') {
        Some(parts) => parts,
        None => anyhow::bail!("Invalid object path {:?}. Expected: bucket/key", path),
    };

    if bucket.is_empty() {
        anyhow::bail!("Bucket name cannot be empty");
    }
    if key.is_empty() {
        anyhow::bail!("Object key cannot be empty");
    }

    Ok(format!("{}/{}", bucket, key))
}
