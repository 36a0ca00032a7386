use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::s3::{Credentials, MultipartConfig};

/// Endpoint and optional credentials for one object store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    /// Endpoint as `host[:port]` or `http(s)://host[:port]`
    pub endpoint: String,

    /// AWS access key ID (omit for anonymous access)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,

    /// AWS secret access key (omit for anonymous access)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,

    /// AWS region (default: us-east-1)
    #[serde(default = "default_region")]
    pub region: String,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl Profile {
    /// Signing credentials, or None for an anonymous profile.
    ///
    /// Giving only one of the two keys is a configuration error.
    pub fn credentials(&self) -> Result<Option<Credentials>> {
        match (&self.access_key, &self.secret_key) {
            (Some(access_key), Some(secret_key)) => Ok(Some(Credentials::new(
                access_key.clone(),
                secret_key.clone(),
                Some(self.region.clone()),
            ))),
            (None, None) => Ok(None),
            _ => anyhow::bail!(
                "Profile for {} must set both access_key and secret_key, or neither",
                self.endpoint
            ),
        }
    }
}

/// Multipart upload settings for upload sinks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultipartSettings {
    /// Part size in bytes, also the multipart threshold (minimum 5 MiB)
    #[serde(default = "default_part_size")]
    pub part_size: usize,

    /// Concurrent part uploads per sink
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Retries per part before the upload is aborted
    #[serde(default = "default_max_part_retries")]
    pub max_part_retries: u32,
}

fn default_part_size() -> usize {
    crate::s3::MIN_PART_SIZE
}

fn default_concurrency() -> usize {
    10
}

fn default_max_part_retries() -> u32 {
    3
}

impl Default for MultipartSettings {
    fn default() -> Self {
        Self {
            part_size: default_part_size(),
            concurrency: default_concurrency(),
            max_part_retries: default_max_part_retries(),
        }
    }
}

/// Transport and retry settings shared by every client operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    /// Retries for transient failures (connection errors, 429, 5xx)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Maximum requests in flight; further requests queue
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Hash request bodies instead of sending UNSIGNED-PAYLOAD
    #[serde(default)]
    pub sign_payload: bool,

    /// Disable TLS certificate verification
    #[serde(default)]
    pub insecure_tls: bool,

    #[serde(default)]
    pub multipart: MultipartSettings,
}

fn default_request_timeout() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_connections() -> usize {
    100
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            max_retries: default_max_retries(),
            max_connections: default_max_connections(),
            sign_payload: false,
            insecure_tls: false,
            multipart: MultipartSettings::default(),
        }
    }
}

impl ClientSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn multipart_config(&self) -> MultipartConfig {
        MultipartConfig::default()
            .with_part_size(self.multipart.part_size)
            .with_concurrency(self.multipart.concurrency)
            .with_max_part_retries(self.multipart.max_part_retries)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Named profiles for different object stores
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,

    /// Profile used when none is named
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_profile: Option<String>,

    /// Client settings
    #[serde(default)]
    pub client: ClientSettings,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a profile by name, or the default profile if not specified
    pub fn get_profile(&self, name: Option<&str>) -> Option<&Profile> {
        if let Some(name) = name {
            self.profiles.get(name)
        } else if let Some(default) = &self.default_profile {
            self.profiles.get(default)
        } else {
            self.profiles.values().next()
        }
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config =
        serde_yaml::from_str(&content).context("Failed to parse YAML configuration")?;

    Ok(config)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("Invalid value for {}: {:?}", name, value)),
        Err(_) => Ok(None),
    }
}

/// Load configuration from environment variables
///
/// - S3_ENDPOINT (required)
/// - AWS_ACCESS_KEY_ID / S3_KEY, AWS_SECRET_ACCESS_KEY / S3_SECRET (optional pair)
/// - AWS_REGION (optional, defaults to us-east-1)
/// - S3_REQUEST_TIMEOUT, S3_MAX_RETRIES, S3_MAX_CONNECTIONS, S3_PART_SIZE (optional)
pub fn load_from_env() -> Result<Config> {
    // Pick up a .env file if present
    let _ = dotenvy::dotenv();

    let mut config = Config::new();

    let endpoint = std::env::var("S3_ENDPOINT")
        .context("S3_ENDPOINT environment variable not set")?
        .trim()
        .to_string();

    if endpoint.is_empty() {
        anyhow::bail!("S3_ENDPOINT is empty");
    }

    let access_key = std::env::var("AWS_ACCESS_KEY_ID")
        .or_else(|_| std::env::var("S3_KEY"))
        .ok();
    let secret_key = std::env::var("AWS_SECRET_ACCESS_KEY")
        .or_else(|_| std::env::var("S3_SECRET"))
        .ok();
    let region = std::env::var("AWS_REGION").unwrap_or_else(|_| default_region());

    let profile = Profile {
        endpoint,
        access_key,
        secret_key,
        region,
    };
    profile.credentials()?;

    config.profiles.insert("default".to_string(), profile);
    config.default_profile = Some("default".to_string());

    if let Some(timeout) = env_parse("S3_REQUEST_TIMEOUT")? {
        config.client.request_timeout = timeout;
    }
    if let Some(retries) = env_parse("S3_MAX_RETRIES")? {
        config.client.max_retries = retries;
    }
    if let Some(connections) = env_parse("S3_MAX_CONNECTIONS")? {
        config.client.max_connections = connections;
    }
    if let Some(part_size) = env_parse("S3_PART_SIZE")? {
        config.client.multipart.part_size = part_size;
    }

    Ok(config)
}

/// Load configuration from a YAML file when given, else from the environment.
///
/// A named profile must exist in the file and becomes the default.
pub fn load_config(config_path: Option<&str>, profile_name: Option<&str>) -> Result<Config> {
    if let Some(path) = config_path {
        let mut config = load_from_yaml(path)?;

        if let Some(name) = profile_name {
            if !config.profiles.contains_key(name) {
                anyhow::bail!("Profile '{}' not found in config file", name);
            }
            config.default_profile = Some(name.to_string());
        }

        Ok(config)
    } else {
        load_from_env()
    }
}
