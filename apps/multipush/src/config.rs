//! CLI configuration.
//!
//! Read from `$MULTIPUSH_CONFIG` or `~/.config/multipush/config.json`, then
//! overridden field by field from `MULTIPUSH_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use multipush_protocol::constants::{
    DEFAULT_EXPIRY, DEFAULT_MAX_CONCURRENCY, DEFAULT_PART_SIZE, DEFAULT_RETRIES,
    DEFAULT_RETRY_DELAY,
};
use multipush_upload::{RetryPolicy, UploadConfig};

/// Endpoint that selects the in-process store.
pub const MEMORY_SCHEME: &str = "memory://";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Base URL of the S3-compatible service, or `memory://<name>`. No
    /// default: the in-memory store must be asked for explicitly.
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    /// Prepended to the file name when no key is given.
    pub key_prefix: String,
    pub part_size: u64,
    pub retries: u32,
    pub retry_delay_secs: u64,
    /// `0` launches every part at once.
    pub max_concurrency: usize,
    pub expiry_hours: u64,
    pub fail_fast: bool,
    pub abort_on_finalize_failure: bool,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            bucket: String::new(),
            region: "us-east-1".into(),
            key_prefix: "recordings/".into(),
            part_size: DEFAULT_PART_SIZE,
            retries: DEFAULT_RETRIES,
            retry_delay_secs: DEFAULT_RETRY_DELAY.as_secs(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            expiry_hours: DEFAULT_EXPIRY.as_secs() / 3600,
            fail_fast: false,
            abort_on_finalize_failure: false,
            connect_timeout_secs: 10,
            request_timeout_secs: 300,
        }
    }
}

impl AppConfig {
    /// Loads the config file (if any), applies environment overrides and
    /// validates the result.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match config_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Applies `MULTIPUSH_*` overrides looked up through `var`.
    pub fn apply_overrides<F>(&mut self, var: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = var("MULTIPUSH_ENDPOINT") {
            self.endpoint = v;
        }
        if let Some(v) = var("MULTIPUSH_BUCKET") {
            self.bucket = v;
        }
        if let Some(v) = var("MULTIPUSH_REGION") {
            self.region = v;
        }
        if let Some(v) = var("MULTIPUSH_PART_SIZE") {
            self.part_size = parse_var("MULTIPUSH_PART_SIZE", &v)?;
        }
        if let Some(v) = var("MULTIPUSH_RETRIES") {
            self.retries = parse_var("MULTIPUSH_RETRIES", &v)?;
        }
        if let Some(v) = var("MULTIPUSH_RETRY_DELAY_SECS") {
            self.retry_delay_secs = parse_var("MULTIPUSH_RETRY_DELAY_SECS", &v)?;
        }
        if let Some(v) = var("MULTIPUSH_MAX_CONCURRENCY") {
            self.max_concurrency = parse_var("MULTIPUSH_MAX_CONCURRENCY", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.part_size == 0 {
            bail!("part_size must be greater than zero");
        }
        if self.endpoint.is_empty() {
            bail!(
                "no endpoint configured: set MULTIPUSH_ENDPOINT or \"endpoint\" in the config file \
                 ({MEMORY_SCHEME}<name> keeps the upload in memory)"
            );
        }
        if !self.is_memory() && self.bucket.is_empty() {
            bail!("bucket must not be empty for endpoint {}", self.endpoint);
        }
        Ok(())
    }

    pub fn is_memory(&self) -> bool {
        self.endpoint.starts_with(MEMORY_SCHEME)
    }

    /// Object key for `file` when none was given on the command line.
    pub fn default_key(&self, file: &Path) -> String {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.bin".into());
        format!("{}{name}", self.key_prefix)
    }

    pub fn upload_config(&self) -> UploadConfig {
        UploadConfig {
            part_size: self.part_size,
            retry: RetryPolicy {
                retries: self.retries,
                delay: Duration::from_secs(self.retry_delay_secs),
                fail_fast: self.fail_fast,
            },
            max_concurrency: self.max_concurrency,
            expiry: Duration::from_secs(self.expiry_hours.saturating_mul(3600)),
            abort_on_finalize_failure: self.abort_on_finalize_failure,
        }
    }
}

fn parse_var<T>(name: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("invalid value for {name}: {value:?}"))
}

fn config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("MULTIPUSH_CONFIG") {
        return Some(PathBuf::from(path));
    }
    std::env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".config").join("multipush").join("config.json"))
}
