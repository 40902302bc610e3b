//! Task configuration.
//!
//! | Key                     | Description                                  | Default     |
//! |-------------------------|----------------------------------------------|-------------|
//! | `s3.bucket`             | Destination bucket                           | required    |
//! | `s3.prefix`             | Key prefix for every archived object         | bucket root |
//! | `local.buffer.dir`      | Scratch directory for chunks being built     | required    |
//! | `compressed_block_size` | Uncompressed bytes per gzip block            | `67108864`  |
//! | `s3.request.timeout.ms` | Upper bound on a single object store request | `30000`     |
//! | `s3.max.retries`        | Retries the object store client may attempt  | `3`         |
use std::{collections::HashMap, path::PathBuf, str::FromStr, time::Duration};

use crate::error::{ArchiverError, ArchiverResult};

/// Default block threshold, 64 MiB.
pub const DEFAULT_BLOCK_THRESHOLD_BYTES: u64 = 64 * 1024 * 1024;
/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Default object store retry budget.
pub const DEFAULT_MAX_RETRIES: usize = 3;

/// Configuration parsed from the task's property map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkConfig {
    /// Bucket every chunk is written to.
    pub bucket: String,
    /// Key prefix, empty for the bucket root.
    pub prefix: String,
    /// Directory holding the chunks currently being written.
    pub buffer_dir: PathBuf,
    /// Uncompressed size at which a chunk starts a new gzip block.
    pub block_threshold_bytes: u64,
    /// Upper bound on a single object store request.
    pub request_timeout: Duration,
    /// Retries the object store client may attempt per request.
    pub max_retries: usize,
}

impl SinkConfig {
    /// Parse a SinkConfig from a string key-value map.
    pub fn from_props(props: &HashMap<String, String>) -> ArchiverResult<Self> {
        let bucket = required(props, "s3.bucket")?;
        let buffer_dir = PathBuf::from(required(props, "local.buffer.dir")?);

        let prefix = props
            .get("s3.prefix")
            .map(|p| p.trim_matches('/').to_string())
            .unwrap_or_default();

        let block_threshold_bytes = parse_number(props, "compressed_block_size")?
            .unwrap_or(DEFAULT_BLOCK_THRESHOLD_BYTES);

        if block_threshold_bytes == 0 {
            return Err(ArchiverError::Config(
                "'compressed_block_size' must be greater than zero".to_string(),
            ));
        }

        let request_timeout = parse_number(props, "s3.request.timeout.ms")?
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        let max_retries = parse_number(props, "s3.max.retries")?.unwrap_or(DEFAULT_MAX_RETRIES);

        Ok(Self {
            bucket,
            prefix,
            buffer_dir,
            block_threshold_bytes,
            request_timeout,
            max_retries,
        })
    }
}

fn required(props: &HashMap<String, String>, key: &str) -> ArchiverResult<String> {
    match props.get(key).map(|v| v.trim()) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(ArchiverError::Config(format!("missing required '{}'", key))),
    }
}

/// Parses an optional numeric property. Absent or blank values yield `None`,
/// anything else must parse.
fn parse_number<T>(props: &HashMap<String, String>, key: &str) -> ArchiverResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    props
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| {
            v.parse::<T>()
                .map_err(|e| ArchiverError::Config(format!("invalid '{}' value '{}': {}", key, v, e)))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = SinkConfig::from_props(&props(&[
            ("s3.bucket", "archive"),
            ("local.buffer.dir", "/tmp/buffers"),
        ]))
        .expect("");

        assert_eq!(config.bucket, "archive");
        assert_eq!(config.prefix, "");
        assert_eq!(config.buffer_dir, PathBuf::from("/tmp/buffers"));
        assert_eq!(config.block_threshold_bytes, 67_108_864);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_full_config() {
        let config = SinkConfig::from_props(&props(&[
            ("s3.bucket", "archive"),
            ("s3.prefix", "/raw/events/"),
            ("local.buffer.dir", "/tmp/buffers"),
            ("compressed_block_size", "1048576"),
            ("s3.request.timeout.ms", "2500"),
            ("s3.max.retries", "7"),
        ]))
        .expect("");

        assert_eq!(config.prefix, "raw/events");
        assert_eq!(config.block_threshold_bytes, 1_048_576);
        assert_eq!(config.request_timeout, Duration::from_millis(2500));
        assert_eq!(config.max_retries, 7);
    }

    #[test]
    fn test_missing_bucket_fails() {
        let err = SinkConfig::from_props(&props(&[("local.buffer.dir", "/tmp/buffers")]))
            .expect_err("");

        assert!(matches!(err, ArchiverError::Config(ref msg) if msg.contains("s3.bucket")));
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_empty_bucket_fails() {
        let result = SinkConfig::from_props(&props(&[
            ("s3.bucket", ""),
            ("local.buffer.dir", "/tmp/buffers"),
        ]));

        assert!(matches!(result, Err(ArchiverError::Config(_))));
    }

    #[test]
    fn test_missing_buffer_dir_fails() {
        let result = SinkConfig::from_props(&props(&[("s3.bucket", "archive")]));

        assert!(matches!(result, Err(ArchiverError::Config(ref msg)) if msg.contains("local.buffer.dir")));
    }

    #[test]
    fn test_malformed_block_size_fails() {
        let result = SinkConfig::from_props(&props(&[
            ("s3.bucket", "archive"),
            ("local.buffer.dir", "/tmp/buffers"),
            ("compressed_block_size", "64MB"),
        ]));

        assert!(
            matches!(result, Err(ArchiverError::Config(ref msg)) if msg.contains("compressed_block_size"))
        );
    }

    #[test]
    fn test_zero_block_size_fails() {
        let result = SinkConfig::from_props(&props(&[
            ("s3.bucket", "archive"),
            ("local.buffer.dir", "/tmp/buffers"),
            ("compressed_block_size", "0"),
        ]));

        assert!(matches!(result, Err(ArchiverError::Config(_))));
    }

    #[test]
    fn test_blank_block_size_keeps_default() {
        let config = SinkConfig::from_props(&props(&[
            ("s3.bucket", "archive"),
            ("local.buffer.dir", "/tmp/buffers"),
            ("compressed_block_size", "  "),
        ]))
        .expect("");

        assert_eq!(config.block_threshold_bytes, DEFAULT_BLOCK_THRESHOLD_BYTES);
    }
}
