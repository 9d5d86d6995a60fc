//! SIEM exporter configuration

use std::time::Duration;

/// Configuration for an HEC-style exporter
#[derive(Debug, Clone)]
pub struct HecExporterConfig {
    /// Collector endpoint URL
    pub endpoint: String,
    /// Ingestion token
    pub token: String,
    /// Authorization scheme preceding the token
    pub auth_scheme: String,
    /// Source type tag on every record
    pub source_type: String,
    /// Source tag; `None` falls back to `"dispatch"`
    pub source: Option<String>,
    /// Host tag; `None` falls back to the machine name
    pub host: Option<String>,
    /// Target index, when the backend routes by index
    pub index: Option<String>,
    /// Events per batch request
    pub max_batch_size: usize,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Retry budget for transient failures
    pub max_retry_attempts: u32,
    /// Base delay for exponential backoff
    pub retry_base_delay: Duration,
    /// Compress request bodies
    pub enable_compression: bool,
    /// Validate the endpoint's TLS certificate
    pub validate_certificate: bool,
    /// Request indexer acknowledgement
    pub use_ack: bool,
    /// Ack channel identifier, sent as a header when present
    pub channel: Option<String>,
}

impl Default for HecExporterConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            token: String::new(),
            auth_scheme: "Splunk".to_string(),
            source_type: "audit:dispatch".to_string(),
            source: None,
            host: None,
            index: None,
            max_batch_size: 100,
            request_timeout: Duration::from_secs(30),
            max_retry_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            enable_compression: true,
            validate_certificate: true,
            use_ack: false,
            channel: None,
        }
    }
}

impl HecExporterConfig {
    /// Configuration pointing at an endpoint with a token
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: token.into(),
            ..Self::default()
        }
    }

    /// Create config from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            endpoint: std::env::var("EXCALIBUR_HEC_ENDPOINT").unwrap_or_default(),
            token: std::env::var("EXCALIBUR_HEC_TOKEN").unwrap_or_default(),
            source: std::env::var("EXCALIBUR_HEC_SOURCE").ok(),
            host: std::env::var("EXCALIBUR_HEC_HOST").ok(),
            index: std::env::var("EXCALIBUR_HEC_INDEX").ok(),
            max_batch_size: std::env::var("EXCALIBUR_HEC_MAX_BATCH")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_batch_size),
            max_retry_attempts: std::env::var("EXCALIBUR_HEC_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_retry_attempts),
            ..defaults
        }
    }

    /// Effective source tag
    pub fn effective_source(&self) -> &str {
        self.source.as_deref().unwrap_or("dispatch")
    }

    /// Effective host tag
    pub fn effective_host(&self) -> String {
        match &self.host {
            Some(host) => host.clone(),
            None => std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
        }
    }

    /// The `Authorization` header value
    pub fn authorization_header(&self) -> String {
        format!("{} {}", self.auth_scheme, self.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HecExporterConfig::default();
        assert_eq!(config.source_type, "audit:dispatch");
        assert_eq!(config.max_batch_size, 100);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.max_retry_attempts, 3);
        assert_eq!(config.retry_base_delay, Duration::from_secs(1));
        assert!(config.enable_compression);
        assert!(config.validate_certificate);
        assert!(!config.use_ack);
        assert_eq!(config.effective_source(), "dispatch");
    }

    #[test]
    fn test_authorization_header() {
        let config = HecExporterConfig::new("https://siem.local:8088", "tok-1");
        assert_eq!(config.authorization_header(), "Splunk tok-1");
    }
}
