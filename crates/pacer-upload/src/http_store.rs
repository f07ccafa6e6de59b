//! Object store backed by plain HTTP PUT

use crate::error::{PutError, UploadError, UploadResult};
use crate::object_store::ObjectStore;
use crate::retry_after::parse_retry_after;
use async_trait::async_trait;
use bytes::Bytes;
use pacer_core::config::UploadConfig;
use reqwest::{Client, ClientBuilder, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Whole-request timeout in seconds, including the body upload
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub pool_max_idle_per_host: usize,
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            connect_timeout_secs: 10,
            pool_max_idle_per_host: 4,
            user_agent: format!("Pacer/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl From<&UploadConfig> for HttpClientConfig {
    fn from(config: &UploadConfig) -> Self {
        Self {
            timeout_secs: config.request_timeout_secs,
            connect_timeout_secs: config.connect_timeout_secs,
            ..Self::default()
        }
    }
}

/// Create a configured HTTP client with connection pooling
pub fn create_client(config: &HttpClientConfig) -> UploadResult<Client> {
    ClientBuilder::new()
        .timeout(Duration::from_secs(config.timeout_secs))
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        // Drop idle connections before the server closes them
        .pool_idle_timeout(Duration::from_secs(90))
        .user_agent(&config.user_agent)
        .use_rustls_tls()
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .map_err(|e| UploadError::Config(format!("Failed to create HTTP client: {}", e)))
}

/// Uploads artifacts with `PUT {endpoint}/{path}`
pub struct HttpObjectStore {
    client: Client,
    endpoint: String,
}

impl HttpObjectStore {
    pub fn new(endpoint: impl Into<String>, config: &HttpClientConfig) -> UploadResult<Self> {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        if endpoint.is_empty() {
            return Err(UploadError::Config("upload endpoint is empty".to_string()));
        }
        Ok(Self {
            client: create_client(config)?,
            endpoint,
        })
    }

    /// Build from the upload section; fails when no endpoint is configured
    pub fn from_config(config: &UploadConfig) -> UploadResult<Self> {
        let endpoint = config
            .endpoint
            .as_deref()
            .ok_or_else(|| UploadError::Config("upload.endpoint is not set".to_string()))?;
        Self::new(endpoint, &HttpClientConfig::from(config))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path.trim_start_matches('/'))
    }
}

/// Statuses worth another attempt
pub fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_EARLY
        || status == StatusCode::TOO_MANY_REQUESTS
}

fn classify_transport(error: &reqwest::Error) -> PutError {
    if error.is_builder() {
        PutError::permanent(format!("invalid request: {}", error))
    } else if error.is_timeout() {
        PutError::retryable(format!("request timed out: {}", error))
    } else if error.is_connect() {
        PutError::retryable(format!("connection failed: {}", error))
    } else {
        PutError::retryable(format!("transport error: {}", error))
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(&self, path: &str, body: Bytes) -> Result<(), PutError> {
        let url = self.url(path);
        let size = body.len();
        debug!(url = %url, size, "Uploading artifact");

        let response = self
            .client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        if status.is_success() {
            debug!(url = %url, status = status.as_u16(), "Upload accepted");
            return Ok(());
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await.unwrap_or_default();
        let message = if body.is_empty() {
            format!("HTTP {}", status.as_u16())
        } else {
            format!("HTTP {}: {}", status.as_u16(), body.trim())
        };

        if is_retryable_status(status) {
            warn!(url = %url, status = status.as_u16(), ?retry_after, "Upload rejected, will retry");
            Err(PutError::Retryable {
                message,
                retry_after,
            })
        } else {
            warn!(url = %url, status = status.as_u16(), "Upload rejected permanently");
            Err(PutError::Permanent { message })
        }
    }
}
