//! Dataset fetcher
//!
//! Downloads the bridge lists and the geo-database archive with retry on
//! transient failures. Payloads land in a temporary file next to the
//! destination and are renamed into place only once complete, so a reader
//! never sees a truncated file under the final name.

use crate::bridge::error::{ConfigError, NetworkError};
use reqwest::{Client, Proxy as ReqwestProxy, StatusCode, Url};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;
use tokio_util::sync::CancellationToken;

/// Default timeout for HTTP requests in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default number of retries after the first attempt
pub const DEFAULT_MAX_RETRIES: usize = 3;

/// Default delay before the first retry
const DEFAULT_BACKOFF_MS: u64 = 1000;

/// Upper bound on a single backoff delay
const MAX_BACKOFF_SECS: u64 = 30;

/// Largest payload accepted (512 MiB)
pub const DEFAULT_MAX_PAYLOAD_BYTES: u64 = 512 * 1024 * 1024;

/// Default user agent for HTTP requests
const DEFAULT_USER_AGENT: &str = concat!("bridge-geo/", env!("CARGO_PKG_VERSION"));

/// Configuration for the fetcher
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Timeout for each request attempt
    pub timeout: Duration,
    /// Proxy applied to every request (http, https, socks5, socks5h)
    pub proxy_url: Option<String>,
    /// Retries after the first attempt for transient failures
    pub max_retries: usize,
    /// Delay before the first retry; doubles on each further retry
    pub backoff: Duration,
    /// Largest payload accepted
    pub max_payload_bytes: u64,
    /// Skip the download when the destination already exists
    pub reuse_existing: bool,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            proxy_url: None,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: Duration::from_millis(DEFAULT_BACKOFF_MS),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            reuse_existing: false,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl FetchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_proxy(mut self, proxy_url: Option<String>) -> Self {
        self.proxy_url = proxy_url;
        self
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_payload_bytes(mut self, max_payload_bytes: u64) -> Self {
        self.max_payload_bytes = max_payload_bytes;
        self
    }

    pub fn with_reuse_existing(mut self, reuse_existing: bool) -> Self {
        self.reuse_existing = reuse_existing;
        self
    }

    /// Backoff delays for the configured number of retries
    fn retry_strategy(&self) -> impl Iterator<Item = Duration> {
        // ExponentialBackoff yields base^n * factor: 2, 4, 8, ... times factor
        let factor = (self.backoff.as_millis() as u64 / 2).max(1);
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(Duration::from_secs(MAX_BACKOFF_SECS))
            .take(self.max_retries)
    }
}

/// Source of remote payloads
///
/// [`HttpTransport`] is the production implementation; tests plug in
/// scripted transports to simulate failures.
pub trait Transport: Send + Sync {
    /// Retrieve the full body at `url`
    fn get(&self, url: &str) -> impl Future<Output = Result<Vec<u8>, NetworkError>> + Send;
}

/// HTTP(S) transport backed by reqwest, optionally through a proxy
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    max_payload_bytes: u64,
}

impl HttpTransport {
    pub fn new(config: &FetchConfig) -> Result<Self, ConfigError> {
        let mut builder = Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent);

        if let Some(proxy_url) = &config.proxy_url {
            let proxy = ReqwestProxy::all(proxy_url).map_err(|e| ConfigError::InvalidProxyUrl {
                url: proxy_url.clone(),
                reason: e.to_string(),
            })?;
            log::info!("Using proxy: {}", proxy_url);
            builder = builder.proxy(proxy);
        } else {
            // ignore HTTP_PROXY and friends unless a proxy is configured
            builder = builder.no_proxy();
        }

        Ok(Self {
            client: builder.build()?,
            max_payload_bytes: config.max_payload_bytes,
        })
    }

    /// Map a reqwest error onto transient/permanent
    fn classify(url: &str, error: reqwest::Error) -> NetworkError {
        if error.is_builder() || error.is_redirect() || error.is_decode() {
            return NetworkError::permanent(url, error);
        }
        if let Some(status) = error.status() {
            return Self::classify_status(url, status);
        }
        // timeouts, connect failures, resets, truncated bodies
        NetworkError::transient(url, error)
    }

    /// Payloads over the cap are permanent failures
    fn check_payload_size(&self, url: &str, size: u64) -> Result<(), NetworkError> {
        if size > self.max_payload_bytes {
            return Err(NetworkError::permanent(
                url,
                format!(
                    "payload of {} bytes exceeds limit of {} bytes",
                    size, self.max_payload_bytes
                ),
            ));
        }
        Ok(())
    }

    fn classify_status(url: &str, status: StatusCode) -> NetworkError {
        let reason = format!("HTTP status: {}", status);
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            NetworkError::transient(url, reason)
        } else {
            NetworkError::permanent(url, reason)
        }
    }
}

impl Transport for HttpTransport {
    async fn get(&self, url: &str) -> Result<Vec<u8>, NetworkError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Self::classify(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::classify_status(url, status));
        }

        if let Some(length) = response.content_length() {
            self.check_payload_size(url, length)?;
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| Self::classify(url, e))? {
            body.extend_from_slice(&chunk);
            self.check_payload_size(url, body.len() as u64)?;
        }

        Ok(body)
    }
}

/// Fetches remote resources to local files
pub struct Fetcher<T> {
    config: FetchConfig,
    transport: T,
    cancel: CancellationToken,
}

impl<T: Transport> Fetcher<T> {
    pub fn new(config: FetchConfig, transport: T, cancel: CancellationToken) -> Self {
        Self {
            config,
            transport,
            cancel,
        }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Download `url` to `destination`
    ///
    /// Transient failures are retried up to `max_retries` times with
    /// exponential backoff. Permanent failures and malformed URLs fail on the
    /// first attempt. Once the run is cancelled no further attempt is made.
    pub async fn fetch(&self, url: &str, destination: &Path) -> Result<PathBuf, NetworkError> {
        if self.config.reuse_existing && destination.exists() {
            log::info!("Reusing existing download: {}", destination.display());
            return Ok(destination.to_path_buf());
        }
        self.fetch_fresh(url, destination).await
    }

    /// Download `url` to `destination`, ignoring any existing file
    pub async fn fetch_fresh(&self, url: &str, destination: &Path) -> Result<PathBuf, NetworkError> {
        validate_url(url)?;

        let attempts = AtomicUsize::new(0);
        let total = self.config.max_retries + 1;

        let action = || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if self.cancel.is_cancelled() {
                    return Err(NetworkError::Cancelled {
                        url: url.to_string(),
                    });
                }
                log::info!("Downloading: {} (attempt {}/{})", url, attempt, total);
                self.transport.get(url).await
            }
        };

        let should_retry = |error: &NetworkError| {
            if !error.is_transient() || self.cancel.is_cancelled() {
                return false;
            }
            let attempt = attempts.load(Ordering::SeqCst);
            if attempt < total {
                log::warn!("Download attempt {}/{} failed: {}, retrying...", attempt, total, error);
            }
            true
        };

        let body = RetryIf::start(self.config.retry_strategy(), action, should_retry)
            .await
            .map_err(|e| {
                if self.cancel.is_cancelled() {
                    log::warn!("Download of {} cancelled: {}", url, e);
                    return NetworkError::Cancelled {
                        url: url.to_string(),
                    };
                }
                log::error!("Download failed {}: {}", url, e);
                e
            })?;

        let path = destination.to_path_buf();
        let size = body.len();
        tokio::task::spawn_blocking(move || persist_atomically(&path, &body))
            .await
            .map_err(|e| NetworkError::Storage {
                path: destination.to_path_buf(),
                source: std::io::Error::other(e),
            })?
            .map_err(|source| NetworkError::Storage {
                path: destination.to_path_buf(),
                source,
            })?;

        log::info!("Download completed: {} ({} bytes)", destination.display(), size);
        Ok(destination.to_path_buf())
    }
}

/// Reject URLs that cannot be requested before touching the network
fn validate_url(url: &str) -> Result<(), NetworkError> {
    let invalid = |reason: String| NetworkError::InvalidUrl {
        url: url.to_string(),
        reason,
    };
    let parsed = Url::parse(url).map_err(|e| invalid(e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(invalid(format!("unsupported scheme `{}`", other))),
    }
}

/// Write `bytes` to a temporary file beside `path`, then rename it into place
pub(crate) fn persist_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}
