//! Bounded outbound HTTP for URLs that arrive from remote parties.
//!
//! Every request is SSRF-validated (including each redirect hop), runs under a hard
//! timeout, and streams its body against a byte cap so oversized payloads are aborted
//! before they are buffered. URLs are redacted to `scheme://host/path` before they reach an
//! error or a log line, since channel API credentials travel in the query string.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures_util::StreamExt;
use reqwest::{redirect::Policy, Method, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use url::Url;

use crate::ssrf_guard::{
    redact_raw_url, redact_url, SsrfGuard, SsrfProtectionConfig, SsrfViolation,
};

pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_MAX_REDIRECTS: usize = 3;
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 8;
pub const DEFAULT_CACHE_TTL_MS: u64 = 5 * 60 * 1_000;
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafeFetchConfig {
    pub timeout_ms: u64,
    pub max_response_bytes: usize,
    pub max_redirects: usize,
    pub max_concurrent_requests: usize,
    pub cache_ttl_ms: u64,
    pub cache_max_entries: usize,
    pub ssrf: SsrfProtectionConfig,
}

impl Default for SafeFetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            cache_ttl_ms: DEFAULT_CACHE_TTL_MS,
            cache_max_entries: DEFAULT_CACHE_MAX_ENTRIES,
            ssrf: SsrfProtectionConfig::default(),
        }
    }
}

/// Every `url` field holds the redacted form produced by [`redact_url`].
#[derive(Debug, Error)]
pub enum SafeFetchError {
    #[error("outbound fetch blocked: {0}")]
    Blocked(#[from] SsrfViolation),
    #[error("outbound fetch to '{url}' timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },
    #[error("response from '{url}' exceeds the {limit} byte cap")]
    TooLarge { url: String, limit: usize },
    #[error("'{url}' returned HTTP {status}")]
    HttpStatus { url: String, status: u16 },
    #[error("redirect from '{url}' rejected: {detail}")]
    Redirect { url: String, detail: String },
    #[error("transport error for '{url}': {detail}")]
    Transport { url: String, detail: String },
    #[error("response from '{url}' is not valid JSON: {detail}")]
    InvalidJson { url: String, detail: String },
    #[error("local path '{}' escapes the allowed media root", path.display())]
    LocalPathOutsideRoot { path: PathBuf },
    #[error("local path '{}' is unavailable: {source}", path.display())]
    LocalPathUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SafeFetchError {
    /// Stable machine-readable reason code for logs.
    pub fn reason_code(&self) -> &str {
        match self {
            Self::Blocked(violation) => violation.reason_code(),
            Self::Timeout { .. } => "fetch_timeout",
            Self::TooLarge { .. } => "fetch_response_too_large",
            Self::HttpStatus { status, .. } => classify_status(*status),
            Self::Redirect { .. } => "fetch_redirect_rejected",
            Self::Transport { .. } => "fetch_transport_error",
            Self::InvalidJson { .. } => "fetch_invalid_json",
            Self::LocalPathOutsideRoot { .. } => "fetch_local_path_outside_root",
            Self::LocalPathUnavailable { .. } => "fetch_local_path_unavailable",
        }
    }
}

fn classify_status(status: u16) -> &'static str {
    match status {
        429 => "fetch_rate_limited",
        500..=599 => "fetch_upstream_unavailable",
        400..=499 => "fetch_request_rejected",
        _ => "fetch_unexpected_status",
    }
}

/// Body and metadata of a completed fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedContent {
    /// Unredacted; keep it out of logs.
    pub final_url: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

struct CachedContent {
    content: FetchedContent,
    stored_at: Instant,
}

/// URL-keyed content cache with a TTL and an entry ceiling.
struct ContentCache {
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<String, CachedContent>>,
}

impl ContentCache {
    fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, url: &str) -> Option<FetchedContent> {
        let mut entries = self.entries.lock().ok()?;
        match entries.get(url) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => Some(entry.content.clone()),
            Some(_) => {
                entries.remove(url);
                None
            }
            None => None,
        }
    }

    fn insert(&self, url: &str, content: &FetchedContent) {
        if self.max_entries == 0 {
            return;
        }
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        let ttl = self.ttl;
        entries.retain(|_, entry| entry.stored_at.elapsed() < ttl);
        while entries.len() >= self.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.stored_at)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    entries.remove(&key);
                }
                None => break,
            }
        }
        entries.insert(
            url.to_string(),
            CachedContent {
                content: content.clone(),
                stored_at: Instant::now(),
            },
        );
    }
}

/// Shared outbound fetch layer; one instance per process.
pub struct SafeFetcher {
    config: SafeFetchConfig,
    guard: SsrfGuard,
    client: reqwest::Client,
    permits: Arc<Semaphore>,
    cache: ContentCache,
}

impl SafeFetcher {
    pub fn new(config: SafeFetchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms.max(1)))
            .redirect(Policy::none())
            .build()
            .context("failed to create safe fetch http client")?;
        Ok(Self {
            guard: SsrfGuard::new(config.ssrf),
            client,
            permits: Arc::new(Semaphore::new(config.max_concurrent_requests.max(1))),
            cache: ContentCache::new(
                Duration::from_millis(config.cache_ttl_ms),
                config.cache_max_entries,
            ),
            config,
        })
    }

    /// GETs `url` with the configured byte cap.
    pub async fn fetch(&self, url: &str) -> Result<FetchedContent, SafeFetchError> {
        self.execute(Method::GET, url, None, self.config.max_response_bytes)
            .await
    }

    /// Like [`SafeFetcher::fetch`] but serves repeat URLs from the content cache.
    pub async fn fetch_cached(&self, url: &str) -> Result<FetchedContent, SafeFetchError> {
        if let Some(content) = self.cache.get(url) {
            debug!(url = %redact_raw_url(url), "safe fetch cache hit");
            return Ok(content);
        }
        let content = self.fetch(url).await?;
        self.cache.insert(url, &content);
        Ok(content)
    }

    pub async fn get_json(&self, url: &str) -> Result<Value, SafeFetchError> {
        let content = self
            .execute(Method::GET, url, None, self.config.max_response_bytes)
            .await?;
        parse_json_body(&content)
    }

    pub async fn post_json(&self, url: &str, body: &Value) -> Result<Value, SafeFetchError> {
        let content = self
            .execute(Method::POST, url, Some(body), self.config.max_response_bytes)
            .await?;
        parse_json_body(&content)
    }

    async fn execute(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        max_bytes: usize,
    ) -> Result<FetchedContent, SafeFetchError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|error| SafeFetchError::Transport {
                url: redact_raw_url(url),
                detail: error.to_string(),
            })?;
        let timeout_ms = self.config.timeout_ms.max(1);
        match tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.execute_with_redirects(method, url, body, max_bytes),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                let url = redact_raw_url(url);
                warn!(url = %url, timeout_ms, "safe fetch timed out");
                Err(SafeFetchError::Timeout { url, timeout_ms })
            }
        }
    }

    async fn execute_with_redirects(
        &self,
        mut method: Method,
        url: &str,
        mut body: Option<&Value>,
        max_bytes: usize,
    ) -> Result<FetchedContent, SafeFetchError> {
        let mut endpoint = self.guard.parse_and_validate_url(url).await?;
        let mut redirect_count = 0usize;

        loop {
            let mut request = self.client.request(method.clone(), endpoint.as_str());
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request.send().await.map_err(|error| {
                if error.is_timeout() {
                    SafeFetchError::Timeout {
                        url: redact_url(&endpoint),
                        timeout_ms: self.config.timeout_ms,
                    }
                } else {
                    SafeFetchError::Transport {
                        url: redact_url(&endpoint),
                        detail: error.without_url().to_string(),
                    }
                }
            })?;
            let status = response.status();
            if status.is_redirection() {
                if redirect_count >= self.config.max_redirects {
                    return Err(SafeFetchError::Redirect {
                        url: redact_url(&endpoint),
                        detail: format!(
                            "redirect count exceeded configured max_redirects={}",
                            self.config.max_redirects
                        ),
                    });
                }
                let next_url = redirect_target(&endpoint, &response)?;
                self.guard.validate_url(&next_url).await?;
                if !matches!(
                    status,
                    StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT
                ) {
                    method = Method::GET;
                    body = None;
                }
                debug!(
                    from = %redact_url(&endpoint),
                    to = %redact_url(&next_url),
                    "following redirect"
                );
                endpoint = next_url;
                redirect_count = redirect_count.saturating_add(1);
                continue;
            }
            if !status.is_success() {
                return Err(SafeFetchError::HttpStatus {
                    url: redact_url(&endpoint),
                    status: status.as_u16(),
                });
            }

            if let Some(declared) = response.content_length() {
                if declared > max_bytes as u64 {
                    return Err(SafeFetchError::TooLarge {
                        url: redact_url(&endpoint),
                        limit: max_bytes,
                    });
                }
            }
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            let bytes = read_body_capped(response, &redact_url(&endpoint), max_bytes).await?;
            return Ok(FetchedContent {
                final_url: endpoint.to_string(),
                content_type,
                bytes,
            });
        }
    }
}

fn redirect_target(endpoint: &Url, response: &reqwest::Response) -> Result<Url, SafeFetchError> {
    let url = redact_url(endpoint);
    let location = response
        .headers()
        .get(reqwest::header::LOCATION)
        .ok_or_else(|| SafeFetchError::Redirect {
            url: url.clone(),
            detail: format!("status {} without Location header", response.status()),
        })?;
    let location = location.to_str().map_err(|error| SafeFetchError::Redirect {
        url: url.clone(),
        detail: format!("invalid Location header: {error}"),
    })?;
    endpoint.join(location).map_err(|error| SafeFetchError::Redirect {
        url,
        detail: format!(
            "location '{}' could not be resolved: {error}",
            redact_raw_url(location)
        ),
    })
}

async fn read_body_capped(
    response: reqwest::Response,
    url: &str,
    max_bytes: usize,
) -> Result<Vec<u8>, SafeFetchError> {
    let mut stream = response.bytes_stream();
    let mut collected = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|error| SafeFetchError::Transport {
            url: url.to_string(),
            detail: error.without_url().to_string(),
        })?;
        if collected.len().saturating_add(chunk.len()) > max_bytes {
            return Err(SafeFetchError::TooLarge {
                url: url.to_string(),
                limit: max_bytes,
            });
        }
        collected.extend_from_slice(&chunk);
    }
    Ok(collected)
}

fn parse_json_body(content: &FetchedContent) -> Result<Value, SafeFetchError> {
    serde_json::from_slice(&content.bytes).map_err(|error| SafeFetchError::InvalidJson {
        url: redact_raw_url(&content.final_url),
        detail: error.to_string(),
    })
}

/// Canonicalizes `candidate` and requires it to live beneath canonical `root`.
pub fn resolve_within_root(root: &Path, candidate: &Path) -> Result<PathBuf, SafeFetchError> {
    let canonical_root =
        std::fs::canonicalize(root).map_err(|source| SafeFetchError::LocalPathUnavailable {
            path: root.to_path_buf(),
            source,
        })?;
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        canonical_root.join(candidate)
    };
    let resolved =
        std::fs::canonicalize(&joined).map_err(|source| SafeFetchError::LocalPathUnavailable {
            path: joined.clone(),
            source,
        })?;
    if !resolved.starts_with(&canonical_root) {
        return Err(SafeFetchError::LocalPathOutsideRoot { path: joined });
    }
    Ok(resolved)
}
