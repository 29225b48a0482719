//! Durable sync-state storage + HTTP API client utilities for SOM.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use som_core::SyncState;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "som-storage";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("reading state file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing state file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("writing state file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("serializing sync state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// JSON file holding the changelog cursor and resource identifiers.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when the file does not exist yet.
    pub async fn load(&self) -> Result<Option<SyncState>, StateError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StateError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if text.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| StateError::Parse {
                path: self.path.clone(),
                source,
            })
    }

    /// Replace the state file atomically via a temp file and rename.
    pub async fn save(&self, state: &SyncState) -> Result<(), StateError> {
        let bytes = serde_json::to_vec_pretty(state)?;
        let write_err = |source| StateError::Write {
            path: self.path.clone(),
            source,
        };

        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).await.map_err(write_err)?;

        let temp_path = parent.join(format!(".{}.state.tmp", Uuid::new_v4()));
        let result = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await?;
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, &self.path).await
        }
        .await;

        if let Err(err) = result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(write_err(err));
        }
        debug!(path = %self.path.display(), cursor = %state.change_cursor, "sync state saved");
        Ok(())
    }
}

/// Statuses worth another attempt: provider quota (429) and server-side failures.
pub fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

pub fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Bounded exponential backoff inside one logical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based). A server `Retry-After` wins but is still capped.
    pub fn delay(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        let doubled = 2u32
            .checked_pow(retry)
            .and_then(|factor| self.initial_delay.checked_mul(factor))
            .unwrap_or(self.max_delay);
        retry_after.unwrap_or(doubled).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub bearer_token: Option<String>,
    pub retry: RetryPolicy,
    /// Client-side pacing for providers with per-minute quotas.
    pub requests_per_minute: Option<u32>,
}

impl Default for ApiClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(200),
            user_agent: None,
            bearer_token: None,
            retry: RetryPolicy::default(),
            requests_per_minute: None,
        }
    }
}

/// Spaces requests evenly: each caller reserves the next free slot and sleeps until it.
#[derive(Debug)]
pub struct RequestPacer {
    spacing: Duration,
    next_slot: Mutex<Instant>,
}

impl RequestPacer {
    pub fn per_minute(requests: u32) -> Self {
        Self {
            spacing: Duration::from_secs(60) / requests.max(1),
            next_slot: Mutex::new(Instant::now()),
        }
    }

    pub fn spacing(&self) -> Duration {
        self.spacing
    }

    pub async fn wait_turn(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let slot = (*next).max(Instant::now());
            *next = slot + self.spacing;
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(err) => is_transient_error(err),
            Self::Status { status, .. } => {
                StatusCode::from_u16(*status).is_ok_and(is_transient_status)
            }
            Self::Decode { .. } => false,
        }
    }
}

enum Attempt {
    Done(ApiResponse),
    Retry {
        error: FetchError,
        retry_after: Option<Duration>,
    },
    Fail(FetchError),
}

/// GET-only API client with bearer auth, bounded retries and optional request pacing.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    bearer_token: Option<String>,
    pacer: Option<Arc<RequestPacer>>,
    retry: RetryPolicy,
}

impl ApiClient {
    pub fn new(config: ApiClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(agent) = config.user_agent {
            builder = builder.user_agent(agent);
        }

        Ok(Self {
            http: builder.build().context("building http client")?,
            bearer_token: config.bearer_token,
            pacer: config
                .requests_per_minute
                .map(|n| Arc::new(RequestPacer::per_minute(n))),
            retry: config.retry,
        })
    }

    pub async fn get_bytes(&self, url: &Url) -> Result<ApiResponse, FetchError> {
        let span = info_span!("http_get", url = %url);
        self.get_with_retries(url).instrument(span).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &Url) -> Result<T, FetchError> {
        let response = self.get_bytes(url).await?;
        serde_json::from_slice(&response.body).map_err(|source| FetchError::Decode {
            url: response.url,
            source,
        })
    }

    async fn get_with_retries(&self, url: &Url) -> Result<ApiResponse, FetchError> {
        let mut retry = 0;
        loop {
            match self.attempt(url).await {
                Attempt::Done(response) => return Ok(response),
                Attempt::Fail(error) => return Err(error),
                Attempt::Retry { error, .. } if retry >= self.retry.max_retries => return Err(error),
                Attempt::Retry { error, retry_after } => {
                    let delay = self.retry.delay(retry, retry_after);
                    warn!(%error, retry, ?delay, "transient failure, backing off");
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
            }
        }
    }

    async fn attempt(&self, url: &Url) -> Attempt {
        if let Some(pacer) = &self.pacer {
            pacer.wait_turn().await;
        }
        let mut request = self.http.get(url.clone());
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) if is_transient_error(&err) => {
                return Attempt::Retry {
                    error: err.into(),
                    retry_after: None,
                }
            }
            Err(err) => return Attempt::Fail(err.into()),
        };

        let status = response.status();
        let final_url = response.url().to_string();
        if status.is_success() {
            return match response.bytes().await {
                Ok(body) => {
                    debug!(%status, bytes = body.len(), "response received");
                    Attempt::Done(ApiResponse {
                        url: final_url,
                        body: body.to_vec(),
                    })
                }
                Err(err) => Attempt::Fail(err.into()),
            };
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();
        let error = FetchError::Status {
            status: status.as_u16(),
            url: final_url,
            body: body.chars().take(512).collect(),
        };
        if is_transient_status(status) {
            Attempt::Retry { error, retry_after }
        } else {
            Attempt::Fail(error)
        }
    }
}
