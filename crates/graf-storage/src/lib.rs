//! Raw download storage, freshness records, and the HTTP/LLM clients.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use graf_core::DownloadRecord;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn, Instrument};
use uuid::Uuid;

/// Name of this crate, used as a stable identifier in diagnostics.
pub const CRATE_NAME: &str = "graf-storage";

const LAST_DOWNLOAD_FILE: &str = "last_download.json";
const LATEST_LINK: &str = "latest";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Filesystem store for raw downloads.
///
/// Every fetch lands in `<root>/<source_id>/[<action>/]<YYYYMMDD_HHMMSS>/`
/// with a `latest` pointer and a `last_download.json` freshness record kept
/// in the parent of the timestamped directory.
#[derive(Debug, Clone)]
pub struct RawDataStore {
    root: PathBuf,
}

/// A freshly-created fetch directory, handed to a format fetcher to fill.
#[derive(Debug, Clone)]
pub struct FetchDir {
    pub path: PathBuf,
    pub source_root: PathBuf,
    pub timestamp: DateTime<Utc>,
    pub stamp: String,
    /// False when the platform refused a symlink; `finalize_fetch` then
    /// materializes `latest` as a directory copy.
    pub latest_is_symlink: bool,
}

impl RawDataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        RawDataStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn source_root(&self, source_id: &str, action: Option<&str>) -> PathBuf {
        match action {
            Some(action) => self.root.join(source_id).join(action),
            None => self.root.join(source_id),
        }
    }

    /// Source directories directly under the store root, sorted by name.
    pub fn list_source_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(_) => return dirs,
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if entry.path().is_dir() && !name.starts_with('.') {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        dirs
    }

    /// Creates the timestamped directory for a new fetch and repoints the
    /// `latest` marker at it.
    pub async fn create_fetch_dir(
        &self,
        source_id: &str,
        action: Option<&str>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<FetchDir> {
        let source_root = self.source_root(source_id, action);
        let stamp = now.format(TIMESTAMP_FORMAT).to_string();
        let path = source_root.join(&stamp);
        tokio::fs::create_dir_all(&path)
            .await
            .with_context(|| format!("creating fetch directory {}", path.display()))?;

        let latest = source_root.join(LATEST_LINK);
        remove_existing_latest(&latest).await?;
        let latest_is_symlink = match make_symlink(Path::new(&stamp), &latest).await {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    error = %err,
                    link = %latest.display(),
                    "symlink unavailable, latest will be materialized as a copy"
                );
                false
            }
        };

        Ok(FetchDir {
            path,
            source_root,
            timestamp: now,
            stamp,
            latest_is_symlink,
        })
    }

    /// Records a completed fetch: writes the freshness record and, where the
    /// `latest` symlink could not be created, copies the fetch directory into
    /// a plain `latest` directory.
    pub async fn finalize_fetch(
        &self,
        fetch: &FetchDir,
        record: &DownloadRecord,
    ) -> anyhow::Result<()> {
        let record_path = fetch.source_root.join(LAST_DOWNLOAD_FILE);
        write_json_atomic(&record_path, record).await?;
        if !fetch.latest_is_symlink {
            let latest = fetch.source_root.join(LATEST_LINK);
            copy_dir_recursive(&fetch.path, &latest)
                .with_context(|| format!("materializing {}", latest.display()))?;
        }
        debug!(directory = %fetch.path.display(), "fetch finalized");
        Ok(())
    }
}

async fn remove_existing_latest(latest: &Path) -> anyhow::Result<()> {
    let meta = match tokio::fs::symlink_metadata(latest).await {
        Ok(meta) => meta,
        Err(_) => return Ok(()),
    };
    if meta.file_type().is_symlink() || !meta.is_dir() {
        tokio::fs::remove_file(latest)
            .await
            .with_context(|| format!("removing {}", latest.display()))?;
    } else {
        tokio::fs::remove_dir_all(latest)
            .await
            .with_context(|| format!("removing {}", latest.display()))?;
    }
    Ok(())
}

#[cfg(unix)]
async fn make_symlink(original: &Path, link: &Path) -> std::io::Result<()> {
    tokio::fs::symlink(original, link).await
}

#[cfg(not(unix))]
async fn make_symlink(_original: &Path, _link: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "symlinks are not supported on this platform",
    ))
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// True for `YYYYMMDD_HHMMSS` directory names.
pub fn looks_like_stamp(name: &str) -> bool {
    name.len() == 15
        && name.as_bytes()[8] == b'_'
        && name
            .bytes()
            .enumerate()
            .all(|(i, b)| i == 8 || b.is_ascii_digit())
}

/// Newest fetch directory under a source root: the `latest` pointer when it
/// resolves, else the lexicographically last timestamp-named subdirectory.
pub fn resolve_latest_dir(source_root: &Path) -> Option<PathBuf> {
    let latest = source_root.join(LATEST_LINK);
    if let Ok(target) = std::fs::read_link(&latest) {
        let resolved = if target.is_absolute() {
            target
        } else {
            source_root.join(target)
        };
        if resolved.is_dir() {
            return Some(resolved);
        }
    } else if latest.is_dir() {
        return Some(latest);
    }
    let mut stamps: Vec<PathBuf> = std::fs::read_dir(source_root)
        .ok()?
        .flatten()
        .filter(|entry| entry.path().is_dir())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .map(looks_like_stamp)
                .unwrap_or(false)
        })
        .map(|entry| entry.path())
        .collect();
    stamps.sort();
    stamps.pop()
}

/// Reads the freshness record under a source (or source/action) root.
pub fn read_download_record(source_root: &Path) -> Option<DownloadRecord> {
    let bytes = std::fs::read(source_root.join(LAST_DOWNLOAD_FILE)).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// True when the last recorded download is at most `max_age_days` old.
/// Absent or unreadable records count as stale.
pub fn is_fresh(source_root: &Path, max_age_days: i64, now: DateTime<Utc>) -> bool {
    match read_download_record(source_root) {
        Some(record) => record.age_days(now) <= max_age_days as f64,
        None => false,
    }
}

/// Writes bytes to a temporary sibling and renames it into place, so a
/// partially-written file is never observable at the final path.
pub async fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path {} has no parent directory", path.display()))?;
    tokio::fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating {}", parent.display()))?;
    let tmp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&tmp_path)
        .await
        .with_context(|| format!("creating {}", tmp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing {}", tmp_path.display()))?;
    file.flush().await?;
    drop(file);
    tokio::fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("renaming {} into place", path.display()))?;
    Ok(())
}

pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing {}", path.display()))?;
    write_bytes_atomic(path, &bytes).await
}

/// Whether a failed request is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    Fatal,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::Fatal
    }
}

pub fn classify_request_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::Fatal
    }
}

/// Walks the error chain looking for a TLS certificate-verification failure.
pub fn is_certificate_error(err: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(current) = source {
        let text = current.to_string().to_ascii_lowercase();
        if text.contains("certificate") || text.contains("unknownissuer") {
            return true;
        }
        source = current.source();
    }
    false
}

/// Exponential backoff shared by the HTTP and LLM clients.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retrying after `attempt` (zero-based) has failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub user_agent: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        HttpClientConfig {
            user_agent: "graf-bot/0.1 (+https://example.org/graf)".to_string(),
            timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl HttpClientConfig {
    pub fn from_graf(config: &graf_core::GrafConfig) -> Self {
        HttpClientConfig {
            user_agent: config.user_agent.clone(),
            timeout: Duration::from_secs(config.http_timeout_secs),
            backoff: BackoffPolicy {
                max_retries: config.http_retries,
                ..BackoffPolicy::default()
            },
        }
    }
}

/// Per-request TLS stance. `SkipVerify` uses the certificate-ignoring client
/// from the first attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslPolicy {
    #[default]
    Verify,
    SkipVerify,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub final_url: String,
    pub body: Vec<u8>,
    /// False when the body was fetched with certificate verification off.
    pub ssl_verified: bool,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("fetch failed with status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response was not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("retries exhausted fetching {url}")]
    Exhausted { url: String },
}

/// Retrying HTTP downloader with a certificate-verifying client and a
/// verification-skipping fallback client.
pub struct HttpFetcher {
    config: HttpClientConfig,
    client: reqwest::Client,
    insecure_client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()?;
        let insecure_client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(HttpFetcher {
            config,
            client,
            insecure_client,
        })
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.config.backoff
    }

    pub async fn fetch_bytes(
        &self,
        source_id: &str,
        url: &str,
        ssl: SslPolicy,
    ) -> Result<FetchedResponse, FetchError> {
        let span = tracing::info_span!("http_fetch", source_id, url);
        self.fetch_bytes_inner(url, ssl).instrument(span).await
    }

    pub async fn fetch_json(
        &self,
        source_id: &str,
        url: &str,
        ssl: SslPolicy,
    ) -> Result<serde_json::Value, FetchError> {
        let response = self.fetch_bytes(source_id, url, ssl).await?;
        Ok(serde_json::from_slice(&response.body)?)
    }

    async fn fetch_bytes_inner(
        &self,
        url: &str,
        ssl: SslPolicy,
    ) -> Result<FetchedResponse, FetchError> {
        let max_retries = self.config.backoff.max_retries;
        let mut use_insecure = matches!(ssl, SslPolicy::SkipVerify);
        let mut last_error: Option<FetchError> = None;

        for attempt in 0..=max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt - 1)).await;
            }
            let client = if use_insecure {
                &self.insecure_client
            } else {
                &self.client
            };
            match client.get(url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let final_url = response.url().to_string();
                        let body = response.bytes().await?;
                        return Ok(FetchedResponse {
                            status: status.as_u16(),
                            final_url,
                            body: body.to_vec(),
                            ssl_verified: !use_insecure,
                        });
                    }
                    warn!(%status, attempt, url, "fetch returned error status");
                    let disposition = classify_status(status);
                    last_error = Some(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                    });
                    if disposition == RetryDisposition::Fatal {
                        break;
                    }
                }
                Err(err) => {
                    if !use_insecure
                        && max_retries > 0
                        && attempt + 1 >= max_retries
                        && is_certificate_error(&err)
                    {
                        warn!(
                            attempt,
                            url, "certificate verification failed, retrying without verification"
                        );
                        use_insecure = true;
                        last_error = Some(FetchError::Request(err));
                        continue;
                    }
                    warn!(error = %err, attempt, url, "fetch attempt failed");
                    let disposition = classify_request_error(&err);
                    last_error = Some(FetchError::Request(err));
                    if disposition == RetryDisposition::Fatal {
                        break;
                    }
                }
            }
        }
        Err(last_error.unwrap_or(FetchError::Exhausted {
            url: url.to_string(),
        }))
    }
}

/// Chat-completion configuration, read from the environment at construction.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub api_url: String,
    pub model: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl LlmConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY is not set"))?;
        if api_key.trim().is_empty() {
            bail!("OPENAI_API_KEY is empty");
        }
        let api_url = std::env::var("LLM_API_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1/chat/completions".to_string());
        let model = std::env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let timeout = std::env::var("LLM_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(180));
        Ok(LlmConfig {
            api_key,
            api_url,
            model,
            timeout,
            backoff: BackoffPolicy::default(),
        })
    }
}

/// One chat completion ask: an optional system message plus the user prompt.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system: Option<String>,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Overrides the client's default model when set.
    pub model: Option<String>,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("llm returned status {status}: {detail}")]
    Api { status: u16, detail: String },
    #[error("llm response carried no content")]
    EmptyResponse,
    #[error("llm retries exhausted")]
    Exhausted,
}

/// Seam for the pipelines: production code talks to [`LlmClient`], tests
/// inject canned completions.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<String, LlmError>;
}

#[derive(Serialize)]
struct ChatWireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatWireRequest<'a> {
    model: &'a str,
    messages: Vec<ChatWireMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatWireResponse {
    choices: Vec<ChatWireChoice>,
}

#[derive(Deserialize)]
struct ChatWireChoice {
    message: ChatWireChoiceMessage,
}

#[derive(Deserialize)]
struct ChatWireChoiceMessage {
    content: Option<String>,
}

/// OpenAI-compatible chat-completions client. Retries 429s, 5xx and
/// transport failures with backoff; other 4xx fail fast.
pub struct LlmClient {
    config: LlmConfig,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(LlmClient { config, client })
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let config = LlmConfig::from_env()?;
        LlmClient::new(config).map_err(|e| anyhow!("building llm client: {e}"))
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }
}

#[async_trait]
impl ChatModel for LlmClient {
    async fn complete(&self, request: &ChatRequest) -> Result<String, LlmError> {
        let model = request.model.as_deref().unwrap_or(&self.config.model);
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system {
            messages.push(ChatWireMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatWireMessage {
            role: "user",
            content: &request.user,
        });
        let wire = ChatWireRequest {
            model,
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let max_retries = self.config.backoff.max_retries;
        let mut last_error: Option<LlmError> = None;
        for attempt in 0..=max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt - 1)).await;
            }
            let sent = self
                .client
                .post(&self.config.api_url)
                .bearer_auth(&self.config.api_key)
                .json(&wire)
                .send()
                .await;
            match sent {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let parsed: ChatWireResponse = response.json().await?;
                        let content = parsed
                            .choices
                            .into_iter()
                            .next()
                            .and_then(|c| c.message.content)
                            .filter(|c| !c.trim().is_empty());
                        return content.ok_or(LlmError::EmptyResponse);
                    }
                    let detail: String = response
                        .text()
                        .await
                        .unwrap_or_default()
                        .chars()
                        .take(300)
                        .collect();
                    let error = LlmError::Api {
                        status: status.as_u16(),
                        detail,
                    };
                    if classify_status(status) == RetryDisposition::Fatal {
                        return Err(error);
                    }
                    warn!(%status, attempt, "llm request rejected, will retry");
                    last_error = Some(error);
                }
                Err(err) => {
                    if classify_request_error(&err) == RetryDisposition::Fatal {
                        return Err(LlmError::Request(err));
                    }
                    warn!(error = %err, attempt, "llm request failed, will retry");
                    last_error = Some(LlmError::Request(err));
                }
            }
        }
        Err(last_error.unwrap_or(LlmError::Exhausted))
    }
}

/// Strips a Markdown code fence (``` or ```json) wrapping a model reply.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let body = if let Some(rest) = trimmed.strip_prefix("```json") {
        rest
    } else if let Some(rest) = trimmed.strip_prefix("```") {
        rest
    } else {
        trimmed
    };
    body.strip_suffix("```").unwrap_or(body).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(8));
    }

    #[test]
    fn stamp_names_are_recognized() {
        assert!(looks_like_stamp("20250102_030405"));
        assert!(!looks_like_stamp("latest"));
        assert!(!looks_like_stamp("20250102-030405"));
        assert!(!looks_like_stamp("2025010_0304056"));
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("record.json");
        write_json_atomic(&path, &serde_json::json!({"ok": true}))
            .await
            .unwrap();
        let bytes = std::fs::read(&path).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["ok"], true);
        let names: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["record.json"]);
    }

    #[tokio::test]
    async fn fetch_dirs_repoint_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = RawDataStore::new(dir.path());
        let first_time = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        let first = store
            .create_fetch_dir("micinn", None, first_time)
            .await
            .unwrap();
        assert_eq!(first.stamp, "20250102_030405");
        assert!(first.path.is_dir());
        assert_eq!(
            resolve_latest_dir(&first.source_root).unwrap(),
            first.path
        );

        let second_time = Utc.with_ymd_and_hms(2025, 2, 3, 4, 5, 6).unwrap();
        let second = store
            .create_fetch_dir("micinn", None, second_time)
            .await
            .unwrap();
        assert_eq!(
            resolve_latest_dir(&second.source_root).unwrap(),
            second.path
        );
    }

    #[tokio::test]
    async fn latest_fallback_uses_newest_stamp() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("source");
        std::fs::create_dir_all(root.join("20250101_000000")).unwrap();
        std::fs::create_dir_all(root.join("20250301_000000")).unwrap();
        std::fs::create_dir_all(root.join("notes")).unwrap();
        assert_eq!(
            resolve_latest_dir(&root).unwrap(),
            root.join("20250301_000000")
        );
    }

    #[tokio::test]
    async fn freshness_respects_max_age() {
        let dir = tempfile::tempdir().unwrap();
        let store = RawDataStore::new(dir.path());
        let now = Utc.with_ymd_and_hms(2025, 6, 10, 12, 0, 0).unwrap();
        let fetched_at = Utc.with_ymd_and_hms(2025, 6, 7, 12, 0, 0).unwrap();
        let fetch = store
            .create_fetch_dir("aei", None, fetched_at)
            .await
            .unwrap();
        let record = DownloadRecord {
            timestamp: fetched_at,
            directory: fetch.stamp.clone(),
            source_id: "aei".to_string(),
            status: "success".to_string(),
            action: None,
        };
        store.finalize_fetch(&fetch, &record).await.unwrap();

        assert!(is_fresh(&fetch.source_root, 7, now));
        assert!(!is_fresh(&fetch.source_root, 2, now));
        assert!(!is_fresh(dir.path().join("absent").as_path(), 7, now));
    }

    #[tokio::test]
    async fn corrupt_freshness_record_counts_as_stale() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("last_download.json"), b"{not json").unwrap();
        assert!(!is_fresh(dir.path(), 7, Utc::now()));
    }

    #[test]
    fn code_fences_are_stripped() {
        assert_eq!(strip_code_fences("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_code_fences("```\n[]\n```"), "[]");
        assert_eq!(strip_code_fences("  {\"a\": 1} "), "{\"a\": 1}");
    }
}
