//! Resumable, hash-verified transfers against the artifact store.
//!
//! Endpoints:
//! - `HEAD /files/{id}`: size in `Content-Length`, SHA-256 hex in `ETag`
//! - `GET /files/{id}`: body, honoring `Range: bytes={start}-`
//! - `POST /files`: multipart upload, part name `file`

use crate::config::DataBankConfig;
use futures::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, RANGE};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("range not satisfiable: {0}")]
    RangeNotSatisfiable(String),

    #[error("insufficient storage: {0}")]
    InsufficientStorage(String),

    /// Downloaded bytes do not match the size or hash the store advertised.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("data bank client error: {0}")]
    Client(String),
}

pub type TransferResult<T> = std::result::Result<T, TransferError>;

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        Self::Client(format!("io error: {e}"))
    }
}

fn map_http_error(status: StatusCode, text: &str) -> TransferError {
    let msg = text.to_string();
    match status.as_u16() {
        400 => TransferError::BadRequest(msg),
        401 => TransferError::Unauthorized(msg),
        403 => TransferError::Forbidden(msg),
        404 => TransferError::NotFound(msg),
        416 => TransferError::RangeNotSatisfiable(msg),
        507 => TransferError::InsufficientStorage(msg),
        code => TransferError::Client(format!("HTTP {code}: {text}")),
    }
}

/// Metadata returned by `HEAD /files/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadInfo {
    pub size: u64,
    /// SHA-256 hex digest, taken from the `ETag` header.
    pub sha256: String,
    pub content_type: String,
}

/// Body of a successful `POST /files`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    pub file_id: String,
    pub size: u64,
    pub sha256: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

fn default_content_type() -> String {
    "application/octet-stream".to_string()
}

#[derive(Debug, Clone, Copy)]
pub struct DownloadOptions<'a> {
    /// Continue from an existing partial file at the destination.
    pub resume: bool,
    /// Compare the SHA-256 of the finished file with the remote hash.
    pub verify_hash: bool,
    pub request_id: Option<&'a str>,
}

impl Default for DownloadOptions<'_> {
    fn default() -> Self {
        Self { resume: true, verify_hash: true, request_id: None }
    }
}

/// HTTP client for the artifact store.
#[derive(Debug, Clone)]
pub struct TransferClient {
    http: Client,
    base_url: String,
    api_key: String,
    retries: u32,
    backoff: Duration,
}

impl TransferClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        timeout: Duration,
        retries: u32,
        backoff: Duration,
    ) -> TransferResult<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransferError::Client(format!("failed to build http client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            retries,
            backoff,
        })
    }

    pub fn from_config(cfg: &DataBankConfig) -> TransferResult<Self> {
        Self::new(&cfg.url, &cfg.api_key, cfg.timeout(), cfg.retries, cfg.backoff())
    }

    fn file_url(&self, file_id: &str) -> String {
        format!("{}/files/{}", self.base_url, file_id)
    }

    fn with_headers(&self, builder: RequestBuilder, request_id: Option<&str>) -> RequestBuilder {
        let builder = builder.header("X-API-Key", &self.api_key);
        match request_id {
            Some(id) => builder.header("X-Request-ID", id),
            None => builder,
        }
    }

    /// Send an idempotent request, retrying 5xx responses and transport
    /// errors up to `retries` times with linear backoff.
    async fn send_idempotent<F>(&self, op: &str, build: F) -> TransferResult<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt: u32 = 0;
        loop {
            match build().send().await {
                Ok(resp) if resp.status().is_server_error() && attempt < self.retries => {
                    attempt += 1;
                    warn!(op, status = %resp.status(), attempt, "data bank server error, retrying");
                    tokio::time::sleep(self.backoff * attempt).await;
                }
                Ok(resp) => return Ok(resp),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    warn!(op, error = %e, attempt, "data bank transport error, retrying");
                    tokio::time::sleep(self.backoff * attempt).await;
                }
                Err(e) => return Err(TransferError::Client(format!("transport error: {e}"))),
            }
        }
    }

    async fn check(resp: Response) -> TransferResult<Response> {
        let status = resp.status();
        if status.is_client_error() || status.is_server_error() {
            let text = resp.text().await.unwrap_or_default();
            return Err(map_http_error(status, &text));
        }
        Ok(resp)
    }

    pub async fn head(&self, file_id: &str, request_id: Option<&str>) -> TransferResult<HeadInfo> {
        let url = self.file_url(file_id);
        let resp = self
            .send_idempotent("head", || self.with_headers(self.http.head(&url), request_id))
            .await?;
        let resp = Self::check(resp).await?;

        let header = |name: reqwest::header::HeaderName| resp.headers().get(name).and_then(|v| v.to_str().ok());
        let size = match header(CONTENT_LENGTH) {
            Some(raw) => raw.trim().parse::<u64>().map_err(|e| {
                TransferError::Client(format!("invalid content-length {raw:?}: {e}"))
            })?,
            None => 0,
        };
        let sha256 = header(ETAG).map(|e| e.trim_matches('"').to_string()).unwrap_or_default();
        let content_type =
            header(CONTENT_TYPE).map_or_else(default_content_type, ToString::to_string);

        Ok(HeadInfo { size, sha256, content_type })
    }

    /// Download `file_id` to `dest`.
    ///
    /// With `resume`, an existing file at `dest` smaller than the remote is
    /// continued with a ranged request; one of equal size is only verified;
    /// a larger one is rejected with [`TransferError::RangeNotSatisfiable`]
    /// and left untouched.
    pub async fn download_to_path(
        &self,
        file_id: &str,
        dest: &Path,
        opts: DownloadOptions<'_>,
    ) -> TransferResult<HeadInfo> {
        let head = self.head(file_id, opts.request_id).await?;
        let local_len = if opts.resume {
            match tokio::fs::metadata(dest).await {
                Ok(meta) => Some(meta.len()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(e.into()),
            }
        } else {
            None
        };
        let start = local_len.unwrap_or(0);

        if start > head.size {
            return Err(TransferError::RangeNotSatisfiable(format!(
                "local file larger than remote ({start} > {})",
                head.size
            )));
        }
        if local_len == Some(head.size) {
            debug!(file_id, size = head.size, "local copy complete, skipping download");
            if opts.verify_hash {
                verify_file_hash(dest, &head.sha256).await?;
            }
            return Ok(head);
        }

        let url = self.file_url(file_id);
        let resp = self
            .send_idempotent("download", || {
                let builder = self.with_headers(self.http.get(&url), opts.request_id);
                if start > 0 { builder.header(RANGE, format!("bytes={start}-")) } else { builder }
            })
            .await?;
        let resp = Self::check(resp).await?;

        let append = start > 0 && resp.status() == StatusCode::PARTIAL_CONTENT;
        if start > 0 && !append {
            warn!(file_id, start, status = %resp.status(), "range ignored by server, restarting download");
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = if append {
            tokio::fs::OpenOptions::new().append(true).open(dest).await?
        } else {
            tokio::fs::File::create(dest).await?
        };

        let mut written: u64 = 0;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| TransferError::Client(format!("transport error: {e}")))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);

        info!(file_id, resumed_from = start, bytes = written, "download finished");
        if opts.verify_hash {
            verify_file_hash(dest, &head.sha256).await?;
        }
        Ok(head)
    }

    /// Upload a stream of `size` bytes as a single multipart POST.
    ///
    /// Never retried: the request body cannot be replayed.
    pub async fn upload<R>(
        &self,
        reader: R,
        size: u64,
        filename: &str,
        content_type: &str,
        request_id: Option<&str>,
    ) -> TransferResult<UploadResult>
    where
        R: AsyncRead + Send + Sync + 'static,
    {
        let body = reqwest::Body::wrap_stream(ReaderStream::new(reader));
        let part = Part::stream_with_length(body, size)
            .file_name(filename.to_string())
            .mime_str(content_type)
            .map_err(|e| TransferError::BadRequest(format!("invalid content type: {e}")))?;
        let form = Form::new().part("file", part);

        let url = format!("{}/files", self.base_url);
        let resp = self
            .with_headers(self.http.post(&url), request_id)
            .multipart(form)
            .send()
            .await
            .map_err(|e| TransferError::Client(format!("transport error: {e}")))?;
        let resp = Self::check(resp).await?;

        let result: UploadResult = resp
            .json()
            .await
            .map_err(|e| TransferError::Client(format!("invalid upload response: {e}")))?;
        if result.file_id.trim().is_empty() {
            return Err(TransferError::Client("upload response missing file_id".to_string()));
        }
        info!(file_id = %result.file_id, size = result.size, filename, "upload finished");
        Ok(result)
    }

    /// Upload a local file.
    pub async fn upload_file(
        &self,
        path: &Path,
        filename: &str,
        content_type: &str,
        request_id: Option<&str>,
    ) -> TransferResult<UploadResult> {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        self.upload(file, size, filename, content_type, request_id).await
    }
}

async fn verify_file_hash(path: &Path, expected: &str) -> TransferResult<()> {
    let owned: PathBuf = path.to_path_buf();
    let actual = tokio::task::spawn_blocking(move || model_trainer_training::sha256_file(&owned))
        .await
        .map_err(|e| TransferError::Client(format!("hash task failed: {e}")))?
        .map_err(|e| TransferError::Client(format!("failed to hash {}: {e}", path.display())))?;
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        return Err(TransferError::Integrity(
            "downloaded file hash does not match ETag".to_string(),
        ));
    }
    Ok(())
}
