//! Retrying HTTP helpers shared by the census and postal clients.
//!
//! Remote calls are retried with bounded exponential backoff, but only when
//! the failure is a transport or service error (`reqwest::Error`, which
//! includes non-2xx statuses via `error_for_status`). Anything else - parse
//! failures, disk errors - returns immediately. Downloaded bodies are
//! streamed chunk-by-chunk into a named temp file that is deleted when the
//! handle drops, on every exit path.

use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures::StreamExt;
use reqwest::{Client, Response, multipart};
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Maximum attempts per remote call.
pub const MAX_RETRIES: u32 = 3;
/// Maximum cumulative wall-clock time spent retrying one call.
pub const MAX_RETRY_TIME: Duration = Duration::from_secs(60);

const BACKOFF_BASE_MS: u64 = 500;

/// Run `call` until it succeeds, the attempt budget is spent, or it fails
/// with a non-transport error.
async fn with_retry<T, F, Fut>(what: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let mut attempt: u32 = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                let transient = err.downcast_ref::<reqwest::Error>().is_some();
                if !transient {
                    return Err(err);
                }
                if attempt >= MAX_RETRIES || started.elapsed() >= MAX_RETRY_TIME {
                    return Err(err.context(format!(
                        "{what} failed after {attempt} attempt(s) in {:?}",
                        started.elapsed()
                    )));
                }
                let delay = Duration::from_millis(BACKOFF_BASE_MS * (1 << attempt));
                warn!(
                    "{what} attempt {attempt}/{MAX_RETRIES} failed, retrying in {delay:?}: {err:#}"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// GET a JSON payload.
///
/// The request and body read are retried; deserialization happens once, after
/// a successful download, so a malformed payload is never re-fetched.
pub async fn get_json<T: DeserializeOwned>(
    client: &Client,
    url: &str,
    params: &[(&str, &str)],
) -> Result<T> {
    let bytes = with_retry("GET", || async move {
        let response = client
            .get(url)
            .query(params)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.bytes().await?)
    })
    .await?;

    serde_json::from_slice(&bytes).with_context(|| format!("unexpected JSON payload from {url}"))
}

/// Download `url` into a scoped temp file.
pub async fn get_and_download_file(client: &Client, url: &str) -> Result<NamedTempFile> {
    debug!("Downloading {url}");
    with_retry("download", || async move {
        let response = client.get(url).send().await?.error_for_status()?;
        stream_to_tempfile(response).await
    })
    .await
}

/// POST a single-file multipart upload and download the response body into a
/// scoped temp file. The form is rebuilt for every attempt.
pub async fn post_and_download_file(
    client: &Client,
    url: &str,
    params: &[(&str, &str)],
    file_field: &str,
    file_name: &str,
    payload: &[u8],
) -> Result<NamedTempFile> {
    debug!("Uploading {} bytes to {url}", payload.len());
    with_retry("upload", || async move {
        let part = multipart::Part::bytes(payload.to_vec())
            .file_name(file_name.to_string())
            .mime_str("text/csv")?;
        let form = multipart::Form::new().part(file_field.to_string(), part);
        let response = client
            .post(url)
            .query(params)
            .multipart(form)
            .send()
            .await?
            .error_for_status()?;
        stream_to_tempfile(response).await
    })
    .await
}

async fn stream_to_tempfile(response: Response) -> Result<NamedTempFile> {
    let tmp = NamedTempFile::new().context("failed to create temp file")?;
    let mut out = tokio::fs::File::create(tmp.path())
        .await
        .context("failed to open temp file for writing")?;

    let mut total: u64 = 0;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        total += chunk.len() as u64;
        out.write_all(&chunk)
            .await
            .context("failed to write download chunk")?;
    }
    out.flush().await.context("failed to flush download")?;

    debug!("Saved {total} bytes to {}", tmp.path().display());
    Ok(tmp)
}
