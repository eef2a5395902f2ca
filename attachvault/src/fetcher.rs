//! fetcher.rs — C7: parallel HTTP GET of encrypted attachments into a
//! scratch file, with per-part retry.
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bots::retry::{retry, Outcome, RetryPolicy};
use crate::error::{Result, VaultError};

/// One part to fetch: its source URL, the byte offset to write it at in the
/// scratch file, and its expected on-wire size.
#[derive(Debug, Clone)]
pub struct FetchPlan {
    pub part_id: i64,
    pub url: String,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct FetchProgress {
    pub completed_parts: u32,
    pub total_parts: u32,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub percent: f64,
}

pub struct PartFetcher {
    client: reqwest::Client,
    concurrency: usize,
    retry_policy: RetryPolicy,
}

impl PartFetcher {
    pub fn new(http_timeout_s: u64, download_concurrency: usize, download_retries: u32, download_retry_base_s: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(http_timeout_s))
            .pool_max_idle_per_host(10)
            .build()?;
        Ok(PartFetcher {
            client,
            concurrency: download_concurrency.max(1),
            retry_policy: RetryPolicy::new(download_retries.max(1), download_retry_base_s),
        })
    }

    /// Writes every plan's ciphertext into `scratch_path` at its given
    /// offset. The file must already exist and be sized to fit the largest
    /// `offset + size`.
    pub async fn fetch_all(
        &self,
        plans: &[FetchPlan],
        scratch_path: &Path,
        token: &CancellationToken,
        progress: Option<mpsc::UnboundedSender<FetchProgress>>,
    ) -> Result<()> {
        let total_parts = plans.len() as u32;
        let total_bytes: u64 = plans.iter().map(|p| p.size).sum();
        let completed = Arc::new(AtomicU32::new(0));
        let bytes_done = Arc::new(AtomicU64::new(0));

        let results: Vec<Result<()>> = stream::iter(plans.iter().cloned())
            .map(|plan| {
                let client = self.client.clone();
                let policy = self.retry_policy;
                let token = token.clone();
                let scratch_path = scratch_path.to_path_buf();
                let completed = Arc::clone(&completed);
                let bytes_done = Arc::clone(&bytes_done);
                let progress = progress.clone();
                async move {
                    if token.is_cancelled() {
                        return Err(VaultError::Cancelled);
                    }
                    let bytes = retry(&policy, &token, || {
                        let client = client.clone();
                        let url = plan.url.clone();
                        async move { fetch_one(&client, &url).await }
                    })
                    .await?;

                    write_at(&scratch_path, plan.offset, &bytes).await?;

                    let n_completed = completed.fetch_add(1, Ordering::SeqCst) + 1;
                    let n_bytes = bytes_done.fetch_add(bytes.len() as u64, Ordering::SeqCst) + bytes.len() as u64;
                    if let Some(tx) = &progress {
                        let _ = tx.send(FetchProgress {
                            completed_parts: n_completed,
                            total_parts,
                            bytes_downloaded: n_bytes,
                            total_bytes,
                            percent: if total_bytes == 0 { 100.0 } else { n_bytes as f64 / total_bytes as f64 * 100.0 },
                        });
                    }
                    Ok(())
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for r in results {
            r?;
        }
        Ok(())
    }
}

async fn fetch_one(client: &reqwest::Client, url: &str) -> Outcome<bytes::Bytes> {
    match client.get(url).send().await {
        Ok(resp) if resp.status().is_success() => match resp.bytes().await {
            Ok(b) => Outcome::Done(b),
            Err(e) => Outcome::Retry(e.into()),
        },
        Ok(resp) => {
            let status = resp.status().as_u16();
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            match crate::error::classify_status(status, retry_after) {
                crate::error::Retryability::Retryable => Outcome::Retry(VaultError::TransferFailed(format!("HTTP {status}"))),
                crate::error::Retryability::RetryableAfter(after) => {
                    Outcome::RetryAfter(VaultError::RateLimited { retry_after_s: after, context: url.to_string() }, after)
                }
                crate::error::Retryability::Fatal => Outcome::Fatal(VaultError::SourceDataMissing(format!("HTTP {status} fetching {url}"))),
            }
        }
        Err(e) => Outcome::Retry(e.into()),
    }
}

async fn write_at(path: &Path, offset: u64, data: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .map_err(|e| VaultError::Internal(format!("opening scratch file: {e}")))?;
    file.seek(std::io::SeekFrom::Start(offset))
        .await
        .map_err(|e| VaultError::Internal(format!("seeking scratch file: {e}")))?;
    file.write_all(data)
        .await
        .map_err(|e| VaultError::Internal(format!("writing scratch file: {e}")))?;
    Ok(())
}
