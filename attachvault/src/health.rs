//! health.rs — C10: periodic/on-demand HEAD sweep that classifies part
//! health and proactively refreshes expired URLs.
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::bots::BotPool;
use crate::error::{classify_status, Result, Retryability};
use crate::index::models::{Part, PartHealth};
use crate::index::IndexStore;
use crate::resolver::{ResolveMode, UrlResolver};

#[derive(Debug, Default, Clone, Copy)]
pub struct HealthCounts {
    pub healthy: u32,
    pub url_refreshed: u32,
    pub unhealthy: u32,
    pub error: u32,
}

#[derive(Debug, Clone)]
pub struct PartHealthResult {
    pub part_id: i64,
    pub classification: PartHealth,
}

#[derive(Debug, Clone)]
pub struct HealthProgress {
    pub scanned: u32,
    pub total: u32,
    pub counts: HealthCounts,
}

pub struct HealthcheckEngine {
    pub index: Arc<IndexStore>,
    pub resolver: Option<Arc<UrlResolver>>,
    pub bots: Option<Arc<BotPool>>,
    client: reqwest::Client,
    head_concurrency: usize,
    refresh_concurrency: usize,
}

impl HealthcheckEngine {
    pub fn new(
        index: Arc<IndexStore>,
        resolver: Option<Arc<UrlResolver>>,
        bots: Option<Arc<BotPool>>,
        head_concurrency: usize,
        head_timeout_s: u64,
        refresh_concurrency: usize,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(head_timeout_s))
            .pool_max_idle_per_host(30)
            .build()?;
        Ok(HealthcheckEngine {
            index,
            resolver,
            bots,
            client,
            head_concurrency: head_concurrency.max(1),
            refresh_concurrency: refresh_concurrency.max(1),
        })
    }

    /// Two-pass sweep (spec §4.10). `resolve_pass` controls whether parts
    /// already known `unhealthy` skip straight to refresh+HEAD (pass 2) or
    /// whether a fresh HEAD is attempted first (pass 1).
    pub async fn sweep(
        &self,
        parts: &[Part],
        resolve_pass: bool,
        cancel: &CancellationToken,
        progress: Option<mpsc::UnboundedSender<HealthProgress>>,
    ) -> Result<(HealthCounts, Vec<PartHealthResult>)> {
        let refresh_sem = Arc::new(Semaphore::new(self.refresh_concurrency));
        let scanned = Arc::new(AtomicU32::new(0));
        let total = parts.len() as u32;

        let results: Vec<PartHealthResult> = stream::iter(parts.iter().cloned())
            .map(|part| {
                let client = self.client.clone();
                let refresh_sem = Arc::clone(&refresh_sem);
                let cancel = cancel.clone();
                let resolver = self.resolver.clone();
                let bots = self.bots.clone();
                let scanned = Arc::clone(&scanned);
                let progress = progress.clone();
                async move {
                    if cancel.is_cancelled() {
                        return PartHealthResult { part_id: part.id, classification: PartHealth::Error };
                    }
                    let classification = if resolve_pass && part.health == PartHealth::Unhealthy {
                        refresh_and_head(&client, &refresh_sem, resolver.as_ref(), bots.as_ref(), &part, &cancel).await
                    } else {
                        classify_one(&client, &refresh_sem, resolver.as_ref(), bots.as_ref(), &part, &cancel).await
                    };
                    scanned.fetch_add(1, Ordering::SeqCst);
                    if let Some(tx) = &progress {
                        let _ = tx.send(HealthProgress {
                            scanned: scanned.load(Ordering::SeqCst),
                            total,
                            counts: HealthCounts::default(),
                        });
                    }
                    PartHealthResult { part_id: part.id, classification }
                }
            })
            .buffer_unordered(self.head_concurrency)
            .collect()
            .await;

        let counts = tally(&results);

        for chunk in results.chunks(500) {
            for r in chunk {
                if let Err(e) = self.index.update_part_health(r.part_id, r.classification).await {
                    warn!("failed to persist health for part {}: {e}", r.part_id);
                }
            }
        }

        Ok((counts, results))
    }
}

fn tally(results: &[PartHealthResult]) -> HealthCounts {
    let mut counts = HealthCounts::default();
    for r in results {
        match r.classification {
            PartHealth::Healthy | PartHealth::UrlRefreshed => {
                counts.healthy += 1;
                if r.classification == PartHealth::UrlRefreshed {
                    counts.url_refreshed += 1;
                }
            }
            PartHealth::Unhealthy => counts.unhealthy += 1,
            PartHealth::Error => counts.error += 1,
            PartHealth::Unknown => {}
        }
    }
    counts
}

async fn classify_one(
    client: &reqwest::Client,
    refresh_sem: &Arc<Semaphore>,
    resolver: Option<&Arc<UrlResolver>>,
    bots: Option<&Arc<BotPool>>,
    part: &Part,
    cancel: &CancellationToken,
) -> PartHealth {
    match head_with_429_retry(client, &part.discord_url, 2).await {
        HeadOutcome::Ok => PartHealth::Healthy,
        HeadOutcome::RefreshCandidate => refresh_and_head(client, refresh_sem, resolver, bots, part, cancel).await,
        HeadOutcome::Unhealthy => PartHealth::Unhealthy,
        HeadOutcome::NetworkError => PartHealth::Error,
    }
}

async fn refresh_and_head(
    client: &reqwest::Client,
    refresh_sem: &Arc<Semaphore>,
    resolver: Option<&Arc<UrlResolver>>,
    bots: Option<&Arc<BotPool>>,
    part: &Part,
    cancel: &CancellationToken,
) -> PartHealth {
    let (Some(resolver), Some(_bots)) = (resolver, bots) else {
        return PartHealth::Unhealthy;
    };
    let Ok(_permit) = refresh_sem.acquire().await else {
        return PartHealth::Unhealthy;
    };

    let mut one = [part.clone()];
    if resolver.resolve(&mut one, ResolveMode::Graceful, cancel).await.is_err() {
        return PartHealth::Unhealthy;
    }
    let refreshed_url = &one[0].discord_url;

    match head_with_429_retry(client, refreshed_url, 0).await {
        HeadOutcome::Ok => PartHealth::UrlRefreshed,
        _ => PartHealth::Unhealthy,
    }
}

enum HeadOutcome {
    Ok,
    RefreshCandidate,
    Unhealthy,
    NetworkError,
}

async fn head_with_429_retry(client: &reqwest::Client, url: &str, max_429_retries: u32) -> HeadOutcome {
    let mut attempt = 0;
    loop {
        let resp = match client.head(url).send().await {
            Ok(r) => r,
            Err(_) => return HeadOutcome::NetworkError,
        };
        let status = resp.status().as_u16();
        if (200..300).contains(&status) {
            return HeadOutcome::Ok;
        }
        if status == 429 {
            if attempt >= max_429_retries {
                return HeadOutcome::Unhealthy;
            }
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(1);
            tokio::time::sleep(Duration::from_secs(retry_after)).await;
            attempt += 1;
            continue;
        }
        if matches!(status, 403 | 404 | 410) {
            return HeadOutcome::RefreshCandidate;
        }
        return match classify_status(status, None) {
            Retryability::Retryable | Retryability::RetryableAfter(_) => HeadOutcome::Unhealthy,
            Retryability::Fatal => HeadOutcome::Unhealthy,
        };
    }
}
