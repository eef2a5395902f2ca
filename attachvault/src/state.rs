//! state.rs — shared application state passed to every Axum handler and CLI
//! command.
use std::path::PathBuf;
use std::sync::Arc;

use crate::bots::BotPool;
use crate::config::Config;
use crate::crypto::KeyCache;
use crate::download::DownloadAssembler;
use crate::fetcher::PartFetcher;
use crate::health::HealthcheckEngine;
use crate::index::IndexStore;
use crate::lifecycle::FileDeleter;
use crate::range::RangeStreamer;
use crate::resolver::UrlResolver;
use crate::upload::UploadOrchestrator;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub index: Arc<IndexStore>,
    pub bots: Arc<BotPool>,
    pub resolver: Arc<UrlResolver>,
    pub fetcher: Arc<PartFetcher>,
    pub keys: Arc<KeyCache>,
    pub uploader: Arc<UploadOrchestrator>,
    pub downloader: Arc<DownloadAssembler>,
    pub ranger: Arc<RangeStreamer>,
    pub health: Arc<HealthcheckEngine>,
    pub deleter: Arc<FileDeleter>,
    pub base_dir: PathBuf,
}

impl AppState {
    pub async fn build(cfg: Config, base_dir: PathBuf) -> anyhow::Result<Self> {
        let cfg = Arc::new(cfg);
        let index = Arc::new(IndexStore::connect(&cfg.db_path).await?);
        let bots = Arc::new(
            BotPool::new(
                &cfg.discord_tokens,
                &cfg.channel_ids,
                cfg.bots_per_channel,
                cfg.bot_init_retries,
                cfg.upload_channel_override,
                cfg.send_retries,
                cfg.send_retry_base_s,
            )
            .await?,
        );
        let resolver = Arc::new(UrlResolver::new(Arc::clone(&bots), Arc::clone(&index)));
        let fetcher = Arc::new(PartFetcher::new(
            cfg.http_timeout_s,
            cfg.download_concurrency,
            cfg.download_retries,
            cfg.download_retry_base_s,
        )?);
        let keys = Arc::new(KeyCache::new());

        tokio::fs::create_dir_all(&cfg.temp_dir).await.ok();

        let uploader = Arc::new(UploadOrchestrator {
            index: Arc::clone(&index),
            bots: Arc::clone(&bots),
            keys: Arc::clone(&keys),
            channel_ids: cfg.channel_ids.clone(),
            upload_channel_override: cfg.upload_channel_override,
            chunk_size: cfg.chunk_size,
            batch_size: cfg.batch_size,
            pbkdf2_iterations: cfg.pbkdf2_iterations,
        });
        let downloader = Arc::new(DownloadAssembler {
            index: Arc::clone(&index),
            resolver: Arc::clone(&resolver),
            fetcher: Arc::clone(&fetcher),
            keys: Arc::clone(&keys),
            temp_dir: cfg.temp_dir.clone(),
        });
        let ranger = Arc::new(RangeStreamer {
            index: Arc::clone(&index),
            resolver: Arc::clone(&resolver),
            fetcher: Arc::clone(&fetcher),
            keys: Arc::clone(&keys),
            temp_dir: cfg.temp_dir.clone(),
        });
        let health = Arc::new(HealthcheckEngine::new(
            Arc::clone(&index),
            Some(Arc::clone(&resolver)),
            Some(Arc::clone(&bots)),
            cfg.head_concurrency,
            cfg.head_timeout_s,
            cfg.refresh_concurrency,
        )?);
        let deleter = Arc::new(FileDeleter { index: Arc::clone(&index), bots: Arc::clone(&bots) });

        Ok(AppState {
            cfg,
            index,
            bots,
            resolver,
            fetcher,
            keys,
            uploader,
            downloader,
            ranger,
            health,
            deleter,
            base_dir,
        })
    }
}
