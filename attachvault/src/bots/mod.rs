//! bots/mod.rs — C4: the pool of authenticated chat-bot identities.
//!
//! Exposes a narrow capability set (`send_attachments`, `fetch_message`,
//! `delete_message`) over whatever client library backs a `Bot`; callers
//! never see a `serenity::Client` or its gateway machinery (spec §9 —
//! dynamic/inheritance-heavy client SDKs are flattened to a capability set).
pub mod retry;

use serenity::http::Http;
use serenity::model::id::{ChannelId, MessageId};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Result, VaultError};
use retry::{retry, Outcome, RetryPolicy};

/// One encrypted chunk ready to be posted as an attachment.
#[derive(Debug, Clone)]
pub struct AttachmentBlob {
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SentAttachment {
    pub name: String,
    pub url: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct SendResult {
    pub message_id: i64,
    pub channel_id: i64,
    pub attachments: Vec<SentAttachment>,
}

pub struct Bot {
    pub name: String,
    pub http: Arc<Http>,
    pub upload_channel_id: ChannelId,
    pub readable_channels: HashSet<ChannelId>,
    pub busy: AtomicUsize,
    /// Outbound proxy URL, if this identity routes through one. Carried as
    /// part of the `Bot` value per spec §4.4; wired into the part fetcher's
    /// HTTP client when present.
    pub proxy: Option<String>,
}

impl Bot {
    fn reads(&self, channel_id: ChannelId) -> bool {
        self.readable_channels.contains(&channel_id)
    }
}

pub struct BotPool {
    bots: Vec<Arc<Bot>>,
    send_retry_policy: RetryPolicy,
}

impl BotPool {
    /// Construction contract (spec §4.4): assign bots to channels
    /// round-robin, capped at `bots_per_channel` per channel; every channel
    /// gets at least one bot when `credentials.len() >= channel_ids.len()`.
    /// A credential that fails `bot_init_retries` retries is excluded, not
    /// fatal — only an empty resulting pool is `BackendUnavailable`.
    pub async fn new(
        credentials: &[String],
        channel_ids: &[u64],
        bots_per_channel: usize,
        bot_init_retries: u32,
        upload_channel_override: Option<u64>,
        send_retries: u32,
        send_retry_base_s: u64,
    ) -> Result<Self> {
        if channel_ids.is_empty() {
            return Err(VaultError::ConfigInvalid("no channel_ids configured".into()));
        }
        let channels: Vec<ChannelId> = channel_ids.iter().map(|&id| ChannelId::new(id)).collect();
        let all_readable: HashSet<ChannelId> = channels.iter().copied().collect();

        let mut channel_counts = vec![0usize; channels.len()];
        let mut bots = Vec::new();

        for (i, token) in credentials.iter().enumerate() {
            let ch_idx_start = i % channels.len();
            let mut ch_idx = None;
            for step in 0..channels.len() {
                let idx = (ch_idx_start + step) % channels.len();
                if channel_counts[idx] < bots_per_channel {
                    ch_idx = Some(idx);
                    break;
                }
            }
            let Some(ch_idx) = ch_idx else {
                break; // every channel already at its cap
            };

            match init_one_bot(token, bot_init_retries).await {
                Ok(http) => {
                    channel_counts[ch_idx] += 1;
                    let upload_channel_id = match upload_channel_override {
                        Some(id) => ChannelId::new(id),
                        None => channels[ch_idx],
                    };
                    bots.push(Arc::new(Bot {
                        name: format!("bot-{i}"),
                        http,
                        upload_channel_id,
                        readable_channels: all_readable.clone(),
                        busy: AtomicUsize::new(0),
                        proxy: None,
                    }));
                }
                Err(e) => {
                    warn!("bot {i} failed init after {bot_init_retries} retries: {e}");
                }
            }
        }

        if bots.is_empty() {
            return Err(VaultError::BackendUnavailable(
                "no bot credential passed initialisation".into(),
            ));
        }
        info!("bot pool ready: {} bot(s) across {} channel(s)", bots.len(), channels.len());

        Ok(BotPool {
            bots,
            send_retry_policy: RetryPolicy::new(send_retries, send_retry_base_s),
        })
    }

    /// Least-busy bot bound to `channel_id` as the upload target. Fails fast
    /// (does not reroute) if no bot is bound there.
    fn pick_uploader(&self, channel_id: ChannelId) -> Result<Arc<Bot>> {
        self.bots
            .iter()
            .filter(|b| b.upload_channel_id == channel_id)
            .min_by_key(|b| b.busy.load(Ordering::SeqCst))
            .cloned()
            .ok_or_else(|| VaultError::BackendUnavailable(format!("no bot bound to channel {channel_id}")))
    }

    fn readers_for(&self, channel_id: Option<ChannelId>) -> Vec<Arc<Bot>> {
        match channel_id {
            Some(id) => {
                let mut readers: Vec<Arc<Bot>> =
                    self.bots.iter().filter(|b| b.reads(id)).cloned().collect();
                readers.sort_by_key(|b| b.busy.load(Ordering::SeqCst));
                readers
            }
            None => self.bots.clone(),
        }
    }

    pub async fn send_attachments(
        &self,
        channel_id: u64,
        attachments: Vec<AttachmentBlob>,
        content: Option<String>,
        token: &CancellationToken,
    ) -> Result<SendResult> {
        let channel = ChannelId::new(channel_id);
        let bot = self.pick_uploader(channel)?;
        bot.busy.fetch_add(1, Ordering::SeqCst);
        let result = retry(&self.send_retry_policy, token, || {
            let bot = Arc::clone(&bot);
            let attachments = attachments.clone();
            let content = content.clone();
            async move { try_send(&bot, channel, attachments, content).await }
        })
        .await;
        bot.busy.fetch_sub(1, Ordering::SeqCst);
        result
    }

    pub async fn fetch_message(
        &self,
        message_id: i64,
        channel_id: Option<u64>,
        token: &CancellationToken,
    ) -> Result<Option<SendResult>> {
        let channel = channel_id.map(ChannelId::new);
        let candidates = self.readers_for(channel);
        if candidates.is_empty() {
            return Err(VaultError::BackendUnavailable("no bot can read the target channel".into()));
        }

        for bot in candidates {
            let bot_channel = channel.unwrap_or(bot.upload_channel_id);
            let outcome = retry(&self.send_retry_policy, token, || {
                let bot = Arc::clone(&bot);
                async move { try_fetch(&bot, bot_channel, message_id).await }
            })
            .await;
            match outcome {
                Ok(Some(msg)) => return Ok(Some(msg)),
                Ok(None) => continue,
                Err(VaultError::SourceDataMissing(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    pub async fn delete_message(&self, message_id: i64, channel_id: u64, token: &CancellationToken) -> Result<()> {
        let channel = ChannelId::new(channel_id);
        let bot = self
            .readers_for(Some(channel))
            .into_iter()
            .next()
            .ok_or_else(|| VaultError::BackendUnavailable("no bot can reach channel for delete".into()))?;
        retry(&self.send_retry_policy, token, || {
            let bot = Arc::clone(&bot);
            async move {
                match channel.delete_message(&bot.http, MessageId::new(message_id as u64)).await {
                    Ok(()) => Outcome::Done(()),
                    Err(e) => classify_send_error(e.into()),
                }
            }
        })
        .await
    }

    /// Best-effort bulk delete (used on upload-abort cleanup). Individual
    /// failures are logged and do not abort the batch.
    pub async fn delete_messages_bulk(&self, message_ids: &[(i64, u64)], token: &CancellationToken) {
        for &(message_id, channel_id) in message_ids {
            if let Err(e) = self.delete_message(message_id, channel_id, token).await {
                warn!("best-effort delete of message {message_id} failed: {e}");
            }
        }
    }

    pub fn bot_count(&self) -> usize {
        self.bots.len()
    }
}

async fn init_one_bot(token: &str, bot_init_retries: u32) -> Result<Arc<Http>> {
    let policy = RetryPolicy::new(bot_init_retries.max(1), 1);
    let cancel = CancellationToken::new(); // init is not user-cancellable
    retry(&policy, &cancel, || {
        let token = token.to_string();
        async move {
            let http = Arc::new(Http::new(&token));
            match http.get_current_user().await {
                Ok(_) => Outcome::Done(http),
                Err(e) => Outcome::Retry(VaultError::from(e)),
            }
        }
    })
    .await
}

async fn try_send(
    bot: &Bot,
    channel: ChannelId,
    attachments: Vec<AttachmentBlob>,
    content: Option<String>,
) -> Outcome<SendResult> {
    let files = attachments
        .into_iter()
        .map(|a| serenity::builder::CreateAttachment::bytes(a.bytes, a.filename))
        .collect::<Vec<_>>();
    let mut builder = serenity::builder::CreateMessage::new();
    if let Some(c) = content {
        builder = builder.content(c);
    }
    for f in files {
        builder = builder.add_file(f);
    }
    match channel.send_message(&bot.http, builder).await {
        Ok(msg) => Outcome::Done(SendResult {
            message_id: msg.id.get() as i64,
            channel_id: channel.get() as i64,
            attachments: msg
                .attachments
                .into_iter()
                .map(|a| SentAttachment { name: a.filename, url: a.url, size: a.size as u64 })
                .collect(),
        }),
        Err(e) => classify_send_error(e.into()),
    }
}

async fn try_fetch(bot: &Bot, channel: ChannelId, message_id: i64) -> Outcome<Option<SendResult>> {
    match channel.message(&bot.http, MessageId::new(message_id as u64)).await {
        Ok(msg) => Outcome::Done(Some(SendResult {
            message_id: msg.id.get() as i64,
            channel_id: channel.get() as i64,
            attachments: msg
                .attachments
                .into_iter()
                .map(|a| SentAttachment { name: a.filename, url: a.url, size: a.size as u64 })
                .collect(),
        })),
        Err(e) => classify_send_error(e.into()),
    }
}

fn classify_send_error<T>(e: VaultError) -> Outcome<T> {
    match &e {
        VaultError::RateLimited { retry_after_s, context } => {
            Outcome::RetryAfter(VaultError::RateLimited { retry_after_s: *retry_after_s, context: context.clone() }, *retry_after_s)
        }
        VaultError::TransferFailed(_) => Outcome::Retry(e),
        // Not found / forbidden on fetch surfaces to the caller immediately
        // so fetch_message can move on to the next candidate bot.
        VaultError::SourceDataMissing(_) => Outcome::Fatal(e),
        _ => Outcome::Retry(e),
    }
}
