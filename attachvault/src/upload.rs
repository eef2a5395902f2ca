//! upload.rs — C5: the upload orchestrator. Reads a source stream, drives
//! C1 (chunk codec) and C2 (key derivation), batches chunks into
//! multi-attachment messages, dispatches them via C4, and commits the whole
//! file to C3 in one transaction.
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bots::{AttachmentBlob, BotPool};
use crate::crypto::{encrypt_chunk, EncryptionHeader, KeyCache};
use crate::error::{Result, VaultError};
use crate::index::models::{NewFile, NewPart};
use crate::index::IndexStore;
use crate::naming::part_attachment_name;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStage {
    Reading,
    Encrypting,
    Uploading,
    Finalizing,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub stage: UploadStage,
    pub current_part: u32,
    pub total_parts: Option<u32>,
    pub bytes_uploaded: u64,
    pub total_bytes: Option<u64>,
    pub percent: Option<f64>,
}

pub struct UploadOptions {
    pub filename: String,
    pub mime_type: Option<String>,
    pub folder_id: Option<i64>,
    pub user_id: Option<i64>,
    pub encrypt: bool,
    pub encryption_key: Option<String>,
    pub media_width: Option<u32>,
    pub media_height: Option<u32>,
    pub total_bytes_hint: Option<u64>,
    pub on_progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
    pub cancel: CancellationToken,
}

impl UploadOptions {
    pub fn new(filename: impl Into<String>, cancel: CancellationToken) -> Self {
        UploadOptions {
            filename: filename.into(),
            mime_type: None,
            folder_id: None,
            user_id: None,
            encrypt: true,
            encryption_key: None,
            media_width: None,
            media_height: None,
            total_bytes_hint: None,
            on_progress: None,
            cancel,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub file_id: i64,
    pub total_parts: u32,
    pub size: u64,
    pub encrypted: bool,
}

struct PendingChunk {
    part_number: u32,
    ciphertext: Vec<u8>,
    iv: Vec<u8>,
    auth_tag: Vec<u8>,
    plain_size: u64,
}

struct DispatchedChunk {
    part_number: u32,
    message_id: i64,
    channel_id: i64,
    url: String,
    size: u64,
    plain_size: u64,
    iv: Vec<u8>,
    auth_tag: Vec<u8>,
}

pub struct UploadOrchestrator {
    pub index: Arc<IndexStore>,
    pub bots: Arc<BotPool>,
    pub keys: Arc<KeyCache>,
    pub channel_ids: Vec<u64>,
    /// When set, every batch dispatches to this channel instead of round-robin
    /// over `channel_ids` — mirrors the single channel every bot is bound to
    /// (see `BotPool::new`) when the override is configured.
    pub upload_channel_override: Option<u64>,
    pub chunk_size: u64,
    pub batch_size: usize,
    pub pbkdf2_iterations: u32,
}

impl UploadOrchestrator {
    pub async fn upload<R>(&self, mut source: R, opts: UploadOptions) -> Result<UploadOutcome>
    where
        R: AsyncRead + Unpin,
    {
        let encryption_key = if opts.encrypt {
            let key = opts
                .encryption_key
                .as_deref()
                .ok_or_else(|| VaultError::ConfigInvalid("encrypt requested but no encryption_key supplied".into()))?;
            Some(key.to_string())
        } else {
            None
        };

        let header = encryption_key.as_ref().map(|_| EncryptionHeader::new_v2(self.pbkdf2_iterations, self.chunk_size));
        let derived_key = match (&encryption_key, &header) {
            (Some(pass), Some(h)) => {
                Some(self.keys.get_or_derive(pass, h.salt.as_slice(), h.pbkdf2_iterations)?)
            }
            _ => None,
        };

        let bytes_uploaded = Arc::new(AtomicU64::new(0));
        let next_part = Arc::new(AtomicU32::new(0));
        let dispatch_sem = Arc::new(Semaphore::new(self.batch_size.max(1) * self.bots.bot_count().max(1)));

        let mut batch: Vec<PendingChunk> = Vec::with_capacity(self.batch_size);
        let mut posted_messages: Vec<(i64, u64)> = Vec::new();
        let mut all_parts: Vec<DispatchedChunk> = Vec::new();
        let mut total_plain_bytes: u64 = 0;
        let mut read_buf = vec![0u8; self.chunk_size as usize];
        let mut saw_any_chunk = false;

        let emit = |opts: &UploadOptions, stage, current_part, total_parts, bytes, total_bytes| {
            if let Some(tx) = &opts.on_progress {
                let percent = total_bytes.map(|t: u64| if t == 0 { 100.0 } else { bytes as f64 / t as f64 * 100.0 });
                let _ = tx.send(ProgressEvent {
                    stage,
                    current_part,
                    total_parts,
                    bytes_uploaded: bytes,
                    total_bytes,
                    percent,
                });
            }
        };

        loop {
            if opts.cancel.is_cancelled() {
                self.abort_cleanup(&posted_messages, &opts.cancel).await;
                return Err(VaultError::Cancelled);
            }

            emit(&opts, UploadStage::Reading, next_part.load(Ordering::SeqCst), None, total_plain_bytes, opts.total_bytes_hint);
            let n = read_full_or_eof(&mut source, &mut read_buf)
                .await
                .map_err(|e| VaultError::SourceDataMissing(e.to_string()))?;
            if n == 0 {
                break;
            }
            saw_any_chunk = true;
            total_plain_bytes += n as u64;

            let part_number = next_part.fetch_add(1, Ordering::SeqCst) + 1;
            emit(&opts, UploadStage::Encrypting, part_number, None, total_plain_bytes, opts.total_bytes_hint);

            let pending = match &derived_key {
                Some(key) => {
                    let enc = encrypt_chunk(&read_buf[..n], key.as_bytes())?;
                    let tag_at = enc.ciphertext_with_tag.len() - crate::crypto::TAG_LEN;
                    let auth_tag = enc.ciphertext_with_tag[tag_at..].to_vec();
                    PendingChunk {
                        part_number,
                        ciphertext: enc.ciphertext_with_tag,
                        iv: enc.iv.to_vec(),
                        auth_tag,
                        plain_size: n as u64,
                    }
                }
                None => PendingChunk {
                    part_number,
                    ciphertext: read_buf[..n].to_vec(),
                    iv: vec![0u8; 12],
                    auth_tag: Vec::new(),
                    plain_size: n as u64,
                },
            };

            batch.push(pending);

            if batch.len() >= self.batch_size {
                let dispatched = match self
                    .dispatch_batch(std::mem::take(&mut batch), &opts, &dispatch_sem, next_part.load(Ordering::SeqCst))
                    .await
                {
                    Ok(d) => d,
                    Err(e) => {
                        self.abort_cleanup(&posted_messages, &opts.cancel).await;
                        return Err(e);
                    }
                };
                for d in &dispatched {
                    posted_messages.push((d.message_id, d.channel_id as u64));
                }
                bytes_uploaded.fetch_add(dispatched.iter().map(|d| d.plain_size).sum(), Ordering::SeqCst);
                emit(&opts, UploadStage::Uploading, part_number, None, bytes_uploaded.load(Ordering::SeqCst), opts.total_bytes_hint);
                all_parts.extend(dispatched);
            }
        }

        if !saw_any_chunk {
            return Err(VaultError::ConfigInvalid("empty source: nothing to upload".into()));
        }

        if !batch.is_empty() {
            let dispatched = match self
                .dispatch_batch(batch, &opts, &dispatch_sem, next_part.load(Ordering::SeqCst))
                .await
            {
                Ok(d) => d,
                Err(e) => {
                    self.abort_cleanup(&posted_messages, &opts.cancel).await;
                    return Err(e);
                }
            };
            for d in &dispatched {
                posted_messages.push((d.message_id, d.channel_id as u64));
            }
            bytes_uploaded.fetch_add(dispatched.iter().map(|d| d.plain_size).sum(), Ordering::SeqCst);
            all_parts.extend(dispatched);
        }

        if opts.cancel.is_cancelled() {
            self.abort_cleanup(&posted_messages, &opts.cancel).await;
            return Err(VaultError::Cancelled);
        }

        let total_parts = all_parts.len() as u32;
        emit(&opts, UploadStage::Finalizing, total_parts, Some(total_parts), total_plain_bytes, Some(total_plain_bytes));

        all_parts.sort_by_key(|p| p.part_number);

        let new_parts: Vec<NewPart> = all_parts
            .iter()
            .map(|d| NewPart {
                part_number: d.part_number,
                message_id: d.message_id,
                channel_id: d.channel_id,
                discord_url: d.url.clone(),
                size: d.size,
                plain_size: d.plain_size,
                iv: Some(d.iv.clone()),
                auth_tag: Some(d.auth_tag.clone()),
            })
            .collect();

        let encryption_header_json = header.as_ref().map(|h| serde_json::to_string(h)).transpose()
            .map_err(|e| VaultError::Internal(format!("encoding encryption header: {e}")))?;

        let new_file = NewFile {
            original_name: opts.filename.clone(),
            size: total_plain_bytes,
            mime_type: opts.mime_type.clone(),
            total_parts,
            folder_id: opts.folder_id,
            user_id: opts.user_id,
            encryption_header: encryption_header_json,
            media_width: opts.media_width,
            media_height: opts.media_height,
        };

        let file_id = self.index.insert_file_with_parts(new_file, new_parts).await?;

        info!("upload committed: file_id={file_id} parts={total_parts} size={total_plain_bytes}");
        Ok(UploadOutcome {
            file_id,
            total_parts,
            size: total_plain_bytes,
            encrypted: header.is_some(),
        })
    }

    async fn dispatch_batch(
        &self,
        batch: Vec<PendingChunk>,
        opts: &UploadOptions,
        dispatch_sem: &Arc<Semaphore>,
        total_parts_so_far: u32,
    ) -> Result<Vec<DispatchedChunk>> {
        let _permit = dispatch_sem.acquire().await.map_err(|_| VaultError::Internal("dispatch semaphore closed".into()))?;

        let channel_id = match self.upload_channel_override {
            Some(id) => id,
            None => {
                let channel_idx = (total_parts_so_far as usize / self.batch_size.max(1)) % self.channel_ids.len();
                self.channel_ids[channel_idx]
            }
        };

        let attachments: Vec<AttachmentBlob> = batch
            .iter()
            .map(|c| AttachmentBlob {
                filename: part_attachment_name(&opts.filename, c.part_number, total_parts_so_far.max(c.part_number)),
                bytes: c.ciphertext.clone(),
            })
            .collect();

        let result = self.bots.send_attachments(channel_id, attachments, None, &opts.cancel).await?;

        if result.attachments.len() != batch.len() {
            return Err(VaultError::Internal(format!(
                "dispatch returned {} attachments for a batch of {}",
                result.attachments.len(),
                batch.len()
            )));
        }

        Ok(batch
            .into_iter()
            .zip(result.attachments.into_iter())
            .map(|(chunk, sent)| DispatchedChunk {
                part_number: chunk.part_number,
                message_id: result.message_id,
                channel_id: result.channel_id,
                url: sent.url,
                size: sent.size.max(chunk.ciphertext.len() as u64),
                plain_size: chunk.plain_size,
                iv: chunk.iv,
                auth_tag: chunk.auth_tag,
            })
            .collect())
    }

    async fn abort_cleanup(&self, posted_messages: &[(i64, u64)], cancel: &CancellationToken) {
        if posted_messages.is_empty() {
            return;
        }
        warn!("upload aborted: best-effort deleting {} posted message(s)", posted_messages.len());
        self.bots.delete_messages_bulk(posted_messages, cancel).await;
    }
}

/// Fills `buf` completely unless the source hits EOF first; a chunk whose
/// plaintext equals exactly `chunk_size` is a full chunk, only the last one
/// may be short (spec §4.5).
async fn read_full_or_eof<R: AsyncRead + Unpin>(source: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
