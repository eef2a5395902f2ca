//! download.rs — C8: orchestrates URL resolution, part fetch, and ordered
//! decryption to produce a plaintext stream of a whole file.
use std::path::PathBuf;
use std::sync::Arc;

use async_stream::try_stream;
use bytes::Bytes;
use futures::Stream;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::crypto::{decrypt_chunk, decrypt_legacy_blob, EncryptionHeader, KeyCache};
use crate::error::{Result, VaultError};
use crate::fetcher::{FetchPlan, PartFetcher};
use crate::index::models::File;
use crate::index::IndexStore;
use crate::resolver::{ResolveMode, UrlResolver};

pub struct DownloadOptions {
    pub encryption_key: Option<String>,
    pub cancel: CancellationToken,
}

pub struct DownloadAssembler {
    pub index: Arc<IndexStore>,
    pub resolver: Arc<UrlResolver>,
    pub fetcher: Arc<PartFetcher>,
    pub keys: Arc<KeyCache>,
    pub temp_dir: PathBuf,
}

impl DownloadAssembler {
    /// Streams the full plaintext of `file_id`. The returned stream applies
    /// back-pressure naturally: decrypted chunks are only produced as the
    /// consumer polls, never more than one part ahead (spec §4.8).
    pub async fn download_stream(
        &self,
        file_id: i64,
        opts: DownloadOptions,
    ) -> Result<impl Stream<Item = Result<Bytes>>> {
        let Some(mut file) = self.index.get_file_by_id(file_id).await? else {
            return Err(VaultError::SourceDataMissing(format!("file {file_id} not found")));
        };

        let mode = self.resolve_key(&file, &opts.encryption_key)?;

        self.resolver.resolve(&mut file.parts, ResolveMode::Strict, &opts.cancel).await?;

        let scratch_path = self.temp_dir.join(format!("attachvault-dl-{}.scratch", Uuid::new_v4()));
        let total_size: u64 = file.parts.iter().map(|p| p.size).sum();
        preallocate(&scratch_path, total_size).await?;

        let mut offset = 0u64;
        let plans: Vec<FetchPlan> = file
            .parts
            .iter()
            .map(|p| {
                let plan = FetchPlan { part_id: p.id, url: p.discord_url.clone(), offset, size: p.size };
                offset += p.size;
                plan
            })
            .collect();

        if let Err(e) = self.fetcher.fetch_all(&plans, &scratch_path, &opts.cancel, None).await {
            let _ = tokio::fs::remove_file(&scratch_path).await;
            return Err(e);
        }

        Ok(decrypt_stream(file, scratch_path, mode, opts.cancel))
    }

    fn resolve_key(&self, file: &File, passphrase: &Option<String>) -> Result<DecryptMode> {
        let Some(header_json) = &file.encryption_header else {
            return Ok(DecryptMode::Plain);
        };
        let header: EncryptionHeader = serde_json::from_str(header_json)
            .map_err(|e| VaultError::Internal(format!("corrupt encryption header: {e}")))?;
        let Some(pass) = passphrase else {
            return Err(VaultError::MissingKey);
        };
        if header.is_legacy() {
            return Ok(DecryptMode::Legacy { passphrase: pass.clone(), iterations: header.pbkdf2_iterations });
        }
        let derived = self.keys.get_or_derive(pass, header.salt.as_slice(), header.pbkdf2_iterations)?;
        Ok(DecryptMode::Chunked(*derived.as_bytes()))
    }
}

/// How a file's bytes get from ciphertext to plaintext. `Legacy` holds the
/// raw passphrase because `decrypt_legacy_blob` derives its own key from the
/// salt embedded in the blob itself, not from the file's encryption header.
enum DecryptMode {
    Plain,
    Chunked([u8; 32]),
    Legacy { passphrase: String, iterations: u32 },
}

async fn preallocate(path: &PathBuf, size: u64) -> Result<()> {
    let file = tokio::fs::File::create(path)
        .await
        .map_err(|e| VaultError::Internal(format!("creating scratch file: {e}")))?;
    file.set_len(size).await.map_err(|e| VaultError::Internal(format!("sizing scratch file: {e}")))?;
    Ok(())
}

/// Builds the ordered decrypt stream. For `Chunked`/`Plain` files this is one
/// read+decrypt per part, in `part_number` order. The `Legacy` format is a
/// single AES-GCM pass over the whole reassembled blob, so it has no
/// per-part granularity — the scratch file is read in one pass and the
/// entire plaintext is yielded as a single item. Closes and unlinks the
/// scratch file on end or error either way.
fn decrypt_stream(
    file: File,
    scratch_path: PathBuf,
    mode: DecryptMode,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<Bytes>> {
    try_stream! {
        let mut scratch = tokio::fs::File::open(&scratch_path)
            .await
            .map_err(|e| VaultError::Internal(format!("opening scratch file: {e}")))?;

        let cleanup = ScratchGuard(scratch_path.clone());

        if let DecryptMode::Legacy { passphrase, iterations } = &mode {
            if cancel.is_cancelled() {
                Err(VaultError::Cancelled)?;
            }
            let mut blob = Vec::new();
            scratch.read_to_end(&mut blob).await
                .map_err(|e| VaultError::Internal(format!("reading scratch file: {e}")))?;
            let plaintext = decrypt_legacy_blob(&blob, passphrase, *iterations)?;
            yield Bytes::from(plaintext);
            drop(cleanup);
        } else {
            for part in &file.parts {
                if cancel.is_cancelled() {
                    Err(VaultError::Cancelled)?;
                }
                scratch.seek(std::io::SeekFrom::Start(part_offset(&file, part.part_number))).await
                    .map_err(|e| VaultError::Internal(format!("seeking scratch file: {e}")))?;
                let mut buf = vec![0u8; part.size as usize];
                scratch.read_exact(&mut buf).await
                    .map_err(|e| VaultError::Internal(format!("reading scratch file: {e}")))?;

                let plaintext = match &mode {
                    DecryptMode::Chunked(k) => decrypt_chunk(&buf, k, &iv_array(part)?, part.part_number)?,
                    DecryptMode::Plain => buf,
                    DecryptMode::Legacy { .. } => unreachable!("handled above"),
                };
                yield Bytes::from(plaintext);
            }
            drop(cleanup);
        }
    }
}

fn part_offset(file: &File, part_number: u32) -> u64 {
    file.parts
        .iter()
        .take_while(|p| p.part_number < part_number)
        .map(|p| p.size)
        .sum()
}

fn iv_array(part: &crate::index::models::Part) -> Result<[u8; 12]> {
    let iv = part.iv.as_ref().ok_or_else(|| VaultError::Internal(format!("part {} missing iv", part.part_number)))?;
    if iv.len() != 12 {
        return Err(VaultError::Internal(format!("part {} has malformed iv length {}", part.part_number, iv.len())));
    }
    let mut out = [0u8; 12];
    out.copy_from_slice(iv);
    Ok(out)
}

/// Unlinks the scratch file when the stream is dropped, whether it ran to
/// completion or was abandoned mid-way on error.
struct ScratchGuard(PathBuf);

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        let path = self.0.clone();
        tokio::spawn(async move {
            let _ = tokio::fs::remove_file(&path).await;
        });
    }
}
