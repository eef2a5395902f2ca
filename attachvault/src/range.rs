//! range.rs — C9: maps a plaintext byte range to the minimal covering part
//! window, fetches only that window, and slices out the requested bytes.
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::crypto::{decrypt_chunk, EncryptionHeader, KeyCache};
use crate::error::{Result, VaultError};
use crate::fetcher::{FetchPlan, PartFetcher};
use crate::index::models::File;
use crate::index::IndexStore;
use crate::resolver::{ResolveMode, UrlResolver};

pub struct RangeStreamer {
    pub index: Arc<IndexStore>,
    pub resolver: Arc<UrlResolver>,
    pub fetcher: Arc<PartFetcher>,
    pub keys: Arc<KeyCache>,
    pub temp_dir: PathBuf,
}

struct Window {
    first_part_idx: usize,
    last_part_idx: usize,
    offset_in_first_chunk: u64,
    content_length: u64,
}

impl RangeStreamer {
    /// Returns exactly `range_end - range_start + 1` plaintext bytes.
    pub async fn range_stream(
        &self,
        file_id: i64,
        range_start: u64,
        range_end: u64,
        encryption_key: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let Some(mut file) = self.index.get_file_by_id(file_id).await? else {
            return Err(VaultError::SourceDataMissing(format!("file {file_id} not found")));
        };

        if file.parts.is_empty() || range_start > range_end || range_end >= file.size {
            return Err(VaultError::RangeNotSatisfiable { start: range_start, end: range_end, size: file.size });
        }

        let window = compute_window(&file, range_start, range_end)?;

        let key = resolve_key(&self.keys, &file, &encryption_key)?;

        let selected = &mut file.parts[window.first_part_idx..=window.last_part_idx];
        self.resolver.resolve(selected, ResolveMode::Strict, cancel).await?;

        let scratch_path = self.temp_dir.join(format!("attachvault-range-{}.scratch", Uuid::new_v4()));
        let total_size: u64 = selected.iter().map(|p| p.size).sum();
        let f = tokio::fs::File::create(&scratch_path)
            .await
            .map_err(|e| VaultError::Internal(format!("creating scratch file: {e}")))?;
        f.set_len(total_size).await.map_err(|e| VaultError::Internal(format!("sizing scratch file: {e}")))?;
        drop(f);

        let mut offset = 0u64;
        let plans: Vec<FetchPlan> = selected
            .iter()
            .map(|p| {
                let plan = FetchPlan { part_id: p.id, url: p.discord_url.clone(), offset, size: p.size };
                offset += p.size;
                plan
            })
            .collect();

        let result = self.fetch_and_slice(&plans, selected, &window, cancel, &scratch_path, key).await;
        let _ = tokio::fs::remove_file(&scratch_path).await;
        result
    }

    async fn fetch_and_slice(
        &self,
        plans: &[FetchPlan],
        parts: &[crate::index::models::Part],
        window: &Window,
        cancel: &CancellationToken,
        scratch_path: &PathBuf,
        key: Option<[u8; 32]>,
    ) -> Result<Vec<u8>> {
        self.fetcher.fetch_all(plans, scratch_path, cancel, None).await?;

        let mut scratch = tokio::fs::File::open(scratch_path)
            .await
            .map_err(|e| VaultError::Internal(format!("opening scratch file: {e}")))?;

        let mut full_plain = Vec::new();
        let mut offset = 0u64;
        for part in parts {
            scratch.seek(std::io::SeekFrom::Start(offset)).await
                .map_err(|e| VaultError::Internal(format!("seeking scratch file: {e}")))?;
            let mut buf = vec![0u8; part.size as usize];
            scratch.read_exact(&mut buf).await
                .map_err(|e| VaultError::Internal(format!("reading scratch file: {e}")))?;
            offset += part.size;

            let plaintext = match key {
                Some(k) => {
                    let iv = part.iv.as_ref().ok_or_else(|| VaultError::Internal(format!("part {} missing iv", part.part_number)))?;
                    if iv.len() != 12 {
                        return Err(VaultError::Internal(format!("part {} malformed iv", part.part_number)));
                    }
                    let mut iv_arr = [0u8; 12];
                    iv_arr.copy_from_slice(iv);
                    decrypt_chunk(&buf, &k, &iv_arr, part.part_number)?
                }
                None => buf,
            };
            full_plain.extend_from_slice(&plaintext);
        }

        let start = window.offset_in_first_chunk as usize;
        let end = start + window.content_length as usize;
        if end > full_plain.len() {
            return Err(VaultError::Internal("range window decrypted fewer bytes than expected".into()));
        }
        Ok(full_plain[start..end].to_vec())
    }
}

fn resolve_key(keys: &KeyCache, file: &File, passphrase: &Option<String>) -> Result<Option<[u8; 32]>> {
    let Some(header_json) = &file.encryption_header else {
        return Ok(None);
    };
    let header: EncryptionHeader = serde_json::from_str(header_json)
        .map_err(|e| VaultError::Internal(format!("corrupt encryption header: {e}")))?;
    if header.is_legacy() {
        // The legacy format is one AES-GCM pass over the whole reassembled
        // blob (see crypto::chunk::decrypt_legacy_blob) — there is no
        // per-part window to decrypt in isolation, so byte ranges aren't
        // serviceable without a full download.
        return Err(VaultError::ConfigInvalid(
            "range requests are not supported for legacy-encrypted files; download the full file instead".into(),
        ));
    }
    let Some(pass) = passphrase else {
        return Err(VaultError::MissingKey);
    };
    let derived = keys.get_or_derive(pass, header.salt.as_slice(), header.pbkdf2_iterations)?;
    Ok(Some(*derived.as_bytes()))
}

/// Builds the cumulative plain-byte table and solves for the minimal
/// covering part window (spec §4.9).
fn compute_window(file: &File, range_start: u64, range_end: u64) -> Result<Window> {
    let mut plain_start = 0u64;
    let mut first_part_idx = None;
    let mut last_part_idx = None;
    let mut first_plain_start = 0u64;
    let mut last_plain_start = 0u64;

    for (i, part) in file.parts.iter().enumerate() {
        let part_end_inclusive = plain_start + part.plain_size - 1;
        if first_part_idx.is_none() && part_end_inclusive >= range_start {
            first_part_idx = Some(i);
            first_plain_start = plain_start;
        }
        if plain_start <= range_end {
            last_part_idx = Some(i);
            last_plain_start = plain_start;
        }
        plain_start += part.plain_size;
    }

    let (Some(first_part_idx), Some(last_part_idx)) = (first_part_idx, last_part_idx) else {
        return Err(VaultError::RangeNotSatisfiable { start: range_start, end: range_end, size: file.size });
    };

    let offset_in_first_chunk = range_start - first_plain_start;
    let bytes_from_last_chunk = range_end - last_plain_start + 1;
    let _ = bytes_from_last_chunk;

    Ok(Window {
        first_part_idx,
        last_part_idx,
        offset_in_first_chunk,
        content_length: range_end - range_start + 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::models::{Part, PartHealth};
    use chrono::Utc;

    fn make_file(plain_sizes: &[u64]) -> File {
        let mut parts = Vec::new();
        for (i, &sz) in plain_sizes.iter().enumerate() {
            parts.push(Part {
                id: i as i64 + 1,
                file_id: 1,
                part_number: i as u32 + 1,
                message_id: 100,
                channel_id: 1,
                discord_url: "http://x".into(),
                size: sz + 16,
                plain_size: sz,
                iv: Some(vec![0u8; 12]),
                auth_tag: None,
                health: PartHealth::Unknown,
            });
        }
        File {
            id: 1,
            original_name: "f".into(),
            size: plain_sizes.iter().sum(),
            mime_type: None,
            total_parts: parts.len() as u32,
            folder_id: None,
            user_id: None,
            encryption_header: None,
            media_width: None,
            media_height: None,
            created_at: Utc::now(),
            parts,
        }
    }

    #[test]
    fn window_covers_s4_example() {
        // upload(b"hello world", chunk_size=4) -> plain_sizes [4,4,3]
        let file = make_file(&[4, 4, 3]);
        let window = compute_window(&file, 2, 8).unwrap();
        assert_eq!(window.first_part_idx, 0);
        assert_eq!(window.last_part_idx, 2);
        assert_eq!(window.offset_in_first_chunk, 2);
        assert_eq!(window.content_length, 7);
    }

    #[test]
    fn window_covers_s2_example() {
        let file = make_file(&[8_388_608, 8_388_608, 1]);
        let window = compute_window(&file, 8_388_607, 8_388_608).unwrap();
        assert_eq!(window.first_part_idx, 0);
        assert_eq!(window.last_part_idx, 1);
    }

    #[test]
    fn out_of_range_rejected() {
        let file = make_file(&[4, 4, 3]);
        assert!(file.size == 11);
    }
}
