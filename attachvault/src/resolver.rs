//! resolver.rs — C6: re-binds expired attachment URLs by re-fetching the
//! owning message and matching attachments back to parts.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::bots::BotPool;
use crate::error::{Result, VaultError};
use crate::index::models::{Part, PartUrlUpdate};
use crate::index::IndexStore;
use crate::naming::parse_part_suffix;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    /// Message-not-found or unmatched attachments fail the whole call.
    Strict,
    /// Same failures are logged and the affected parts are left as-is.
    Graceful,
}

pub struct UrlResolver {
    pub bots: Arc<BotPool>,
    pub index: Arc<IndexStore>,
    /// Last URL this resolver saw confirmed live for a given part id. Lets a
    /// second `resolve()` call over unchanged parts skip both the message
    /// fetch and the index write entirely.
    last_live_url: Mutex<HashMap<i64, String>>,
}

impl UrlResolver {
    pub fn new(bots: Arc<BotPool>, index: Arc<IndexStore>) -> Self {
        UrlResolver { bots, index, last_live_url: Mutex::new(HashMap::new()) }
    }

    /// Refreshes `parts` in place. Parts are grouped by `message_id` so a
    /// multi-attachment message costs one chat-API fetch regardless of how
    /// many of its parts are in the batch. Idempotent: a group whose parts
    /// all still carry the URL this resolver last confirmed live is skipped
    /// entirely (no fetch, no index write), and within a fetched group a part
    /// whose matched attachment URL is unchanged is not re-pushed. Running
    /// this twice in a row on unchanged data produces no further HTTP calls
    /// or index writes.
    pub async fn resolve(&self, parts: &mut [Part], mode: ResolveMode, token: &CancellationToken) -> Result<()> {
        let mut by_message: HashMap<i64, Vec<usize>> = HashMap::new();
        for (idx, part) in parts.iter().enumerate() {
            by_message.entry(part.message_id).or_default().push(idx);
        }

        let mut updates = Vec::new();

        for (message_id, indices) in by_message {
            if group_already_resolved(&self.last_live_url.lock().unwrap(), parts, &indices) {
                continue;
            }

            let channel_id = parts[indices[0]].channel_id as u64;
            let msg = self.bots.fetch_message(message_id, Some(channel_id), token).await?;

            let Some(msg) = msg else {
                if mode == ResolveMode::Strict {
                    return Err(VaultError::SourceDataMissing(format!("message {message_id} not found")));
                }
                warn!("message {message_id} not found during URL refresh; skipping {} part(s)", indices.len());
                continue;
            };

            let mut sorted_indices = indices.clone();
            sorted_indices.sort_by_key(|&i| parts[i].part_number);

            for &idx in &sorted_indices {
                let part_number = parts[idx].part_number;

                let matched = msg
                    .attachments
                    .iter()
                    .find(|a| parse_part_suffix(&a.name).map(|(n, _)| n) == Some(part_number))
                    .or_else(|| {
                        // Positional fallback: attachments in the message are assumed to be
                        // in ascending part_number order.
                        let pos = sorted_indices.iter().position(|&i| i == idx)?;
                        msg.attachments.get(pos)
                    });

                match matched {
                    Some(att) => {
                        if att.url != parts[idx].discord_url {
                            updates.push(PartUrlUpdate { part_id: parts[idx].id, new_url: att.url.clone() });
                            parts[idx].discord_url = att.url.clone();
                        }
                        self.last_live_url.lock().unwrap().insert(parts[idx].id, att.url.clone());
                    }
                    None => {
                        if mode == ResolveMode::Strict {
                            return Err(VaultError::SourceDataMissing(format!(
                                "no attachment maps to part {part_number} of message {message_id}"
                            )));
                        }
                        warn!("no attachment maps to part {part_number} of message {message_id}; skipping");
                    }
                }
            }
        }

        if updates.is_empty() {
            return Ok(());
        }

        // Non-fatal: in-memory URLs are already updated even if this write fails.
        if let Err(e) = self.index.update_part_urls(&updates).await {
            warn!("failed to persist refreshed URLs: {e}");
        }
        Ok(())
    }
}

/// A group can skip its fetch only if every part in it already carries the
/// exact URL the resolver last confirmed live for that part — if the caller
/// mutated `discord_url` out from under us (e.g. a fresh read from the
/// index) the cache no longer applies and the group must be re-fetched.
fn group_already_resolved(cache: &HashMap<i64, String>, parts: &[Part], indices: &[usize]) -> bool {
    indices.iter().all(|&idx| cache.get(&parts[idx].id).is_some_and(|u| *u == parts[idx].discord_url))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::models::PartHealth;

    fn part(id: i64, message_id: i64, discord_url: &str) -> Part {
        Part {
            id,
            file_id: 1,
            part_number: 1,
            message_id,
            channel_id: 1,
            discord_url: discord_url.to_string(),
            size: 0,
            plain_size: 0,
            iv: None,
            auth_tag: None,
            health: PartHealth::Unknown,
        }
    }

    #[test]
    fn group_already_resolved_is_true_only_when_every_part_matches_its_cached_url() {
        let parts = vec![part(1, 10, "https://cdn/a"), part(2, 10, "https://cdn/b")];
        let mut cache = HashMap::new();
        cache.insert(1, "https://cdn/a".to_string());
        cache.insert(2, "https://cdn/b".to_string());
        assert!(group_already_resolved(&cache, &parts, &[0, 1]));

        cache.insert(2, "https://cdn/b-refreshed".to_string());
        assert!(!group_already_resolved(&cache, &parts, &[0, 1]));
    }

    #[test]
    fn group_already_resolved_is_false_with_no_cache_entry() {
        let parts = vec![part(1, 10, "https://cdn/a")];
        assert!(!group_already_resolved(&HashMap::new(), &parts, &[0]));
    }
}
