//! lifecycle.rs — whole-file deletion (spec §3): enumerate a file's distinct
//! chat messages, delete each via C4, then remove the File row (cascading to
//! Parts and Shares) only after the chat-side deletes have either succeeded
//! or exhausted their retries. Grounded on the teacher's `api.rs::delete_file`
//! (load record → best-effort `delete_channel`/`delete_message` → drop the
//! local record), generalized from a single Discord channel-per-file shape
//! to the spec's per-message granularity.
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::bots::BotPool;
use crate::error::{Result, VaultError};
use crate::index::IndexStore;

pub struct FileDeleter {
    pub index: Arc<IndexStore>,
    pub bots: Arc<BotPool>,
}

impl FileDeleter {
    /// Deletes `file_id` end to end. Chat-side message deletes are
    /// best-effort past retry exhaustion (spec §3: "the behavior on
    /// exhaustion is a policy choice") — this implementation proceeds to
    /// remove the File row regardless, logging any message that could not be
    /// deleted, since refusing to ever remove the index entry would leave an
    /// unreachable file with no recovery path.
    pub async fn delete_file(&self, file_id: i64, cancel: &CancellationToken) -> Result<()> {
        if self.index.get_file_by_id(file_id).await?.is_none() {
            return Err(VaultError::SourceDataMissing(format!("file {file_id} not found")));
        }

        let messages = self.index.distinct_message_ids(file_id).await?;
        let mut failures = 0usize;
        for (message_id, channel_id) in &messages {
            if let Err(e) = self.bots.delete_message(*message_id, *channel_id as u64, cancel).await {
                failures += 1;
                warn!("delete_file({file_id}): message {message_id} could not be deleted: {e}");
            }
        }
        if failures > 0 {
            warn!(
                "delete_file({file_id}): {failures}/{} chat message(s) survived deletion; removing index entry anyway",
                messages.len()
            );
        }

        self.index.delete_file(file_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::models::{NewFile, NewPart};

    #[tokio::test]
    async fn distinct_message_ids_and_cascade_survive_a_multi_part_file() {
        // Exercises the two index-store calls `delete_file` chains together,
        // without needing a live bot pool (which requires real credentials).
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("lifecycle.sqlite3");
        let store = IndexStore::connect(&db_path).await.unwrap();

        let file = NewFile {
            original_name: "x.bin".into(),
            size: 20,
            mime_type: None,
            total_parts: 2,
            folder_id: None,
            user_id: None,
            encryption_header: None,
            media_width: None,
            media_height: None,
        };
        let parts = vec![
            NewPart {
                part_number: 1,
                message_id: 42,
                channel_id: 7,
                discord_url: "https://cdn.example.com/part1".into(),
                size: 26,
                plain_size: 10,
                iv: Some(vec![0u8; 12]),
                auth_tag: Some(vec![0u8; 16]),
            },
            NewPart {
                part_number: 2,
                message_id: 42, // same message: both parts were batched together
                channel_id: 7,
                discord_url: "https://cdn.example.com/part2".into(),
                size: 26,
                plain_size: 10,
                iv: Some(vec![1u8; 12]),
                auth_tag: Some(vec![1u8; 16]),
            },
        ];
        let file_id = store.insert_file_with_parts(file, parts).await.unwrap();

        let messages = store.distinct_message_ids(file_id).await.unwrap();
        assert_eq!(messages, vec![(42, 7)]); // one message, not two

        store.delete_file(file_id).await.unwrap();
        assert!(store.get_file_by_id(file_id).await.unwrap().is_none());
    }
}
