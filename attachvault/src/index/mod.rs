//! index/mod.rs — C3: durable relational catalogue of files, parts, folders,
//! and shares, with transactional File+Part commit.
pub mod models;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;

use crate::crypto::header::decode_any_shape;
use crate::error::{Result, VaultError};
use models::{File, NewFile, NewPart, Part, PartHealth, PartUrlUpdate};

#[derive(Clone)]
pub struct IndexStore {
    pool: SqlitePool,
}

impl IndexStore {
    pub async fn connect(db_path: &Path) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))
            .map_err(|e| VaultError::Internal(format!("bad db path: {e}")))?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(opts)
            .await?;
        sqlx::migrate!("src/index/migrations").run(&pool).await
            .map_err(|e| VaultError::Internal(format!("migration failed: {e}")))?;
        Ok(IndexStore { pool })
    }

    /// Inserts the File row and all of its Parts in one transaction. The
    /// File row is written first (so file_parts' foreign key is always
    /// satisfied without deferring constraint checks); transaction atomicity
    /// is what actually provides the "never a partial Part set" guarantee
    /// from spec §3, independent of insertion order.
    pub async fn insert_file_with_parts(&self, file: NewFile, parts: Vec<NewPart>) -> Result<i64> {
        if parts.len() as u32 != file.total_parts {
            return Err(VaultError::Internal(format!(
                "total_parts mismatch: file says {}, got {} parts",
                file.total_parts,
                parts.len()
            )));
        }
        let mut tx = self.pool.begin().await?;

        let file_id: i64 = sqlx::query(
            r#"INSERT INTO files
               (original_name, size, mime_type, total_parts, folder_id, user_id,
                encryption_header, media_width, media_height)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
        )
        .bind(&file.original_name)
        .bind(file.size as i64)
        .bind(&file.mime_type)
        .bind(file.total_parts as i64)
        .bind(file.folder_id)
        .bind(file.user_id)
        .bind(&file.encryption_header)
        .bind(file.media_width.map(|v| v as i64))
        .bind(file.media_height.map(|v| v as i64))
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        for p in &parts {
            sqlx::query(
                r#"INSERT INTO file_parts
                   (file_id, part_number, message_id, channel_id, discord_url,
                    size, plain_size, iv, auth_tag, health)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'unknown')"#,
            )
            .bind(file_id)
            .bind(p.part_number as i64)
            .bind(p.message_id)
            .bind(p.channel_id)
            .bind(&p.discord_url)
            .bind(p.size as i64)
            .bind(p.plain_size as i64)
            .bind(p.iv.as_ref().map(|b| base64_encode(b)))
            .bind(p.auth_tag.as_ref().map(|b| base64_encode(b)))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(file_id)
    }

    pub async fn get_file_by_id(&self, id: i64) -> Result<Option<File>> {
        let Some(file_row) = sqlx::query(
            r#"SELECT id, original_name, size, mime_type, total_parts, folder_id, user_id,
                      encryption_header, media_width, media_height, created_at
               FROM files WHERE id = ?1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let part_rows = sqlx::query(
            r#"SELECT id, file_id, part_number, message_id, channel_id, discord_url,
                      size, plain_size, iv, auth_tag, health
               FROM file_parts WHERE file_id = ?1 ORDER BY part_number ASC"#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let mut parts = Vec::with_capacity(part_rows.len());
        for row in part_rows {
            parts.push(Part {
                id: row.try_get("id")?,
                file_id: row.try_get("file_id")?,
                part_number: row.try_get::<i64, _>("part_number")? as u32,
                message_id: row.try_get("message_id")?,
                channel_id: row.try_get("channel_id")?,
                discord_url: row.try_get("discord_url")?,
                size: row.try_get::<i64, _>("size")? as u64,
                plain_size: row.try_get::<i64, _>("plain_size")? as u64,
                iv: decode_text_column(row.try_get::<Option<String>, _>("iv")?),
                auth_tag: decode_text_column(row.try_get::<Option<String>, _>("auth_tag")?),
                health: PartHealth::parse(&row.try_get::<String, _>("health")?),
            });
        }

        Ok(Some(File {
            id: file_row.try_get("id")?,
            original_name: file_row.try_get("original_name")?,
            size: file_row.try_get::<i64, _>("size")? as u64,
            mime_type: file_row.try_get("mime_type")?,
            total_parts: file_row.try_get::<i64, _>("total_parts")? as u32,
            folder_id: file_row.try_get("folder_id")?,
            user_id: file_row.try_get("user_id")?,
            encryption_header: file_row.try_get("encryption_header")?,
            media_width: file_row.try_get::<Option<i64>, _>("media_width")?.map(|v| v as u32),
            media_height: file_row.try_get::<Option<i64>, _>("media_height")?.map(|v| v as u32),
            created_at: file_row.try_get("created_at")?,
            parts,
        }))
    }

    /// Idempotent, batched URL refresh writes — running this twice with the
    /// same updates is a no-op change in effect, per spec §8 property 6.
    pub async fn update_part_urls(&self, updates: &[PartUrlUpdate]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for u in updates {
            sqlx::query("UPDATE file_parts SET discord_url = ?1 WHERE id = ?2")
                .bind(&u.new_url)
                .bind(u.part_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn update_part_health(&self, part_id: i64, health: PartHealth) -> Result<()> {
        sqlx::query("UPDATE file_parts SET health = ?1 WHERE id = ?2")
            .bind(health.as_str())
            .bind(part_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Cascades to file_parts and shares via `ON DELETE CASCADE`.
    pub async fn delete_file(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM files WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_files(&self, folder_id: Option<i64>, user_id: Option<i64>) -> Result<Vec<File>> {
        let rows = sqlx::query(
            r#"SELECT id, original_name, size, mime_type, total_parts, folder_id, user_id,
                      encryption_header, media_width, media_height, created_at
               FROM files
               WHERE (?1 IS NULL OR folder_id = ?1)
                 AND (?2 IS NULL OR user_id = ?2)
               ORDER BY created_at DESC"#,
        )
        .bind(folder_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(File {
                    id: row.try_get("id")?,
                    original_name: row.try_get("original_name")?,
                    size: row.try_get::<i64, _>("size")? as u64,
                    mime_type: row.try_get("mime_type")?,
                    total_parts: row.try_get::<i64, _>("total_parts")? as u32,
                    folder_id: row.try_get("folder_id")?,
                    user_id: row.try_get("user_id")?,
                    encryption_header: row.try_get("encryption_header")?,
                    media_width: row.try_get::<Option<i64>, _>("media_width")?.map(|v| v as u32),
                    media_height: row.try_get::<Option<i64>, _>("media_height")?.map(|v| v as u32),
                    created_at: row.try_get("created_at")?,
                    parts: Vec::new(),
                })
            })
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()
            .map_err(Into::into)
    }

    /// Distinct message ids owning a file's parts, used by the delete
    /// pipeline to know which chat messages to remove (spec §3 lifecycle).
    pub async fn distinct_message_ids(&self, file_id: i64) -> Result<Vec<(i64, i64)>> {
        let rows = sqlx::query(
            "SELECT DISTINCT message_id, channel_id FROM file_parts WHERE file_id = ?1",
        )
        .bind(file_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| Ok((r.try_get("message_id")?, r.try_get("channel_id")?)))
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()
            .map_err(Into::into)
    }

    /// Resolves a share token to its owning `file_id`, the only share-link
    /// behaviour this engine needs (spec §1: share CRUD is out of scope,
    /// but the read path it relies on to serve a download is not). Returns
    /// `None` for an unknown or expired token.
    pub async fn resolve_share_token(&self, token: &str) -> Result<Option<i64>> {
        let row = sqlx::query(
            r#"SELECT file_id FROM shares
               WHERE token = ?1 AND (expires_at IS NULL OR expires_at > datetime('now'))"#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.try_get::<i64, _>("file_id")).transpose().map_err(Into::into)
    }

    /// Issues a new share token for `file_id`, optionally expiring at
    /// `expires_at` (RFC3339). The token itself is caller-supplied (the CLI
    /// generates a UUID) — this store only persists the mapping.
    pub async fn create_share(&self, file_id: i64, token: &str, expires_at: Option<&str>) -> Result<()> {
        sqlx::query("INSERT INTO shares (file_id, token, expires_at) VALUES (?1, ?2, ?3)")
            .bind(file_id)
            .bind(token)
            .bind(expires_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn base64_encode(b: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(b)
}

fn decode_text_column(v: Option<String>) -> Option<Vec<u8>> {
    v.and_then(|s| decode_any_shape(s.as_bytes()).ok())
}
