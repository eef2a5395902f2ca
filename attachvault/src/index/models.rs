//! models.rs — row types for the index store (spec §3).
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartHealth {
    Unknown,
    Healthy,
    UrlRefreshed,
    Unhealthy,
    Error,
}

impl PartHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartHealth::Unknown => "unknown",
            PartHealth::Healthy => "healthy",
            PartHealth::UrlRefreshed => "url_refreshed",
            PartHealth::Unhealthy => "unhealthy",
            PartHealth::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "healthy" => PartHealth::Healthy,
            "url_refreshed" => PartHealth::UrlRefreshed,
            "unhealthy" => PartHealth::Unhealthy,
            "error" => PartHealth::Error,
            _ => PartHealth::Unknown,
        }
    }
}

/// One encrypted chunk, corresponding to a single chat-backend attachment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Part {
    pub id: i64,
    pub file_id: i64,
    pub part_number: u32,
    pub message_id: i64,
    pub channel_id: i64,
    pub discord_url: String,
    pub size: u64,
    pub plain_size: u64,
    pub iv: Option<Vec<u8>>,
    pub auth_tag: Option<Vec<u8>>,
    pub health: PartHealth,
}

/// A new part awaiting insertion, produced mid-upload before it has an id.
#[derive(Debug, Clone)]
pub struct NewPart {
    pub part_number: u32,
    pub message_id: i64,
    pub channel_id: i64,
    pub discord_url: String,
    pub size: u64,
    pub plain_size: u64,
    pub iv: Option<Vec<u8>>,
    pub auth_tag: Option<Vec<u8>>,
}

/// Logical user-facing object: the file as a whole plus its ordered parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct File {
    pub id: i64,
    pub original_name: String,
    pub size: u64,
    pub mime_type: Option<String>,
    pub total_parts: u32,
    pub folder_id: Option<i64>,
    pub user_id: Option<i64>,
    pub encryption_header: Option<String>,
    pub media_width: Option<u32>,
    pub media_height: Option<u32>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl File {
    pub fn is_encrypted(&self) -> bool {
        self.encryption_header.is_some()
    }
}

/// Fields needed to insert a new File row; `id` and `created_at` are assigned
/// by the store.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub original_name: String,
    pub size: u64,
    pub mime_type: Option<String>,
    pub total_parts: u32,
    pub folder_id: Option<i64>,
    pub user_id: Option<i64>,
    pub encryption_header: Option<String>,
    pub media_width: Option<u32>,
    pub media_height: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct PartUrlUpdate {
    pub part_id: i64,
    pub new_url: String,
}
