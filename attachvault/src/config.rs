/// config.rs — configuration loader.
/// Reads config.json, validates/clamps each field, falls back to defaults,
/// and lets bot.env override the secret fields (discord tokens, passphrase).
use serde::{Deserialize, Serialize};
use std::{fs, path::{Path, PathBuf}};

// ─── Raw JSON shapes (all-optional, for validation) ───────────────────────────

#[derive(Deserialize, Default, Clone)]
struct RawUpload {
    chunk_size_mb:     Option<u64>,
    batch_size:        Option<usize>,
    bots_per_channel:  Option<usize>,
    bot_init_retries:  Option<u32>,
    send_retries:      Option<u32>,
    send_retry_base_s: Option<u64>,
    encrypt:           Option<bool>,
    pbkdf2_iterations: Option<u32>,
}

#[derive(Deserialize, Default, Clone)]
struct RawDownload {
    http_timeout_s:        Option<u64>,
    download_concurrency:  Option<usize>,
    download_retries:      Option<u32>,
    download_retry_base_s: Option<u64>,
}

#[derive(Deserialize, Default, Clone)]
struct RawHealth {
    head_concurrency:    Option<usize>,
    head_timeout_s:      Option<u64>,
    refresh_concurrency: Option<usize>,
    sweep_interval_s:    Option<u64>,
}

#[derive(Deserialize, Default, Clone)]
struct RawServer {
    host:      Option<String>,
    port:      Option<u16>,
    log_level: Option<String>,
}

#[derive(Deserialize, Default, Clone)]
struct RawData {
    db_path:  Option<String>,
    temp_dir: Option<String>,
}

#[derive(Deserialize, Default, Clone)]
struct RawConfig {
    #[serde(default)]
    channel_ids: Vec<u64>,
    #[serde(default)]
    upload_channel_override: Option<u64>,
    #[serde(default)]
    public_base_url: Option<String>,
    #[serde(default)]
    upload: RawUpload,
    #[serde(default)]
    download: RawDownload,
    #[serde(default)]
    health: RawHealth,
    #[serde(default)]
    server: RawServer,
    #[serde(default)]
    data: RawData,
}

// ─── Validated, exported config ───────────────────────────────────────────────

#[derive(Clone, Debug, Serialize)]
pub struct Config {
    // Chat backend
    pub discord_tokens:          Vec<String>,
    pub channel_ids:             Vec<u64>,
    pub upload_channel_override: Option<u64>,
    pub bots_per_channel:        usize,
    pub bot_init_retries:        u32,

    // Upload
    pub chunk_size:        u64,
    pub batch_size:        usize,
    pub send_retries:      u32,
    pub send_retry_base_s: u64,
    pub encrypt:           bool,
    pub encryption_key:    Option<String>,
    pub pbkdf2_iterations: u32,

    // Download
    pub http_timeout_s:        u64,
    pub download_concurrency:  usize,
    pub download_retries:      u32,
    pub download_retry_base_s: u64,

    // Healthcheck
    pub head_concurrency:    usize,
    pub head_timeout_s:      u64,
    pub refresh_concurrency: usize,
    pub sweep_interval_s:    u64,

    // Server
    pub host:      String,
    pub port:      u16,
    pub log_level: String,

    // Data
    pub db_path:  PathBuf,
    pub temp_dir: PathBuf,

    pub public_base_url: Option<String>,
}

/// 8 MiB minus a KiB of headroom for the GCM tag and protocol overhead —
/// the ceiling a single chunk's on-wire attachment may occupy, per spec §4.5.
pub const MAX_CHUNK_SIZE: u64 = 8 * 1024 * 1024 - 1024;

impl Config {
    pub fn load(base_dir: &Path) -> Self {
        let path = base_dir.join("config.json");
        let raw: RawConfig = if path.exists() {
            match fs::read_to_string(&path).map_err(anyhow::Error::from).and_then(|s| {
                let mut val: serde_json::Value = serde_json::from_str(&s)?;
                strip_comment_keys(&mut val);
                serde_json::from_value(val).map_err(Into::into)
            }) {
                Ok(r) => r,
                Err(e) => {
                    eprintln!("⚠️  config.json parse error: {e} → using defaults");
                    RawConfig::default()
                }
            }
        } else {
            eprintln!("⚠️  config.json not found → using defaults");
            RawConfig::default()
        };

        let mut cfg = Self::from_raw(raw, base_dir);

        let env_path = base_dir.join("bot.env");
        if env_path.exists() {
            dotenvy::from_path(&env_path).ok();
        }
        if let Ok(tokens) = std::env::var("DISCORD_TOKENS") {
            cfg.discord_tokens = tokens.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(key) = std::env::var("ENCRYPTION_KEY") {
            if !key.is_empty() { cfg.encryption_key = Some(key); }
        }
        cfg
    }

    fn from_raw(r: RawConfig, base_dir: &Path) -> Self {
        let u = &r.upload;
        let d = &r.download;
        let h = &r.health;
        let s = &r.server;
        let dt = &r.data;

        macro_rules! clamp {
            ($val:expr, $default:expr, $lo:expr, $hi:expr) => {{
                let v = $val.unwrap_or($default);
                let (lo, hi) = ($lo, $hi);
                if v < lo || v > hi {
                    eprintln!("⚠️  config value {v} out of range [{lo},{hi}] → default {}", $default);
                    $default
                } else { v }
            }};
        }

        // Default is the full 8 MiB − 1 KiB ceiling (spec §6); an explicit
        // `chunk_size_mb` is honored in whole-MiB steps but still capped.
        let chunk_size = match u.chunk_size_mb {
            Some(mb) => (clamp!(Some(mb), 8, 1, 8) * 1024 * 1024).min(MAX_CHUNK_SIZE),
            None => MAX_CHUNK_SIZE,
        };
        let batch_size = clamp!(u.batch_size, 3, 1, 10);
        let bots_per_channel = clamp!(u.bots_per_channel, 5, 1, 20);
        let bot_init_retries = clamp!(u.bot_init_retries, 2, 0, 10);
        let send_retries = clamp!(u.send_retries, 5, 1, 10);
        let send_retry_base_s = clamp!(u.send_retry_base_s, 1, 1, 10);
        let encrypt = u.encrypt.unwrap_or(true);
        let pbkdf2_iterations = clamp!(u.pbkdf2_iterations, 100_000, 10_000, 1_000_000);

        let http_timeout_s = clamp!(d.http_timeout_s, 30, 5, 300);
        let download_concurrency = clamp!(d.download_concurrency, 6, 1, 32);
        let download_retries = clamp!(d.download_retries, 3, 1, 10);
        let download_retry_base_s = clamp!(d.download_retry_base_s, 1, 1, 10);

        let head_concurrency = clamp!(h.head_concurrency, 20, 1, 100);
        let head_timeout_s = clamp!(h.head_timeout_s, 10, 1, 60);
        let refresh_concurrency = clamp!(h.refresh_concurrency, 3, 1, 20);
        let sweep_interval_s = clamp!(h.sweep_interval_s, 3600, 60, 86_400);

        let log_level_raw = s.log_level.clone().unwrap_or_else(|| "info".to_string());
        let log_level = if ["debug", "info", "warn", "error"].contains(&log_level_raw.as_str()) {
            log_level_raw
        } else { "info".to_string() };

        Config {
            discord_tokens: vec![],
            channel_ids: r.channel_ids,
            upload_channel_override: r.upload_channel_override,
            bots_per_channel,
            bot_init_retries,

            chunk_size,
            batch_size,
            send_retries,
            send_retry_base_s,
            encrypt,
            encryption_key: None,
            pbkdf2_iterations,

            http_timeout_s,
            download_concurrency,
            download_retries,
            download_retry_base_s,

            head_concurrency,
            head_timeout_s,
            refresh_concurrency,
            sweep_interval_s,

            host: s.host.clone().unwrap_or_else(|| "0.0.0.0".to_string()),
            port: s.port.unwrap_or(8000),
            log_level,

            db_path: dt.db_path.clone().map(PathBuf::from)
                .unwrap_or_else(|| base_dir.join("attachvault.sqlite3")),
            temp_dir: dt.temp_dir.clone().map(PathBuf::from)
                .unwrap_or_else(|| base_dir.join("scratch")),

            public_base_url: r.public_base_url,
        }
    }

    /// Fields that must be present for the engine to start at all
    /// (`ConfigInvalid`, fatal at startup per spec §7).
    pub fn validate(&self) -> Result<(), String> {
        if self.discord_tokens.is_empty() {
            return Err("no discord_tokens configured".into());
        }
        if self.channel_ids.is_empty() {
            return Err("no channel_ids configured".into());
        }
        if self.chunk_size == 0 {
            return Err("chunk_size must be > 0".into());
        }
        if self.chunk_size > MAX_CHUNK_SIZE {
            return Err(format!("chunk_size exceeds backend attachment limit ({MAX_CHUNK_SIZE} bytes)"));
        }
        Ok(())
    }

    pub fn print_summary(&self) {
        println!("{}", "─".repeat(60));
        println!("⚙️  attachvault config");
        println!("   bots={} channels={} bots/channel={}", self.discord_tokens.len(), self.channel_ids.len(), self.bots_per_channel);
        println!("   chunk_size={:.1}MiB batch_size={} encrypt={}", self.chunk_size as f64 / 1024.0 / 1024.0, self.batch_size, self.encrypt);
        println!("   download_concurrency={} retries={}", self.download_concurrency, self.download_retries);
        println!("   server={}:{} log={}", self.host, self.port, self.log_level);
        println!("   db={}", self.db_path.display());
        println!("{}", "─".repeat(60));
    }
}

fn strip_comment_keys(val: &mut serde_json::Value) {
    if let serde_json::Value::Object(map) = val {
        let keys_to_remove: Vec<String> = map.keys().filter(|k| k.starts_with('_')).cloned().collect();
        for k in keys_to_remove { map.remove(&k); }
        for v in map.values_mut() { strip_comment_keys(v); }
    }
}
