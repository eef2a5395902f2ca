//! attachvault_core — content-addressed, chunked, AES-256-GCM-encrypted
//! block storage on top of a Discord-like attachment API.
pub mod bots;
pub mod config;
pub mod crypto;
pub mod download;
pub mod error;
pub mod fetcher;
pub mod health;
pub mod http;
pub mod index;
pub mod lifecycle;
pub mod naming;
pub mod range;
pub mod resolver;
pub mod state;
pub mod upload;

pub use error::{Result, VaultError};
pub use state::AppState;
