//! Per-chunk authenticated encryption (C1) and per-file key derivation (C2).
pub mod chunk;
pub mod kdf;
pub mod header;

pub use chunk::{decrypt_chunk, decrypt_legacy_blob, encrypt_chunk, EncryptedChunk, IV_LEN, TAG_LEN};
pub use header::{DuckTypedBytes, EncryptionHeader};
pub use kdf::{derive_key, DerivedKey, KeyCache};
