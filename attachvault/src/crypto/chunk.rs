//! chunk.rs — C1: per-chunk AES-256-GCM encrypt/decrypt.
//!
//! `encrypt_chunk` returns the raw AES-GCM output with the 16-byte tag
//! appended — that concatenation is exactly what gets written to the wire as
//! an attachment's bytes (spec §6, "on-the-wire attachment content").
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;

use crate::error::{Result, VaultError};

pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

pub struct EncryptedChunk {
    /// AES-GCM ciphertext with the 16-byte auth tag appended.
    pub ciphertext_with_tag: Vec<u8>,
    pub iv: [u8; IV_LEN],
    pub plain_size: u64,
}

/// Encrypts one plaintext chunk with a fresh CSPRNG-drawn IV and empty AAD.
pub fn encrypt_chunk(plaintext: &[u8], key: &[u8; 32]) -> Result<EncryptedChunk> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    let nonce = Nonce::from_slice(&iv);

    let ciphertext_with_tag = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad: &[] })
        .map_err(|_| VaultError::Internal("AES-GCM encryption failed".into()))?;

    Ok(EncryptedChunk {
        ciphertext_with_tag,
        iv,
        plain_size: plaintext.len() as u64,
    })
}

/// Decrypts one chunk. The trailing 16 bytes of `ciphertext_with_tag` are the
/// auth tag; any bit-flip in ciphertext, tag, iv, or key yields
/// `AuthenticationFailure`.
pub fn decrypt_chunk(
    ciphertext_with_tag: &[u8],
    key: &[u8; 32],
    iv: &[u8; IV_LEN],
    part_number: u32,
) -> Result<Vec<u8>> {
    if ciphertext_with_tag.len() < TAG_LEN {
        return Err(VaultError::AuthenticationFailure { part_number });
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(iv);

    cipher
        .decrypt(nonce, Payload { msg: ciphertext_with_tag, aad: &[] })
        .map_err(|_| VaultError::AuthenticationFailure { part_number })
}

/// Legacy single-header format: the first 64 bytes of the reassembled blob
/// are `salt(32) ‖ iv(16) ‖ tag(16)`, followed by one AES-256-GCM ciphertext
/// pass over the rest. Only the first 12 bytes of the 16-byte `iv` field are
/// used as the GCM nonce (see DESIGN.md for why). Read-only compatibility —
/// new writes always use the v2 chunked header (spec §9 open question).
pub fn decrypt_legacy_blob(blob: &[u8], passphrase: &str, iterations: u32) -> Result<Vec<u8>> {
    const LEGACY_HEADER_LEN: usize = 32 + 16 + 16;
    if blob.len() < LEGACY_HEADER_LEN {
        return Err(VaultError::Internal("legacy blob shorter than header".into()));
    }
    let salt = &blob[0..32];
    let iv16 = &blob[32..48];
    let tag = &blob[48..64];
    let body = &blob[64..];

    let key = crate::crypto::kdf::derive_key(passphrase, salt, iterations)?;
    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&iv16[..IV_LEN]);

    let mut ciphertext_with_tag = Vec::with_capacity(body.len() + TAG_LEN);
    ciphertext_with_tag.extend_from_slice(body);
    ciphertext_with_tag.extend_from_slice(tag);

    decrypt_chunk(&ciphertext_with_tag, key.as_bytes(), &iv, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let key = [7u8; 32];
        let plaintext = b"hello world, this is a test chunk".to_vec();
        let enc = encrypt_chunk(&plaintext, &key).unwrap();
        let dec = decrypt_chunk(&enc.ciphertext_with_tag, &key, &enc.iv, 1).unwrap();
        assert_eq!(dec, plaintext);
    }

    #[test]
    fn tampered_tag_fails() {
        let key = [1u8; 32];
        let plaintext = b"some secret bytes".to_vec();
        let mut enc = encrypt_chunk(&plaintext, &key).unwrap();
        let last = enc.ciphertext_with_tag.len() - 1;
        enc.ciphertext_with_tag[last] ^= 0xFF;
        let err = decrypt_chunk(&enc.ciphertext_with_tag, &key, &enc.iv, 3).unwrap_err();
        assert!(matches!(err, VaultError::AuthenticationFailure { part_number: 3 }));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = [2u8; 32];
        let plaintext = b"another secret".to_vec();
        let mut enc = encrypt_chunk(&plaintext, &key).unwrap();
        enc.ciphertext_with_tag[0] ^= 0x01;
        assert!(decrypt_chunk(&enc.ciphertext_with_tag, &key, &enc.iv, 1).is_err());
    }

    #[test]
    fn tampered_iv_fails() {
        let key = [3u8; 32];
        let plaintext = b"yet another secret".to_vec();
        let mut enc = encrypt_chunk(&plaintext, &key).unwrap();
        enc.iv[0] ^= 0x01;
        assert!(decrypt_chunk(&enc.ciphertext_with_tag, &key, &enc.iv, 1).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let plaintext = b"secret under key a".to_vec();
        let enc = encrypt_chunk(&plaintext, &[9u8; 32]).unwrap();
        assert!(decrypt_chunk(&enc.ciphertext_with_tag, &[8u8; 32], &enc.iv, 1).is_err());
    }

    #[test]
    fn deterministic_given_fixed_iv() {
        // Same plaintext + key + (forced) iv must produce the same ciphertext.
        let key = [4u8; 32];
        let plaintext = b"deterministic test".to_vec();
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let iv = [5u8; IV_LEN];
        let nonce = Nonce::from_slice(&iv);
        let a = cipher.encrypt(nonce, Payload { msg: &plaintext, aad: &[] }).unwrap();
        let b = cipher.encrypt(nonce, Payload { msg: &plaintext, aad: &[] }).unwrap();
        assert_eq!(a, b);
    }
}
