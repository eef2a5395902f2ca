//! kdf.rs — C2: PBKDF2-HMAC-SHA256 key derivation, cached per session.
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use zeroize::Zeroizing;

use crate::error::{Result, VaultError};

/// An immutable, zeroize-on-drop 32-byte AES-256 key.
pub struct DerivedKey(Zeroizing<[u8; 32]>);

impl DerivedKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Derives a 32-byte AES-256 key via PBKDF2-HMAC-SHA256.
pub fn derive_key(passphrase: &str, salt: &[u8], iterations: u32) -> Result<DerivedKey> {
    if salt.len() != 32 {
        return Err(VaultError::Internal(format!("salt must be 32 bytes, got {}", salt.len())));
    }
    let mut key = Zeroizing::new([0u8; 32]);
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, iterations, key.as_mut());
    Ok(DerivedKey(key))
}

fn fingerprint(passphrase: &str) -> [u8; 32] {
    let digest = Sha256::digest(passphrase.as_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Caches derived keys by `(passphrase-fingerprint, salt, iterations)` so a
/// download session that touches many parts of the same file derives the key
/// exactly once, per spec §4.2.
#[derive(Default)]
pub struct KeyCache {
    inner: Mutex<HashMap<([u8; 32], Vec<u8>, u32), Arc<DerivedKey>>>,
}

impl KeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_derive(&self, passphrase: &str, salt: &[u8], iterations: u32) -> Result<Arc<DerivedKey>> {
        let cache_key = (fingerprint(passphrase), salt.to_vec(), iterations);
        {
            let guard = self.inner.lock().unwrap();
            if let Some(k) = guard.get(&cache_key) {
                return Ok(Arc::clone(k));
            }
        }
        let derived = Arc::new(derive_key(passphrase, salt, iterations)?);
        self.inner.lock().unwrap().insert(cache_key, Arc::clone(&derived));
        Ok(derived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_for_fixed_inputs() {
        let salt = [0u8; 32];
        let a = derive_key("pw", &salt, 1000).unwrap();
        let b = derive_key("pw", &salt, 1000).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn differs_by_salt() {
        let a = derive_key("pw", &[0u8; 32], 1000).unwrap();
        let b = derive_key("pw", &[1u8; 32], 1000).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn cache_returns_same_key() {
        let cache = KeyCache::new();
        let salt = [3u8; 32];
        let a = cache.get_or_derive("pw", &salt, 1000).unwrap();
        let b = cache.get_or_derive("pw", &salt, 1000).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }
}
