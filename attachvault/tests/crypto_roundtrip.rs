//! End-to-end crypto path: derive a key from a passphrase, encrypt several
//! chunks, and verify decrypt round-trips and tamper detection across the
//! KeyCache + chunk codec boundary together (not just each module alone).
use attachvault_core::crypto::{decrypt_chunk, encrypt_chunk, EncryptionHeader, KeyCache};

#[test]
fn passphrase_derived_key_round_trips_multiple_chunks() {
    let header = EncryptionHeader::new_v2(50_000, 1024 * 1024);
    let keys = KeyCache::new();
    let derived = keys.get_or_derive("correct horse battery staple", header.salt.as_slice(), header.pbkdf2_iterations).unwrap();

    let chunks: Vec<&[u8]> = vec![b"chunk one bytes", b"chunk two has different content", b"!"];
    for (i, plaintext) in chunks.iter().enumerate() {
        let enc = encrypt_chunk(plaintext, derived.as_bytes()).unwrap();
        let dec = decrypt_chunk(&enc.ciphertext_with_tag, derived.as_bytes(), &enc.iv, i as u32 + 1).unwrap();
        assert_eq!(&dec, plaintext);
    }
}

#[test]
fn wrong_passphrase_fails_to_decrypt() {
    let header = EncryptionHeader::new_v2(50_000, 1024);
    let keys = KeyCache::new();
    let right = keys.get_or_derive("correct-password", header.salt.as_slice(), header.pbkdf2_iterations).unwrap();
    let wrong = keys.get_or_derive("wrong-password", header.salt.as_slice(), header.pbkdf2_iterations).unwrap();

    let plaintext = b"sensitive payload";
    let enc = encrypt_chunk(plaintext, right.as_bytes()).unwrap();
    let err = decrypt_chunk(&enc.ciphertext_with_tag, wrong.as_bytes(), &enc.iv, 1).unwrap_err();
    assert!(err.to_string().contains("authentication failure"));
}

#[test]
fn each_chunk_gets_a_distinct_iv() {
    let key = [11u8; 32];
    let a = encrypt_chunk(b"same plaintext", &key).unwrap();
    let b = encrypt_chunk(b"same plaintext", &key).unwrap();
    assert_ne!(a.iv, b.iv);
    assert_ne!(a.ciphertext_with_tag, b.ciphertext_with_tag);
}

#[test]
fn key_cache_is_stable_across_repeated_header_parses() {
    let header = EncryptionHeader::new_v2(50_000, 4096);
    let json = serde_json::to_string(&header).unwrap();

    let keys = KeyCache::new();
    let parsed_a: EncryptionHeader = serde_json::from_str(&json).unwrap();
    let parsed_b: EncryptionHeader = serde_json::from_str(&json).unwrap();

    let key_a = keys.get_or_derive("pw", parsed_a.salt.as_slice(), parsed_a.pbkdf2_iterations).unwrap();
    let key_b = keys.get_or_derive("pw", parsed_b.salt.as_slice(), parsed_b.pbkdf2_iterations).unwrap();
    assert_eq!(key_a.as_bytes(), key_b.as_bytes());
}
