//! header.rs — per-file encryption header (spec §6) and the duck-typed byte
//! decoder that accepts the four shapes iv/auth_tag/salt have historically
//! been stored in: raw bytes, a JSON int array, a comma-separated decimal
//! string, or a base64 string.
use base64::Engine as _;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const V2_VERSION: &str = "v2-chunked-aes-gcm";
pub const V2_METHOD: &str = "chunked-aes-gcm-12";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionHeader {
    pub version: String,
    pub method: String,
    pub salt: DuckTypedBytes,
    #[serde(rename = "pbkdf2Iterations")]
    pub pbkdf2_iterations: u32,
    #[serde(rename = "ivLength")]
    pub iv_length: u32,
    #[serde(rename = "tagLength")]
    pub tag_length: u32,
    #[serde(rename = "chunkSize")]
    pub chunk_size: u64,
}

impl EncryptionHeader {
    /// Builds a fresh v2 header: a new random 32-byte salt, the configured
    /// KDF iteration count, and the file's chunk size.
    pub fn new_v2(pbkdf2_iterations: u32, chunk_size: u64) -> Self {
        let mut salt = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut salt);
        EncryptionHeader {
            version: V2_VERSION.to_string(),
            method: V2_METHOD.to_string(),
            salt: DuckTypedBytes(salt),
            pbkdf2_iterations,
            iv_length: crate::crypto::chunk::IV_LEN as u32,
            tag_length: crate::crypto::chunk::TAG_LEN as u32,
            chunk_size,
        }
    }

    pub fn is_legacy(&self) -> bool {
        self.version != V2_VERSION
    }
}

/// A byte buffer that (de)serializes across the shapes the original store
/// has accumulated over time. New writes always emit base64 (spec §9 open
/// question: base64 chosen as the canonical on-disk shape).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuckTypedBytes(pub Vec<u8>);

impl DuckTypedBytes {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for DuckTypedBytes {
    fn from(v: Vec<u8>) -> Self {
        DuckTypedBytes(v)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawShape {
    Array(Vec<u8>),
    Text(String),
}

impl<'de> Deserialize<'de> for DuckTypedBytes {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = RawShape::deserialize(deserializer)?;
        let bytes = match raw {
            RawShape::Array(v) => v,
            RawShape::Text(s) => decode_text_shape(&s).map_err(serde::de::Error::custom)?,
        };
        Ok(DuckTypedBytes(bytes))
    }
}

impl Serialize for DuckTypedBytes {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(&self.0))
    }
}

/// Decodes a byte buffer known to be text: base64, or comma-separated
/// decimal (`"12,5,200,..."`). Used both for the header's `salt` field and
/// for legacy TEXT-column `iv`/`auth_tag` values read from the index.
pub fn decode_text_shape(s: &str) -> Result<Vec<u8>, String> {
    let trimmed = s.trim();
    if trimmed.contains(',') {
        let parsed: Result<Vec<u8>, _> =
            trimmed.split(',').map(|p| p.trim().parse::<u8>()).collect();
        if let Ok(bytes) = parsed {
            return Ok(bytes);
        }
    }
    if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(trimmed) {
        return Ok(bytes);
    }
    Err(format!("cannot decode byte shape from {s:?}"))
}

/// Decodes a byte column that may have been persisted as raw bytes, a JSON
/// int array, comma-decimal text, or base64 text — the full set of shapes
/// named in spec §4.3's schema notes.
pub fn decode_any_shape(raw: &[u8]) -> Result<Vec<u8>, String> {
    // A raw BLOB of exactly IV/tag/salt length is already the final shape.
    if raw.len() == 12 || raw.len() == 16 || raw.len() == 32 {
        // Still try to see if it's actually ASCII text in one of the other
        // shapes before accepting it as literal bytes — e.g. a 12-character
        // base64 string is implausible for 12 raw IV bytes but let's not
        // guess: if it parses as valid UTF-8 *and* as one of the text
        // shapes, prefer the text interpretation (this is how the legacy
        // store actually behaves: TEXT columns that happen to be short).
        if let Ok(s) = std::str::from_utf8(raw) {
            if let Ok(bytes) = decode_text_shape(s) {
                return Ok(bytes);
            }
        }
        return Ok(raw.to_vec());
    }
    if let Ok(v) = serde_json::from_slice::<Vec<u8>>(raw) {
        return Ok(v);
    }
    if let Ok(s) = std::str::from_utf8(raw) {
        return decode_text_shape(s);
    }
    Ok(raw.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_json() {
        let header = EncryptionHeader::new_v2(100_000, 8_387_584);
        let json = serde_json::to_string(&header).unwrap();
        let back: EncryptionHeader = serde_json::from_str(&json).unwrap();
        assert_eq!(header.salt, back.salt);
        assert_eq!(back.version, V2_VERSION);
    }

    #[test]
    fn header_accepts_int_array_salt() {
        let json = r#"{
            "version": "v2-chunked-aes-gcm",
            "method": "chunked-aes-gcm-12",
            "salt": [1,2,3,4],
            "pbkdf2Iterations": 100000,
            "ivLength": 12,
            "tagLength": 16,
            "chunkSize": 1024
        }"#;
        let header: EncryptionHeader = serde_json::from_str(json).unwrap();
        assert_eq!(header.salt.as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn decode_text_shape_handles_base64_and_csv() {
        let b64 = base64::engine::general_purpose::STANDARD.encode([1u8, 2, 3]);
        assert_eq!(decode_text_shape(&b64).unwrap(), vec![1, 2, 3]);
        assert_eq!(decode_text_shape("10,20,30").unwrap(), vec![10, 20, 30]);
    }
}
