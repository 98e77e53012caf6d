//! Content-addressed hashing for log entries.
//!
//! Uses SHA-256 to derive the identifier of every entry.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

/// Identifier of an entry: the SHA-256 digest of its canonical encoding.
///
/// Ordered bytewise, which is the tie-break between concurrent writes with
/// equal clocks.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; 32]);

impl Hash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex, 64 characters.
    pub fn to_hex(&self) -> String {
        encode_hex(&self.0)
    }

    /// Parse the 64-character hex form. Either case is accepted.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = decode_hex(s)?;
        <[u8; 32]>::try_from(bytes.as_slice()).ok().map(Hash)
    }

    /// First 8 hex characters, for log lines.
    pub fn short(&self) -> String {
        encode_hex(&self.0[..4])
    }
}

/// Lowercase hex of `bytes`.
pub(crate) fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Decode hex of either case. `None` on odd length or a non-hex character.
pub(crate) fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 || !s.is_ascii() {
        return None;
    }
    s.as_bytes()
        .chunks_exact(2)
        .map(|pair| {
            let high = (pair[0] as char).to_digit(16)?;
            let low = (pair[1] as char).to_digit(16)?;
            Some((high * 16 + low) as u8)
        })
        .collect()
}

/// Serde adapter for byte fields carried as hex strings.
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::encode_hex(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::decode_hex(&s).ok_or_else(|| serde::de::Error::custom("invalid hex string"))
    }
}

impl std::str::FromStr for Hash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Hash::from_hex(s).ok_or_else(|| format!("invalid hash: {s}"))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.short())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

// Hashes travel as hex strings on both the peer wire and the control channel.
impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse::<Hash>().map_err(serde::de::Error::custom)
    }
}

/// Incremental SHA-256 over the fields of a value.
pub struct Hasher {
    inner: Sha256,
}

impl Hasher {
    pub fn new() -> Self {
        Hasher {
            inner: Sha256::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Feed a variable-length field, prefixed with its length so adjacent
    /// fields cannot run into each other.
    pub fn field(&mut self, data: &[u8]) {
        self.inner.update((data.len() as u64).to_le_bytes());
        self.inner.update(data);
    }

    pub fn finalize(self) -> Hash {
        Hash(self.inner.finalize().into())
    }

    /// One-shot digest.
    pub fn hash(data: &[u8]) -> Hash {
        Hash(Sha256::digest(data).into())
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}
