//! Node identity and write access policy.
//!
//! Every node owns an ed25519 key pair for the lifetime of the process. The
//! public half travels inside each entry as its [`Author`], and the entry hash
//! is signed with the private half.

use crate::entry::Op;
use crate::hash::{encode_hex, hex_bytes, Hash};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Public identity stamped on every entry a node originates.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Author {
    /// Hex encoding of `public_key`.
    pub id: String,
    #[serde(with = "hex_bytes")]
    pub public_key: Vec<u8>,
}

impl Author {
    /// Check that `id` matches `public_key` and that the key is well formed.
    pub fn is_consistent(&self) -> bool {
        self.public_key.len() == 32 && self.id == encode_hex(&self.public_key)
    }

    /// Verify `signature` over `hash` against this author's key.
    pub fn verify(&self, hash: &Hash, signature: &[u8]) -> bool {
        let Ok(key_bytes) = <[u8; 32]>::try_from(self.public_key.as_slice()) else {
            return false;
        };
        let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify(hash.as_bytes(), &signature).is_ok()
    }

    /// First 8 characters of the id, for logs.
    pub fn short(&self) -> &str {
        match self.id.char_indices().nth(8) {
            Some((end, _)) => &self.id[..end],
            None => &self.id,
        }
    }
}

impl fmt::Debug for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Author({}...)", self.short())
    }
}

/// The local node identity, created once at startup.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    author: Author,
}

impl Identity {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        Self::from_signing_key(signing_key)
    }

    /// Derive an identity from a fixed 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(&seed))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let public_key = signing_key.verifying_key().to_bytes().to_vec();
        let author = Author {
            id: encode_hex(&public_key),
            public_key,
        };
        Identity {
            signing_key,
            author,
        }
    }

    /// The node id (hex public key).
    pub fn id(&self) -> &str {
        &self.author.id
    }

    /// The public identity embedded in entries.
    pub fn author(&self) -> &Author {
        &self.author
    }

    /// Sign an entry hash.
    pub fn stamp(&self, hash: &Hash) -> Vec<u8> {
        self.signing_key.sign(hash.as_bytes()).to_bytes().to_vec()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("id", &self.author.short())
            .finish_non_exhaustive()
    }
}

/// Write policy consulted before an operation enters the log.
pub trait AccessController: Send + Sync {
    /// Whether `author` may append `op`.
    fn can_append(&self, author: &Author, op: &Op) -> bool;
}

/// Anyone may write (`write: ["*"]`).
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenAccess;

impl AccessController for OpenAccess {
    fn can_append(&self, _author: &Author, _op: &Op) -> bool {
        true
    }
}

/// Only the listed author ids may write.
#[derive(Clone, Debug, Default)]
pub struct AllowList {
    writers: HashSet<String>,
}

impl AllowList {
    pub fn new<I, S>(writers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AllowList {
            writers: writers.into_iter().map(Into::into).collect(),
        }
    }

    pub fn allow(&mut self, id: impl Into<String>) {
        self.writers.insert(id.into());
    }
}

impl AccessController for AllowList {
    fn can_append(&self, author: &Author, _op: &Op) -> bool {
        self.writers.contains(&author.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Hasher;

    #[test]
    fn test_seeded_identity_is_stable() {
        let a = Identity::from_seed([7u8; 32]);
        let b = Identity::from_seed([7u8; 32]);
        assert_eq!(a.id(), b.id());
        assert_eq!(a.id().len(), 64);
        assert!(a.author().is_consistent());
    }

    #[test]
    fn test_stamp_verifies() {
        let identity = Identity::generate();
        let hash = Hasher::hash(b"payload");
        let signature = identity.stamp(&hash);

        assert!(identity.author().verify(&hash, &signature));
        assert!(!identity.author().verify(&Hasher::hash(b"other"), &signature));
        assert!(!identity.author().verify(&hash, &signature[..10]));
    }

    #[test]
    fn test_forged_author_rejected() {
        let real = Identity::from_seed([1u8; 32]);
        let other = Identity::from_seed([2u8; 32]);
        let hash = Hasher::hash(b"payload");

        let signature = other.stamp(&hash);
        assert!(!real.author().verify(&hash, &signature));

        let mut forged = real.author().clone();
        forged.id = other.id().to_string();
        assert!(!forged.is_consistent());
    }

    #[test]
    fn test_access_policies() {
        let writer = Identity::from_seed([3u8; 32]);
        let stranger = Identity::from_seed([4u8; 32]);
        let op = Op::delete("k");

        assert!(OpenAccess.can_append(stranger.author(), &op));

        let list = AllowList::new([writer.id()]);
        assert!(list.can_append(writer.author(), &op));
        assert!(!list.can_append(stranger.author(), &op));
    }

    #[test]
    fn test_author_hex_roundtrip() {
        let author = Identity::from_seed([9u8; 32]).author().clone();
        let json = serde_json::to_string(&author).unwrap();
        let back: Author = serde_json::from_str(&json).unwrap();
        assert_eq!(back, author);
    }

    #[test]
    fn test_short_id_never_splits_a_character() {
        let mut author = Identity::from_seed([9u8; 32]).author().clone();
        assert_eq!(author.short(), &author.id[..8]);

        author.id = "abc".into();
        assert_eq!(author.short(), "abc");

        author.id = "ééééééééé".into();
        assert_eq!(author.short(), "éééééééé");
    }

    #[test]
    fn test_public_key_rejects_bad_hex() {
        let author = Identity::from_seed([9u8; 32]).author().clone();
        let mut json = serde_json::to_value(&author).unwrap();
        json["public_key"] = serde_json::json!("abc");
        assert!(serde_json::from_value::<Author>(json.clone()).is_err());
        json["public_key"] = serde_json::json!("zz".repeat(32));
        assert!(serde_json::from_value::<Author>(json).is_err());
    }
}
