//! Node identity types.

use std::{fmt, str::FromStr};

use bincode::{Decode, Encode};
use ed25519_dalek::SigningKey;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// A node's 256-bit public identity.
///
/// The hex encoding of the key doubles as the peer key used by the switch to deduplicate
/// connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub struct PubKey {
    bytes: [u8; Self::BYTES],
}

impl PubKey {
    /// The size of the key in bytes.
    pub const BYTES: usize = 32;

    /// Creates a new key from the supplied bytes.
    pub fn new(bytes: [u8; Self::BYTES]) -> Self {
        PubKey { bytes }
    }

    /// Returns the bytes backing the key.
    pub fn bytes(&self) -> [u8; Self::BYTES] {
        self.bytes
    }

    #[cfg(test)]
    /// Convenience function for working with small keys during testing.
    pub fn from_u16(raw: u16) -> Self {
        let mut bytes = [0u8; Self::BYTES];
        bytes[..2].copy_from_slice(&raw.to_le_bytes());

        Self { bytes }
    }
}

impl fmt::Display for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.bytes))
    }
}

impl FromStr for PubKey {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; Self::BYTES];
        hex::decode_to_slice(s, &mut bytes)?;

        Ok(Self { bytes })
    }
}

impl Serialize for PubKey {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PubKey {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// The node's private identity, handed to the secure transport on every connection.
#[derive(Clone)]
pub struct NodeKey {
    signing: SigningKey,
}

impl NodeKey {
    /// Creates a key from its 32 secret bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&bytes),
        }
    }

    /// Generates a fresh random key.
    pub fn generate() -> Self {
        use rand::{thread_rng, Fill};

        let mut rng = thread_rng();
        let mut bytes = [0u8; 32];
        let _res = bytes.try_fill(&mut rng);
        // Sanity check this doesn't fail in debug mode.
        debug_assert!(_res.is_ok());

        Self::from_bytes(bytes)
    }

    /// Returns the public half of the key.
    pub fn pub_key(&self) -> PubKey {
        PubKey::new(self.signing.verifying_key().to_bytes())
    }

    /// Returns the underlying signing key.
    pub fn signing_key(&self) -> &SigningKey {
        &self.signing
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the secret.
        f.debug_struct("NodeKey")
            .field("pub_key", &format_args!("{}", self.pub_key()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let key = PubKey::from_u16(0xbeef);
        let encoded = key.to_string();

        assert_eq!(encoded.len(), PubKey::BYTES * 2);
        assert!(encoded.starts_with("efbe"));
        assert_eq!(encoded.parse::<PubKey>().unwrap(), key);
    }

    #[test]
    fn parse_rejects_bad_length() {
        assert!("abcd".parse::<PubKey>().is_err());
        assert!("zz".repeat(32).parse::<PubKey>().is_err());
    }

    #[test]
    fn node_key_is_deterministic() {
        let a = NodeKey::from_bytes([7u8; 32]);
        let b = NodeKey::from_bytes([7u8; 32]);
        assert_eq!(a.pub_key(), b.pub_key());

        let c = NodeKey::generate();
        assert_ne!(a.pub_key(), c.pub_key());
    }

    #[test]
    fn debug_hides_secret() {
        let key = NodeKey::from_bytes([1u8; 32]);
        let debug = format!("{key:?}");
        assert!(debug.contains(&key.pub_key().to_string()));
    }
}
