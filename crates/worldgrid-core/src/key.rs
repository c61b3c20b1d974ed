//! Opaque record key encoding.
//!
//! Keys travel through task payloads and URLs, so they are encoded as
//! lowercase hex of `world/<id>`. Decoding validates every layer.

use std::fmt;

use thiserror::Error;

const KIND: &str = "world";

/// Identity of a world record, safe to round-trip through task payloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorldKey {
    world_id: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("key is empty")]
    Empty,
    #[error("key is not valid hex: {0}")]
    NotHex(String),
    #[error("key is not valid utf-8")]
    NotUtf8,
    #[error("unexpected key kind: {0}")]
    WrongKind(String),
    #[error("world id must not be empty")]
    EmptyId,
}

impl WorldKey {
    pub fn new(world_id: impl Into<String>) -> Result<Self, KeyError> {
        let world_id = world_id.into();
        if world_id.is_empty() {
            return Err(KeyError::EmptyId);
        }
        Ok(Self { world_id })
    }

    pub fn world_id(&self) -> &str {
        &self.world_id
    }

    pub fn encode(&self) -> String {
        hex::encode(format!("{KIND}/{}", self.world_id))
    }

    pub fn decode(encoded: &str) -> Result<Self, KeyError> {
        let encoded = encoded.trim();
        if encoded.is_empty() {
            return Err(KeyError::Empty);
        }
        let bytes = hex::decode(encoded).map_err(|e| KeyError::NotHex(e.to_string()))?;
        let raw = String::from_utf8(bytes).map_err(|_| KeyError::NotUtf8)?;
        let (kind, id) = raw
            .split_once('/')
            .ok_or_else(|| KeyError::WrongKind(raw.clone()))?;
        if kind != KIND {
            return Err(KeyError::WrongKind(kind.to_string()));
        }
        Self::new(id)
    }
}

impl fmt::Display for WorldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{KIND}/{}", self.world_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_recovers_world_id() {
        let key = WorldKey::new("alpha").unwrap();
        let decoded = WorldKey::decode(&key.encode()).unwrap();
        assert_eq!(decoded.world_id(), "alpha");
    }

    #[test]
    fn world_ids_with_separators_survive() {
        let key = WorldKey::new("team/alpha beta").unwrap();
        let decoded = WorldKey::decode(&key.encode()).unwrap();
        assert_eq!(decoded, key);
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(WorldKey::decode(""), Err(KeyError::Empty));
        assert!(matches!(WorldKey::decode("zz"), Err(KeyError::NotHex(_))));
        assert!(matches!(WorldKey::decode("ff"), Err(KeyError::NotUtf8)));
        let other = hex::encode("server/alpha");
        assert_eq!(
            WorldKey::decode(&other),
            Err(KeyError::WrongKind("server".to_string()))
        );
        assert_eq!(WorldKey::decode(&hex::encode("world/")), Err(KeyError::EmptyId));
    }

    #[test]
    fn empty_world_id_is_rejected() {
        assert_eq!(WorldKey::new(""), Err(KeyError::EmptyId));
    }
}
