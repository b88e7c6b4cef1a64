//! Git object ids and content hashing

use std::fmt;

use gix_object::Kind;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Git SHA-1 object identifier (20 raw bytes, rendered as 40 hex characters)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjectId([u8; 20]);

impl ObjectId {
    pub const LEN: usize = 20;
    pub const ZERO: ObjectId = ObjectId([0u8; 20]);

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; 20] = bytes.try_into().ok()?;
        Some(Self(raw))
    }

    /// Parse 40 hex characters (surrounding whitespace is ignored)
    pub fn from_hex(s: &str) -> Option<Self> {
        let mut raw = [0u8; 20];
        hex::decode_to_slice(s.trim(), &mut raw).ok()?;
        Some(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl Serialize for ObjectId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ObjectId::from_hex(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid object id: {}", s)))
    }
}

/// A fully materialized Git object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitObject {
    pub id: ObjectId,
    pub kind: Kind,
    pub data: Vec<u8>,
}

impl GitObject {
    /// Create a GitObject from raw object data (without header)
    pub fn from_raw(kind: Kind, data: Vec<u8>) -> Self {
        let id = compute_object_id(kind, &data);
        Self { id, kind, data }
    }
}

pub fn kind_name(kind: Kind) -> &'static str {
    match kind {
        Kind::Commit => "commit",
        Kind::Tree => "tree",
        Kind::Blob => "blob",
        Kind::Tag => "tag",
    }
}

/// Compute the Git object id over `"{type} {length}\0{content}"`
pub fn compute_object_id(kind: Kind, data: &[u8]) -> ObjectId {
    let header = format!("{} {}\0", kind_name(kind), data.len());
    let mut hasher = Sha1::new();
    hasher.update(header.as_bytes());
    hasher.update(data);
    ObjectId(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_object_id() {
        // Known blob: "test\n" -> SHA-1: 9daeafb9864cf43055ae93beb0afd6c7d144bfa4
        let id = compute_object_id(Kind::Blob, b"test\n");
        assert_eq!(id.to_hex(), "9daeafb9864cf43055ae93beb0afd6c7d144bfa4");
    }

    #[test]
    fn test_empty_tree_and_blob() {
        assert_eq!(
            compute_object_id(Kind::Blob, b"").to_hex(),
            "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391"
        );
        assert_eq!(
            compute_object_id(Kind::Tree, b"").to_hex(),
            "4b825dc642cb6eb9a060e54bf8d69288fbee4904"
        );
    }

    #[test]
    fn test_hex_parsing() {
        let id = ObjectId::from_hex("9daeafb9864cf43055ae93beb0afd6c7d144bfa4\n").unwrap();
        assert_eq!(id, compute_object_id(Kind::Blob, b"test\n"));
        assert!(ObjectId::from_hex("9daeafb9").is_none());
        assert!(ObjectId::from_hex(&"0".repeat(40)).unwrap().is_zero());
    }

    #[test]
    fn test_serde_as_hex_string() {
        let obj = GitObject::from_raw(Kind::Blob, b"hello world\n".to_vec());
        let json = serde_json::to_string(&obj.id).unwrap();
        assert_eq!(json, "\"3b18e512dba79e4c8300dd08aeb37f8e728b8dad\"");
        let back: ObjectId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, obj.id);
    }
}
