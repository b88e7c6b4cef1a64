//! Key layout of a repository inside the store.

use std::{fmt, str::FromStr};

use crate::{error::Error, pack::ObjectId};

const PACK_DIR: &str = "objects/pack";

/// A repository identified as `owner/name`; every key it owns starts with that prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoNamespace {
    owner: String,
    name: String,
}

impl RepoNamespace {
    pub fn parse(uri: &str) -> Result<Self, Error> {
        let invalid = || Error::InvalidNamespace(uri.to_string());
        let (owner, name) = uri.split_once('/').ok_or_else(invalid)?;
        for part in [owner, name] {
            if part.is_empty()
                || part == "."
                || part == ".."
                || part.contains('/')
                || part.chars().any(|c| c.is_whitespace() || c.is_control())
            {
                return Err(invalid());
            }
        }
        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }

    pub fn head_key(&self) -> String {
        format!("{}/HEAD", self)
    }

    pub fn config_key(&self) -> String {
        format!("{}/config", self)
    }

    /// Key of a reference such as `refs/heads/main`
    pub fn ref_key(&self, reference: &str) -> String {
        format!("{}/{}", self, reference)
    }

    pub fn refs_prefix(&self) -> String {
        format!("{}/refs/", self)
    }

    /// Reference name for a key below [`refs_prefix`](Self::refs_prefix)
    pub fn ref_name<'k>(&self, key: &'k str) -> Option<&'k str> {
        let own = format!("{}/", self);
        key.strip_prefix(own.as_str())
            .filter(|name| name.starts_with("refs/"))
    }

    pub fn packs_prefix(&self) -> String {
        format!("{}/{}/", self, PACK_DIR)
    }

    pub fn pack_key(&self, checksum: &ObjectId) -> String {
        format!("{}/{}/pack-{}.pack", self, PACK_DIR, checksum)
    }

    pub fn index_key(&self, checksum: &ObjectId) -> String {
        format!("{}/{}/pack-{}.idx", self, PACK_DIR, checksum)
    }

    /// Pack checksum named by an `.idx` key of this repository
    pub fn index_checksum(&self, key: &str) -> Option<ObjectId> {
        let file = key.strip_prefix(self.packs_prefix().as_str())?;
        let hex = file.strip_prefix("pack-")?.strip_suffix(".idx")?;
        if hex.len() != 40 {
            return None;
        }
        ObjectId::from_hex(hex)
    }
}

impl fmt::Display for RepoNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl FromStr for RepoNamespace {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_key_layout() {
        let repo = RepoNamespace::parse("alice/project").unwrap();
        let checksum = ObjectId::from_bytes([0xab; 20]);

        assert_eq!(repo.head_key(), "alice/project/HEAD");
        assert_eq!(repo.config_key(), "alice/project/config");
        assert_eq!(
            repo.ref_key("refs/heads/main"),
            "alice/project/refs/heads/main"
        );
        assert_eq!(
            repo.pack_key(&checksum),
            format!("alice/project/objects/pack/pack-{}.pack", checksum)
        );
        assert_eq!(repo.index_checksum(&repo.index_key(&checksum)), Some(checksum));
        assert_eq!(repo.index_checksum(&repo.pack_key(&checksum)), None);
    }

    #[test]
    fn test_ref_name_from_key() {
        let repo = RepoNamespace::parse("a/b").unwrap();
        assert_eq!(repo.ref_name("a/b/refs/tags/v1"), Some("refs/tags/v1"));
        assert_eq!(repo.ref_name("a/b/HEAD"), None);
        assert_eq!(repo.ref_name("a/bc/refs/tags/v1"), None);
    }

    #[rstest]
    #[case("")]
    #[case("owner")]
    #[case("owner/")]
    #[case("/name")]
    #[case("a/b/c")]
    #[case("../name")]
    #[case("own er/name")]
    fn test_rejects_invalid_namespace(#[case] uri: &str) {
        assert!(matches!(
            RepoNamespace::parse(uri),
            Err(Error::InvalidNamespace(_))
        ));
    }
}
