//! Read path answering "what does the remote have".

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::value::RefValue;
use crate::{
    error::{Error, Result},
    pack::ObjectId,
    storage::{KvStore, RepoNamespace},
};

/// Capabilities a pushing client may rely on
pub const CAPABILITIES: &[&str] = &["ofs-delta", "delete-refs", "report-status"];

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AdvertisedRefs {
    pub head: Option<ObjectId>,
    pub references: BTreeMap<String, ObjectId>,
    pub capabilities: Vec<String>,
}

/// Names of every stored reference, sorted.
pub fn list_refs<S: KvStore + ?Sized>(store: &S, repo: &RepoNamespace) -> Result<Vec<String>> {
    let keys = store
        .list_keys(&repo.refs_prefix())
        .map_err(Error::Storage)?;
    Ok(keys
        .iter()
        .filter_map(|key| repo.ref_name(key))
        .map(str::to_string)
        .collect())
}

fn read_value<S: KvStore + ?Sized>(store: &S, key: &str) -> Result<Option<RefValue>> {
    let bytes = store.get(key).map_err(Error::Storage)?;
    Ok(bytes.and_then(|b| {
        let value = RefValue::parse(&b);
        if value.is_none() {
            tracing::warn!("ignoring unparsable reference at {}", key);
        }
        value
    }))
}

/// Follow at most one level of symbolic indirection.
fn resolve<S: KvStore + ?Sized>(
    store: &S,
    repo: &RepoNamespace,
    value: Option<RefValue>,
) -> Result<Option<ObjectId>> {
    match value {
        Some(RefValue::Direct(id)) => Ok(Some(id)),
        Some(RefValue::Symbolic(target)) => match read_value(store, &repo.ref_key(&target))? {
            Some(RefValue::Direct(id)) => Ok(Some(id)),
            _ => Ok(None),
        },
        None => Ok(None),
    }
}

/// Current references, the resolved HEAD and the supported capabilities.
pub fn advertised_refs<S: KvStore + ?Sized>(
    store: &S,
    repo: &RepoNamespace,
) -> Result<AdvertisedRefs> {
    let mut references = BTreeMap::new();
    for name in list_refs(store, repo)? {
        let value = read_value(store, &repo.ref_key(&name))?;
        if let Some(id) = resolve(store, repo, value)? {
            references.insert(name, id);
        }
    }
    let head = resolve(store, repo, read_value(store, &repo.head_key())?)?;

    Ok(AdvertisedRefs {
        head,
        references,
        capabilities: CAPABILITIES.iter().map(|c| c.to_string()).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        refs::{initialize_repository, DEFAULT_HEAD},
        storage::MemoryStore,
    };

    fn oid(b: u8) -> ObjectId {
        ObjectId::from_bytes([b; 20])
    }

    #[test]
    fn test_empty_repository() {
        let store = MemoryStore::new();
        let repo = RepoNamespace::parse("o/r").unwrap();
        let adv = advertised_refs(&store, &repo).unwrap();
        assert_eq!(adv.head, None);
        assert!(adv.references.is_empty());
        assert_eq!(adv.capabilities, vec!["ofs-delta", "delete-refs", "report-status"]);
    }

    #[test]
    fn test_head_follows_one_symbolic_level() {
        let store = MemoryStore::new();
        let repo = RepoNamespace::parse("o/r").unwrap();
        initialize_repository(&store, &repo, DEFAULT_HEAD).unwrap();
        store
            .set(&repo.ref_key("refs/heads/master"), &RefValue::Direct(oid(1)).encode())
            .unwrap();
        store
            .set(&repo.ref_key("refs/tags/v1"), &RefValue::Direct(oid(2)).encode())
            .unwrap();
        store
            .set(
                &repo.ref_key("refs/heads/alias"),
                &RefValue::Symbolic("refs/heads/master".into()).encode(),
            )
            .unwrap();

        assert_eq!(
            list_refs(&store, &repo).unwrap(),
            vec!["refs/heads/alias", "refs/heads/master", "refs/tags/v1"]
        );
        let adv = advertised_refs(&store, &repo).unwrap();
        assert_eq!(adv.head, Some(oid(1)));
        assert_eq!(adv.references.get("refs/heads/alias"), Some(&oid(1)));
        assert_eq!(adv.references.get("refs/tags/v1"), Some(&oid(2)));
    }

    #[test]
    fn test_head_to_unborn_branch() {
        let store = MemoryStore::new();
        let repo = RepoNamespace::parse("o/r").unwrap();
        initialize_repository(&store, &repo, DEFAULT_HEAD).unwrap();
        assert_eq!(advertised_refs(&store, &repo).unwrap().head, None);
    }

    #[test]
    fn test_serializes_as_json() {
        let adv = AdvertisedRefs {
            head: Some(oid(0xab)),
            references: BTreeMap::from([("refs/heads/master".to_string(), oid(0xab))]),
            capabilities: vec!["ofs-delta".into()],
        };
        let json = serde_json::to_value(&adv).unwrap();
        assert_eq!(json["head"], serde_json::json!(oid(0xab).to_hex()));
        assert_eq!(
            json["references"]["refs/heads/master"],
            serde_json::json!(oid(0xab).to_hex())
        );
    }
}
