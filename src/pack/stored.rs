//! Objects from packs already persisted for a repository.
//!
//! Used to complete thin packs: a ref-delta whose base is not in the
//! incoming pack is resolved against every stored `.idx`/`.pack` pair.

use std::{collections::HashMap, sync::Arc};

use gix_object::Kind;

use super::{
    decode::{read_entry_at, ExternalObjects},
    delta,
    graph::EntryKind,
    index::PackIndex,
    ObjectId,
};
use crate::{
    error::{Error, Result},
    storage::{KvStore, RepoNamespace},
};

pub struct StoredPacks<S: ?Sized> {
    store: Arc<S>,
    repo: RepoNamespace,
    indexes: Vec<PackIndex>,
    packs: HashMap<ObjectId, Arc<Vec<u8>>>,
    max_delta_depth: usize,
}

impl<S: KvStore + ?Sized> StoredPacks<S> {
    /// Load every pack index stored for `repo`.
    pub fn load(store: Arc<S>, repo: &RepoNamespace, max_delta_depth: usize) -> Result<Self> {
        let mut indexes = Vec::new();
        for key in store
            .list_keys(&repo.packs_prefix())
            .map_err(Error::Storage)?
        {
            if repo.index_checksum(&key).is_none() {
                continue;
            }
            let bytes = match store.get(&key).map_err(Error::Storage)? {
                Some(bytes) => bytes,
                None => continue,
            };
            indexes.push(PackIndex::decode(&bytes)?);
        }
        tracing::debug!("loaded {} stored pack indexes for {}", indexes.len(), repo);

        Ok(Self {
            store,
            repo: repo.clone(),
            indexes,
            packs: HashMap::new(),
            max_delta_depth,
        })
    }

    pub fn pack_count(&self) -> usize {
        self.indexes.len()
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.locate(id).is_some()
    }

    fn locate(&self, id: &ObjectId) -> Option<(ObjectId, u64)> {
        self.indexes
            .iter()
            .find_map(|index| index.find(id).map(|e| (index.pack_checksum(), e.offset)))
    }

    fn pack(&mut self, checksum: ObjectId) -> Result<Arc<Vec<u8>>> {
        if let Some(pack) = self.packs.get(&checksum) {
            return Ok(Arc::clone(pack));
        }
        let key = self.repo.pack_key(&checksum);
        let bytes = self
            .store
            .get(&key)
            .map_err(Error::Storage)?
            .ok_or_else(|| {
                Error::Storage(anyhow::anyhow!("pack '{}' is indexed but missing", key))
            })?;
        let pack = Arc::new(bytes);
        self.packs.insert(checksum, Arc::clone(&pack));
        Ok(pack)
    }

    /// Materialize a stored object, following its delta chain across packs.
    pub fn read_object(&mut self, id: &ObjectId) -> Result<Option<(Kind, Vec<u8>)>> {
        let Some((mut checksum, mut offset)) = self.locate(id) else {
            return Ok(None);
        };

        let mut deltas = Vec::new();
        let (kind, mut content) = loop {
            let pack = self.pack(checksum)?;
            let (entry, data) = read_entry_at(&pack, offset)?;
            match entry {
                EntryKind::Base(kind) => break (kind, data),
                EntryKind::OfsDelta { base_offset } => {
                    deltas.push((offset, data));
                    offset = base_offset;
                }
                EntryKind::RefDelta { base } => {
                    deltas.push((offset, data));
                    (checksum, offset) = self
                        .locate(&base)
                        .ok_or(Error::ReferenceDeltaUnresolved { id: base })?;
                }
            }
            if deltas.len() > self.max_delta_depth {
                return Err(Error::DeltaChainTooDeep {
                    limit: self.max_delta_depth,
                });
            }
        };

        for (offset, data) in deltas.into_iter().rev() {
            content = delta::apply(&content, &data)
                .map_err(|source| Error::Delta { offset, source })?;
        }
        Ok(Some((kind, content)))
    }
}

impl<S: KvStore + ?Sized> ExternalObjects for StoredPacks<S> {
    fn find_object(&mut self, id: &ObjectId) -> Result<Option<(Kind, Vec<u8>)>> {
        self.read_object(id)
    }
}
