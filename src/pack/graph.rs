//! Object records discovered while scanning a pack, and their delta links.
//!
//! Records live in an arena and refer to each other by [`RecordId`]; a delta
//! holds the id of its base, a base holds the ids of the deltas that depend
//! on it.

use std::collections::HashMap;

use gix_object::Kind;

use super::ObjectId;

pub type RecordId = usize;

/// Type of a record as written in the pack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Base(Kind),
    OfsDelta { base_offset: u64 },
    RefDelta { base: ObjectId },
}

impl EntryKind {
    pub fn is_delta(&self) -> bool {
        !matches!(self, EntryKind::Base(_))
    }
}

#[derive(Debug, Clone)]
pub struct ObjectRecord {
    /// Byte position of the entry header in the pack
    pub offset: u64,
    /// Inflated size; for deltas this becomes the patched size once resolved
    pub length: u64,
    pub declared: Option<EntryKind>,
    pub resolved: Option<Kind>,
    pub id: Option<ObjectId>,
    pub crc32: u32,
    pub parent: Option<RecordId>,
    pub children: Vec<RecordId>,
    /// Placeholder for a thin-pack base that is not part of this pack
    pub external: bool,
    /// Number of deltas between this record and its base object
    pub depth: usize,
}

impl ObjectRecord {
    pub fn is_delta(&self) -> bool {
        self.declared.map(|k| k.is_delta()).unwrap_or(false)
    }
}

#[derive(Debug, Default)]
pub struct ObjectGraph {
    records: Vec<ObjectRecord>,
    /// Records in the order they were scanned (placeholders excluded)
    scanned: Vec<RecordId>,
    by_id: HashMap<ObjectId, RecordId>,
    by_offset: HashMap<u64, RecordId>,
}

impl ObjectGraph {
    pub fn with_capacity(count: usize) -> Self {
        Self {
            records: Vec::with_capacity(count),
            scanned: Vec::with_capacity(count),
            by_id: HashMap::with_capacity(count),
            by_offset: HashMap::with_capacity(count),
        }
    }

    pub fn get(&self, id: RecordId) -> &ObjectRecord {
        &self.records[id]
    }

    pub fn get_mut(&mut self, id: RecordId) -> &mut ObjectRecord {
        &mut self.records[id]
    }

    pub fn scanned(&self) -> &[RecordId] {
        &self.scanned
    }

    pub fn by_offset(&self, offset: u64) -> Option<RecordId> {
        self.by_offset.get(&offset).copied()
    }

    pub fn by_id(&self, id: &ObjectId) -> Option<RecordId> {
        self.by_id.get(id).copied()
    }

    /// Register a record read from the pack.
    pub fn push_scanned(
        &mut self,
        offset: u64,
        length: u64,
        declared: EntryKind,
        crc32: u32,
        parent: Option<RecordId>,
    ) -> RecordId {
        let idx = self.records.len();
        let depth = parent.map(|p| self.records[p].depth + 1).unwrap_or(0);
        let resolved = match declared {
            EntryKind::Base(kind) => Some(kind),
            _ => None,
        };
        self.records.push(ObjectRecord {
            offset,
            length,
            declared: Some(declared),
            resolved,
            id: None,
            crc32,
            parent,
            children: Vec::new(),
            external: false,
            depth,
        });
        if let Some(p) = parent {
            self.records[p].children.push(idx);
        }
        self.by_offset.insert(offset, idx);
        self.scanned.push(idx);
        idx
    }

    /// Register a placeholder for a base object that lives outside the pack.
    pub fn push_external(&mut self, id: ObjectId) -> RecordId {
        let idx = self.records.len();
        self.records.push(ObjectRecord {
            offset: 0,
            length: 0,
            declared: None,
            resolved: None,
            id: Some(id),
            crc32: 0,
            parent: None,
            children: Vec::new(),
            external: true,
            depth: 0,
        });
        self.by_id.insert(id, idx);
        idx
    }

    /// Record the content hash of `record` and make it findable by id.
    ///
    /// If a thin-pack placeholder was waiting for this id, its children are
    /// re-parented onto `record` and their ids are returned.
    pub fn assign_id(&mut self, record: RecordId, id: ObjectId) -> Vec<RecordId> {
        debug_assert!(self.records[record].id.is_none(), "object id assigned twice");
        self.records[record].id = Some(id);

        let adopted = match self.by_id.get(&id).copied() {
            Some(existing) if self.records[existing].external => {
                std::mem::take(&mut self.records[existing].children)
            }
            Some(_) => return Vec::new(),
            None => Vec::new(),
        };
        self.by_id.insert(id, record);

        let depth = self.records[record].depth;
        for &child in &adopted {
            self.records[child].parent = Some(record);
            self.records[child].depth = depth + 1;
        }
        self.records[record].children.extend(adopted.iter().copied());
        adopted
    }

    /// Placeholders that still have dependent deltas
    pub fn pending_externals(&self) -> Vec<RecordId> {
        let mut pending: Vec<RecordId> = self
            .by_id
            .values()
            .copied()
            .filter(|&r| self.records[r].external && !self.records[r].children.is_empty())
            .collect();
        pending.sort_unstable();
        pending
    }
}
