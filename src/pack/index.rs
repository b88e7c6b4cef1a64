//! Version 2 pack index (`.idx`) files.
//!
//! Layout: magic `\377tOc`, version, 256-entry fanout table, sorted object
//! ids, CRC32 table, 4-byte offset table (high bit set means an index into
//! the 8-byte large-offset table), the pack checksum and finally the SHA-1
//! of everything before it.

use gix_object::Kind;
use sha1::{Digest, Sha1};

use super::{decode::PackObserver, ObjectId};
use crate::error::{Error, Result};

const IDX_MAGIC: &[u8; 4] = b"\xfftOc";
const IDX_VERSION: u32 = 2;
const LARGE_OFFSET_FLAG: u32 = 0x8000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub id: ObjectId,
    pub offset: u64,
    pub crc32: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackIndex {
    /// Sorted by object id
    entries: Vec<IndexEntry>,
    pack_checksum: ObjectId,
}

impl PackIndex {
    pub fn new(mut entries: Vec<IndexEntry>, pack_checksum: ObjectId) -> Self {
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries.dedup_by(|a, b| a.id == b.id);
        Self {
            entries,
            pack_checksum,
        }
    }

    pub fn pack_checksum(&self) -> ObjectId {
        self.pack_checksum
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.iter()
    }

    pub fn find(&self, id: &ObjectId) -> Option<&IndexEntry> {
        self.entries
            .binary_search_by(|e| e.id.cmp(id))
            .ok()
            .map(|i| &self.entries[i])
    }

    pub fn encode(&self) -> Vec<u8> {
        let n = self.entries.len();
        let mut out = Vec::with_capacity(8 + 256 * 4 + n * 28 + 40);
        out.extend_from_slice(IDX_MAGIC);
        out.extend_from_slice(&IDX_VERSION.to_be_bytes());

        let mut fanout = [0u32; 256];
        for entry in &self.entries {
            fanout[entry.id.as_bytes()[0] as usize] += 1;
        }
        let mut running = 0u32;
        for slot in fanout.iter_mut() {
            running += *slot;
            *slot = running;
        }
        for count in fanout {
            out.extend_from_slice(&count.to_be_bytes());
        }

        for entry in &self.entries {
            out.extend_from_slice(entry.id.as_bytes());
        }
        for entry in &self.entries {
            out.extend_from_slice(&entry.crc32.to_be_bytes());
        }
        let mut large = Vec::new();
        for entry in &self.entries {
            let small = if entry.offset < LARGE_OFFSET_FLAG as u64 {
                entry.offset as u32
            } else {
                large.push(entry.offset);
                LARGE_OFFSET_FLAG | (large.len() - 1) as u32
            };
            out.extend_from_slice(&small.to_be_bytes());
        }
        for offset in large {
            out.extend_from_slice(&offset.to_be_bytes());
        }

        out.extend_from_slice(self.pack_checksum.as_bytes());
        let digest: [u8; 20] = Sha1::digest(&out).into();
        out.extend_from_slice(&digest);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidIndex(reason.to_string());

        let min_len = 8 + 256 * 4 + 2 * ObjectId::LEN;
        if bytes.len() < min_len {
            return Err(invalid("file too short"));
        }
        if &bytes[0..4] != IDX_MAGIC {
            return Err(invalid("bad signature"));
        }
        if be_u32(bytes, 4) != IDX_VERSION {
            return Err(invalid("unsupported version"));
        }

        let (body, trailer) = bytes.split_at(bytes.len() - ObjectId::LEN);
        let digest: [u8; 20] = Sha1::digest(body).into();
        if digest.as_slice() != trailer {
            return Err(invalid("index checksum mismatch"));
        }

        let mut previous = 0u32;
        for i in 0..256 {
            let count = be_u32(bytes, 8 + i * 4);
            if count < previous {
                return Err(invalid("fanout table is not monotonic"));
            }
            previous = count;
        }
        let n = previous as usize;

        let ids_at = 8 + 256 * 4;
        let crcs_at = ids_at + n * ObjectId::LEN;
        let offsets_at = crcs_at + n * 4;
        let large_at = offsets_at + n * 4;
        let checksum_at = body.len() - ObjectId::LEN;
        if large_at > checksum_at || (checksum_at - large_at) % 8 != 0 {
            return Err(invalid("table sizes do not match object count"));
        }
        let large_count = (checksum_at - large_at) / 8;

        let mut entries = Vec::with_capacity(n);
        for i in 0..n {
            let at = ids_at + i * ObjectId::LEN;
            let id = ObjectId::from_slice(&bytes[at..at + ObjectId::LEN])
                .ok_or_else(|| invalid("bad object id"))?;
            let crc32 = be_u32(bytes, crcs_at + i * 4);
            let small = be_u32(bytes, offsets_at + i * 4);
            let offset = if small & LARGE_OFFSET_FLAG != 0 {
                let slot = (small & !LARGE_OFFSET_FLAG) as usize;
                if slot >= large_count {
                    return Err(invalid("large offset out of range"));
                }
                be_u64(bytes, large_at + slot * 8)
            } else {
                small as u64
            };
            if let Some(prev) = entries.last().map(|e: &IndexEntry| e.id) {
                if prev >= id {
                    return Err(invalid("object ids are not sorted"));
                }
            }
            entries.push(IndexEntry { id, offset, crc32 });
        }

        let pack_checksum = ObjectId::from_slice(&bytes[checksum_at..checksum_at + ObjectId::LEN])
            .ok_or_else(|| invalid("bad pack checksum"))?;
        Ok(Self {
            entries,
            pack_checksum,
        })
    }
}

fn be_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn be_u64(bytes: &[u8], at: usize) -> u64 {
    (be_u32(bytes, at) as u64) << 32 | be_u32(bytes, at + 4) as u64
}

/// Observer that collects index entries while a pack is decoded.
#[derive(Debug, Default)]
pub struct IndexBuilder {
    entries: Vec<IndexEntry>,
    checksum: Option<ObjectId>,
}

impl IndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects reported so far
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build the index; only valid once the decoder reported the footer.
    pub fn finish(self) -> Result<PackIndex> {
        let checksum = self
            .checksum
            .ok_or_else(|| Error::InvalidIndex("pack footer was never decoded".to_string()))?;
        Ok(PackIndex::new(self.entries, checksum))
    }
}

impl PackObserver for IndexBuilder {
    fn on_header(&mut self, count: u32) -> Result<()> {
        self.entries.reserve(count as usize);
        Ok(())
    }

    fn on_inflated_object_header(&mut self, _kind: Kind, _size: u64, _offset: u64) -> Result<()> {
        Ok(())
    }

    fn on_inflated_object_content(
        &mut self,
        id: ObjectId,
        offset: u64,
        crc32: u32,
        _content: &[u8],
    ) -> Result<()> {
        self.entries.push(IndexEntry { id, offset, crc32 });
        Ok(())
    }

    fn on_footer(&mut self, checksum: ObjectId) -> Result<()> {
        self.checksum = Some(checksum);
        Ok(())
    }
}
