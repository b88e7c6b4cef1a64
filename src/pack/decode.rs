//! Packfile decoding.
//!
//! Decoding runs in two phases. The scan phase reads every entry in pack
//! order, hashes base objects, and links each delta to its base in an
//! [`ObjectGraph`]. The resolve phase walks every base object and applies
//! its deltas depth-first with an explicit worklist, reporting each
//! materialized object to the registered [`PackObserver`]s.
//!
//! Sources that can seek are re-read during the resolve phase; for
//! non-seekable sources every entry's inflated bytes are retained from the
//! scan phase instead.

use std::{
    collections::HashMap,
    io::{self, Read, Seek, SeekFrom},
    sync::Arc,
};

use flate2::{Crc, Decompress, FlushDecompress, Status};
use gix_object::Kind;
use sha1::{Digest, Sha1};

use super::{
    cache::{DeltaCache, DEFAULT_CAPACITY_BYTES},
    delta,
    graph::{EntryKind, ObjectGraph, RecordId},
    objects::{compute_object_id, kind_name},
    ObjectId,
};
use crate::error::{Error, Result};

const PACK_SIGNATURE: &[u8; 4] = b"PACK";
const PACK_HEADER_SIZE: usize = 12;
const READ_CHUNK: usize = 64 * 1024;
/// ceil(64 / 7)
const MAX_VARINT_BYTES: usize = 10;

/// Default bound on delta chain length
pub const DEFAULT_MAX_DELTA_DEPTH: usize = 10_000;

/// A byte source the decoder can read a pack from.
pub trait PackSource: Read {
    /// Whether `seek_to` can be used to re-read earlier entries.
    fn is_seekable(&self) -> bool;

    /// Reposition to an absolute pack offset.
    fn seek_to(&mut self, offset: u64) -> io::Result<()>;
}

/// Random-access source (files, in-memory cursors)
pub struct Seekable<R>(pub R);

impl<R: Read> Read for Seekable<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl<R: Read + Seek> PackSource for Seekable<R> {
    fn is_seekable(&self) -> bool {
        true
    }

    fn seek_to(&mut self, offset: u64) -> io::Result<()> {
        self.0.seek(SeekFrom::Start(offset)).map(|_| ())
    }
}

/// Forward-only source (pipes, sockets)
pub struct Streaming<R>(pub R);

impl<R: Read> Read for Streaming<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl<R: Read> PackSource for Streaming<R> {
    fn is_seekable(&self) -> bool {
        false
    }

    fn seek_to(&mut self, _offset: u64) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "streaming pack source cannot seek",
        ))
    }
}

/// Receives decoder events. Every method defaults to a no-op.
pub trait PackObserver {
    /// Called once the pack header has been read.
    fn on_header(&mut self, _count: u32) -> Result<()> {
        Ok(())
    }

    /// Called before the content of each materialized object.
    fn on_inflated_object_header(&mut self, _kind: Kind, _size: u64, _offset: u64) -> Result<()> {
        Ok(())
    }

    /// Called for each materialized object, bases first, then their deltas.
    fn on_inflated_object_content(
        &mut self,
        _id: ObjectId,
        _offset: u64,
        _crc32: u32,
        _content: &[u8],
    ) -> Result<()> {
        Ok(())
    }

    /// Called once every object has been resolved.
    fn on_footer(&mut self, _checksum: ObjectId) -> Result<()> {
        Ok(())
    }
}

/// Supplies thin-pack bases that are not contained in the pack itself.
pub trait ExternalObjects {
    fn find_object(&mut self, id: &ObjectId) -> Result<Option<(Kind, Vec<u8>)>>;
}

#[derive(Debug, Clone, Copy)]
pub struct DecoderOptions {
    /// Byte budget of the cache holding bases with pending deltas
    pub cache_capacity: usize,
    pub max_delta_depth: usize,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CAPACITY_BYTES,
            max_delta_depth: DEFAULT_MAX_DELTA_DEPTH,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct EntryHeader {
    offset: u64,
    size: u64,
    kind: EntryKind,
}

/// Buffered reader over a [`PackSource`] that tracks the absolute offset,
/// the CRC32 of the current entry, and (while scanning) the pack checksum.
struct Scanner<S> {
    source: S,
    buf: Vec<u8>,
    pos: usize,
    offset: u64,
    hasher: Option<Sha1>,
    crc: Crc,
}

impl<S: PackSource> Scanner<S> {
    fn new(source: S) -> Self {
        Self {
            source,
            buf: Vec::with_capacity(READ_CHUNK),
            pos: 0,
            offset: 0,
            hasher: Some(Sha1::new()),
            crc: Crc::new(),
        }
    }

    fn is_seekable(&self) -> bool {
        self.source.is_seekable()
    }

    /// Make at least one byte available; returns the number available (0 at EOF).
    fn fill(&mut self) -> io::Result<usize> {
        if self.pos < self.buf.len() {
            return Ok(self.buf.len() - self.pos);
        }
        self.buf.clear();
        self.pos = 0;
        self.buf.resize(READ_CHUNK, 0);
        let n = loop {
            match self.source.read(&mut self.buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.buf.clear();
                    return Err(e);
                }
            }
        };
        self.buf.truncate(n);
        Ok(n)
    }

    fn consume(&mut self, n: usize) {
        let bytes = &self.buf[self.pos..self.pos + n];
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(bytes);
        }
        self.crc.update(bytes);
        self.pos += n;
        self.offset += n as u64;
    }

    fn read_byte(&mut self) -> Result<u8> {
        if self.fill()? == 0 {
            return Err(Error::entry(self.offset, "unexpected end of pack"));
        }
        let b = self.buf[self.pos];
        self.consume(1);
        Ok(b)
    }

    /// Fill `out` completely; returns how many bytes were read before EOF.
    fn read_into(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let mut done = 0;
        while done < out.len() {
            let available = self.fill()?;
            if available == 0 {
                break;
            }
            let n = available.min(out.len() - done);
            out[done..done + n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
            self.consume(n);
            done += n;
        }
        Ok(done)
    }

    fn seek(&mut self, offset: u64) -> Result<()> {
        self.source.seek_to(offset)?;
        self.buf.clear();
        self.pos = 0;
        self.offset = offset;
        self.hasher = None;
        Ok(())
    }

    /// Read the pack header, returning the declared object count.
    fn read_header(&mut self) -> Result<u32> {
        let mut header = [0u8; PACK_HEADER_SIZE];
        let n = self.read_into(&mut header)?;
        if n == 0 {
            return Err(Error::EmptyPack);
        }
        if n < PACK_HEADER_SIZE {
            return Err(Error::MalformedHeader(format!(
                "expected {} header bytes, got {}",
                PACK_HEADER_SIZE, n
            )));
        }
        if &header[0..4] != PACK_SIGNATURE {
            return Err(Error::MalformedHeader("bad pack signature".to_string()));
        }
        let version = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if version != 2 && version != 3 {
            return Err(Error::MalformedHeader(format!(
                "unsupported pack version {}",
                version
            )));
        }
        Ok(u32::from_be_bytes([header[8], header[9], header[10], header[11]]))
    }

    /// Parse an entry header at the current position and reset the entry CRC.
    fn read_entry_header(&mut self) -> Result<EntryHeader> {
        let offset = self.offset;
        self.crc.reset();

        let first = self.read_byte()?;
        let type_code = (first >> 4) & 0x07;
        let mut size = (first & 0x0f) as u64;
        let mut shift = 4u32;
        let mut byte = first;
        while byte & 0x80 != 0 {
            if shift > 60 {
                return Err(Error::entry(offset, "object size varint too long"));
            }
            byte = self.read_byte()?;
            size |= ((byte & 0x7f) as u64) << shift;
            shift += 7;
        }

        let kind = match type_code {
            1 => EntryKind::Base(Kind::Commit),
            2 => EntryKind::Base(Kind::Tree),
            3 => EntryKind::Base(Kind::Blob),
            4 => EntryKind::Base(Kind::Tag),
            6 => {
                let mut c = self.read_byte()?;
                let mut distance = (c & 0x7f) as u64;
                let mut read = 1;
                while c & 0x80 != 0 {
                    if read >= MAX_VARINT_BYTES {
                        return Err(Error::entry(offset, "ofs-delta offset varint too long"));
                    }
                    c = self.read_byte()?;
                    read += 1;
                    distance = ((distance + 1) << 7) | (c & 0x7f) as u64;
                }
                if distance > offset {
                    return Err(Error::entry(offset, "ofs-delta base before start of pack"));
                }
                EntryKind::OfsDelta {
                    base_offset: offset - distance,
                }
            }
            7 => {
                let mut raw = [0u8; ObjectId::LEN];
                if self.read_into(&mut raw)? != ObjectId::LEN {
                    return Err(Error::entry(offset, "truncated ref-delta base id"));
                }
                EntryKind::RefDelta {
                    base: ObjectId::from_bytes(raw),
                }
            }
            t => return Err(Error::entry(offset, format!("bad object type {}", t))),
        };

        Ok(EntryHeader { offset, size, kind })
    }

    /// Inflate the zlib stream at the current position, which must produce
    /// exactly `expected` bytes.
    fn inflate(&mut self, offset: u64, expected: u64) -> Result<Vec<u8>> {
        let expected = usize::try_from(expected)
            .map_err(|_| Error::entry(offset, "object too large for this platform"))?;
        let mut de = Decompress::new(true);
        // declared sizes are untrusted until inflated
        let mut out: Vec<u8> = Vec::with_capacity(expected.min(16 * READ_CHUNK));

        loop {
            if self.fill()? == 0 {
                return Err(Error::entry(offset, "truncated compressed data"));
            }
            if out.len() == out.capacity() {
                out.reserve(64);
            }

            let before_in = de.total_in();
            let before_out = de.total_out();
            let status = de
                .decompress_vec(&self.buf[self.pos..], &mut out, FlushDecompress::None)
                .map_err(|e| Error::entry(offset, format!("inflate failed: {}", e)))?;
            let consumed = (de.total_in() - before_in) as usize;
            let produced = (de.total_out() - before_out) as usize;
            self.consume(consumed);

            if out.len() > expected {
                return Err(Error::entry(
                    offset,
                    format!("inflated size exceeds declared {}", expected),
                ));
            }
            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    if consumed == 0 && produced == 0 && out.len() < out.capacity() {
                        return Err(Error::entry(offset, "inflate stalled"));
                    }
                }
            }
        }

        if out.len() != expected {
            return Err(Error::entry(
                offset,
                format!("inflated {} bytes, header declared {}", out.len(), expected),
            ));
        }
        Ok(out)
    }
}

/// Read a single entry (header and inflated data) from a complete pack held in memory.
pub(crate) fn read_entry_at(pack: &[u8], offset: u64) -> Result<(EntryKind, Vec<u8>)> {
    let mut scanner = Scanner::new(Seekable(io::Cursor::new(pack)));
    scanner.seek(offset)?;
    let header = scanner.read_entry_header()?;
    let data = scanner.inflate(offset, header.size)?;
    Ok((header.kind, data))
}

const MAX_PREALLOC_RECORDS: usize = 1 << 16;

/// Decodes one pack and reports every object it contains.
pub struct PackfileDecoder<'a, S> {
    scanner: Scanner<S>,
    observers: Vec<&'a mut dyn PackObserver>,
    external: Option<&'a mut dyn ExternalObjects>,
    options: DecoderOptions,
    graph: ObjectGraph,
    cache: DeltaCache,
    /// Inflated entry data by offset, only used for non-seekable sources
    retained: HashMap<u64, Arc<[u8]>>,
    /// Children still waiting for resolution, per record
    pending: HashMap<RecordId, usize>,
}

impl<'a, S: PackSource> PackfileDecoder<'a, S> {
    pub fn new(source: S) -> Self {
        let options = DecoderOptions::default();
        Self {
            scanner: Scanner::new(source),
            observers: Vec::new(),
            external: None,
            options,
            graph: ObjectGraph::default(),
            cache: DeltaCache::new(options.cache_capacity),
            retained: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    pub fn with_options(mut self, options: DecoderOptions) -> Self {
        self.options = options;
        self.cache = DeltaCache::new(options.cache_capacity);
        self
    }

    pub fn observer(mut self, observer: &'a mut dyn PackObserver) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn external_objects(mut self, external: &'a mut dyn ExternalObjects) -> Self {
        self.external = Some(external);
        self
    }

    /// Decode the whole pack, returning its trailing checksum.
    pub fn decode(mut self) -> Result<ObjectId> {
        let count = self.scanner.read_header()?;
        tracing::debug!("pack header declares {} objects", count);
        self.notify(|o| o.on_header(count))?;

        // the header count is untrusted until the entries are scanned
        self.graph = ObjectGraph::with_capacity((count as usize).min(MAX_PREALLOC_RECORDS));
        self.scan(count)?;
        let checksum = self.read_trailer()?;
        tracing::debug!("pack checksum is {}", checksum);

        self.resolve()?;
        self.notify(|o| o.on_footer(checksum))?;
        Ok(checksum)
    }

    fn notify<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&mut (dyn PackObserver + 'a)) -> Result<()>,
    {
        for observer in self.observers.iter_mut() {
            f(&mut **observer)?;
        }
        Ok(())
    }

    fn scan(&mut self, count: u32) -> Result<()> {
        let seekable = self.scanner.is_seekable();

        for scanned in 0..count {
            if self.scanner.fill()? == 0 {
                return Err(Error::CountMismatch {
                    declared: count,
                    scanned,
                });
            }

            let header = self.scanner.read_entry_header()?;
            let data = self.scanner.inflate(header.offset, header.size)?;
            let crc32 = self.scanner.crc.sum();
            let offset = header.offset;

            match header.kind {
                EntryKind::Base(kind) => {
                    let id = compute_object_id(kind, &data);
                    tracing::trace!("base {} {} at offset {}", kind_name(kind), id, offset);
                    let record = self
                        .graph
                        .push_scanned(offset, header.size, header.kind, crc32, None);
                    self.graph.assign_id(record, id);
                }
                EntryKind::OfsDelta { base_offset } => {
                    let parent = self
                        .graph
                        .by_offset(base_offset)
                        .ok_or(Error::ObjectNotFound {
                            offset: base_offset,
                        })?;
                    tracing::trace!("ofs-delta at offset {} against {}", offset, base_offset);
                    self.graph
                        .push_scanned(offset, header.size, header.kind, crc32, Some(parent));
                }
                EntryKind::RefDelta { base } => {
                    let parent = match self.graph.by_id(&base) {
                        Some(parent) => parent,
                        None => {
                            tracing::debug!("ref-delta base {} not (yet) in pack", base);
                            self.graph.push_external(base)
                        }
                    };
                    self.graph
                        .push_scanned(offset, header.size, header.kind, crc32, Some(parent));
                }
            }

            if !seekable {
                self.retained.insert(offset, data.into());
            }
        }
        Ok(())
    }

    fn read_trailer(&mut self) -> Result<ObjectId> {
        let actual = self
            .scanner
            .hasher
            .take()
            .map(|h| ObjectId::from_bytes(h.finalize().into()))
            .unwrap_or_default();

        let offset = self.scanner.offset;
        let mut raw = [0u8; ObjectId::LEN];
        if self.scanner.read_into(&mut raw)? != ObjectId::LEN {
            return Err(Error::entry(offset, "truncated pack trailer"));
        }
        let expected = ObjectId::from_bytes(raw);
        if expected != actual {
            return Err(Error::ChecksumMismatch { expected, actual });
        }
        if self.scanner.fill()? != 0 {
            return Err(Error::TrailingData);
        }
        Ok(expected)
    }

    fn resolve(&mut self) -> Result<()> {
        let bases: Vec<RecordId> = self
            .graph
            .scanned()
            .iter()
            .copied()
            .filter(|&r| !self.graph.get(r).is_delta())
            .collect();

        for base in bases {
            let content = self.read_data(base)?;
            self.emit(base, &content)?;
            self.resolve_children(base, content)?;
        }

        for placeholder in self.graph.pending_externals() {
            // an earlier external chain may already have adopted these deltas
            if self.graph.get(placeholder).children.is_empty() {
                continue;
            }
            let id = self.graph.get(placeholder).id.unwrap_or_default();
            let found = match self.external.as_mut() {
                Some(external) => external.find_object(&id)?,
                None => None,
            };
            let (kind, data) = match found {
                Some(found) => found,
                None => {
                    tracing::warn!("unable to resolve reference delta base {}", id);
                    return Err(Error::ReferenceDeltaUnresolved { id });
                }
            };
            tracing::debug!("thin pack base {} resolved from stored objects", id);
            let record = self.graph.get_mut(placeholder);
            record.resolved = Some(kind);
            record.length = data.len() as u64;
            self.resolve_children(placeholder, data.into())?;
        }

        if let Some(&unresolved) = self
            .graph
            .scanned()
            .iter()
            .find(|&&r| self.graph.get(r).id.is_none())
        {
            let offset = self.graph.get(unresolved).offset;
            return Err(Error::entry(offset, "delta base never resolved"));
        }
        Ok(())
    }

    /// Resolve every delta below `root`, whose content is already materialized.
    fn resolve_children(&mut self, root: RecordId, content: Arc<[u8]>) -> Result<()> {
        let children = self.graph.get(root).children.clone();
        if children.is_empty() {
            self.finish(root);
            return Ok(());
        }
        self.cache.put(self.cache_key(root), content);
        self.pending.insert(root, children.len());

        let mut stack: Vec<RecordId> = children.into_iter().rev().collect();
        while let Some(child) = stack.pop() {
            let record = self.graph.get(child);
            let offset = record.offset;
            let parent = record
                .parent
                .ok_or_else(|| Error::entry(offset, "delta without base"))?;
            let depth = self.graph.get(parent).depth + 1;
            if depth > self.options.max_delta_depth {
                return Err(Error::DeltaChainTooDeep {
                    limit: self.options.max_delta_depth,
                });
            }
            let kind = self
                .graph
                .get(parent)
                .resolved
                .ok_or_else(|| Error::entry(offset, "delta base type unknown"))?;

            let base = self.materialize(parent)?;
            let delta_data = self.read_data(child)?;
            let patched = delta::apply(&base, &delta_data)
                .map_err(|source| Error::Delta { offset, source })?;
            let id = compute_object_id(kind, &patched);

            let record = self.graph.get_mut(child);
            record.resolved = Some(kind);
            record.length = patched.len() as u64;
            record.depth = depth;
            let adopted = self.graph.assign_id(child, id);
            if !adopted.is_empty() {
                tracing::debug!("{} deltas waiting on {} attached to it", adopted.len(), id);
            }

            let patched: Arc<[u8]> = patched.into();
            self.emit(child, &patched)?;

            let grandchildren = self.graph.get(child).children.clone();
            if grandchildren.is_empty() {
                self.finish(child);
            } else {
                self.cache.put(self.cache_key(child), patched);
                self.pending.insert(child, grandchildren.len());
                stack.extend(grandchildren.into_iter().rev());
            }
            self.child_done(parent);
        }
        Ok(())
    }

    fn child_done(&mut self, parent: RecordId) {
        if let Some(remaining) = self.pending.get_mut(&parent) {
            *remaining -= 1;
            if *remaining == 0 {
                self.pending.remove(&parent);
                self.finish(parent);
            }
        }
    }

    /// Drop cached and retained data for a record with no outstanding deltas.
    fn finish(&mut self, record: RecordId) {
        self.cache.remove(self.cache_key(record));
        if !self.graph.get(record).external {
            self.retained.remove(&self.graph.get(record).offset);
        }
    }

    fn cache_key(&self, record: RecordId) -> u64 {
        let r = self.graph.get(record);
        if r.external {
            // placeholders have no pack offset; keep them clear of real ones
            u64::MAX - record as u64
        } else {
            r.offset
        }
    }

    /// Content of a record, from cache or rebuilt from its nearest available ancestor.
    fn materialize(&mut self, record: RecordId) -> Result<Arc<[u8]>> {
        let mut chain = Vec::new();
        let mut current = record;
        let mut content: Arc<[u8]> = loop {
            if let Some(cached) = self.cache.get(self.cache_key(current)) {
                break cached;
            }
            let r = self.graph.get(current);
            if r.external {
                let id = r.id.unwrap_or_default();
                let found = match self.external.as_mut() {
                    Some(external) => external.find_object(&id)?,
                    None => None,
                };
                match found {
                    Some((_, data)) => break data.into(),
                    None => return Err(Error::ReferenceDeltaUnresolved { id }),
                }
            }
            if !r.is_delta() {
                break self.read_data(current)?;
            }
            let offset = r.offset;
            chain.push(current);
            if chain.len() > self.options.max_delta_depth {
                return Err(Error::DeltaChainTooDeep {
                    limit: self.options.max_delta_depth,
                });
            }
            current = r
                .parent
                .ok_or_else(|| Error::entry(offset, "delta without base"))?;
        };

        for r in chain.into_iter().rev() {
            let offset = self.graph.get(r).offset;
            let delta_data = self.read_data(r)?;
            content = delta::apply(&content, &delta_data)
                .map_err(|source| Error::Delta { offset, source })?
                .into();
        }
        Ok(content)
    }

    /// Inflated bytes of an entry as stored in the pack (delta data for deltas).
    fn read_data(&mut self, record: RecordId) -> Result<Arc<[u8]>> {
        let offset = self.graph.get(record).offset;
        if !self.scanner.is_seekable() {
            return self
                .retained
                .get(&offset)
                .cloned()
                .ok_or_else(|| Error::entry(offset, "entry data not retained"));
        }

        self.scanner.seek(offset)?;
        let header = self.scanner.read_entry_header()?;
        Ok(self.scanner.inflate(offset, header.size)?.into())
    }

    fn emit(&mut self, record: RecordId, content: &[u8]) -> Result<()> {
        let r = self.graph.get(record);
        let offset = r.offset;
        let crc32 = r.crc32;
        let size = content.len() as u64;
        let (kind, id) = match (r.resolved, r.id) {
            (Some(kind), Some(id)) => (kind, id),
            _ => return Err(Error::entry(offset, "object emitted before resolution")),
        };

        self.notify(|o| o.on_inflated_object_header(kind, size, offset))?;
        self.notify(|o| o.on_inflated_object_content(id, offset, crc32, content))
    }
}

/// One object as reported to [`CollectObjects`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedObject {
    pub id: ObjectId,
    pub kind: Kind,
    pub offset: u64,
    pub crc32: u32,
    pub data: Vec<u8>,
}

/// Observer that keeps every decoded object in memory.
#[derive(Debug, Default)]
pub struct CollectObjects {
    pub declared: u32,
    pub objects: Vec<DecodedObject>,
    pub checksum: Option<ObjectId>,
    pending_kind: Option<Kind>,
}

impl PackObserver for CollectObjects {
    fn on_header(&mut self, count: u32) -> Result<()> {
        self.declared = count;
        Ok(())
    }

    fn on_inflated_object_header(&mut self, kind: Kind, _size: u64, _offset: u64) -> Result<()> {
        self.pending_kind = Some(kind);
        Ok(())
    }

    fn on_inflated_object_content(
        &mut self,
        id: ObjectId,
        offset: u64,
        crc32: u32,
        content: &[u8],
    ) -> Result<()> {
        let kind = self
            .pending_kind
            .take()
            .ok_or_else(|| Error::entry(offset, "object content without header"))?;
        self.objects.push(DecodedObject {
            id,
            kind,
            offset,
            crc32,
            data: content.to_vec(),
        });
        Ok(())
    }

    fn on_footer(&mut self, checksum: ObjectId) -> Result<()> {
        self.checksum = Some(checksum);
        Ok(())
    }
}
