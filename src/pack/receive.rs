//! Receive pack files during push operations
//!
//! Flow:
//! 1. [`begin_ingest`] spawns a decoder thread reading from a shared buffer
//! 2. The caller writes pack bytes into the returned [`PackSink`]
//! 3. [`PackSink::close`] ends the stream, waits for the decoder, then
//!    stores `pack-<checksum>.pack` and `.idx` together in one batch

use std::{
    io::{self, Read, Write},
    sync::Arc,
    thread::{self, JoinHandle},
};

use super::{
    buffer::SharedBuffer,
    decode::{DecoderOptions, PackfileDecoder},
    index::{IndexBuilder, PackIndex},
    stored::StoredPacks,
    ObjectId,
};
use crate::{
    error::{Error, Result},
    storage::{KvMutation, KvStore, RepoNamespace},
};

/// Default size of the chunks [`receive_pack`] copies into the sink
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Result of a completed ingestion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// No bytes were received, or the pack held no objects; nothing was stored.
    Empty,
    Stored { checksum: ObjectId, objects: usize },
}

impl IngestOutcome {
    pub fn checksum(&self) -> Option<ObjectId> {
        match self {
            IngestOutcome::Empty => None,
            IngestOutcome::Stored { checksum, .. } => Some(*checksum),
        }
    }
}

/// Write side of an ingestion; also implements [`Write`].
pub struct PackSink<S: KvStore + ?Sized> {
    buffer: Arc<SharedBuffer>,
    worker: Option<JoinHandle<Result<Option<PackIndex>>>>,
    store: Arc<S>,
    repo: RepoNamespace,
}

/// Start decoding a pack for `repo`; bytes are supplied through the returned sink.
pub fn begin_ingest<S>(
    store: Arc<S>,
    repo: &RepoNamespace,
    options: DecoderOptions,
) -> Result<PackSink<S>>
where
    S: KvStore + ?Sized + 'static,
{
    let stored = StoredPacks::load(Arc::clone(&store), repo, options.max_delta_depth)?;
    let buffer = SharedBuffer::new();
    let reader = buffer.reader();
    let worker_buffer = Arc::clone(&buffer);

    let worker = thread::Builder::new()
        .name(format!("index-pack {}", repo))
        .spawn(move || {
            let result = build_index(reader, stored, options);
            if let Err(e) = &result {
                worker_buffer.fail_consumer(e.to_string());
            }
            result
        })?;

    Ok(PackSink {
        buffer,
        worker: Some(worker),
        store,
        repo: repo.clone(),
    })
}

fn build_index<S, R>(
    reader: R,
    mut stored: StoredPacks<S>,
    options: DecoderOptions,
) -> Result<Option<PackIndex>>
where
    S: KvStore + ?Sized,
    R: super::decode::PackSource,
{
    let mut builder = IndexBuilder::new();
    let decoded = PackfileDecoder::new(reader)
        .with_options(options)
        .observer(&mut builder)
        .external_objects(&mut stored)
        .decode();
    match decoded {
        Ok(_) => Ok(Some(builder.finish()?)),
        Err(Error::EmptyPack) => Ok(None),
        Err(e) => Err(e),
    }
}

impl<S: KvStore + ?Sized> PackSink<S> {
    /// Bytes accepted so far
    pub fn received(&self) -> usize {
        self.buffer.len()
    }

    /// End the stream, wait for decoding and persist the pack and its index.
    ///
    /// On any decode failure nothing is written to the store.
    pub fn close(mut self) -> Result<IngestOutcome> {
        self.buffer.complete(None);
        let index = self.join()?;

        let index = match index {
            Some(index) if !index.is_empty() => index,
            _ => {
                tracing::debug!("no objects received for {}, nothing stored", self.repo);
                return Ok(IngestOutcome::Empty);
            }
        };

        let checksum = index.pack_checksum();
        let objects = index.len();
        let pack = self.buffer.take_bytes();
        tracing::info!(
            "storing pack {} for {} ({} objects, {} bytes)",
            checksum,
            self.repo,
            objects,
            pack.len()
        );
        self.store
            .write_batch(vec![
                KvMutation::Set {
                    key: self.repo.pack_key(&checksum),
                    value: pack,
                },
                KvMutation::Set {
                    key: self.repo.index_key(&checksum),
                    value: index.encode(),
                },
            ])
            .map_err(Error::Storage)?;

        Ok(IngestOutcome::Stored { checksum, objects })
    }

    /// Abandon the stream; the decoder fails with `reason` and nothing is stored.
    pub fn abort(mut self, reason: &str) -> Error {
        self.buffer.complete(Some(reason.to_string()));
        match self.join() {
            Err(e) => e,
            Ok(_) => Error::Io(io::Error::new(io::ErrorKind::Interrupted, reason.to_string())),
        }
    }

    fn join(&mut self) -> Result<Option<PackIndex>> {
        match self.worker.take() {
            Some(worker) => worker.join().map_err(|_| {
                Error::Io(io::Error::new(io::ErrorKind::Other, "pack decoder thread panicked"))
            })?,
            None => Ok(None),
        }
    }
}

impl<S: KvStore + ?Sized> Write for PackSink<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(error) = self.buffer.consumer_error() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, error));
        }
        self.buffer.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<S: KvStore + ?Sized> Drop for PackSink<S> {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.buffer.complete(Some("pack sink dropped before close".to_string()));
            let _ = self.join();
        }
    }
}

/// Copy a whole pack from `pack_stream` into the store in `chunk_size` pieces.
pub fn receive_pack<R, S>(
    pack_stream: &mut R,
    store: Arc<S>,
    repo: &RepoNamespace,
    options: DecoderOptions,
    chunk_size: usize,
) -> Result<IngestOutcome>
where
    R: Read + ?Sized,
    S: KvStore + ?Sized + 'static,
{
    let mut sink = begin_ingest(store, repo, options)?;
    let mut chunk = vec![0u8; chunk_size.max(1)];
    loop {
        let n = match pack_stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(sink.abort(&format!("reading pack failed: {}", e))),
        };
        if sink.write_all(&chunk[..n]).is_err() {
            // the decoder already failed; close reports its error
            break;
        }
    }
    tracing::debug!("received {} pack bytes for {}", sink.received(), repo);
    sink.close()
}

#[cfg(test)]
mod tests {
    use gix_object::Kind;
    use rstest::rstest;

    use super::*;
    use crate::{
        pack::{delta, encode::PackEncoder, objects::compute_object_id},
        storage::MemoryStore,
    };

    fn repo() -> RepoNamespace {
        RepoNamespace::parse("owner/repo").unwrap()
    }

    fn sample_pack() -> (Vec<u8>, ObjectId) {
        let v1 = b"first line\nsecond line\n".repeat(10);
        let mut v2 = v1.clone();
        v2.extend_from_slice(b"third line\n");
        let mut encoder = PackEncoder::new(Vec::new(), 3).unwrap();
        let base = encoder.add_object(Kind::Blob, &v1).unwrap();
        encoder.add_ofs_delta(base, &delta::encode(&v1, &v2)).unwrap();
        encoder.add_object(Kind::Tree, b"").unwrap();
        encoder.finish().unwrap()
    }

    #[rstest]
    #[case(1)]
    #[case(7)]
    #[case(64)]
    #[case(1 << 20)]
    fn test_chunked_ingest_stores_pack_and_index(#[case] chunk: usize) {
        let store = Arc::new(MemoryStore::new());
        let (pack, checksum) = sample_pack();

        let outcome = receive_pack(
            &mut pack.as_slice(),
            Arc::clone(&store),
            &repo(),
            DecoderOptions::default(),
            chunk,
        )
        .unwrap();

        assert_eq!(
            outcome,
            IngestOutcome::Stored {
                checksum,
                objects: 3
            }
        );
        assert_eq!(store.get(&repo().pack_key(&checksum)).unwrap(), Some(pack));
        let idx = store.get(&repo().index_key(&checksum)).unwrap().unwrap();
        let index = PackIndex::decode(&idx).unwrap();
        assert!(index.find(&compute_object_id(Kind::Tree, b"")).is_some());
    }

    #[test]
    fn test_empty_stream_stores_nothing() {
        let store = Arc::new(MemoryStore::new());
        let sink = begin_ingest(Arc::clone(&store), &repo(), DecoderOptions::default()).unwrap();
        assert_eq!(sink.close().unwrap(), IngestOutcome::Empty);
        assert!(store.is_empty());
    }

    #[test]
    fn test_zero_object_pack_stores_nothing() {
        let store = Arc::new(MemoryStore::new());
        let (pack, _) = PackEncoder::new(Vec::new(), 0).unwrap().finish().unwrap();
        let outcome = receive_pack(
            &mut pack.as_slice(),
            Arc::clone(&store),
            &repo(),
            DecoderOptions::default(),
            DEFAULT_CHUNK_SIZE,
        )
        .unwrap();
        assert_eq!(outcome, IngestOutcome::Empty);
        assert!(store.is_empty());
    }

    #[test]
    fn test_corrupt_pack_stores_nothing() {
        let store = Arc::new(MemoryStore::new());
        let (mut pack, _) = sample_pack();
        let last = pack.len() - 1;
        pack[last] ^= 0x55;

        let result = receive_pack(
            &mut pack.as_slice(),
            Arc::clone(&store),
            &repo(),
            DecoderOptions::default(),
            16,
        );
        assert!(matches!(result, Err(Error::ChecksumMismatch { .. })));
        assert!(store.is_empty());
    }

    #[test]
    fn test_writes_fail_after_decoder_error() {
        let store = Arc::new(MemoryStore::new());
        let mut sink =
            begin_ingest(Arc::clone(&store), &repo(), DecoderOptions::default()).unwrap();
        sink.write_all(b"NOTAPACKHEADER").unwrap();

        // the decoder rejects the header on its own thread; wait until it has
        let mut rejected = false;
        for _ in 0..200 {
            if sink.write(b"more").is_err() {
                rejected = true;
                break;
            }
            thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(rejected);
        assert!(matches!(sink.close(), Err(Error::MalformedHeader(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn test_abort_discards_pack() {
        let store = Arc::new(MemoryStore::new());
        let (pack, _) = sample_pack();
        let mut sink =
            begin_ingest(Arc::clone(&store), &repo(), DecoderOptions::default()).unwrap();
        sink.write_all(&pack[..pack.len() / 2]).unwrap();

        let error = sink.abort("client went away");
        assert!(error.to_string().contains("client went away"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_thin_pack_against_stored_pack() {
        let store = Arc::new(MemoryStore::new());
        let base = b"shared base content\n".repeat(6);
        let mut encoder = PackEncoder::new(Vec::new(), 1).unwrap();
        encoder.add_object(Kind::Blob, &base).unwrap();
        let (first, _) = encoder.finish().unwrap();
        receive_pack(
            &mut first.as_slice(),
            Arc::clone(&store),
            &repo(),
            DecoderOptions::default(),
            32,
        )
        .unwrap();

        let mut target = base.clone();
        target.extend_from_slice(b"appended\n");
        let mut encoder = PackEncoder::new(Vec::new(), 1).unwrap();
        encoder
            .add_ref_delta(
                &compute_object_id(Kind::Blob, &base),
                &delta::encode(&base, &target),
            )
            .unwrap();
        let (thin, _) = encoder.finish().unwrap();

        let outcome = receive_pack(
            &mut thin.as_slice(),
            Arc::clone(&store),
            &repo(),
            DecoderOptions::default(),
            32,
        )
        .unwrap();
        assert!(matches!(outcome, IngestOutcome::Stored { objects: 1, .. }));
    }
}
