//! Git pack format support
//!
//! Decoding of incoming packs (including thin packs completed from stored
//! objects), `.idx` generation, and the streaming ingestion that persists
//! both into a repository's key-value namespace.

pub mod buffer;
pub mod cache;
pub mod decode;
pub mod delta;
pub mod encode;
pub mod graph;
pub mod index;
pub mod objects;
pub mod receive;
pub mod stored;

pub use decode::{
    CollectObjects, DecodedObject, DecoderOptions, ExternalObjects, PackObserver, PackSource,
    PackfileDecoder, Seekable, Streaming,
};
pub use encode::{encode_objects, PackEncoder};
pub use index::{IndexBuilder, IndexEntry, PackIndex};
pub use objects::{compute_object_id, GitObject, ObjectId};
pub use receive::{begin_ingest, receive_pack, IngestOutcome, PackSink};
pub use stored::StoredPacks;
