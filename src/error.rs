use thiserror::Error;

use crate::pack::{delta::DeltaError, ObjectId};

/// Why a reference precondition failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// Create targeted a reference that is already present.
    AlreadyExists,
    /// Update or delete targeted a reference that is absent.
    DoesNotExist,
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictKind::AlreadyExists => write!(f, "reference already exists"),
            ConflictKind::DoesNotExist => write!(f, "reference does not exist"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed pack header: {0}")]
    MalformedHeader(String),

    #[error("pack contains no data")]
    EmptyPack,

    #[error("malformed pack entry at offset {offset}: {reason}")]
    MalformedEntry { offset: u64, reason: String },

    #[error("ofs-delta base at offset {offset} not found")]
    ObjectNotFound { offset: u64 },

    #[error("reference delta base {id} not found")]
    ReferenceDeltaUnresolved { id: ObjectId },

    #[error("pack checksum mismatch: trailer says {expected}, content hashes to {actual}")]
    ChecksumMismatch { expected: ObjectId, actual: ObjectId },

    #[error("pack declares {declared} objects but only {scanned} were read")]
    CountMismatch { declared: u32, scanned: u32 },

    #[error("unexpected data after pack trailer")]
    TrailingData,

    #[error("delta chain deeper than {limit}")]
    DeltaChainTooDeep { limit: usize },

    #[error("corrupt delta at offset {offset}: {source}")]
    Delta {
        offset: u64,
        #[source]
        source: DeltaError,
    },

    #[error("invalid pack index: {0}")]
    InvalidIndex(String),

    #[error("invalid repository namespace: '{0}'")]
    InvalidNamespace(String),

    #[error("reference doesn't start with refs/: '{0}'")]
    InvalidReferenceName(String),

    #[error("malformed command for '{0}': old and new hashes are both zero")]
    InvalidCommand(String),

    #[error("{kind}: '{name}'")]
    ReferenceConflict { name: String, kind: ConflictKind },

    #[error("commands cannot be empty")]
    EmptyCommandList,

    #[error("author cannot be empty")]
    MissingAuthor,

    #[error("unknown query endpoint: '{0}'")]
    UnknownQuery(String),

    #[error("query result could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),
}

impl Error {
    pub(crate) fn entry(offset: u64, reason: impl Into<String>) -> Self {
        Error::MalformedEntry {
            offset,
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
