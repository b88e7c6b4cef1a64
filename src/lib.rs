#![deny(clippy::mod_module_files)]
//! Git push ingestion into a key-value namespace: pack decoding and
//! indexing, thin-pack completion, and reference updates.

pub mod commands;
pub mod config;
pub mod error;
pub mod pack;
pub mod protocol;
pub mod refs;
pub mod storage;

pub use error::{ConflictKind, Error, Result};
