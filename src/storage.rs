mod filesystem;
mod keys;
mod memory;
mod traits;

pub use filesystem::FilesystemStore;
pub use keys::RepoNamespace;
pub use memory::MemoryStore;
pub use traits::{KvMutation, KvStore};
