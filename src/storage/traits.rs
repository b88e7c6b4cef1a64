use anyhow::Result;

/// One change inside a [`KvStore::write_batch`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvMutation {
    Set { key: String, value: Vec<u8> },
    Delete { key: String },
}

/// Flat key-value namespace holding repository data.
///
/// Keys are `/`-separated strings such as `owner/name/refs/heads/main`.
pub trait KvStore: Send + Sync {
    /// Read a value. Returns `None` if the key is absent.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Check whether a key is present.
    fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Write a value, replacing any previous one.
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove a key. Returns Ok(()) even if it didn't exist.
    fn delete(&self, key: &str) -> Result<()>;

    /// All keys starting with `prefix`, in lexicographic order.
    fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Apply several mutations, in order.
    /// Implementations document how atomic the batch is.
    fn write_batch(&self, batch: Vec<KvMutation>) -> Result<()>;
}
