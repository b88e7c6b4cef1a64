use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use tempfile::NamedTempFile;

use super::traits::{KvMutation, KvStore};

const TEMP_PREFIX: &str = ".tmp-";

/// Filesystem-backed store: every key is a file below `base_path`.
///
/// Writes go to a temp file that is renamed into place. A batch first
/// stages all of its writes, then renames and deletes in order, so a
/// failure while staging leaves the store untouched.
pub struct FilesystemStore {
    base_path: PathBuf,
}

impl FilesystemStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)
            .with_context(|| format!("Failed to create store dir {}", base_path.display()))?;
        Ok(FilesystemStore { base_path })
    }

    /// Map a key to its file, rejecting keys that could escape the store.
    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty()
            || key.starts_with('/')
            || key
                .split('/')
                .any(|part| part.is_empty() || part == "." || part == "..")
        {
            bail!("invalid storage key '{}'", key);
        }
        if key.split('/').any(|part| part.starts_with(TEMP_PREFIX)) {
            bail!("storage key '{}' uses a reserved name", key);
        }
        Ok(self.base_path.join(key))
    }

    fn stage(&self, key: &str, value: &[u8]) -> Result<(NamedTempFile, PathBuf)> {
        let path = self.path_for(key)?;
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.base_path.clone());
        fs::create_dir_all(&dir)?;

        let mut temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&dir)
            .with_context(|| format!("Failed to create temp file for '{}'", key))?;
        temp.write_all(value)?;
        temp.as_file().sync_all()?;
        Ok((temp, path))
    }

    fn collect_keys(&self, dir: &Path, prefix: &str, keys: &mut Vec<String>) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(TEMP_PREFIX) {
                continue;
            }
            if entry.file_type()?.is_dir() {
                self.collect_keys(&path, prefix, keys)?;
                continue;
            }
            let relative = path.strip_prefix(&self.base_path)?;
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        Ok(())
    }
}

impl KvStore for FilesystemStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read '{}'", key)),
        }
    }

    fn has(&self, key: &str) -> Result<bool> {
        Ok(self.path_for(key)?.is_file())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let (temp, path) = self.stage(key, value)?;
        temp.persist(&path)
            .with_context(|| format!("Failed to write '{}'", key))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete '{}'", key)),
        }
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        // only walk the deepest directory the prefix names
        let dir = match prefix.rfind('/') {
            Some(slash) => self.base_path.join(&prefix[..slash]),
            None => self.base_path.clone(),
        };
        let mut keys = Vec::new();
        self.collect_keys(&dir, prefix, &mut keys)?;
        keys.sort();
        Ok(keys)
    }

    fn write_batch(&self, batch: Vec<KvMutation>) -> Result<()> {
        let mut staged = Vec::with_capacity(batch.len());
        for mutation in &batch {
            match mutation {
                KvMutation::Set { key, value } => staged.push(Some(self.stage(key, value)?)),
                KvMutation::Delete { key } => {
                    self.path_for(key)?;
                    staged.push(None);
                }
            }
        }

        for (mutation, staged) in batch.iter().zip(staged) {
            match (mutation, staged) {
                (KvMutation::Set { key, .. }, Some((temp, path))) => {
                    temp.persist(&path)
                        .with_context(|| format!("Failed to write '{}'", key))?;
                }
                (KvMutation::Delete { key }, _) => self.delete(key)?,
                (KvMutation::Set { key, .. }, None) => bail!("write for '{}' was not staged", key),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_and_read_key() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = FilesystemStore::new(temp_dir.path())?;

        store.set("owner/repo/HEAD", b"ref: refs/heads/master\n")?;
        assert_eq!(
            store.get("owner/repo/HEAD")?,
            Some(b"ref: refs/heads/master\n".to_vec())
        );
        assert!(temp_dir.path().join("owner/repo/HEAD").is_file());
        assert_eq!(store.get("owner/repo/config")?, None);

        Ok(())
    }

    #[test]
    fn test_overwrite_and_delete() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = FilesystemStore::new(temp_dir.path())?;

        store.set("k", b"1")?;
        store.set("k", b"2")?;
        assert_eq!(store.get("k")?, Some(b"2".to_vec()));
        store.delete("k")?;
        store.delete("k")?;
        assert!(!store.has("k")?);
        Ok(())
    }

    #[test]
    fn test_list_keys_skips_temp_files() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = FilesystemStore::new(temp_dir.path())?;

        store.set("o/r/refs/heads/main", b"a")?;
        store.set("o/r/refs/heads/feature/x", b"b")?;
        store.set("o/r/HEAD", b"c")?;
        fs::write(temp_dir.path().join("o/r/refs/heads/.tmp-abc"), b"partial")?;

        assert_eq!(
            store.list_keys("o/r/refs/")?,
            vec!["o/r/refs/heads/feature/x", "o/r/refs/heads/main"]
        );
        assert!(store.list_keys("missing/")?.is_empty());
        Ok(())
    }

    #[test]
    fn test_rejects_escaping_keys() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = FilesystemStore::new(temp_dir.path())?;

        assert!(store.set("../outside", b"x").is_err());
        assert!(store.set("/etc/passwd", b"x").is_err());
        assert!(store.set("a/./b", b"x").is_err());
        assert!(store.get("a//b").is_err());
        Ok(())
    }

    #[test]
    fn test_batch_with_invalid_key_writes_nothing() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = FilesystemStore::new(temp_dir.path())?;

        let result = store.write_batch(vec![
            KvMutation::Set {
                key: "good".into(),
                value: b"1".to_vec(),
            },
            KvMutation::Set {
                key: "../bad".into(),
                value: b"2".to_vec(),
            },
        ]);
        assert!(result.is_err());
        assert!(!store.has("good")?);
        Ok(())
    }
}
