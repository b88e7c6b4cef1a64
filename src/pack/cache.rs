//! Byte-bounded LRU of materialized object contents, keyed by pack offset.

use std::sync::Arc;

use lru::LruCache;

/// Default capacity: 96 MiB of object content
pub const DEFAULT_CAPACITY_BYTES: usize = 96 * 1024 * 1024;

pub struct DeltaCache {
    entries: LruCache<u64, Arc<[u8]>>,
    capacity: usize,
    size: usize,
}

impl DeltaCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            capacity,
            size: 0,
        }
    }

    pub fn get(&mut self, offset: u64) -> Option<Arc<[u8]>> {
        self.entries.get(&offset).cloned()
    }

    /// Insert content, evicting least-recently-used entries while over capacity.
    ///
    /// Content larger than the whole capacity is not cached.
    pub fn put(&mut self, offset: u64, content: Arc<[u8]>) {
        if content.len() > self.capacity {
            self.remove(offset);
            return;
        }
        self.size += content.len();
        if let Some(old) = self.entries.put(offset, content) {
            self.size -= old.len();
        }
        while self.size > self.capacity {
            match self.entries.pop_lru() {
                Some((evicted, bytes)) => {
                    tracing::trace!(
                        "delta cache evicted offset {} ({} bytes)",
                        evicted,
                        bytes.len()
                    );
                    self.size -= bytes.len();
                }
                None => break,
            }
        }
    }

    pub fn remove(&mut self, offset: u64) {
        if let Some(old) = self.entries.pop(&offset) {
            self.size -= old.len();
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(n: usize) -> Arc<[u8]> {
        vec![0u8; n].into()
    }

    #[test]
    fn test_evicts_least_recently_used_by_bytes() {
        let mut cache = DeltaCache::new(10);
        cache.put(1, bytes(4));
        cache.put(2, bytes(4));
        assert!(cache.get(1).is_some()); // 2 is now least recent
        cache.put(3, bytes(4));

        assert!(cache.get(2).is_none());
        assert!(cache.get(1).is_some());
        assert!(cache.get(3).is_some());
        assert_eq!(cache.size(), 8);
    }

    #[test]
    fn test_oversized_entries_are_skipped() {
        let mut cache = DeltaCache::new(4);
        cache.put(1, bytes(5));
        assert!(cache.is_empty());
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_replace_and_remove_keep_size_accurate() {
        let mut cache = DeltaCache::new(100);
        cache.put(7, bytes(10));
        cache.put(7, bytes(3));
        assert_eq!(cache.size(), 3);
        assert_eq!(cache.len(), 1);
        cache.remove(7);
        cache.remove(7);
        assert_eq!(cache.size(), 0);
    }
}
