use std::collections::HashMap;

use keystone_core::types::CacheKey;
use parking_lot::Mutex;

use crate::Cache;

#[derive(Debug)]
enum StagedWrite {
  Set(CacheKey, Vec<u8>),
  Delete(CacheKey),
}

/// In memory implementation of the `Cache` trait, for testing purposes.
///
/// Reads observe the committed state only; staged writes become visible at
/// `commit_transaction`, mirroring the durability contract production
/// implementations provide.
#[derive(Debug, Default)]
pub struct InMemoryCache {
  committed: Mutex<HashMap<CacheKey, Vec<u8>>>,
  staged: Mutex<Option<Vec<StagedWrite>>>,
  write_log: Mutex<Vec<CacheKey>>,
}

impl InMemoryCache {
  pub fn new() -> Self {
    Self::default()
  }

  /// Keys written since the last call, in write order. Test hook for
  /// asserting which blobs a cache write actually touched.
  pub fn drain_written_keys(&self) -> Vec<CacheKey> {
    std::mem::take(&mut *self.write_log.lock())
  }

  fn record(&self, key: &CacheKey, blob: &[u8]) {
    self.write_log.lock().push(key.clone());

    let mut staged = self.staged.lock();
    if let Some(writes) = staged.as_mut() {
      writes.push(StagedWrite::Set(key.clone(), blob.to_vec()));
    } else {
      self.committed.lock().insert(key.clone(), blob.to_vec());
    }
  }
}

impl Cache for InMemoryCache {
  fn get_blob(&self, key: &CacheKey) -> anyhow::Result<Option<Vec<u8>>> {
    Ok(self.committed.lock().get(key).cloned())
  }

  fn set_blob(&self, key: &CacheKey, blob: &[u8]) -> anyhow::Result<()> {
    self.record(key, blob);
    Ok(())
  }

  fn has_blob(&self, key: &CacheKey) -> bool {
    self.committed.lock().contains_key(key)
  }

  fn delete_blob(&self, key: &CacheKey) -> anyhow::Result<()> {
    let mut staged = self.staged.lock();
    if let Some(writes) = staged.as_mut() {
      writes.push(StagedWrite::Delete(key.clone()));
    } else {
      self.committed.lock().remove(key);
    }
    Ok(())
  }

  fn set_large_blob(&self, key: &CacheKey, blob: &[u8]) -> anyhow::Result<()> {
    self.record(key, blob);
    Ok(())
  }

  fn get_large_blob(&self, key: &CacheKey) -> anyhow::Result<Vec<u8>> {
    self
      .committed
      .lock()
      .get(key)
      .cloned()
      .ok_or_else(|| anyhow::anyhow!("missing blob {key}"))
  }

  fn start_transaction(&self) -> anyhow::Result<()> {
    // An uncommitted previous transaction is discarded.
    *self.staged.lock() = Some(Vec::new());
    Ok(())
  }

  fn commit_transaction(&self) -> anyhow::Result<()> {
    let writes = self
      .staged
      .lock()
      .take()
      .ok_or_else(|| anyhow::anyhow!("commit_transaction without start_transaction"))?;

    let mut committed = self.committed.lock();
    for write in writes {
      match write {
        StagedWrite::Set(key, blob) => {
          committed.insert(key, blob);
        }
        StagedWrite::Delete(key) => {
          committed.remove(&key);
        }
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn writes_outside_a_transaction_are_immediate() {
    let cache = InMemoryCache::new();
    let key = CacheKey::new("header");

    cache.set_blob(&key, b"v1").unwrap();
    assert_eq!(cache.get_blob(&key).unwrap(), Some(b"v1".to_vec()));
  }

  #[test]
  fn staged_writes_are_invisible_until_commit() {
    let cache = InMemoryCache::new();
    let key = CacheKey::new("header");
    cache.set_blob(&key, b"v1").unwrap();

    cache.start_transaction().unwrap();
    cache.set_blob(&key, b"v2").unwrap();
    assert_eq!(cache.get_blob(&key).unwrap(), Some(b"v1".to_vec()));

    cache.commit_transaction().unwrap();
    assert_eq!(cache.get_blob(&key).unwrap(), Some(b"v2".to_vec()));
  }

  #[test]
  fn abandoned_transaction_leaves_previous_state() {
    let cache = InMemoryCache::new();
    let key = CacheKey::new("header");
    cache.set_blob(&key, b"v1").unwrap();

    cache.start_transaction().unwrap();
    cache.set_blob(&key, b"v2").unwrap();

    // A new transaction discards the abandoned writes.
    cache.start_transaction().unwrap();
    cache.commit_transaction().unwrap();
    assert_eq!(cache.get_blob(&key).unwrap(), Some(b"v1".to_vec()));
  }

  #[test]
  fn drain_written_keys_reports_write_order() {
    let cache = InMemoryCache::new();
    cache.set_blob(&CacheKey::new("a"), b"1").unwrap();
    cache.set_large_blob(&CacheKey::new("b"), b"2").unwrap();

    assert_eq!(
      cache.drain_written_keys(),
      vec![CacheKey::new("a"), CacheKey::new("b")]
    );
    assert_eq!(cache.drain_written_keys(), Vec::<CacheKey>::new());
  }
}
