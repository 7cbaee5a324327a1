use std::sync::Arc;

use keystone_core::types::CacheKey;

pub use fs_cache::FsCache;
pub use in_memory_cache::InMemoryCache;

mod fs_cache;
mod in_memory_cache;

pub type CacheRef = Arc<dyn Cache + Sync + Send>;

/// External blob store the engine persists into.
///
/// Implementations must keep the previously committed generation readable
/// while the next one is being written: writes issued between
/// `start_transaction` and `commit_transaction` become visible atomically at
/// commit, and a crash in between leaves the prior state intact.
#[mockall::automock]
pub trait Cache {
  fn get_blob(&self, key: &CacheKey) -> anyhow::Result<Option<Vec<u8>>>;

  fn set_blob(&self, key: &CacheKey, blob: &[u8]) -> anyhow::Result<()>;

  fn has_blob(&self, key: &CacheKey) -> bool;

  fn delete_blob(&self, key: &CacheKey) -> anyhow::Result<()>;

  /// Write a large blob to its own backing storage so the main store stays
  /// small.
  fn set_large_blob(&self, key: &CacheKey, blob: &[u8]) -> anyhow::Result<()>;

  fn get_large_blob(&self, key: &CacheKey) -> anyhow::Result<Vec<u8>>;

  fn start_transaction(&self) -> anyhow::Result<()>;

  fn commit_transaction(&self) -> anyhow::Result<()>;
}
