use std::fs;
use std::path::Path;
use std::path::PathBuf;

use keystone_core::types::CacheKey;
use parking_lot::Mutex;

use crate::Cache;

const STAGING_DIR: &str = ".staging";

/// Convert a cache key to a safe filesystem path.
/// Sanitizes `..` in path segments to avoid directory traversal.
fn file_for_key(base: &Path, key: &CacheKey) -> PathBuf {
  let clean_key = key
    .as_str()
    .split('/')
    .map(|part| {
      if part == ".." {
        "$$__parent_dir$$"
      } else {
        part
      }
    })
    .collect::<Vec<_>>()
    .join("/");
  base.join(clean_key)
}

/// A filesystem-backed cache implementation.
///
/// Blobs live under `{cache_dir}/{key}`. During a transaction, writes land in
/// a staging directory and are renamed into place at commit, so an
/// interrupted write never replaces previously committed blobs with partial
/// content.
#[derive(Debug)]
pub struct FsCache {
  cache_dir: PathBuf,
  in_transaction: Mutex<bool>,
}

impl FsCache {
  pub fn new(cache_dir: PathBuf) -> Self {
    Self {
      cache_dir,
      in_transaction: Mutex::new(false),
    }
  }

  fn staging_dir(&self) -> PathBuf {
    self.cache_dir.join(STAGING_DIR)
  }

  fn write_blob(&self, key: &CacheKey, blob: &[u8]) -> anyhow::Result<()> {
    let base = if *self.in_transaction.lock() {
      self.staging_dir()
    } else {
      self.cache_dir.clone()
    };

    let file_path = file_for_key(&base, key);
    if let Some(parent) = file_path.parent() {
      fs::create_dir_all(parent)?;
    }
    fs::write(&file_path, blob)?;
    Ok(())
  }

  fn read_blob(&self, key: &CacheKey) -> anyhow::Result<Option<Vec<u8>>> {
    let file_path = file_for_key(&self.cache_dir, key);
    match fs::read(&file_path) {
      Ok(bytes) => Ok(Some(bytes)),
      Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
      Err(error) => Err(error.into()),
    }
  }

  fn promote_staged(&self, staged: &Path, committed: &Path) -> anyhow::Result<()> {
    for entry in fs::read_dir(staged)? {
      let entry = entry?;
      let target = committed.join(entry.file_name());
      if entry.file_type()?.is_dir() {
        fs::create_dir_all(&target)?;
        self.promote_staged(&entry.path(), &target)?;
      } else {
        fs::rename(entry.path(), &target)?;
      }
    }
    Ok(())
  }
}

impl Cache for FsCache {
  fn get_blob(&self, key: &CacheKey) -> anyhow::Result<Option<Vec<u8>>> {
    self.read_blob(key)
  }

  fn set_blob(&self, key: &CacheKey, blob: &[u8]) -> anyhow::Result<()> {
    self.write_blob(key, blob)
  }

  fn has_blob(&self, key: &CacheKey) -> bool {
    file_for_key(&self.cache_dir, key).is_file()
  }

  fn delete_blob(&self, key: &CacheKey) -> anyhow::Result<()> {
    match fs::remove_file(file_for_key(&self.cache_dir, key)) {
      Ok(()) => Ok(()),
      Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
      Err(error) => Err(error.into()),
    }
  }

  fn set_large_blob(&self, key: &CacheKey, blob: &[u8]) -> anyhow::Result<()> {
    self.write_blob(key, blob)
  }

  fn get_large_blob(&self, key: &CacheKey) -> anyhow::Result<Vec<u8>> {
    self
      .read_blob(key)?
      .ok_or_else(|| anyhow::anyhow!("missing blob {key}"))
  }

  fn start_transaction(&self) -> anyhow::Result<()> {
    let staging = self.staging_dir();
    if staging.exists() {
      // Leftovers from an interrupted or abandoned write.
      tracing::warn!(staging = %staging.display(), "discarding stale cache staging directory");
      fs::remove_dir_all(&staging)?;
    }
    fs::create_dir_all(&staging)?;
    *self.in_transaction.lock() = true;
    Ok(())
  }

  fn commit_transaction(&self) -> anyhow::Result<()> {
    let staging = self.staging_dir();
    self.promote_staged(&staging, &self.cache_dir)?;
    fs::remove_dir_all(&staging)?;
    *self.in_transaction.lock() = false;
    Ok(())
  }
}
