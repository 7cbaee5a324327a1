use std::path::Path;
use std::sync::Arc;

use keystone_filesystem::FileSystem;
use keystone_filesystem::FileSystemRef;

use crate::hash::hash_bytes;
use crate::key_path::value_at_key_path;

pub type ConfigKeyHasherRef = Arc<dyn ConfigKeyHasher + Send + Sync>;

/// Hashes one addressable sub-value of a structured config file.
///
/// Granular config invalidation needs a stable content hash of just the
/// sub-key a request read, so that edits to unrelated sections of the same
/// file do not invalidate it.
#[mockall::automock]
pub trait ConfigKeyHasher {
  /// `Ok(None)` when the file or the key does not exist.
  fn hash_config_key(&self, file_path: &Path, key_path: &str) -> anyhow::Result<Option<String>>;
}

/// [`ConfigKeyHasher`] for JSON config files.
#[derive(Debug)]
pub struct JsonConfigKeyHasher {
  fs: FileSystemRef,
}

impl JsonConfigKeyHasher {
  pub fn new(fs: FileSystemRef) -> Self {
    Self { fs }
  }
}

impl ConfigKeyHasher for JsonConfigKeyHasher {
  fn hash_config_key(&self, file_path: &Path, key_path: &str) -> anyhow::Result<Option<String>> {
    let contents = match self.fs.read_to_string(file_path) {
      Ok(contents) => contents,
      Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
      Err(error) => return Err(error.into()),
    };

    let document: serde_json::Value = serde_json::from_str(&contents)?;
    Ok(
      value_at_key_path(&document, key_path)
        .map(|value| hash_bytes(value.to_string().as_bytes())),
    )
  }
}
