use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

/// A condition a request declares while running. When the condition fires the
/// cached result becomes stale and the request re-runs on the next build.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Invalidation {
  FileUpdate(PathBuf),
  FileDelete(PathBuf),
  FileCreate(FileCreateInvalidation),
  EnvChange(String),
  OptionChange(String),
  ConfigKeyChange { file_path: PathBuf, key_path: String },
  /// Re-run on every process start. For requests whose correctness cannot be
  /// derived from declared file/env/option state, e.g. because they execute
  /// arbitrary third-party code at load time.
  Startup,
  /// Re-run on every build.
  Build,
}

/// Shape of a "file created" trigger.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FileCreateInvalidation {
  /// An exact path comes into existence.
  Path(PathBuf),
  /// Any created path matches a glob pattern.
  Glob(String),
  /// A file or directory named `file_name` (optionally multi-segment, e.g.
  /// `node_modules/lodash`) is created in any directory between
  /// `above_path`'s parent and the file-system root.
  FileNameAbove { file_name: String, above_path: PathBuf },
}

/// Read-only view of a request's currently declared update triggers, exposed
/// so a re-running request can inspect what it depended on last time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RequestInvalidation {
  File(PathBuf),
  Env(String),
  Option(String),
  ConfigKey { file_path: PathBuf, key_path: String },
}

bitflags::bitflags! {
  /// Why a request is invalid. Reasons accumulate until the next successful
  /// run clears them.
  #[derive(Clone, Copy, Debug, PartialEq, Eq)]
  pub struct InvalidateReason: u32 {
    const INITIAL_BUILD = 1 << 0;
    const FILE_UPDATE = 1 << 1;
    const FILE_CREATE = 1 << 2;
    const FILE_DELETE = 1 << 3;
    const ENV_CHANGE = 1 << 4;
    const OPTION_CHANGE = 1 << 5;
    const STARTUP = 1 << 6;
    const ERROR = 1 << 7;
  }
}

impl Serialize for InvalidateReason {
  fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    self.bits().serialize(serializer)
  }
}

impl<'de> Deserialize<'de> for InvalidateReason {
  fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let bits = u32::deserialize(deserializer)?;
    Ok(InvalidateReason::from_bits_truncate(bits))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn reasons_accumulate() {
    let mut reason = InvalidateReason::INITIAL_BUILD;
    reason |= InvalidateReason::FILE_UPDATE;
    assert!(reason.contains(InvalidateReason::FILE_UPDATE));
    assert!(reason.contains(InvalidateReason::INITIAL_BUILD));
    assert!(!reason.contains(InvalidateReason::ERROR));
  }

  #[test]
  fn reason_serializes_as_bits() {
    let reason = InvalidateReason::FILE_UPDATE | InvalidateReason::ERROR;
    let serialized = serde_json::to_string(&reason).unwrap();
    let restored: InvalidateReason = serde_json::from_str(&serialized).unwrap();
    assert_eq!(restored, reason);
  }
}
