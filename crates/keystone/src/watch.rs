use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchEventType {
  Create,
  Update,
  Delete,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchEvent {
  pub path: PathBuf,
  pub kind: WatchEventType,
}

impl WatchEvent {
  pub fn create(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      kind: WatchEventType::Create,
    }
  }

  pub fn update(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      kind: WatchEventType::Update,
    }
  }

  pub fn delete(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      kind: WatchEventType::Delete,
    }
  }
}

pub type WatchEvents = Vec<WatchEvent>;

pub type WatcherRef = Arc<dyn Watcher + Send + Sync>;

/// Boundary to the file-system watcher.
///
/// Only snapshot bookkeeping is modelled here; delivery of live event batches
/// while watching is the embedder's concern.
#[mockall::automock]
pub trait Watcher {
  /// Persist a marker of the current file-system state under `watch_dir` to
  /// `snapshot_path`.
  fn write_snapshot(&self, watch_dir: &Path, snapshot_path: &Path) -> anyhow::Result<()>;

  /// The events that happened under `watch_dir` since `snapshot_path` was
  /// written.
  fn events_since(&self, watch_dir: &Path, snapshot_path: &Path) -> anyhow::Result<WatchEvents>;
}
