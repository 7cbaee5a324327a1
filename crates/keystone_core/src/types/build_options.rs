use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use super::feature_flags::FeatureFlags;

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
  #[default]
  Development,
  Production,
}

/// Options one build session runs against.
///
/// `entries`, `mode`, `should_build_lazily` and `watch_backend` key the cache
/// generation: changing any of them makes previously persisted state
/// unreachable. `env` and `options` are the documents env/option invalidation
/// nodes are diffed against between builds.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BuildOptions {
  pub entries: Vec<String>,
  pub mode: BuildMode,
  pub should_build_lazily: bool,
  pub watch_backend: String,
  /// Environment snapshot the build observes.
  pub env: BTreeMap<String, String>,
  /// Opaque option document requests may declare invalidations against,
  /// addressed by dotted key paths.
  pub options: serde_json::Value,
  pub feature_flags: FeatureFlags,
}
