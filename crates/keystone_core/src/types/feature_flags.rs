use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureFlagValue {
  String(String),
  Bool(bool),
}

pub type FeatureFlags = HashMap<String, FeatureFlagValue>;

pub fn flag_enabled(flags: &FeatureFlags, name: &str) -> bool {
  matches!(flags.get(name), Some(FeatureFlagValue::Bool(true)))
}

/// Like [`flag_enabled`], but a missing flag falls back to `default`.
pub fn flag_enabled_or(flags: &FeatureFlags, name: &str, default: bool) -> bool {
  match flags.get(name) {
    Some(FeatureFlagValue::Bool(value)) => *value,
    Some(FeatureFlagValue::String(_)) | None => default,
  }
}
