use serde_json::Value;

/// Resolve a dotted key path (`"resolver.extensions"`) inside a JSON
/// document. Returns `None` when any segment is missing or the value at an
/// intermediate segment is not an object.
pub fn value_at_key_path<'a>(document: &'a Value, key_path: &str) -> Option<&'a Value> {
  let mut current = document;
  for segment in key_path.split('.') {
    current = current.get(segment)?;
  }
  Some(current)
}
