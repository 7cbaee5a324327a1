use xxhash_rust::xxh3::xxh3_64;
use xxhash_rust::xxh3::Xxh3;

/// Hasher for identifiers that end up in the on-disk cache.
///
/// The hashes don't need to be incredibly fast, but they must be stable
/// across runs, machines, platforms and versions, since they key cache
/// generations and persisted request results.
pub type IdentifierHasher = Xxh3;

pub fn hash_string(s: &str) -> String {
  hash_bytes(s.as_bytes())
}

pub fn hash_bytes(bytes: &[u8]) -> String {
  format!("{:016x}", xxh3_64(bytes))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn hashes_are_stable_and_fixed_width() {
    assert_eq!(hash_string("mode"), hash_string("mode"));
    assert_eq!(hash_string("mode").len(), 16);
    assert_ne!(hash_string("mode"), hash_string("mode "));
  }
}
