//! Stable namespaced cache keys.

use sha2::{Digest, Sha256};

/// Build a cache key as `namespace:<sha256(input)>`.
///
/// Input is trimmed before hashing so that incidental whitespace in request
/// paths or query strings maps to the same entry.
pub fn cache_key(namespace: &str, input: &str) -> String {
  // SHA256 hash for stable, fixed-length keys
  let mut hasher = Sha256::new();
  hasher.update(input.trim().as_bytes());
  format!("{}:{}", namespace, hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_key_is_namespaced_and_stable() {
    let a = cache_key("summaries", "/summary?id=1");
    let b = cache_key("summaries", "  /summary?id=1 ");
    assert_eq!(a, b);
    assert!(a.starts_with("summaries:"));
    assert_eq!(a.len(), "summaries:".len() + 64);
  }

  #[test]
  fn test_namespaces_do_not_collide() {
    assert_ne!(cache_key("a", "x"), cache_key("b", "x"));
  }
}
