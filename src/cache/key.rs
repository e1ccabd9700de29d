//! Cache key generation using SHA-256 hashes

use sha2::{Digest, Sha256};

/// Generate a deterministic cache key from operation type and parameters.
///
/// The key is a SHA-256 hash of the operation and sorted parameters, so
/// every runner derives the same key for the same request regardless of
/// parameter order.
pub fn cache_key<K: AsRef<str>, V: AsRef<str>>(operation: &str, params: &[(K, V)]) -> String {
    let mut hasher = Sha256::new();

    hasher.update(operation.as_bytes());
    hasher.update(b"|");

    let mut sorted_params: Vec<_> = params.iter().collect();
    sorted_params.sort_by(|(a, _), (b, _)| a.as_ref().cmp(b.as_ref()));

    for (k, v) in sorted_params {
        hasher.update(k.as_ref().as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_ref().as_bytes());
        hasher.update(b"&");
    }

    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_deterministic() {
        let key1 = cache_key("list_pulls", &[("owner", "org"), ("repo", "app")]);
        let key2 = cache_key("list_pulls", &[("repo", "app"), ("owner", "org")]);

        // Same inputs in different order should produce same key
        assert_eq!(key1, key2);
    }

    #[test]
    fn test_cache_key_different_operations() {
        let key1 = cache_key("list_pulls", &[("owner", "org")]);
        let key2 = cache_key("list_branches", &[("owner", "org")]);

        assert_ne!(key1, key2);
    }

    #[test]
    fn test_cache_key_different_values() {
        let key1 = cache_key("get_repo", &[("repo", "a")]);
        let key2 = cache_key("get_repo", &[("repo", "b")]);

        assert_ne!(key1, key2);
    }

    #[test]
    fn test_cache_key_no_params() {
        let empty: [(&str, &str); 0] = [];
        let key = cache_key("get_rate_limit", &empty);

        assert_eq!(key.len(), 64);
        assert_eq!(key, cache_key("get_rate_limit", &empty));
    }
}
