//! Cache key derivation for task results.

use sha2::{Digest, Sha256};

/// Derives the cache key for a node invocation.
///
/// The key covers the node type, its config, and the run inputs; two tasks
/// with the same key are expected to produce the same outputs. Object keys
/// are serialized in sorted order by `serde_json`, so logically equal
/// configs hash identically.
#[must_use]
pub fn task_cache_key(
    node_type: &str,
    config: &serde_json::Value,
    inputs: &serde_json::Value,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(node_type.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical_json(config).as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical_json(inputs).as_bytes());
    format!("task:{}", hex::encode(hasher.finalize()))
}

fn canonical_json(value: &serde_json::Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cache_key_is_stable() {
        let a = task_cache_key("http", &json!({"url": "x", "method": "GET"}), &json!({"n": 1}));
        let b = task_cache_key("http", &json!({"method": "GET", "url": "x"}), &json!({"n": 1}));
        assert_eq!(a, b);
        assert!(a.starts_with("task:"));
        assert_eq!(a.len(), "task:".len() + 64);
    }

    #[test]
    fn test_cache_key_changes_with_inputs() {
        let config = json!({"url": "x"});
        let a = task_cache_key("http", &config, &json!({"n": 1}));
        let b = task_cache_key("http", &config, &json!({"n": 2}));
        let c = task_cache_key("grpc", &config, &json!({"n": 1}));
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
