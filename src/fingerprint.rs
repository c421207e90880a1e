//! Deterministic cache-key function over a request descriptor (C3, §4.7).

use std::hash::Hasher;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::descriptor::{Body, RequestDescriptor, Scalar};

/// Which hash family backs key compaction. The fast default is seeded
/// per-instance (ahash's `RandomState`), so fingerprints are stable within
/// one `RequestCache` but not guaranteed stable across processes (§4.7) —
/// an explicit, documented trade against cross-process hash-flooding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashAlgorithm {
    #[default]
    Fast,
    Strong,
}

/// Computes fingerprints for a fixed configuration (max key length, hash
/// algorithm, header whitelist).
pub struct Fingerprinter {
    max_key_length: usize,
    algorithm: HashAlgorithm,
    headers_whitelist: Vec<String>,
    fast_hasher_seed: ahash::RandomState,
}

impl Fingerprinter {
    pub fn new(max_key_length: usize, algorithm: HashAlgorithm, headers_whitelist: Vec<String>) -> Self {
        Self {
            max_key_length,
            algorithm,
            headers_whitelist,
            fast_hasher_seed: ahash::RandomState::new(),
        }
    }

    /// Build the deterministic fingerprint for a descriptor.
    pub fn fingerprint(&self, descriptor: &RequestDescriptor) -> String {
        let mut key = String::new();
        key.push_str(descriptor.method.as_str());
        key.push('|');
        key.push_str(&normalize_url(&descriptor.url));
        key.push('|');
        key.push_str(&canonical_params(descriptor));
        key.push('|');
        key.push_str(&canonical_body(&descriptor.body));

        if !self.headers_whitelist.is_empty() {
            key.push('|');
            key.push_str(&canonical_headers(&descriptor.headers, &self.headers_whitelist));
        }

        if key.len() > self.max_key_length {
            self.hash_with_prefix(&key)
        } else {
            key
        }
    }

    fn hash_with_prefix(&self, key: &str) -> String {
        match self.algorithm {
            HashAlgorithm::Fast => {
                let mut hasher = self.fast_hasher_seed.build_hasher();
                hasher.write(key.as_bytes());
                format!("fast:{:016x}", hasher.finish())
            }
            HashAlgorithm::Strong => {
                let mut hasher = Sha256::new();
                hasher.update(key.as_bytes());
                format!("sha256:{:x}", hasher.finalize())
            }
        }
    }
}

/// Strip trailing path separators and drop the query string — query
/// parameters are tracked separately via `params` (§4.7).
fn normalize_url(url: &str) -> String {
    let without_query = url.split('?').next().unwrap_or(url);
    let trimmed = without_query.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Sorted by key, nulls dropped, so param order and null presence never
/// affect the fingerprint (§8, fingerprint determinism).
fn canonical_params(descriptor: &RequestDescriptor) -> String {
    let mut parts: Vec<String> = descriptor
        .params
        .iter()
        .filter(|(_, v)| !matches!(v, Scalar::Null))
        .map(|(k, v)| format!("{k}={}", scalar_to_string(v)))
        .collect();
    parts.sort();
    parts.join("&")
}

fn scalar_to_string(scalar: &Scalar) -> String {
    match scalar {
        Scalar::Null => String::new(),
        Scalar::String(s) => s.clone(),
        Scalar::Number(n) => n.to_string(),
        Scalar::Bool(b) => b.to_string(),
    }
}

fn canonical_headers(headers: &[(String, String)], whitelist: &[String]) -> String {
    let whitelist_lower: Vec<String> = whitelist.iter().map(|h| h.to_ascii_lowercase()).collect();
    let mut parts: Vec<String> = headers
        .iter()
        .filter(|(k, _)| whitelist_lower.contains(&k.to_ascii_lowercase()))
        .map(|(k, v)| format!("{}={v}", k.to_ascii_lowercase()))
        .collect();
    parts.sort();
    parts.join("&")
}

/// Strings are used verbatim; structured JSON values are serialized with a
/// stable (sorted) key order via [`canonical_json`]; binary-like payloads
/// are represented by a type tag plus size only — content hashing is
/// allowed but not required, so identical byte payloads may legitimately
/// produce distinct keys (§4.7's documented relaxation).
fn canonical_body(body: &Body) -> String {
    match body {
        Body::None => "none".to_string(),
        Body::Text(s) => format!("text:{s}"),
        Body::Bytes(b) => format!("bytes:{}", b.len()),
        Body::Form(pairs) => format!("form:{}", pairs.len()),
        Body::Stream => "stream".to_string(),
        Body::Value(v) => format!("value:{}", canonical_json(v, 0)),
    }
}

/// Serializes a JSON value with object keys sorted, breaking at a revisit
/// or depth bound rather than looping — `serde_json::Value` is a tree so a
/// true cycle cannot occur in Rust, but the bound guards against
/// pathologically deep nesting carried over from dynamically-typed inputs.
fn canonical_json(value: &Value, depth: usize) -> String {
    const MAX_DEPTH: usize = 64;
    if depth >= MAX_DEPTH {
        return "…".to_string();
    }
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("{s:?}"),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(|v| canonical_json(v, depth + 1)).collect();
            format!("[{}]", parts.join(","))
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{k:?}:{}", canonical_json(&map[k], depth + 1)))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Method;

    fn fp() -> Fingerprinter {
        Fingerprinter::new(512, HashAlgorithm::Fast, Vec::new())
    }

    #[test]
    fn differs_by_method() {
        let get = RequestDescriptor::new("/x", Method::Get);
        let post = RequestDescriptor::new("/x", Method::Post);
        assert_ne!(fp().fingerprint(&get), fp().fingerprint(&post));
    }

    #[test]
    fn trailing_slash_does_not_affect_fingerprint() {
        let a = RequestDescriptor::new("/x/", Method::Get);
        let b = RequestDescriptor::new("/x", Method::Get);
        assert_eq!(fp().fingerprint(&a), fp().fingerprint(&b));
    }

    #[test]
    fn query_string_is_stripped() {
        let a = RequestDescriptor::new("/x?foo=bar", Method::Get);
        let b = RequestDescriptor::new("/x", Method::Get);
        assert_eq!(fp().fingerprint(&a), fp().fingerprint(&b));
    }

    #[test]
    fn param_key_order_does_not_affect_fingerprint() {
        let a = RequestDescriptor::new("/x", Method::Get)
            .with_param("a", "1")
            .with_param("b", "2");
        let b = RequestDescriptor::new("/x", Method::Get)
            .with_param("b", "2")
            .with_param("a", "1");
        assert_eq!(fp().fingerprint(&a), fp().fingerprint(&b));
    }

    #[test]
    fn null_params_are_dropped() {
        let a = RequestDescriptor::new("/x", Method::Get).with_param("a", "1");
        let b = RequestDescriptor::new("/x", Method::Get)
            .with_param("a", "1")
            .with_param("b", Scalar::Null);
        assert_eq!(fp().fingerprint(&a), fp().fingerprint(&b));
    }

    #[test]
    fn long_keys_are_hashed_with_prefix() {
        let fingerprinter = Fingerprinter::new(16, HashAlgorithm::Fast, Vec::new());
        let desc = RequestDescriptor::new("/a-very-long-path-that-exceeds-the-limit", Method::Get);
        let key = fingerprinter.fingerprint(&desc);
        assert!(key.len() <= 32);
        assert!(key.starts_with("fast:"));
    }

    #[test]
    fn strong_algorithm_produces_sha256_prefixed_hash() {
        let fingerprinter = Fingerprinter::new(4, HashAlgorithm::Strong, Vec::new());
        let desc = RequestDescriptor::new("/x", Method::Get);
        let key = fingerprinter.fingerprint(&desc);
        assert!(key.starts_with("sha256:"));
    }

    #[test]
    fn object_key_order_does_not_affect_fingerprint() {
        let a = RequestDescriptor::new("/x", Method::Post)
            .with_body(Body::Value(serde_json::json!({"a": 1, "b": 2})));
        let b = RequestDescriptor::new("/x", Method::Post)
            .with_body(Body::Value(serde_json::json!({"b": 2, "a": 1})));
        assert_eq!(fp().fingerprint(&a), fp().fingerprint(&b));
    }
}
