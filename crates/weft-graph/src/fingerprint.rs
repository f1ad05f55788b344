//! Deterministic input fingerprinting for cache keys.

use serde_json::json;
use sha2::{Digest, Sha256};

use crate::error::GraphResult;
use crate::payload::TaskPayload;

/// Computes the cache fingerprint of a task input.
///
/// The fingerprint is the hex SHA-256 of the canonical JSON encoding of
/// `{ "input": input, "type": type_name }`. Payload maps are key-sorted
/// by construction, so equal inputs fingerprint identically regardless
/// of insertion order; array element order is significant.
pub fn fingerprint(type_name: &str, input: &TaskPayload) -> GraphResult<String> {
    let key = json!({ "input": input, "type": type_name });
    let bytes = serde_json::to_vec(&key)?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::payload::payload_from;

    #[test]
    fn test_fingerprint_is_stable() {
        let input = payload_from([("prompt", json!("x")), ("steps", json!(4))]);
        let a = fingerprint("gen", &input).expect("fingerprint");
        let b = fingerprint("gen", &input).expect("fingerprint");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_fingerprint_ignores_insertion_order() {
        let a = payload_from([("a", json!(1)), ("b", json!(2))]);
        let b = payload_from([("b", json!(2)), ("a", json!(1))]);
        assert_eq!(
            fingerprint("t", &a).expect("fingerprint"),
            fingerprint("t", &b).expect("fingerprint"),
        );
    }

    #[test]
    fn test_fingerprint_varies_by_type_and_input() {
        let input = payload_from([("a", json!(1))]);
        let other = payload_from([("a", json!(2))]);

        assert_ne!(
            fingerprint("t", &input).expect("fingerprint"),
            fingerprint("u", &input).expect("fingerprint"),
        );
        assert_ne!(
            fingerprint("t", &input).expect("fingerprint"),
            fingerprint("t", &other).expect("fingerprint"),
        );
    }

    #[test]
    fn test_fingerprint_array_order_significant() {
        let a = payload_from([("values", json!([1, 2]))]);
        let b = payload_from([("values", json!([2, 1]))]);
        assert_ne!(
            fingerprint("t", &a).expect("fingerprint"),
            fingerprint("t", &b).expect("fingerprint"),
        );
    }
}
