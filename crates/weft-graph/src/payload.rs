//! Payload and provenance types exchanged between tasks.

use serde_json::{Map, Value};

/// A string-keyed JSON object carried as a task's input or output.
///
/// Backed by a sorted map (`serde_json` without `preserve_order`), which
/// keeps serialized payloads canonical for fingerprinting.
pub type TaskPayload = Map<String, Value>;

/// A shallow string-keyed map propagated along dataflows for audit and
/// downstream use.
pub type Provenance = Map<String, Value>;

/// Shallow-merges `overlay` into `base`; keys in `overlay` win.
pub fn merge_shallow(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, value) in overlay {
        base.insert(key.clone(), value.clone());
    }
}

/// Builds a payload from an iterator of key/value pairs.
pub fn payload_from<I, K>(entries: I) -> TaskPayload
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    entries
        .into_iter()
        .map(|(key, value)| (key.into(), value))
        .collect()
}
