//! Flat-state codec.
//!
//! Job state is durable only in flat form: dot-separated paths mapped to
//! JSON leaves, with symbol keys assigned lazily by the store. The
//! hierarchical view is materialized on client reads and never persisted,
//! so the durable form stays free of cyclic references.

use crate::types::DimensionalAddress;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Flatten a JSON value into path/leaf pairs under `prefix`. Objects are
/// walked; arrays and scalars are leaves.
pub fn flatten(prefix: &str, value: &Value) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    flatten_into(prefix, value, &mut out);
    out
}

fn flatten_into(prefix: &str, value: &Value, out: &mut Vec<(String, Value)>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (k, v) in map {
                let path = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{prefix}.{k}")
                };
                flatten_into(&path, v, out);
            }
        }
        other => out.push((prefix.to_string(), other.clone())),
    }
}

/// Rebuild the hierarchical view from flat entries. Later entries win on
/// path collisions.
pub fn materialize<I>(entries: I) -> Value
where
    I: IntoIterator<Item = (String, Value)>,
{
    let mut root = Map::new();
    for (path, value) in entries {
        insert_path(&mut root, &path, value);
    }
    Value::Object(root)
}

fn insert_path(root: &mut Map<String, Value>, path: &str, value: Value) {
    let mut parts = path.split('.').peekable();
    let mut current = root;
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            current.insert(part.to_string(), value);
            return;
        }
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = entry.as_object_mut().expect("object ensured above");
    }
}

/// Storage key for a path written under a dimensional address. The root
/// subspace uses the bare path; cycle subspaces suffix the trimmed address
/// so each iteration's writes stay isolated.
pub fn dimensioned_path(path: &str, dad: &DimensionalAddress) -> String {
    let trimmed = dad.trimmed();
    if trimmed == DimensionalAddress::root() {
        path.to_string()
    } else {
        format!("{path}{trimmed}")
    }
}

/// Walk a dotted path into a JSON value.
pub fn value_at<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

/// Render a JSON leaf as a correlation key: strings unquoted, everything
/// else in canonical JSON form.
pub fn key_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Expand a `consumes` declaration (producer activity id → paths read) into
/// the flat path list handed to the store.
pub fn consumed_paths(consumes: &BTreeMap<String, Vec<String>>) -> Vec<String> {
    let mut out: Vec<String> = consumes.values().flatten().cloned().collect();
    out.sort();
    out.dedup();
    out
}
