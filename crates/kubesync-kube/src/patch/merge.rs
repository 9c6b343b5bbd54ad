//! JSON merge patches (RFC 7386) for unstructured kinds

use serde_json::{Map, Value};

use crate::error::{KubeError, Result};

/// Fields a three-way merge patch must never touch
const PRECONDITION_KEYS: &[&str] = &["apiVersion", "kind"];
const PRECONDITION_METADATA_KEYS: &[&str] = &["name"];

/// Two-way merge patch turning `original` into `modified`
pub fn create_merge_patch(original: &Value, modified: &Value) -> Value {
    match (original, modified) {
        (Value::Object(old), Value::Object(new)) => Value::Object(diff_objects(old, new)),
        _ => modified.clone(),
    }
}

fn diff_objects(original: &Map<String, Value>, modified: &Map<String, Value>) -> Map<String, Value> {
    let mut patch = Map::new();

    for (key, new) in modified {
        match (original.get(key), new) {
            (Some(Value::Object(old)), Value::Object(new)) => {
                let nested = diff_objects(old, new);
                if !nested.is_empty() {
                    patch.insert(key.clone(), Value::Object(nested));
                }
            }
            (Some(old), new) if old == new => {}
            _ => {
                patch.insert(key.clone(), new.clone());
            }
        }
    }

    for key in original.keys() {
        if !modified.contains_key(key) {
            patch.insert(key.clone(), Value::Null);
        }
    }

    patch
}

/// Three-way merge patch with identity preconditions
///
/// Additions and changes come from the live object, removals from the last
/// applied one. The patch is rejected when it would change `apiVersion`,
/// `kind` or `metadata.name`.
pub fn create_three_way_merge_patch(
    original: &Value,
    modified: &Value,
    current: &Value,
) -> Result<Value> {
    let mut additions = create_merge_patch(current, modified);
    retain_nulls(&mut additions, false);

    let mut deletions = create_merge_patch(original, modified);
    retain_nulls(&mut deletions, true);

    json_patch::merge(&mut deletions, &additions);
    check_preconditions(&deletions)?;
    Ok(deletions)
}

/// Keep only null leaves (`keep == true`) or drop them (`keep == false`)
fn retain_nulls(patch: &mut Value, keep: bool) {
    let Value::Object(map) = patch else {
        return;
    };

    map.retain(|_, value| match value {
        Value::Null => keep,
        Value::Object(_) => {
            retain_nulls(value, keep);
            value.as_object().is_some_and(|m| !m.is_empty())
        }
        _ => !keep,
    });
}

fn check_preconditions(patch: &Value) -> Result<()> {
    for key in PRECONDITION_KEYS {
        if patch.get(key).is_some() {
            return Err(KubeError::PatchPrecondition {
                field: key.to_string(),
            });
        }
    }

    if let Some(metadata) = patch.get("metadata") {
        for key in PRECONDITION_METADATA_KEYS {
            if metadata.get(key).is_some() {
                return Err(KubeError::PatchPrecondition {
                    field: format!("metadata.{key}"),
                });
            }
        }
    }

    Ok(())
}

/// Apply a merge patch to a document
pub fn apply(document: &mut Value, patch: &Value) {
    json_patch::merge(document, patch);
}
