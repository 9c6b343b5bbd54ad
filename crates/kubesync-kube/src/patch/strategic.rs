//! Strategic merge patches for built-in kinds
//!
//! Lists of objects that Kubernetes merges by key (containers by `name`,
//! volume mounts by `mountPath`, ...) are diffed element by element instead of
//! being replaced wholesale. Removed elements are expressed with the
//! `$patch: delete` directive and the desired order of a merged list with a
//! `$setElementOrder/<field>` directive. Lists without a merge key are atomic.

use serde_json::{Map, Value};

const PATCH_DIRECTIVE: &str = "$patch";
const DELETE: &str = "delete";
const REPLACE: &str = "replace";
const ELEMENT_ORDER_PREFIX: &str = "$setElementOrder/";

/// Merge key of a list field, given the field that contains it
///
/// `parent` is the name of the enclosing field; for list elements it is the
/// name of the list holding the element.
pub fn merge_key(parent: Option<&str>, field: &str) -> Option<&'static str> {
    match field {
        "containers" | "initContainers" | "ephemeralContainers" | "volumes" | "env"
        | "imagePullSecrets" | "resourceClaims" => Some("name"),
        "volumeMounts" => Some("mountPath"),
        "volumeDevices" => Some("devicePath"),
        "ports" => match parent {
            Some("containers" | "initContainers" | "ephemeralContainers") => {
                Some("containerPort")
            }
            _ => Some("port"),
        },
        "hostAliases" => Some("ip"),
        "conditions" => Some("type"),
        "ownerReferences" => Some("uid"),
        "topologySpreadConstraints" => Some("topologyKey"),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct DiffOptions {
    /// Do not emit removals
    ignore_deletions: bool,
    /// Only emit removals
    ignore_changes_and_additions: bool,
}

/// Three-way strategic merge patch
///
/// Additions and changes are computed against the live object so fields
/// mutated by controllers are overwritten; removals are computed against the
/// last applied object so fields the client never set are left alone.
pub fn create_three_way_patch(original: &Value, modified: &Value, current: &Value) -> Value {
    let empty = Map::new();
    let modified = modified.as_object().unwrap_or(&empty);

    let delta = diff_maps(
        current.as_object().unwrap_or(&empty),
        modified,
        DiffOptions {
            ignore_deletions: true,
            ..Default::default()
        },
        None,
    );
    let deletions = diff_maps(
        original.as_object().unwrap_or(&empty),
        modified,
        DiffOptions {
            ignore_changes_and_additions: true,
            ..Default::default()
        },
        None,
    );

    let mut patch = Value::Object(deletions);
    merge_patches(&mut patch, &Value::Object(delta), None);
    patch
}

fn diff_maps(
    original: &Map<String, Value>,
    modified: &Map<String, Value>,
    opts: DiffOptions,
    parent: Option<&str>,
) -> Map<String, Value> {
    let mut patch = Map::new();

    for (key, new) in modified {
        match (original.get(key), new) {
            (None, _) => {
                if !opts.ignore_changes_and_additions {
                    patch.insert(key.clone(), new.clone());
                }
            }
            (Some(Value::Object(old)), Value::Object(new)) => {
                let nested = diff_maps(old, new, opts, Some(key.as_str()));
                if !nested.is_empty() {
                    patch.insert(key.clone(), Value::Object(nested));
                }
            }
            (Some(Value::Array(old)), Value::Array(new)) => {
                match merge_key(parent, key).filter(|mk| keyed_list(old, mk) && keyed_list(new, mk)) {
                    Some(mk) => {
                        let entries = diff_keyed_lists(old, new, mk, opts, key);
                        if !entries.is_empty() {
                            if !opts.ignore_changes_and_additions {
                                patch.insert(
                                    format!("{ELEMENT_ORDER_PREFIX}{key}"),
                                    Value::Array(element_order(new, mk)),
                                );
                            }
                            patch.insert(key.clone(), Value::Array(entries));
                        }
                    }
                    None => {
                        if old != new && !opts.ignore_changes_and_additions {
                            patch.insert(key.clone(), Value::Array(new.clone()));
                        }
                    }
                }
            }
            (Some(old), new) => {
                if old != new && !opts.ignore_changes_and_additions {
                    patch.insert(key.clone(), new.clone());
                }
            }
        }
    }

    if !opts.ignore_deletions {
        for key in original.keys() {
            if !modified.contains_key(key) {
                patch.insert(key.clone(), Value::Null);
            }
        }
    }

    patch
}

fn diff_keyed_lists(
    original: &[Value],
    modified: &[Value],
    mk: &str,
    opts: DiffOptions,
    field: &str,
) -> Vec<Value> {
    let mut entries = Vec::new();

    for new in modified {
        let Some(new_map) = new.as_object() else {
            continue;
        };
        match find_by_key(original, mk, &new_map[mk]) {
            None => {
                if !opts.ignore_changes_and_additions {
                    entries.push(new.clone());
                }
            }
            Some(old_map) => {
                let mut nested = diff_maps(old_map, new_map, opts, Some(field));
                if !nested.is_empty() {
                    nested.insert(mk.to_string(), new_map[mk].clone());
                    entries.push(Value::Object(nested));
                }
            }
        }
    }

    if !opts.ignore_deletions {
        for old in original {
            let Some(old_map) = old.as_object() else {
                continue;
            };
            if find_by_key(modified, mk, &old_map[mk]).is_none() {
                let mut removal = Map::new();
                removal.insert(mk.to_string(), old_map[mk].clone());
                removal.insert(PATCH_DIRECTIVE.to_string(), Value::String(DELETE.to_string()));
                entries.push(Value::Object(removal));
            }
        }
    }

    entries
}

/// True when every element is an object carrying the merge key
fn keyed_list(list: &[Value], mk: &str) -> bool {
    list.iter()
        .all(|v| v.as_object().is_some_and(|m| m.contains_key(mk)))
}

fn find_by_key<'a>(list: &'a [Value], mk: &str, key: &Value) -> Option<&'a Map<String, Value>> {
    list.iter()
        .filter_map(Value::as_object)
        .find(|m| m.get(mk) == Some(key))
}

fn element_order(list: &[Value], mk: &str) -> Vec<Value> {
    list.iter()
        .filter_map(Value::as_object)
        .map(|m| {
            let mut entry = Map::new();
            entry.insert(mk.to_string(), m[mk].clone());
            Value::Object(entry)
        })
        .collect()
}

/// Combine two patches into one, keeping directives and null removals
fn merge_patches(base: &mut Value, overlay: &Value, parent: Option<&str>) {
    if !base.is_object() || !overlay.is_object() {
        *base = overlay.clone();
        return;
    }
    let (Some(base_map), Some(overlay_map)) = (base.as_object_mut(), overlay.as_object()) else {
        return;
    };

    for (key, value) in overlay_map {
        match (base_map.get_mut(key), value) {
            (Some(existing), Value::Object(_)) if existing.is_object() => {
                merge_patches(existing, value, Some(key.as_str()));
            }
            (Some(Value::Array(existing)), Value::Array(entries)) => {
                match merge_key(parent, key) {
                    Some(mk) => merge_patch_lists(existing, entries, mk, key),
                    None => *existing = entries.clone(),
                }
            }
            _ => {
                base_map.insert(key.clone(), value.clone());
            }
        }
    }
}

fn merge_patch_lists(existing: &mut Vec<Value>, entries: &[Value], mk: &str, field: &str) {
    for entry in entries {
        let key = entry.get(mk);
        let slot = existing
            .iter_mut()
            .find(|e| key.is_some() && e.get(mk) == key);
        match slot {
            Some(slot) => merge_patches(slot, entry, Some(field)),
            None => existing.push(entry.clone()),
        }
    }
}

/// Apply a strategic merge patch to a document
pub fn apply(document: &mut Value, patch: &Value) {
    apply_value(document, patch, None);
}

fn apply_value(document: &mut Value, patch: &Value, parent: Option<&str>) {
    let Value::Object(patch_map) = patch else {
        *document = patch.clone();
        return;
    };

    if patch_map.get(PATCH_DIRECTIVE).and_then(Value::as_str) == Some(REPLACE) {
        *document = strip_directives(patch);
        return;
    }

    if !document.is_object() {
        *document = Value::Object(Map::new());
    }
    let Value::Object(doc_map) = document else {
        return;
    };

    let mut orders = Vec::new();
    for (key, value) in patch_map {
        if key == PATCH_DIRECTIVE {
            continue;
        }
        if let Some(field) = key.strip_prefix(ELEMENT_ORDER_PREFIX) {
            orders.push((field, value));
            continue;
        }

        match value {
            Value::Null => {
                doc_map.remove(key);
            }
            Value::Object(_) => {
                let slot = doc_map.entry(key.clone()).or_insert(Value::Null);
                apply_value(slot, value, Some(key.as_str()));
            }
            Value::Array(entries) => {
                let mk = merge_key(parent, key);
                match (mk, doc_map.get_mut(key)) {
                    (Some(mk), Some(Value::Array(existing))) => {
                        apply_keyed_list(existing, entries, mk, key);
                    }
                    _ => {
                        let kept = entries
                            .iter()
                            .filter(|e| !is_delete(e))
                            .map(strip_directives)
                            .collect();
                        doc_map.insert(key.clone(), Value::Array(kept));
                    }
                }
            }
            _ => {
                doc_map.insert(key.clone(), value.clone());
            }
        }
    }

    for (field, order) in orders {
        let (Some(mk), Some(Value::Array(list)), Value::Array(order)) =
            (merge_key(parent, field), doc_map.get_mut(field), order)
        else {
            continue;
        };
        reorder(list, order, mk);
    }
}

fn apply_keyed_list(existing: &mut Vec<Value>, entries: &[Value], mk: &str, field: &str) {
    for entry in entries {
        let key = entry.get(mk);
        let position = key.and_then(|k| existing.iter().position(|e| e.get(mk) == Some(k)));

        if is_delete(entry) {
            if let Some(i) = position {
                existing.remove(i);
            }
            continue;
        }

        match position {
            Some(i) => apply_value(&mut existing[i], entry, Some(field)),
            None => existing.push(strip_directives(entry)),
        }
    }
}

/// Order listed elements as requested; unlisted elements keep their place at the end
fn reorder(list: &mut Vec<Value>, order: &[Value], mk: &str) {
    let mut remaining = std::mem::take(list);
    for wanted in order {
        let Some(key) = wanted.get(mk) else {
            continue;
        };
        if let Some(i) = remaining.iter().position(|e| e.get(mk) == Some(key)) {
            list.push(remaining.remove(i));
        }
    }
    list.append(&mut remaining);
}

fn is_delete(entry: &Value) -> bool {
    entry.get(PATCH_DIRECTIVE).and_then(Value::as_str) == Some(DELETE)
}

fn strip_directives(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| *k != PATCH_DIRECTIVE && !k.starts_with(ELEMENT_ORDER_PREFIX))
                .map(|(k, v)| (k.clone(), strip_directives(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(strip_directives).collect()),
        other => other.clone(),
    }
}
