//! Local application of merge and strategic-merge patches, used to decide
//! whether a rendered patch would change anything before sending it.

use fakelet_core::{PatchData, PatchKind};
use serde_json::{Map, Value};

/// RFC 7386 JSON merge patch. `null` removes a key.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(p) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(t) = target {
        for (k, v) in p {
            if v.is_null() {
                t.remove(k);
            } else {
                merge_patch(t.entry(k.as_str()).or_insert(Value::Null), v);
            }
        }
    }
}

/// Strategic merge without schema: maps merge like a merge patch; lists of
/// objects that all carry a `type` (or else `name`) key merge element-wise
/// on it; every other list is replaced.
pub fn strategic_merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(t), Value::Object(p)) => {
            for (k, v) in p {
                if v.is_null() {
                    t.remove(k);
                    continue;
                }
                match t.get_mut(k.as_str()) {
                    Some(existing) => strategic_merge(existing, v),
                    None => {
                        t.insert(k.clone(), strip_nulls(v));
                    }
                }
            }
        }
        (Value::Array(t), Value::Array(p)) => match merge_key(p) {
            Some(key) => merge_list(t, p, key),
            None => *t = p.clone(),
        },
        (t, p) => *t = strip_nulls(p),
    }
}

fn strip_nulls(v: &Value) -> Value {
    match v {
        Value::Object(m) => {
            Value::Object(m.iter().filter(|(_, v)| !v.is_null()).map(|(k, v)| (k.clone(), strip_nulls(v))).collect())
        }
        other => other.clone(),
    }
}

fn merge_key(items: &[Value]) -> Option<&'static str> {
    if items.is_empty() {
        return None;
    }
    ["type", "name"].into_iter().find(|key| items.iter().all(|i| i.get(*key).map_or(false, Value::is_string)))
}

fn merge_list(target: &mut Vec<Value>, patch: &[Value], key: &str) {
    for item in patch {
        let id = item.get(key);
        match target.iter_mut().find(|t| t.get(key) == id) {
            Some(existing) => strategic_merge(existing, item),
            None => target.push(strip_nulls(item)),
        }
    }
}

/// `current` with `patch` applied locally.
pub fn apply_local(current: &Value, patch: &PatchData) -> Value {
    let mut out = current.clone();
    match patch.kind {
        PatchKind::Merge => merge_patch(&mut out, &patch.body),
        PatchKind::StrategicMerge => strategic_merge(&mut out, &patch.body),
    }
    out
}

/// Whether sending `patch` would modify `current`.
pub fn would_change(current: &Value, patch: &PatchData) -> bool {
    apply_local(current, patch) != *current
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_patch_rfc7386_cases() {
        let cases = [
            (json!({"a": "b"}), json!({"a": "c"}), json!({"a": "c"})),
            (json!({"a": "b"}), json!({"b": "c"}), json!({"a": "b", "b": "c"})),
            (json!({"a": "b"}), json!({"a": null}), json!({})),
            (json!({"a": ["b"]}), json!({"a": "c"}), json!({"a": "c"})),
            (json!({"a": {"b": "c"}}), json!({"a": {"b": "d", "c": null}}), json!({"a": {"b": "d"}})),
            (json!({"a": [{"b": "c"}]}), json!({"a": [1]}), json!({"a": [1]})),
            (json!(["a", "b"]), json!({"a": "b"}), json!({"a": "b"})),
            (json!({"e": null}), json!({"a": 1}), json!({"e": null, "a": 1})),
            (json!({}), json!({"a": {"bb": {"ccc": null}}}), json!({"a": {"bb": {}}})),
        ];
        for (target, patch, want) in cases {
            let mut t = target.clone();
            merge_patch(&mut t, &patch);
            assert_eq!(t, want, "{} + {}", target, patch);
        }
    }

    #[test]
    fn strategic_merge_keys_conditions_by_type() {
        let mut node = json!({"status": {"conditions": [
            {"type": "Ready", "status": "False", "reason": "Init"},
            {"type": "MemoryPressure", "status": "False"}
        ]}});
        let patch = json!({"status": {"conditions": [
            {"type": "Ready", "status": "True"},
            {"type": "PIDPressure", "status": "False"}
        ]}});
        strategic_merge(&mut node, &patch);
        assert_eq!(
            node["status"]["conditions"],
            json!([
                {"type": "Ready", "status": "True", "reason": "Init"},
                {"type": "MemoryPressure", "status": "False"},
                {"type": "PIDPressure", "status": "False"}
            ])
        );
    }

    #[test]
    fn strategic_merge_by_name_and_replace_scalars() {
        let mut pod = json!({"status": {
            "containerStatuses": [{"name": "app", "ready": false}],
            "podIPs": [{"ip": "10.0.0.1"}],
            "hostIP": "1.1.1.1"
        }});
        let patch = json!({"status": {
            "containerStatuses": [{"name": "app", "ready": true}],
            "podIPs": [{"ip": "10.0.0.2"}],
            "hostIP": null
        }});
        strategic_merge(&mut pod, &patch);
        assert_eq!(pod["status"]["containerStatuses"], json!([{"name": "app", "ready": true}]));
        assert_eq!(pod["status"]["podIPs"], json!([{"ip": "10.0.0.2"}]));
        assert!(pod["status"].get("hostIP").is_none());
    }

    #[test]
    fn no_op_detection() {
        let current = json!({"metadata": {"name": "x"}, "status": {"phase": "Running"}});
        let same = PatchData::merge(json!({"status": {"phase": "Running"}}));
        let diff = PatchData::merge(json!({"status": {"phase": "Succeeded"}}));
        let remove_absent = PatchData::merge(json!({"status": {"reason": null}}));
        assert!(!would_change(&current, &same));
        assert!(would_change(&current, &diff));
        assert!(!would_change(&current, &remove_absent));
        let strategic = PatchData { kind: PatchKind::StrategicMerge, ..same };
        assert!(!would_change(&current, &strategic));
    }
}
