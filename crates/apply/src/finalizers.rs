use fakelet_core::stage::FinalizersSpec;
use fakelet_core::PatchData;
use serde_json::json;

/// Finalizer list after applying `spec` to `current`, or `None` when unchanged.
pub fn edit_finalizers(current: &[String], spec: &FinalizersSpec) -> Option<Vec<String>> {
    let mut out: Vec<String> = if spec.empty { Vec::new() } else { current.to_vec() };
    if !spec.remove.is_empty() {
        out.retain(|f| !spec.remove.iter().any(|r| &r.value == f));
    }
    for add in &spec.add {
        if !out.contains(&add.value) {
            out.push(add.value.clone());
        }
    }
    (out != current).then_some(out)
}

/// Merge patch rewriting `metadata.finalizers`, when the directive changes anything.
pub fn finalizers_patch(current: &[String], spec: &FinalizersSpec) -> Option<PatchData> {
    edit_finalizers(current, spec).map(|list| PatchData::merge(json!({"metadata": {"finalizers": list}})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fakelet_core::stage::FinalizerItem;

    fn items(v: &[&str]) -> Vec<FinalizerItem> {
        v.iter().map(|s| FinalizerItem { value: s.to_string() }).collect()
    }

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn add_remove_empty() {
        let cur = strings(&["a", "b"]);
        let add = FinalizersSpec { add: items(&["c", "a"]), ..Default::default() };
        assert_eq!(edit_finalizers(&cur, &add), Some(strings(&["a", "b", "c"])));
        let remove = FinalizersSpec { remove: items(&["a"]), ..Default::default() };
        assert_eq!(edit_finalizers(&cur, &remove), Some(strings(&["b"])));
        let empty = FinalizersSpec { empty: true, ..Default::default() };
        assert_eq!(edit_finalizers(&cur, &empty), Some(vec![]));
        let replace = FinalizersSpec { empty: true, add: items(&["z"]), ..Default::default() };
        assert_eq!(edit_finalizers(&cur, &replace), Some(strings(&["z"])));
    }

    #[test]
    fn unchanged_lists_produce_nothing() {
        let cur = strings(&["a"]);
        assert_eq!(edit_finalizers(&cur, &FinalizersSpec { add: items(&["a"]), ..Default::default() }), None);
        assert_eq!(edit_finalizers(&cur, &FinalizersSpec { remove: items(&["x"]), ..Default::default() }), None);
        assert_eq!(edit_finalizers(&[], &FinalizersSpec { empty: true, ..Default::default() }), None);
        assert!(finalizers_patch(&cur, &FinalizersSpec::default()).is_none());
    }

    #[test]
    fn patch_body() {
        let p = finalizers_patch(&[], &FinalizersSpec { add: items(&["fakelet.dev/hold"]), ..Default::default() }).unwrap();
        assert_eq!(p.body, json!({"metadata": {"finalizers": ["fakelet.dev/hold"]}}));
        assert!(p.subresource.is_none());
    }
}
