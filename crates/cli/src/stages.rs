use std::path::Path;

use anyhow::{Context, Result};
use fakelet_core::stage::{Stage, STAGE_KIND};
use serde::Deserialize;
use tracing::warn;

/// Parse every `Stage` document of a multi-document YAML stream.
pub fn parse_stages(text: &str) -> Result<Vec<Stage>> {
    let mut out = Vec::new();
    for (i, doc) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let value = serde_yaml::Value::deserialize(doc).with_context(|| format!("document {}", i))?;
        if value.is_null() {
            continue;
        }
        let stage: Stage = serde_yaml::from_value(value).with_context(|| format!("document {}", i))?;
        if let Some(kind) = stage.kind.as_deref().filter(|k| *k != STAGE_KIND) {
            warn!(document = i, kind, "skipping non-Stage document");
            continue;
        }
        out.push(stage);
    }
    Ok(out)
}

pub fn load_stages(paths: &[impl AsRef<Path>]) -> Result<Vec<Stage>> {
    let mut out = Vec::new();
    for p in paths {
        let p = p.as_ref();
        let text = std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        out.extend(parse_stages(&text).with_context(|| format!("parsing {}", p.display()))?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCS: &str = r#"
apiVersion: fakelet.dev/v1alpha1
kind: Stage
metadata:
  name: node-ready
spec:
  resourceRef: {kind: Node}
  next:
    statusTemplate: |
      phase: Running
---
---
kind: ConfigMap
metadata:
  name: other
spec:
  resourceRef: {kind: Pod}
---
metadata:
  name: widget-up
spec:
  resourceRef: {apiGroup: example.io/v1, kind: Widget}
  weight: 2
"#;

    #[test]
    fn multi_document_stream() {
        let stages = parse_stages(DOCS).unwrap();
        let names: Vec<_> = stages.iter().map(|s| s.name()).collect();
        assert_eq!(names, ["node-ready", "widget-up"]);
        assert!(stages[0].spec.resource_ref.is_core("Node"));
        assert_eq!(stages[1].spec.resource_ref.group_version(), ("example.io", "v1"));
    }

    #[test]
    fn malformed_document_names_its_index() {
        let err = parse_stages("metadata: {name: a}\nspec: {}\n").unwrap_err();
        assert!(format!("{:#}", err).contains("document 0"));
    }
}
