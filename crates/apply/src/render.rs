//! Template rendering for stage patches.
//!
//! Templates are minijinja with strict undefined handling. The watched
//! object's top-level fields are the template context, so a status
//! template reads `{{ metadata.name }}` or `{{ spec.nodeName }}`.

use chrono::{SecondsFormat, Utc};
use fakelet_core::stage::PatchSpec;
use fakelet_core::PatchData;
use minijinja::{Environment, UndefinedBehavior};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("template: {0}")]
    Template(#[from] minijinja::Error),
    #[error("rendered template is not YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid patch root {0:?}")]
    Root(String),
}

/// Renders patch templates with a fixed function set.
///
/// Every renderer provides `Now()`; controllers register the rest through
/// [`Renderer::environment_mut`] before sharing it with workers.
pub struct Renderer {
    env: Environment<'static>,
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer").finish_non_exhaustive()
    }
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl Renderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);
        env.add_function("Now", now_rfc3339);
        Self { env }
    }

    pub fn environment_mut(&mut self) -> &mut Environment<'static> {
        &mut self.env
    }

    pub fn render_text(&self, template: &str, input: &Value) -> Result<String, RenderError> {
        Ok(self.env.render_str(template, minijinja::Value::from_serialize(input))?)
    }

    /// Render `template` against `input` and parse the result as YAML.
    /// Empty output is an empty map.
    pub fn render(&self, template: &str, input: &Value) -> Result<Value, RenderError> {
        let text = self.render_text(template, input)?;
        if text.trim().is_empty() {
            return Ok(Value::Object(Map::new()));
        }
        match serde_yaml::from_str::<Value>(&text)? {
            Value::Null => Ok(Value::Object(Map::new())),
            v => Ok(v),
        }
    }

    /// Render one configured patch into the body sent to the API server.
    pub fn render_patch(&self, spec: &PatchSpec, input: &Value) -> Result<PatchData, RenderError> {
        let doc = self.render(&spec.template, input)?;
        let body = match spec.root.as_deref() {
            Some(root) => wrap_under(root, doc)?,
            None => doc,
        };
        Ok(PatchData { kind: spec.kind, subresource: spec.subresource.clone(), body })
    }
}

fn wrap_under(root: &str, doc: Value) -> Result<Value, RenderError> {
    let root = root.trim().trim_start_matches('.');
    if root.is_empty() {
        return Ok(doc);
    }
    let parts: Vec<&str> = root.split('.').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(RenderError::Root(root.to_string()));
    }
    Ok(parts.into_iter().rev().fold(doc, |acc, key| {
        let mut m = Map::new();
        m.insert(key.to_string(), acc);
        Value::Object(m)
    }))
}
