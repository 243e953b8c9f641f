//! Node patch rendering.
//!
//! A patch template is a minijinja template producing a YAML document. The
//! template is rendered against the JSON form of a
//! [`ResourceBasicDescription`](dpmock_api::ResourceBasicDescription), so it
//! sees `resourceName`, `capacity` and `deviceIDFormat.{prefix, delimiter,
//! ordinalStart}`. The YAML output is normalized to compact JSON.
//!
//! Besides the minijinja builtins the environment provides the helpers patch
//! templates commonly need:
//!
//! | helper | kind | example |
//! |---|---|---|
//! | `toJson` | filter | `{{ deviceIDFormat.prefix \| toJson }}` |
//! | `atoi` | filter | `{{ capacity \| atoi }}` |
//! | `until` | filter, function | `{{ until(4) }}` -> `[0, 1, 2, 3]` |
//! | `chunk` | filter | `{{ ids \| chunk(2) }}` |
//! | `split` | filter | `{{ "a,b" \| split(",") }}` |
//! | `append` | filter | `{{ ids \| append("x") }}` |

use minijinja::{Environment, Error, ErrorKind, Value};
use serde::Serialize;
use thiserror::Error;

/// Upper bound for `until`, keeps a bad capacity from exhausting memory.
const MAX_UNTIL: i64 = 100_000;

/// Template name. Carries no extension, so no auto-escaping applies.
const TEMPLATE_NAME: &str = "node-patch";

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to compile patch template: {0}")]
    Compile(#[source] Error),

    #[error("failed to execute patch template: {0}")]
    Execute(#[source] Error),

    #[error("failed to build template context: {0}")]
    Context(#[source] serde_json::Error),

    #[error("rendered patch is not valid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to encode patch as JSON: {0}")]
    Json(#[source] serde_json::Error),
}

/// Renders node patch templates into JSON patch documents.
pub struct PatchRenderer {
    env: Environment<'static>,
}

impl Default for PatchRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl PatchRenderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_filter("toJson", to_json);
        env.add_filter("atoi", atoi);
        env.add_filter("until", until);
        env.add_function("until", until);
        env.add_filter("chunk", chunk);
        env.add_filter("split", split);
        env.add_filter("append", append);
        Self { env }
    }

    /// Render `text` against `context` and return the patch as compact JSON.
    ///
    /// An empty template, or one rendering only whitespace, yields an empty
    /// string.
    pub fn render<C: Serialize>(&self, text: &str, context: &C) -> Result<String, RenderError> {
        if text.is_empty() {
            return Ok(String::new());
        }

        let json_context = serde_json::to_value(context).map_err(RenderError::Context)?;

        let template = self
            .env
            .template_from_named_str(TEMPLATE_NAME, text)
            .map_err(RenderError::Compile)?;
        let yaml = template
            .render(Value::from_serialize(&json_context))
            .map_err(RenderError::Execute)?;

        // A template may render nothing, e.g. when fully conditional
        if yaml.trim().is_empty() {
            return Ok(String::new());
        }
        yaml_to_json(&unescape_html(&yaml))
    }
}

/// Convert a YAML (or JSON) document to compact JSON.
pub fn yaml_to_json(text: &str) -> Result<String, RenderError> {
    let value: serde_json::Value = serde_yaml::from_str(text)?;
    serde_json::to_string(&value).map_err(RenderError::Json)
}

/// Undo HTML entity escaping of interpolated strings.
fn unescape_html(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    const ENTITIES: [(&str, &str); 8] = [
        ("&lt;", "<"),
        ("&gt;", ">"),
        ("&quot;", "\""),
        ("&#34;", "\""),
        ("&#39;", "'"),
        ("&#x27;", "'"),
        ("&#x2f;", "/"),
        ("&#x2F;", "/"),
    ];
    let mut out = text.to_string();
    for (entity, plain) in ENTITIES {
        out = out.replace(entity, plain);
    }
    // Last, so "&amp;lt;" decodes to "&lt;" and not "<"
    out.replace("&amp;", "&")
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidOperation, msg.into())
}

fn to_json(value: Value) -> Result<String, Error> {
    serde_json::to_string(&value).map_err(|e| invalid(format!("toJson: {}", e)))
}

fn atoi(value: Value) -> Result<i64, Error> {
    let text = value.to_string();
    text.trim()
        .parse()
        .map_err(|_| invalid(format!("atoi: {:?} is not an integer", text)))
}

fn until(count: i64) -> Result<Value, Error> {
    if count > MAX_UNTIL {
        return Err(invalid(format!("until: {} exceeds {}", count, MAX_UNTIL)));
    }
    Ok(Value::from((0..count.max(0)).collect::<Vec<i64>>()))
}

fn chunk(values: Vec<Value>, size: usize) -> Result<Value, Error> {
    if size == 0 {
        return Err(invalid("chunk: size must be positive"));
    }
    let chunks: Vec<Value> = values
        .chunks(size)
        .map(|c| Value::from(c.to_vec()))
        .collect();
    Ok(Value::from(chunks))
}

fn split(text: &str, separator: &str) -> Vec<String> {
    text.split(separator).map(str::to_string).collect()
}

fn append(mut values: Vec<Value>, item: Value) -> Vec<Value> {
    values.push(item);
    values
}
