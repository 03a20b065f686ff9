//! Placeholder rendering.
//!
//! Placeholders are `{{ path }}`, where `path` is a dot-separated lookup
//! into the payload object (`{{order.id}}`, `{{items.0.sku}}`). Strings
//! render verbatim, numbers and booleans via `to_string`, null as empty,
//! arrays and objects as JSON. A path missing from the payload is an error;
//! unlike plain string replacement nothing is left unexpanded.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{TemplateError, TemplateResult, TemplateVariant};

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Rendered content for one channel and locale
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub body: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<RenderedAttachment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedAttachment {
    pub filename: String,
    pub content_type: String,
    pub content: String,
}

impl RenderedContent {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            subject: None,
            body: body.into(),
            attachments: Vec::new(),
        }
    }

    pub(super) fn render(variant: &TemplateVariant, payload: &Value) -> TemplateResult<Self> {
        let subject = variant
            .subject
            .as_deref()
            .map(|s| render_text(s, payload))
            .transpose()?;
        let body = render_text(&variant.body, payload)?;
        let attachments = variant
            .attachments
            .iter()
            .map(|a| {
                Ok(RenderedAttachment {
                    filename: render_text(&a.filename, payload)?,
                    content_type: a.content_type.clone(),
                    content: render_text(&a.content, payload)?,
                })
            })
            .collect::<TemplateResult<Vec<_>>>()?;

        Ok(Self {
            subject,
            body,
            attachments,
        })
    }
}

/// Placeholder paths referenced by `text`, in order of appearance.
pub fn placeholders(text: &str) -> TemplateResult<Vec<&str>> {
    let mut paths = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find(OPEN) {
        let after_open = &rest[start + OPEN.len()..];
        let end = after_open
            .find(CLOSE)
            .ok_or_else(|| TemplateError::Malformed(format!("unclosed placeholder in {:?}", text)))?;
        let path = after_open[..end].trim();
        if path.is_empty() || path.split('.').any(str::is_empty) {
            return Err(TemplateError::Malformed(format!(
                "invalid placeholder {{{{{}}}}}",
                &after_open[..end]
            )));
        }
        paths.push(path);
        rest = &after_open[end + CLOSE.len()..];
    }

    Ok(paths)
}

/// Substitute every placeholder in `text` from `payload`.
pub fn render_text(text: &str, payload: &Value) -> TemplateResult<String> {
    let mut output = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find(OPEN) {
        output.push_str(&rest[..start]);
        let after_open = &rest[start + OPEN.len()..];
        let end = after_open
            .find(CLOSE)
            .ok_or_else(|| TemplateError::Malformed(format!("unclosed placeholder in {:?}", text)))?;
        let path = after_open[..end].trim();
        let value = lookup(payload, path)
            .ok_or_else(|| TemplateError::MissingPayloadField(path.to_string()))?;
        append_value(&mut output, value);
        rest = &after_open[end + CLOSE.len()..];
    }
    output.push_str(rest);

    Ok(output)
}

fn lookup<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }
    path.split('.').try_fold(payload, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn append_value(output: &mut String, value: &Value) {
    match value {
        Value::String(s) => output.push_str(s),
        Value::Number(n) => output.push_str(&n.to_string()),
        Value::Bool(b) => output.push_str(if *b { "true" } else { "false" }),
        Value::Null => {}
        // Arrays and objects render as JSON
        other => output.push_str(&other.to_string()),
    }
}
