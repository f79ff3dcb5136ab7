//! Attribute substitution for templated check definitions.
//!
//! A definition may reference attributes with `{{name}}` (also written
//! `{{ name }}` or `{{.name}}`). Rendering never fails: when the template is
//! malformed or references an unknown attribute, the raw text is returned
//! untouched and the reason is reported alongside it.

use std::collections::HashMap;

use thiserror::Error;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Why a template could not be rendered
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("unterminated placeholder at byte {offset}")]
    Unterminated { offset: usize },

    #[error("invalid placeholder '{name}' at byte {offset}")]
    InvalidName { name: String, offset: usize },

    #[error("no attribute named '{0}'")]
    MissingAttribute(String),
}

/// Output of [`render`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    /// Text to hand to the check initializer
    pub text: String,

    /// Set when the raw text was used because substitution failed
    pub fallback: Option<RenderError>,
}

impl Rendered {
    pub fn used_fallback(&self) -> bool {
        self.fallback.is_some()
    }
}

/// Substitute attributes into a raw definition, falling back to the raw text
pub fn render(raw: &str, attributes: &HashMap<String, String>) -> Rendered {
    match substitute(raw, attributes) {
        Ok(text) => Rendered { text, fallback: None },
        Err(error) => Rendered { text: raw.to_string(), fallback: Some(error) },
    }
}

fn substitute(raw: &str, attributes: &HashMap<String, String>) -> Result<String, RenderError> {
    let mut rendered = String::with_capacity(raw.len());
    let mut rest = raw;
    let mut offset = 0;

    while let Some(start) = rest.find(OPEN) {
        rendered.push_str(&rest[..start]);

        let body = &rest[start + OPEN.len()..];
        let end = body
            .find(CLOSE)
            .ok_or(RenderError::Unterminated { offset: offset + start })?;

        let name = placeholder_name(&body[..end]).ok_or_else(|| RenderError::InvalidName {
            name: body[..end].to_string(),
            offset: offset + start,
        })?;

        let value = attributes
            .get(name)
            .ok_or_else(|| RenderError::MissingAttribute(name.to_string()))?;
        rendered.push_str(value);

        let consumed = start + OPEN.len() + end + CLOSE.len();
        offset += consumed;
        rest = &rest[consumed..];
    }

    rendered.push_str(rest);
    Ok(rendered)
}

fn placeholder_name(inner: &str) -> Option<&str> {
    let name = inner.trim();
    let name = name.strip_prefix('.').unwrap_or(name);

    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');

    valid.then_some(name)
}
