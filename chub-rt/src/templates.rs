//! Communication template rendering
//!
//! Templates use `{{ name }}` placeholders. Whitespace inside the braces is
//! ignored. An unterminated `{{` is copied through literally.

use chub_common::db::models::CommunicationTemplate;
use chub_common::{Error, Result};
use std::collections::HashMap;

/// Template parameters by placeholder name
pub type TemplateParams = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedTemplate {
    pub subject: Option<String>,
    pub body: String,
}

/// Substitute every placeholder in `text`
///
/// A placeholder without a matching parameter is an `InvalidInput` error.
pub fn render(text: &str, params: &TemplateParams) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];

        let Some(end) = after_open.find("}}") else {
            out.push_str(&rest[start..]);
            return Ok(out);
        };

        let key = after_open[..end].trim();
        let value = params
            .get(key)
            .ok_or_else(|| Error::InvalidInput(format!("Missing template parameter: {}", key)))?;
        out.push_str(value);
        rest = &after_open[end + 2..];
    }

    out.push_str(rest);
    Ok(out)
}

pub fn render_template(
    template: &CommunicationTemplate,
    params: &TemplateParams,
) -> Result<RenderedTemplate> {
    Ok(RenderedTemplate {
        subject: template
            .subject
            .as_deref()
            .map(|subject| render(subject, params))
            .transpose()?,
        body: render(&template.body, params)?,
    })
}

/// Build a parameter map from string pairs
pub fn params<const N: usize>(pairs: [(&str, String); N]) -> TemplateParams {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

/// First `max_chars` characters of `text`, with an ellipsis if truncated
pub fn preview(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}…", head)
    } else {
        head
    }
}
