//! # Value Template
//!
//! Optional post-extraction transform applied before change detection.
//!
//! A template is plain text with `{{ expr }}` placeholders. `expr` is either
//! `value` (the raw extracted string) or `value_json.<path>` (the raw string
//! parsed as JSON and walked by dot-separated object keys or array indices),
//! followed by zero or more `| trim`, `| upper`, `| lower` filters.
//!
//! Rendering errors reduce to an absent value in the coordinator, exactly like
//! extraction misses.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use thiserror::Error;

static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();

fn placeholder() -> &'static Regex {
    PLACEHOLDER.get_or_init(|| Regex::new(r"\{\{(.*?)\}\}").expect("placeholder pattern is valid"))
}

/// Template compile and render failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    /// A `{{` without its closing `}}`.
    #[error("unterminated placeholder in template '{0}'")]
    Unterminated(String),
    /// An empty `{{ }}`.
    #[error("empty placeholder in template '{0}'")]
    EmptyExpression(String),
    /// Anything other than `value` / `value_json`.
    #[error("unknown variable '{0}'")]
    UnknownVariable(String),
    /// Filter name not supported.
    #[error("unknown filter '{0}'")]
    UnknownFilter(String),
    /// `value_json` used but the value does not parse as JSON.
    #[error("value is not valid JSON")]
    NotJson,
    /// `value_json` path does not resolve.
    #[error("path '{0}' not found in value_json")]
    PathNotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Filter {
    Trim,
    Upper,
    Lower,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Value(Vec<Filter>),
    ValueJson(Vec<String>, Vec<Filter>),
}

/// # Value Template
///
/// A compiled `value_template`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl ValueTemplate {
    /// Compiles `source`, rejecting malformed placeholders, unknown variables and filters.
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut last = 0;

        for caps in placeholder().captures_iter(source) {
            let Some(whole) = caps.get(0) else { continue };
            push_literal(&mut segments, &source[last..whole.start()], source)?;
            segments.push(parse_expression(&caps[1], source)?);
            last = whole.end();
        }
        push_literal(&mut segments, &source[last..], source)?;

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// The template text as configured.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Renders the template for an extracted `value`.
    pub fn render(&self, value: &str) -> Result<String, TemplateError> {
        let mut json: Option<Value> = None;
        let mut out = String::with_capacity(value.len() + self.source.len());

        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Value(filters) => out.push_str(&apply(value.to_string(), filters)),
                Segment::ValueJson(path, filters) => {
                    if json.is_none() {
                        json = Some(serde_json::from_str(value).map_err(|_| TemplateError::NotJson)?);
                    }
                    let Some(root) = json.as_ref() else {
                        return Err(TemplateError::NotJson);
                    };
                    let found = lookup(root, path)?;
                    out.push_str(&apply(found, filters));
                }
            }
        }

        Ok(out)
    }
}

fn push_literal(segments: &mut Vec<Segment>, text: &str, source: &str) -> Result<(), TemplateError> {
    if text.contains("{{") {
        return Err(TemplateError::Unterminated(source.to_string()));
    }
    if !text.is_empty() {
        segments.push(Segment::Literal(text.to_string()));
    }
    Ok(())
}

fn parse_expression(expr: &str, source: &str) -> Result<Segment, TemplateError> {
    let mut parts = expr.split('|').map(str::trim);
    let variable = parts.next().unwrap_or_default();
    if variable.is_empty() {
        return Err(TemplateError::EmptyExpression(source.to_string()));
    }

    let filters = parts
        .map(|name| match name {
            "trim" => Ok(Filter::Trim),
            "upper" => Ok(Filter::Upper),
            "lower" => Ok(Filter::Lower),
            other => Err(TemplateError::UnknownFilter(other.to_string())),
        })
        .collect::<Result<Vec<_>, _>>()?;

    match variable.split_once('.') {
        None if variable == "value" => Ok(Segment::Value(filters)),
        Some(("value_json", path)) if !path.is_empty() => Ok(Segment::ValueJson(
            path.split('.').map(str::to_owned).collect(),
            filters,
        )),
        _ => Err(TemplateError::UnknownVariable(variable.to_string())),
    }
}

fn lookup(root: &Value, path: &[String]) -> Result<String, TemplateError> {
    let mut node = root;
    for key in path {
        let next = match node {
            Value::Object(map) => map.get(key),
            Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        node = next.ok_or_else(|| TemplateError::PathNotFound(path.join(".")))?;
    }

    Ok(match node {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

fn apply(mut text: String, filters: &[Filter]) -> String {
    for filter in filters {
        text = match filter {
            Filter::Trim => text.trim().to_string(),
            Filter::Upper => text.to_uppercase(),
            Filter::Lower => text.to_lowercase(),
        };
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_value_with_filters_and_literals() {
        let t = ValueTemplate::parse("{{ value | trim | upper }} EUR").unwrap();
        assert_eq!(t.render("  12,50 ").unwrap(), "12,50 EUR");
    }

    #[test]
    fn renders_json_paths() {
        let t = ValueTemplate::parse("{{ value_json.items.1.name }} ({{ value_json.count }})").unwrap();
        let raw = r#"{"count": 2, "items": [{"name": "a"}, {"name": "b"}]}"#;
        assert_eq!(t.render(raw).unwrap(), "b (2)");
    }

    #[test]
    fn render_errors_for_non_json_or_missing_paths() {
        let t = ValueTemplate::parse("{{ value_json.price }}").unwrap();
        assert_eq!(t.render("not json"), Err(TemplateError::NotJson));
        assert_eq!(
            t.render(r#"{"cost": 1}"#),
            Err(TemplateError::PathNotFound("price".into()))
        );
    }

    #[test]
    fn rejects_malformed_templates() {
        assert!(matches!(ValueTemplate::parse("{{ value "), Err(TemplateError::Unterminated(_))));
        assert!(matches!(ValueTemplate::parse("{{ }}"), Err(TemplateError::EmptyExpression(_))));
        assert_eq!(
            ValueTemplate::parse("{{ states }}"),
            Err(TemplateError::UnknownVariable("states".into()))
        );
        assert_eq!(
            ValueTemplate::parse("{{ value | reverse }}"),
            Err(TemplateError::UnknownFilter("reverse".into()))
        );
    }

    #[test]
    fn template_without_placeholders_is_constant() {
        let t = ValueTemplate::parse("fixed").unwrap();
        assert_eq!(t.render("anything").unwrap(), "fixed");
        assert_eq!(t.source(), "fixed");
    }
}
