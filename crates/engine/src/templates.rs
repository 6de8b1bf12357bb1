//! Template placeholder parsing and substitution.
//!
//! Sequence documents reference explicit inputs with `{{ name }}` placeholders
//! (dotted paths such as `{{ cluster.master }}` walk nested inputs). The same
//! context renders step names and target strings once before scheduling and is
//! handed to the binder for argument values.

use once_cell::sync::Lazy;
use regex::Regex;
use runbook_types::BindingError;
use serde_json::Value;

static VARIABLE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*(\.[A-Za-z0-9_-]+)*$").expect("template variable regex should compile")
});

/// Explicit input map that placeholders are resolved against.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TemplateContext {
    values: serde_json::Map<String, Value>,
}

impl TemplateContext {
    pub fn new(values: serde_json::Map<String, Value>) -> Self {
        Self { values }
    }

    /// Adds or replaces a top-level input.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    /// Builder-style variant of [`TemplateContext::insert`].
    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.insert(name, value);
        self
    }

    /// Looks up a dotted path; numeric segments index into arrays.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut current = self.values.get(segments.next()?)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// One piece of a parsed template string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment<'a> {
    Literal(&'a str),
    Placeholder(&'a str),
}

/// Splits `text` into literal and placeholder segments.
///
/// Fails on an unterminated `{{`, an empty placeholder, or a name that is not a
/// dotted identifier path.
pub fn parse_segments<'a>(text: &'a str, location: &str) -> Result<Vec<Segment<'a>>, BindingError> {
    let mut segments = Vec::new();
    let mut remainder = text;

    while let Some(start) = remainder.find("{{") {
        if start > 0 {
            segments.push(Segment::Literal(&remainder[..start]));
        }
        let after_start = &remainder[start + 2..];
        let Some(end) = after_start.find("}}") else {
            return Err(BindingError::MalformedPlaceholder {
                location: location.to_string(),
                reason: format!("unterminated placeholder in '{text}'"),
            });
        };
        let name = after_start[..end].trim();
        if name.is_empty() {
            return Err(BindingError::MalformedPlaceholder {
                location: location.to_string(),
                reason: "empty placeholder".to_string(),
            });
        }
        if !VARIABLE_NAME.is_match(name) {
            return Err(BindingError::MalformedPlaceholder {
                location: location.to_string(),
                reason: format!("'{name}' is not a variable name"),
            });
        }
        segments.push(Segment::Placeholder(name));
        remainder = &after_start[end + 2..];
    }

    if !remainder.is_empty() {
        segments.push(Segment::Literal(remainder));
    }
    Ok(segments)
}

/// Returns true when `text` contains at least one `{{`.
pub fn has_placeholders(text: &str) -> bool {
    text.contains("{{")
}

/// Renders a template string to text, stringifying non-string values.
pub fn render_string(text: &str, context: &TemplateContext, location: &str) -> Result<String, BindingError> {
    if !has_placeholders(text) {
        return Ok(text.to_string());
    }

    let mut rendered = String::with_capacity(text.len());
    for segment in parse_segments(text, location)? {
        match segment {
            Segment::Literal(literal) => rendered.push_str(literal),
            Segment::Placeholder(name) => rendered.push_str(&stringify(lookup_required(context, name, location)?)),
        }
    }
    Ok(rendered)
}

/// Recursively substitutes placeholders in a JSON value.
///
/// A string consisting of exactly one placeholder takes the context value
/// verbatim so numbers and structures keep their type.
pub fn interpolate_value(value: &Value, context: &TemplateContext, location: &str) -> Result<Value, BindingError> {
    match value {
        Value::String(text) => interpolate_text(text, context, location),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(index, item)| interpolate_value(item, context, &format!("{location}[{index}]")))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut interpolated = serde_json::Map::new();
            for (key, nested) in map {
                interpolated.insert(key.clone(), interpolate_value(nested, context, &format!("{location}.{key}"))?);
            }
            Ok(Value::Object(interpolated))
        }
        _ => Ok(value.clone()),
    }
}

fn interpolate_text(text: &str, context: &TemplateContext, location: &str) -> Result<Value, BindingError> {
    if !has_placeholders(text) {
        return Ok(Value::String(text.to_string()));
    }
    let segments = parse_segments(text, location)?;
    if let [Segment::Placeholder(name)] = segments.as_slice() {
        return lookup_required(context, name, location).cloned();
    }
    render_string(text, context, location).map(Value::String)
}

fn lookup_required<'c>(context: &'c TemplateContext, name: &str, location: &str) -> Result<&'c Value, BindingError> {
    context.lookup(name).ok_or_else(|| BindingError::UndefinedVariable {
        name: name.to_string(),
        location: location.to_string(),
    })
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
