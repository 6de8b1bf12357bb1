//! Parameter binding: turns a step's declared arguments into concrete values.

use indexmap::IndexMap;
use runbook_types::BindingError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{model::Step, templates::{TemplateContext, interpolate_value}};

/// Concrete call arguments with every placeholder substituted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundArgs {
    #[serde(default)]
    pub positional: Vec<Value>,
    #[serde(default)]
    pub keyword: IndexMap<String, Value>,
}

impl BoundArgs {
    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyword.is_empty()
    }

    /// JSON payload handed to procedure backends: `{"args": [...], "kwargs": {...}}`.
    pub fn to_payload(&self) -> Value {
        let keyword: serde_json::Map<String, Value> = self.keyword.iter().map(|(key, value)| (key.clone(), value.clone())).collect();
        serde_json::json!({
            "args": self.positional,
            "kwargs": keyword,
        })
    }
}

/// Binds positional and keyword arguments against `context`.
///
/// Binding is pure: the same inputs always produce the same output and the
/// context is never mutated. Keyword order follows the declaration, and a
/// repeated key keeps its last value.
pub fn bind<'a>(
    positional: &[Value],
    keyword: impl IntoIterator<Item = (&'a String, &'a Value)>,
    context: &TemplateContext,
) -> Result<BoundArgs, BindingError> {
    let positional = positional
        .iter()
        .enumerate()
        .map(|(index, value)| interpolate_value(value, context, &format!("args[{index}]")))
        .collect::<Result<Vec<_>, _>>()?;

    let mut bound_keywords = IndexMap::new();
    for (key, value) in keyword {
        let bound = interpolate_value(value, context, &format!("kwargs.{key}"))?;
        bound_keywords.insert(key.clone(), bound);
    }

    Ok(BoundArgs {
        positional,
        keyword: bound_keywords,
    })
}

/// Binds the arguments declared on `step`.
pub fn bind_step(step: &Step, context: &TemplateContext) -> Result<BoundArgs, BindingError> {
    bind(&step.args, &step.kwargs, context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kwargs(entries: &[(&str, Value)]) -> Vec<(String, Value)> {
        entries.iter().map(|(key, value)| (key.to_string(), value.clone())).collect()
    }

    #[test]
    fn literal_arguments_bind_unchanged() {
        let keyword = kwargs(&[("delay", json!(1)), ("timeout", json!(1))]);
        let bound = bind(&[json!(0)], keyword.iter().map(|(k, v)| (k, v)), &TemplateContext::default()).expect("bind");

        assert_eq!(bound.positional, vec![json!(0)]);
        assert_eq!(bound.keyword.get("delay"), Some(&json!(1)));
        assert_eq!(bound.keyword.get("timeout"), Some(&json!(1)));
        assert_eq!(bound.to_payload(), json!({"args": [0], "kwargs": {"delay": 1, "timeout": 1}}));
    }

    #[test]
    fn keyword_only_binding_leaves_positional_empty() {
        let keyword = kwargs(&[("delay", json!(1)), ("timeout", json!(1))]);
        let bound = bind(&[], keyword.iter().map(|(k, v)| (k, v)), &TemplateContext::default()).expect("bind");
        assert!(bound.positional.is_empty());
        assert_eq!(serde_json::to_value(&bound.keyword).expect("serialize"), json!({"delay": 1, "timeout": 1}));
    }

    #[test]
    fn keyword_order_does_not_change_binding() {
        let forward = kwargs(&[("delay", json!(1)), ("timeout", json!(2))]);
        let reverse = kwargs(&[("timeout", json!(2)), ("delay", json!(1))]);
        let context = TemplateContext::default();

        let forward = bind(&[], forward.iter().map(|(k, v)| (k, v)), &context).expect("bind forward");
        let reverse = bind(&[], reverse.iter().map(|(k, v)| (k, v)), &context).expect("bind reverse");
        let as_map = |args: &BoundArgs| args.keyword.iter().map(|(k, v)| (k.clone(), v.clone())).collect::<std::collections::BTreeMap<_, _>>();
        assert_eq!(as_map(&forward), as_map(&reverse));
    }

    #[test]
    fn repeated_keyword_keeps_last_value() {
        let keyword = kwargs(&[("delay", json!(1)), ("delay", json!(5))]);
        let bound = bind(&[], keyword.iter().map(|(k, v)| (k, v)), &TemplateContext::default()).expect("bind");
        assert_eq!(bound.keyword.len(), 1);
        assert_eq!(bound.keyword["delay"], json!(5));
    }

    #[test]
    fn placeholders_resolve_from_context_and_binding_is_repeatable() {
        let context = TemplateContext::default().with("osd", json!(7)).with("label", json!("delay"));
        let keyword = kwargs(&[("id", json!("{{ osd }}")), ("note", json!("run {{ label }}"))]);

        let first = bind(&[json!("{{ label }}")], keyword.iter().map(|(k, v)| (k, v)), &context).expect("bind");
        let second = bind(&[json!("{{ label }}")], keyword.iter().map(|(k, v)| (k, v)), &context).expect("bind again");
        assert_eq!(first, second);
        assert_eq!(first.positional, vec![json!("delay")]);
        assert_eq!(first.keyword["id"], json!(7));
        assert_eq!(first.keyword["note"], json!("run delay"));
    }

    #[test]
    fn undefined_variable_is_a_binding_error() {
        let keyword = kwargs(&[("id", json!("{{ missing }}"))]);
        let error = bind(&[], keyword.iter().map(|(k, v)| (k, v)), &TemplateContext::default()).expect_err("undefined");
        assert_eq!(
            error,
            BindingError::UndefinedVariable {
                name: "missing".into(),
                location: "kwargs.id".into(),
            }
        );
    }
}
