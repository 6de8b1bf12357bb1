//! Set-based target resolution over a node inventory.

use std::{collections::BTreeSet, fs, path::Path};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use regex::Regex;
use runbook_types::{NodeId, ResolutionError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::expr::{TargetExpr, TargetType};

/// Per-node attributes (grains, roles, pillar data) used by predicates.
pub type NodeAttributes = serde_json::Map<String, Value>;

/// Known nodes and their attributes, in declaration order.
///
/// Serialized as a plain mapping of node id to attribute mapping:
///
/// ```yaml
/// storage-1:
///   roles: [storage]
///   os: SUSE
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Inventory {
    nodes: IndexMap<NodeId, NodeAttributes>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads an inventory from a YAML or JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).with_context(|| format!("Failed to read inventory file: {}", path.display()))?;
        serde_yaml::from_str(&content).with_context(|| format!("Failed to parse inventory file: {}", path.display()))
    }

    pub fn insert(&mut self, node: impl Into<NodeId>, attributes: NodeAttributes) {
        self.nodes.insert(node.into(), attributes);
    }

    /// Builder-style variant of [`Inventory::insert`] taking a JSON object.
    ///
    /// Non-object values are stored as a node without attributes.
    pub fn with_node(mut self, node: impl Into<NodeId>, attributes: Value) -> Self {
        let attributes = match attributes {
            Value::Object(map) => map,
            _ => NodeAttributes::new(),
        };
        self.insert(node, attributes);
        self
    }

    pub fn attributes(&self, node: &NodeId) -> Option<&NodeAttributes> {
        self.nodes.get(node)
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.nodes.contains_key(node)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Turns target expressions into concrete node sets.
#[derive(Debug, Clone)]
pub struct TargetResolver {
    inventory: Inventory,
    control_node: NodeId,
}

impl TargetResolver {
    pub fn new(inventory: Inventory, control_node: impl Into<NodeId>) -> Self {
        Self {
            inventory,
            control_node: control_node.into(),
        }
    }

    pub fn control_node(&self) -> &NodeId {
        &self.control_node
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    /// Resolves `expr` to an ordered node set, which may be empty.
    ///
    /// Evaluation is set-based: `and` intersects, `or` unions and `not`
    /// complements against the addressable universe (every inventory node plus
    /// the control node).
    pub fn resolve(&self, expr: &TargetExpr) -> Result<BTreeSet<NodeId>, ResolutionError> {
        let nodes = match expr {
            TargetExpr::Control => BTreeSet::from([self.control_node.clone()]),
            TargetExpr::NodeGlob(pattern) => {
                let matcher = GlobMatcher::new(pattern, expr)?;
                self.universe().into_iter().filter(|node| matcher.matches(node.as_str())).collect()
            }
            TargetExpr::NodeList(nodes) => {
                let universe = self.universe();
                nodes.iter().filter(|node| universe.contains(*node)).cloned().collect()
            }
            TargetExpr::Attribute { key, pattern } => {
                let matcher = GlobMatcher::new(pattern, expr)?;
                self.inventory
                    .nodes
                    .iter()
                    .filter(|(_, attributes)| lookup_attribute(attributes, key).is_some_and(|value| matcher.matches_value(value)))
                    .map(|(node, _)| node.clone())
                    .collect()
            }
            TargetExpr::Size { key, bound } => self
                .inventory
                .nodes
                .iter()
                .filter(|(_, attributes)| lookup_attribute(attributes, key).is_some_and(|value| bound.matches_value(value)))
                .map(|(node, _)| node.clone())
                .collect(),
            TargetExpr::And(left, right) => {
                let left = self.resolve(left)?;
                let right = self.resolve(right)?;
                left.intersection(&right).cloned().collect()
            }
            TargetExpr::Or(left, right) => {
                let mut left = self.resolve(left)?;
                left.extend(self.resolve(right)?);
                left
            }
            TargetExpr::Not(inner) => {
                let excluded = self.resolve(inner)?;
                self.universe().into_iter().filter(|node| !excluded.contains(node)).collect()
            }
        };
        Ok(nodes)
    }

    /// Parses `expression` as `target_type` and resolves it.
    pub fn resolve_expression(&self, expression: &str, target_type: TargetType) -> Result<BTreeSet<NodeId>, ResolutionError> {
        self.resolve(&TargetExpr::parse(expression, target_type)?)
    }

    /// Resolves `expr` and rejects an empty result unless `allow_empty` is set.
    pub fn resolve_required(&self, expr: &TargetExpr, allow_empty: bool) -> Result<BTreeSet<NodeId>, ResolutionError> {
        let nodes = self.resolve(expr)?;
        debug!(target_expr = %expr, matched = nodes.len(), allow_empty, "resolved target expression");
        if nodes.is_empty() && !allow_empty {
            return Err(ResolutionError::EmptyTarget {
                expression: expr.to_string(),
            });
        }
        Ok(nodes)
    }

    fn universe(&self) -> BTreeSet<NodeId> {
        let mut universe: BTreeSet<NodeId> = self.inventory.node_ids().cloned().collect();
        universe.insert(self.control_node.clone());
        universe
    }
}

fn lookup_attribute<'a>(attributes: &'a NodeAttributes, key: &str) -> Option<&'a Value> {
    let mut segments = key.split('.');
    let mut current = attributes.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Anchored glob (`*`, `?`) compiled to a regex.
struct GlobMatcher {
    pattern: String,
    regex: Regex,
}

impl GlobMatcher {
    fn new(pattern: &str, expr: &TargetExpr) -> Result<Self, ResolutionError> {
        let mut source = String::with_capacity(pattern.len() + 8);
        source.push('^');
        for character in pattern.chars() {
            match character {
                '*' => source.push_str(".*"),
                '?' => source.push('.'),
                other => source.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
            }
        }
        source.push('$');

        let regex = Regex::new(&source).map_err(|error| ResolutionError::InvalidExpression {
            expression: expr.to_string(),
            reason: error.to_string(),
        })?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    fn matches(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }

    /// Matches scalars directly and lists by any element; numbers compare numerically.
    fn matches_value(&self, value: &Value) -> bool {
        match value {
            Value::String(text) => self.matches(text),
            Value::Number(number) => match (self.pattern.parse::<f64>(), number.as_f64()) {
                (Ok(expected), Some(actual)) => expected == actual,
                _ => self.matches(&number.to_string()),
            },
            Value::Bool(flag) => self.pattern.eq_ignore_ascii_case(if *flag { "true" } else { "false" }),
            Value::Array(items) => items.iter().any(|item| !item.is_array() && self.matches_value(item)),
            Value::Object(_) | Value::Null => false,
        }
    }
}
