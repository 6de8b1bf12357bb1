//! Error taxonomy for sequence execution.
//!
//! Resolution and binding errors are structural: the step they belong to is
//! never dispatched. Dispatch and partial failures are runtime outcomes of a
//! step that was attempted. All of them halt a running sequence.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::NodeId;

/// Target expression could not be parsed or resolved to a usable node set.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolutionError {
    #[error("invalid target expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },

    #[error("target expression '{expression}' matched no nodes")]
    EmptyTarget { expression: String },
}

/// Arguments could not be bound against the template context.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BindingError {
    #[error("undefined template variable '{name}' at {location}")]
    UndefinedVariable { name: String, location: String },

    #[error("malformed template at {location}: {reason}")]
    MalformedPlaceholder { location: String, reason: String },
}

/// The invoked procedure reported failure for an untargeted call or for every target.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DispatchError {
    #[error("procedure '{procedure}' failed: {message}")]
    Failed { procedure: String, message: String },

    #[error("procedure '{procedure}' timed out: {message}")]
    TimedOut { procedure: String, message: String },
}

/// Some, but not all, targets of a state call failed.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error(
    "procedure '{procedure}' failed on {} of {} targets: {}",
    .failed.len(),
    total_targets(.failed, .succeeded),
    join_nodes(.failed)
)]
pub struct PartialFailureError {
    pub procedure: String,
    pub failed: Vec<NodeId>,
    pub succeeded: Vec<NodeId>,
}

/// Any reason a single step stopped the sequence.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "category", content = "detail", rename_all = "snake_case")]
pub enum StepError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Binding(#[from] BindingError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    PartialFailure(#[from] PartialFailureError),
}

impl StepError {
    /// Structural errors prevent the step from being dispatched at all.
    pub fn is_structural(&self) -> bool {
        matches!(self, StepError::Resolution(_) | StepError::Binding(_))
    }
}

fn total_targets(failed: &[NodeId], succeeded: &[NodeId]) -> usize {
    failed.len() + succeeded.len()
}

fn join_nodes(nodes: &[NodeId]) -> String {
    nodes.iter().map(NodeId::as_str).collect::<Vec<_>>().join(", ")
}
