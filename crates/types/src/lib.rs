//! Shared type definitions for the runbook workspace.
//!
//! These types cross the boundary between the engine and its callers: node
//! identifiers, per-step reports, the final sequence outcome, lifecycle events
//! and the error taxonomy embedded in halted reports.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod errors;
pub mod sequence;

pub use errors::{BindingError, DispatchError, PartialFailureError, ResolutionError, StepError};
pub use sequence::{
    HaltCause, NodeResult, RunState, SequenceControl, SequenceEvent, SequenceOutcome, StepOutcome, StepReport, StepStatus,
};

/// Addressable node identifier (a minion id in Salt terms).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node identifier from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
