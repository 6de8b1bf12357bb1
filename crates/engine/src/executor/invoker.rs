//! Procedure backends: the invocation trait and a side-effect-free echo implementation.

use std::collections::HashSet;

use async_trait::async_trait;
use runbook_types::NodeId;
use serde_json::{Value, json};
use thiserror::Error;

use crate::binder::BoundArgs;

/// Failure reported by a procedure backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProcedureError {
    #[error("{0}")]
    Failed(String),
    /// The procedure's own wait budget (for example its `timeout` keyword) ran out.
    #[error("{0}")]
    TimedOut(String),
}

/// Invoke a named procedure.
///
/// Backends decide how a procedure is actually executed (remote job queue,
/// local process, test double). Retries and waits belong to the procedure and
/// are configured through its arguments; the engine never retries a call.
#[async_trait]
pub trait ProcedureInvoker: Send + Sync {
    /// Execute an untargeted procedure once on the control node.
    async fn invoke_runner(&self, procedure: &str, args: &BoundArgs) -> Result<Value, ProcedureError>;

    /// Execute a procedure against one resolved node.
    async fn invoke_state(&self, procedure: &str, node: &NodeId, args: &BoundArgs) -> Result<Value, ProcedureError>;
}

/// Backend that echoes each call back as its output, without side effects.
///
/// Procedures listed via [`EchoInvoker::failing`] report failure instead, and
/// those listed via [`EchoInvoker::timing_out`] report a timeout. Useful for
/// dry runs and tests.
#[derive(Debug, Clone, Default)]
pub struct EchoInvoker {
    failing: HashSet<String>,
    timing_out: HashSet<String>,
}

impl EchoInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, procedures: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.failing.extend(procedures.into_iter().map(Into::into));
        self
    }

    pub fn timing_out(mut self, procedures: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.timing_out.extend(procedures.into_iter().map(Into::into));
        self
    }

    fn respond(&self, procedure: &str, node: Option<&NodeId>, args: &BoundArgs) -> Result<Value, ProcedureError> {
        let location = node.map(|node| format!(" on {node}")).unwrap_or_default();
        if self.timing_out.contains(procedure) {
            return Err(ProcedureError::TimedOut(format!("{procedure}{location} did not finish in time")));
        }
        if self.failing.contains(procedure) {
            return Err(ProcedureError::Failed(format!("{procedure}{location} reported failure")));
        }

        let mut output = json!({ "procedure": procedure });
        if let Some(node) = node {
            output["node"] = Value::String(node.to_string());
        }
        if !args.is_empty() {
            output["args"] = args.to_payload();
        }
        Ok(output)
    }
}

#[async_trait]
impl ProcedureInvoker for EchoInvoker {
    async fn invoke_runner(&self, procedure: &str, args: &BoundArgs) -> Result<Value, ProcedureError> {
        self.respond(procedure, None, args)
    }

    async fn invoke_state(&self, procedure: &str, node: &NodeId, args: &BoundArgs) -> Result<Value, ProcedureError> {
        self.respond(procedure, Some(node), args)
    }
}
