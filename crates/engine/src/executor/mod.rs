//! Step execution: dispatches one prepared request and aggregates per-node results.
//!
//! - `invoker::ProcedureInvoker` abstracts how a procedure is actually run
//! - `invoker::EchoInvoker` answers every call locally for dry runs and tests
//! - [`StepExecutor`] fans a state call out over its target set and joins the
//!   results before returning, so each step is a barrier for the scheduler

use std::{collections::BTreeSet, sync::Arc};

use futures_util::{StreamExt, stream};
use indexmap::IndexMap;
use runbook_types::{DispatchError, NodeId, NodeResult, PartialFailureError, StepError, StepOutcome, StepStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::binder::BoundArgs;

pub mod invoker;
pub use invoker::{EchoInvoker, ProcedureError, ProcedureInvoker};

/// Per-step node fan-out used when no limit is configured.
pub const DEFAULT_MAX_CONCURRENCY: usize = 16;

/// Dispatch shape of a prepared step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DispatchCall {
    Runner,
    State { targets: BTreeSet<NodeId> },
}

/// Fully resolved and bound unit of work for one step.
///
/// Produced by the scheduler right before dispatch and discarded once the
/// step's outcome is known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    /// Name of the step this request was prepared for.
    pub step: String,
    pub procedure: String,
    pub call: DispatchCall,
    pub args: BoundArgs,
}

impl DispatchRequest {
    pub fn target_count(&self) -> usize {
        match &self.call {
            DispatchCall::Runner => 1,
            DispatchCall::State { targets } => targets.len(),
        }
    }
}

/// Executes dispatch requests through a [`ProcedureInvoker`].
#[derive(Clone)]
pub struct StepExecutor {
    invoker: Arc<dyn ProcedureInvoker>,
    control_node: NodeId,
    max_concurrency: usize,
}

impl StepExecutor {
    pub fn new(invoker: Arc<dyn ProcedureInvoker>, control_node: impl Into<NodeId>) -> Self {
        Self {
            invoker,
            control_node: control_node.into(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }

    /// Caps how many per-node calls of one state step are in flight at once.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn control_node(&self) -> &NodeId {
        &self.control_node
    }

    /// Runs `request` to completion and aggregates its results.
    ///
    /// Runner calls produce one result keyed by the control node. State calls
    /// produce one result per target in target order. Procedure failures are
    /// captured as results, never raised.
    pub async fn execute(&self, request: &DispatchRequest) -> StepOutcome {
        let results = match &request.call {
            DispatchCall::Runner => {
                debug!(step = %request.step, procedure = %request.procedure, "dispatching runner call");
                let result = self.invoker.invoke_runner(&request.procedure, &request.args).await;
                IndexMap::from([(self.control_node.clone(), node_result(result))])
            }
            DispatchCall::State { targets } => {
                debug!(
                    step = %request.step,
                    procedure = %request.procedure,
                    targets = targets.len(),
                    max_concurrency = self.max_concurrency,
                    "dispatching state call"
                );
                let invoker = &self.invoker;
                stream::iter(targets.iter())
                    .map(|node| async move {
                        let result = invoker.invoke_state(&request.procedure, node, &request.args).await;
                        (node.clone(), node_result(result))
                    })
                    .buffered(self.max_concurrency)
                    .collect::<IndexMap<_, _>>()
                    .await
            }
        };

        let outcome = StepOutcome::from_results(results);
        if !outcome.status.is_success() {
            warn!(
                step = %request.step,
                procedure = %request.procedure,
                status = %outcome.status,
                failed = outcome.failed_nodes().len(),
                "step did not succeed"
            );
        }
        outcome
    }
}

fn node_result(result: Result<Value, ProcedureError>) -> NodeResult {
    match result {
        Ok(output) => NodeResult::Succeeded { output },
        Err(ProcedureError::Failed(error)) => NodeResult::Failed { error },
        Err(ProcedureError::TimedOut(error)) => NodeResult::TimedOut { error },
    }
}

/// Builds the error describing a non-successful outcome; `None` on success.
pub fn outcome_error(procedure: &str, outcome: &StepOutcome) -> Option<StepError> {
    let message = || {
        outcome
            .results
            .iter()
            .filter_map(|(node, result)| result.error().map(|error| format!("{node}: {error}")))
            .collect::<Vec<_>>()
            .join("; ")
    };

    match outcome.status {
        StepStatus::Success => None,
        StepStatus::Partial => Some(
            PartialFailureError {
                procedure: procedure.to_string(),
                failed: outcome.failed_nodes(),
                succeeded: outcome.succeeded_nodes(),
            }
            .into(),
        ),
        StepStatus::Timeout => Some(
            DispatchError::TimedOut {
                procedure: procedure.to_string(),
                message: message(),
            }
            .into(),
        ),
        StepStatus::Failure => Some(
            DispatchError::Failed {
                procedure: procedure.to_string(),
                message: message(),
            }
            .into(),
        ),
    }
}
