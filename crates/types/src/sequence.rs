//! Step outcomes, sequence reports and run lifecycle events.

use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{NodeId, StepError};

/// Aggregate status of one dispatched step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Every target (or the single runner call) succeeded.
    Success,
    /// Nothing succeeded, or the step could not be dispatched.
    Failure,
    /// Some targets succeeded and some did not.
    Partial,
    /// Nothing succeeded and every failure was a procedure timeout.
    Timeout,
}

impl StepStatus {
    /// Only `Success` lets the scheduler advance.
    pub fn is_success(self) -> bool {
        matches!(self, StepStatus::Success)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StepStatus::Success => "SUCCESS",
            StepStatus::Failure => "FAILURE",
            StepStatus::Partial => "PARTIAL",
            StepStatus::Timeout => "TIMEOUT",
        };
        f.write_str(label)
    }
}

/// Result of a procedure call against one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NodeResult {
    Succeeded { output: JsonValue },
    Failed { error: String },
    TimedOut { error: String },
}

impl NodeResult {
    pub fn is_success(&self) -> bool {
        matches!(self, NodeResult::Succeeded { .. })
    }

    /// Error text for failed or timed out calls.
    pub fn error(&self) -> Option<&str> {
        match self {
            NodeResult::Succeeded { .. } => None,
            NodeResult::Failed { error } | NodeResult::TimedOut { error } => Some(error.as_str()),
        }
    }
}

/// Typed outcome of executing one dispatch request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub status: StepStatus,
    /// Per-target results in dispatch order.
    pub results: IndexMap<NodeId, NodeResult>,
}

impl StepOutcome {
    /// Aggregates per-node results into a step status.
    ///
    /// An empty result set is a success: the executor only sees one when the
    /// step explicitly tolerates an empty target.
    pub fn from_results(results: IndexMap<NodeId, NodeResult>) -> Self {
        let succeeded = results.values().filter(|result| result.is_success()).count();
        let timed_out = results
            .values()
            .filter(|result| matches!(result, NodeResult::TimedOut { .. }))
            .count();
        let failed = results.len() - succeeded;

        let status = if failed == 0 {
            StepStatus::Success
        } else if succeeded > 0 {
            StepStatus::Partial
        } else if timed_out == failed {
            StepStatus::Timeout
        } else {
            StepStatus::Failure
        };

        Self { status, results }
    }

    pub fn succeeded_nodes(&self) -> Vec<NodeId> {
        self.results
            .iter()
            .filter(|(_, result)| result.is_success())
            .map(|(node, _)| node.clone())
            .collect()
    }

    pub fn failed_nodes(&self) -> Vec<NodeId> {
        self.results
            .iter()
            .filter(|(_, result)| !result.is_success())
            .map(|(node, _)| node.clone())
            .collect()
    }
}

/// Report entry for a step the scheduler attempted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    /// Zero-based position in the sequence.
    pub index: usize,
    pub name: String,
    pub procedure: String,
    pub status: StepStatus,
    /// Per-node results that completed, including on failure.
    #[serde(default)]
    pub results: IndexMap<NodeId, NodeResult>,
    /// Why the step did not succeed, when it did not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    pub duration_ms: u64,
}

/// Why a run stopped before completing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum HaltCause {
    /// The named step failed or could not be dispatched.
    StepFailed { error: StepError },
    /// A halt was requested; the named step was not attempted.
    Requested,
}

impl fmt::Display for HaltCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaltCause::StepFailed { error } => write!(f, "{error}"),
            HaltCause::Requested => f.write_str("halt requested"),
        }
    }
}

/// Terminal state of a sequence run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Completed,
    Halted { step: String, cause: HaltCause },
}

/// Final report produced by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceOutcome {
    /// Sequence identifier, when the definition carried one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<String>,
    pub state: RunState,
    /// Attempted steps in execution order.
    pub steps: Vec<StepReport>,
    /// Steps never dispatched, in declaration order.
    #[serde(default)]
    pub not_attempted: Vec<String>,
}

impl SequenceOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self.state, RunState::Completed)
    }

    /// Name of the step the run halted at, if it halted.
    pub fn halted_at(&self) -> Option<&str> {
        match &self.state {
            RunState::Completed => None,
            RunState::Halted { step, .. } => Some(step.as_str()),
        }
    }

    pub fn step(&self, name: &str) -> Option<&StepReport> {
        self.steps.iter().find(|report| report.name == name)
    }
}

/// Control commands accepted by a running sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceControl {
    /// Stop before the next step; the in-flight step is allowed to finish.
    Halt,
}

/// Lifecycle events emitted while a sequence runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SequenceEvent {
    RunStarted {
        step_count: usize,
        at: DateTime<Utc>,
    },
    StepStarted {
        index: usize,
        name: String,
        started_at: DateTime<Utc>,
    },
    StepFinished {
        index: usize,
        name: String,
        status: StepStatus,
        duration_ms: u64,
    },
    RunFinished {
        state: RunState,
        finished_at: DateTime<Utc>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(id: &str) -> NodeId {
        NodeId::new(id)
    }

    #[test]
    fn aggregate_status_covers_all_shapes() {
        let mut all_ok = IndexMap::new();
        all_ok.insert(node("a"), NodeResult::Succeeded { output: json!(true) });
        all_ok.insert(node("b"), NodeResult::Succeeded { output: json!(true) });
        assert_eq!(StepOutcome::from_results(all_ok).status, StepStatus::Success);

        let mut mixed = IndexMap::new();
        mixed.insert(node("a"), NodeResult::Succeeded { output: json!(true) });
        mixed.insert(node("b"), NodeResult::Failed { error: "boom".into() });
        let outcome = StepOutcome::from_results(mixed);
        assert_eq!(outcome.status, StepStatus::Partial);
        assert_eq!(outcome.failed_nodes(), vec![node("b")]);
        assert_eq!(outcome.succeeded_nodes(), vec![node("a")]);

        let mut timed_out = IndexMap::new();
        timed_out.insert(node("a"), NodeResult::TimedOut { error: "1s elapsed".into() });
        assert_eq!(StepOutcome::from_results(timed_out).status, StepStatus::Timeout);

        let mut failed = IndexMap::new();
        failed.insert(node("a"), NodeResult::TimedOut { error: "1s elapsed".into() });
        failed.insert(node("b"), NodeResult::Failed { error: "boom".into() });
        assert_eq!(StepOutcome::from_results(failed).status, StepStatus::Failure);
    }

    #[test]
    fn empty_results_count_as_success() {
        assert_eq!(StepOutcome::from_results(IndexMap::new()).status, StepStatus::Success);
    }

    #[test]
    fn halted_outcome_serializes_step_and_cause() {
        let outcome = SequenceOutcome {
            sequence: Some("osd-removal".into()),
            state: RunState::Halted {
                step: "remove_osd".into(),
                cause: HaltCause::Requested,
            },
            steps: vec![],
            not_attempted: vec!["remove_osd".into()],
        };
        let value = serde_json::to_value(&outcome).expect("serialize outcome");
        assert_eq!(value["state"]["state"], "halted");
        assert_eq!(value["state"]["step"], "remove_osd");
        assert_eq!(value["state"]["cause"]["reason"], "requested");
        assert_eq!(outcome.halted_at(), Some("remove_osd"));
    }
}
