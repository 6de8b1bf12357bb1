//! Sequential, fail-fast sequence scheduler.
//!
//! The scheduler walks a [`Sequence`] in declaration order. For each step it
//! resolves the target, binds the arguments, hands the resulting
//! [`DispatchRequest`] to the [`StepExecutor`] and waits for the aggregate
//! outcome before considering the next step. The first step that does not
//! succeed halts the run; nothing after it is attempted.
//!
//! [`Scheduler::run_with_control`] additionally streams [`SequenceEvent`]s and
//! honors [`SequenceControl::Halt`] requests once the running step's outcome
//! is known.

use std::time::Instant;

use chrono::Utc;
use runbook_types::{HaltCause, RunState, SequenceControl, SequenceEvent, SequenceOutcome, StepError, StepReport, StepStatus};
use thiserror::Error;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, error::TryRecvError, unbounded_channel};
use tracing::{debug, info, warn};

use crate::{
    binder::bind_step,
    executor::{DispatchCall, DispatchRequest, StepExecutor, outcome_error},
    model::{Sequence, Step, StepCall},
    target::TargetResolver,
    templates::TemplateContext,
};

/// A step that could not be prepared while planning.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("step '{step}': {source}")]
pub struct PlanError {
    pub step: String,
    #[source]
    pub source: StepError,
}

/// Drives sequences through a resolver, binder and executor.
#[derive(Clone)]
pub struct Scheduler {
    resolver: TargetResolver,
    executor: StepExecutor,
    context: TemplateContext,
}

impl Scheduler {
    pub fn new(resolver: TargetResolver, executor: StepExecutor) -> Self {
        Self {
            resolver,
            executor,
            context: TemplateContext::default(),
        }
    }

    /// Sets the inputs used to bind argument placeholders.
    pub fn with_context(mut self, context: TemplateContext) -> Self {
        self.context = context;
        self
    }

    pub fn resolver(&self) -> &TargetResolver {
        &self.resolver
    }

    /// Resolves and binds one step into a dispatch request.
    ///
    /// Errors here are structural: the step must not be dispatched.
    pub fn prepare(&self, step: &Step) -> Result<DispatchRequest, StepError> {
        let call = match &step.call {
            StepCall::Runner => DispatchCall::Runner,
            StepCall::State {
                target,
                allow_empty_target,
                ..
            } => DispatchCall::State {
                targets: self.resolver.resolve_required(target, *allow_empty_target)?,
            },
        };
        let args = bind_step(step, &self.context)?;
        Ok(DispatchRequest {
            step: step.name.clone(),
            procedure: step.procedure.clone(),
            call,
            args,
        })
    }

    /// Prepares every step without dispatching anything.
    ///
    /// Resolution runs against the inventory as it is now; a real run resolves
    /// each step again right before it is dispatched.
    pub fn plan(&self, sequence: &Sequence) -> Result<Vec<DispatchRequest>, PlanError> {
        sequence
            .steps()
            .iter()
            .map(|step| {
                self.prepare(step).map_err(|source| PlanError {
                    step: step.name.clone(),
                    source,
                })
            })
            .collect()
    }

    /// Runs `sequence` to completion or to the first failing step.
    pub async fn run(&self, sequence: &Sequence) -> SequenceOutcome {
        let (_control_tx, control_rx) = unbounded_channel();
        let (event_tx, _event_rx) = unbounded_channel();
        self.run_with_control(sequence, control_rx, event_tx).await
    }

    /// Runs `sequence` while emitting lifecycle events and honoring halt requests.
    ///
    /// Pending controls are drained before the first step and after every
    /// step. A halt never interrupts an in-flight step: the step finishes, is
    /// reported, and the run halts at it with cause `requested`. A halt queued
    /// before the run starts halts at the first step without dispatching it.
    /// A step failure takes precedence over a concurrent halt request. A closed
    /// event channel is ignored.
    pub async fn run_with_control(
        &self,
        sequence: &Sequence,
        mut control_rx: UnboundedReceiver<SequenceControl>,
        event_tx: UnboundedSender<SequenceEvent>,
    ) -> SequenceOutcome {
        let steps = sequence.steps();
        info!(sequence = sequence.name().unwrap_or("<unnamed>"), steps = steps.len(), "sequence run started");
        let _ = event_tx.send(SequenceEvent::RunStarted {
            step_count: steps.len(),
            at: Utc::now(),
        });

        let mut reports = Vec::with_capacity(steps.len());
        let mut state = RunState::Completed;
        let mut halted_index = None;

        for (index, step) in steps.iter().enumerate() {
            if halt_requested(&mut control_rx) {
                warn!(step = %step.name, "halt requested; stopping before step");
                state = RunState::Halted {
                    step: step.name.clone(),
                    cause: HaltCause::Requested,
                };
                halted_index = Some(index);
                break;
            }

            let report = self.run_step(index, step, &event_tx).await;
            let failed = report.error.clone();
            reports.push(report);

            if let Some(error) = failed {
                warn!(step = %step.name, error = %error, "step failed; halting sequence");
                state = RunState::Halted {
                    step: step.name.clone(),
                    cause: HaltCause::StepFailed { error },
                };
                halted_index = Some(index + 1);
                break;
            }

            if halt_requested(&mut control_rx) {
                warn!(step = %step.name, "halt requested while step was running");
                state = RunState::Halted {
                    step: step.name.clone(),
                    cause: HaltCause::Requested,
                };
                halted_index = Some(index + 1);
                break;
            }
        }

        let not_attempted = halted_index
            .map(|first| steps[first..].iter().map(|step| step.name.clone()).collect())
            .unwrap_or_default();

        match &state {
            RunState::Completed => info!(steps = reports.len(), "sequence completed"),
            RunState::Halted { step, cause } => info!(step = %step, cause = %cause, "sequence halted"),
        }
        let _ = event_tx.send(SequenceEvent::RunFinished {
            state: state.clone(),
            finished_at: Utc::now(),
        });

        SequenceOutcome {
            sequence: sequence.name().map(str::to_string),
            state,
            steps: reports,
            not_attempted,
        }
    }

    async fn run_step(&self, index: usize, step: &Step, event_tx: &UnboundedSender<SequenceEvent>) -> StepReport {
        info!(index, step = %step.name, procedure = %step.procedure, "step started");
        let _ = event_tx.send(SequenceEvent::StepStarted {
            index,
            name: step.name.clone(),
            started_at: Utc::now(),
        });

        let started_at = Instant::now();
        let (status, results, error) = match self.prepare(step) {
            Ok(request) => {
                debug!(step = %step.name, targets = request.target_count(), "dispatch request prepared");
                let outcome = self.executor.execute(&request).await;
                let error = outcome_error(&request.procedure, &outcome);
                (outcome.status, outcome.results, error)
            }
            Err(error) => (StepStatus::Failure, Default::default(), Some(error)),
        };
        let duration_ms = started_at.elapsed().as_millis().try_into().unwrap_or(u64::MAX);

        info!(index, step = %step.name, status = %status, duration_ms, "step finished");
        let _ = event_tx.send(SequenceEvent::StepFinished {
            index,
            name: step.name.clone(),
            status,
            duration_ms,
        });

        StepReport {
            index,
            name: step.name.clone(),
            procedure: step.procedure.clone(),
            status,
            results,
            error,
            duration_ms,
        }
    }
}

/// Drains pending controls without waiting; returns whether a halt was seen.
fn halt_requested(control_rx: &mut UnboundedReceiver<SequenceControl>) -> bool {
    let mut halt = false;
    loop {
        match control_rx.try_recv() {
            Ok(SequenceControl::Halt) => halt = true,
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => return halt,
        }
    }
}
