//! # Sequence Model Definitions
//!
//! A [`Sequence`] is an immutable, ordered list of [`Step`]s. Declaration order
//! is the only execution order; there is no dependency graph.
//!
//! Sequences are usually authored as YAML documents ([`SequenceDocument`]) and
//! rendered once against an explicit [`TemplateContext`] before scheduling:
//!
//! ```rust
//! use runbook_engine::{SequenceDocument, TemplateContext};
//! use serde_json::json;
//!
//! let document: SequenceDocument = serde_yaml::from_str(r#"
//! sequence: osd-removal
//! steps:
//!   - name: "disengage safety ({{ label }})"
//!     runner: disengage.safety
//!   - name: check
//!     state: ceph.tests.check
//!     target: self
//! "#)?;
//!
//! let context = TemplateContext::default().with("label", json!("delay"));
//! let sequence = document.render(&context)?;
//! assert_eq!(sequence.steps()[0].name, "disengage safety (delay)");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::collections::HashSet;

use indexmap::IndexMap;
use runbook_types::{BindingError, ResolutionError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{
    target::{TargetExpr, TargetType},
    templates::{TemplateContext, render_string},
};

/// How a step is dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepCall {
    /// Untargeted call executed once by the engine itself.
    Runner,
    /// Targeted call applied to every node the target resolves to.
    State {
        target: TargetExpr,
        target_type: TargetType,
        /// Accept an empty resolved target set instead of failing the step.
        allow_empty_target: bool,
    },
}

/// One named unit of work in a sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub name: String,
    pub procedure: String,
    pub call: StepCall,
    pub args: Vec<Value>,
    pub kwargs: IndexMap<String, Value>,
}

impl Step {
    pub fn runner(name: impl Into<String>, procedure: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            procedure: procedure.into(),
            call: StepCall::Runner,
            args: Vec::new(),
            kwargs: IndexMap::new(),
        }
    }

    pub fn state(name: impl Into<String>, procedure: impl Into<String>, target: TargetExpr, target_type: TargetType) -> Self {
        Self {
            name: name.into(),
            procedure: procedure.into(),
            call: StepCall::State {
                target,
                target_type,
                allow_empty_target: false,
            },
            args: Vec::new(),
            kwargs: IndexMap::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    /// Marks a state step as tolerating an empty target set. No effect on runner steps.
    pub fn allowing_empty_target(mut self) -> Self {
        if let StepCall::State { allow_empty_target, .. } = &mut self.call {
            *allow_empty_target = true;
        }
        self
    }

    pub fn is_runner(&self) -> bool {
        matches!(self.call, StepCall::Runner)
    }
}

/// Problems found while building a sequence from its definition.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DefinitionError {
    #[error("step #{index} has an empty name")]
    EmptyStepName { index: usize },

    #[error("duplicate step name '{name}'")]
    DuplicateStepName { name: String },

    #[error("step '{step}' has an empty procedure")]
    EmptyProcedure { step: String },

    #[error("step '{step}' must set exactly one of 'runner' or 'state'")]
    CallKind { step: String },

    #[error("state step '{step}' requires a target")]
    MissingTarget { step: String },

    #[error("runner step '{step}' cannot declare a target")]
    UnexpectedTarget { step: String },

    #[error("step '{step}': {source}")]
    Template {
        step: String,
        #[source]
        source: BindingError,
    },

    #[error("step '{step}': {source}")]
    Target {
        step: String,
        #[source]
        source: ResolutionError,
    },
}

/// Immutable, validated sequence of steps.
#[derive(Debug, Clone, PartialEq)]
pub struct Sequence {
    name: Option<String>,
    steps: Vec<Step>,
}

impl Sequence {
    /// Validates step names (non-empty, unique) and procedures (non-empty).
    pub fn new(name: Option<String>, steps: Vec<Step>) -> Result<Self, DefinitionError> {
        let mut seen = HashSet::new();
        for (index, step) in steps.iter().enumerate() {
            if step.name.trim().is_empty() {
                return Err(DefinitionError::EmptyStepName { index });
            }
            if !seen.insert(step.name.as_str()) {
                return Err(DefinitionError::DuplicateStepName { name: step.name.clone() });
            }
            if step.procedure.trim().is_empty() {
                return Err(DefinitionError::EmptyProcedure { step: step.name.clone() });
            }
        }
        Ok(Self { name, steps })
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|step| step.name.as_str())
    }
}

/// Authoring form of a sequence, prior to template rendering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SequenceDocument {
    /// Optional sequence identifier.
    #[serde(default)]
    pub sequence: Option<String>,
    /// Steps in execution order.
    #[serde(default)]
    pub steps: Vec<StepDocument>,
}

/// Authoring form of a step. Exactly one of `runner` / `state` must be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepDocument {
    pub name: String,
    /// Procedure executed engine-side, untargeted.
    #[serde(default)]
    pub runner: Option<String>,
    /// Procedure applied to each resolved target node.
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub target_type: TargetType,
    #[serde(default)]
    pub allow_empty_target: bool,
    /// Positional arguments; placeholders are bound at dispatch.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Keyword arguments; placeholders are bound at dispatch.
    #[serde(default)]
    pub kwargs: IndexMap<String, Value>,
}

impl SequenceDocument {
    /// Runs the template pre-pass and builds a validated [`Sequence`].
    ///
    /// Step names, procedures and target strings are rendered here and targets
    /// are parsed once. Argument placeholders are left for the binder.
    pub fn render(&self, context: &TemplateContext) -> Result<Sequence, DefinitionError> {
        let steps = self
            .steps
            .iter()
            .enumerate()
            .map(|(index, step)| step.render(index, context))
            .collect::<Result<Vec<_>, _>>()?;
        Sequence::new(self.sequence.clone(), steps)
    }
}

impl StepDocument {
    fn render(&self, index: usize, context: &TemplateContext) -> Result<Step, DefinitionError> {
        let name = render_string(&self.name, context, &format!("steps[{index}].name")).map_err(|source| {
            DefinitionError::Template {
                step: self.name.clone(),
                source,
            }
        })?;
        let template_error = |source| DefinitionError::Template {
            step: name.clone(),
            source,
        };

        let (procedure, call) = match (&self.runner, &self.state) {
            (Some(procedure), None) => {
                if self.target.is_some() {
                    return Err(DefinitionError::UnexpectedTarget { step: name.clone() });
                }
                (procedure, StepCall::Runner)
            }
            (None, Some(procedure)) => {
                let Some(raw_target) = &self.target else {
                    return Err(DefinitionError::MissingTarget { step: name.clone() });
                };
                let rendered = render_string(raw_target, context, &format!("steps[{index}].target")).map_err(template_error)?;
                let target = TargetExpr::parse(&rendered, self.target_type).map_err(|source| DefinitionError::Target {
                    step: name.clone(),
                    source,
                })?;
                (
                    procedure,
                    StepCall::State {
                        target,
                        target_type: self.target_type,
                        allow_empty_target: self.allow_empty_target,
                    },
                )
            }
            _ => return Err(DefinitionError::CallKind { step: name.clone() }),
        };

        let procedure = render_string(procedure, context, &format!("steps[{index}].procedure")).map_err(template_error)?;
        Ok(Step {
            name,
            procedure,
            call,
            args: self.args.clone(),
            kwargs: self.kwargs.clone(),
        })
    }
}

/// A collection of named sequence documents loaded from one file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SequenceBundle {
    pub sequences: IndexMap<String, SequenceDocument>,
}

impl SequenceBundle {
    /// Returns the named document, or the only one when `name` is `None`.
    pub fn select(&self, name: Option<&str>) -> Option<&SequenceDocument> {
        match name {
            Some(name) => self.sequences.get(name),
            None if self.sequences.len() == 1 => self.sequences.values().next(),
            None => None,
        }
    }
}
