//! # Runbook Engine
//!
//! The Runbook Engine runs orchestration sequences: ordered lists of named
//! steps, each either an untargeted *runner* call or a *state* call applied to
//! the nodes a target expression resolves to. Steps run strictly one after
//! another and the first step that does not succeed halts the sequence.
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use runbook_engine::{EchoInvoker, Inventory, Scheduler, StepExecutor, TargetResolver, TemplateContext, parse_sequence_file};
//!
//! let temp_dir = tempfile::tempdir()?;
//! let sequence_path = temp_dir.path().join("sequence.yaml");
//! std::fs::write(&sequence_path, r#"
//! sequence: smoke
//! steps:
//!   - name: check
//!     state: ceph.tests.check
//!     target: self
//! "#)?;
//!
//! let bundle = parse_sequence_file(&sequence_path)?;
//! let sequence = bundle.select(None).expect("one sequence").render(&TemplateContext::default())?;
//!
//! let scheduler = Scheduler::new(
//!     TargetResolver::new(Inventory::new(), "admin"),
//!     StepExecutor::new(Arc::new(EchoInvoker::new()), "admin"),
//! );
//! let runtime = tokio::runtime::Builder::new_current_thread().build()?;
//! let outcome = runtime.block_on(scheduler.run(&sequence));
//! assert!(outcome.is_completed());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Architecture
//!
//! - **`model`**: sequences, steps and their YAML authoring form
//! - **`templates`**: `{{ name }}` placeholder rendering against explicit inputs
//! - **`target`**: target expression parsing and resolution against an inventory
//! - **`binder`**: argument binding into concrete call values
//! - **`executor`**: procedure invocation and per-node result aggregation
//! - **`scheduler`**: sequential, fail-fast driving of a whole sequence
//! - **`config`**: engine configuration loading

use std::{fs, path::Path};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::Deserialize;

pub mod binder;
pub mod config;
pub mod executor;
pub mod model;
pub mod scheduler;
pub mod target;
pub mod templates;

pub use binder::{BoundArgs, bind, bind_step};
pub use config::{ConfigError, EngineConfig, default_config_path, load_config, load_config_from_path};
pub use executor::{DispatchCall, DispatchRequest, EchoInvoker, ProcedureError, ProcedureInvoker, StepExecutor, outcome_error};
pub use model::{DefinitionError, Sequence, SequenceBundle, SequenceDocument, Step, StepCall, StepDocument};
pub use scheduler::{PlanError, Scheduler};
pub use target::{Inventory, SizeBound, TargetExpr, TargetResolver, TargetType};
pub use templates::TemplateContext;

/// Loads a sequence file (YAML or JSON) from the filesystem.
///
/// Accepts either a single document with `sequence` and `steps` keys, or a
/// bundle with documents under a `sequences` key. A single document without a
/// `sequence` name is stored as `"default"`.
pub fn parse_sequence_file(file_path: impl AsRef<Path>) -> Result<SequenceBundle> {
    let file_path = file_path.as_ref();
    let content = fs::read_to_string(file_path).with_context(|| format!("Failed to read sequence file: {}", file_path.display()))?;

    // Try the bundle form first so a bundle is never accepted as an empty single document.
    #[derive(Deserialize)]
    struct MultiSequenceDocument {
        sequences: IndexMap<String, SequenceDocument>,
    }

    if let Ok(document) = serde_yaml::from_str::<MultiSequenceDocument>(&content) {
        return Ok(SequenceBundle {
            sequences: document.sequences,
        });
    }

    let document: SequenceDocument = serde_yaml::from_str(&content).with_context(|| {
        format!(
            "Unsupported sequence document format in {}. Expected a single sequence with 'sequence' and 'steps' fields \
             or a bundle with sequences under a 'sequences' key",
            file_path.display()
        )
    })?;
    let name = document.sequence.clone().unwrap_or_else(|| "default".to_string());
    Ok(SequenceBundle {
        sequences: IndexMap::from([(name, document)]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_sequence_file() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let path = temp_dir.path().join("sequence.yaml");
        fs::write(
            &path,
            r#"
sequence: osd-removal
steps:
  - name: disengage
    runner: disengage.safety
"#,
        )
        .expect("write sequence");

        let bundle = parse_sequence_file(&path).expect("parse");
        assert_eq!(bundle.sequences.len(), 1);
        assert_eq!(bundle.sequences["osd-removal"].steps.len(), 1);
    }

    #[test]
    fn parse_multi_sequence_file_keeps_declaration_order() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let path = temp_dir.path().join("bundle.yaml");
        fs::write(
            &path,
            r#"
sequences:
  removal:
    steps: []
  health:
    steps: []
"#,
        )
        .expect("write bundle");

        let bundle = parse_sequence_file(&path).expect("parse bundle");
        let names: Vec<&str> = bundle.sequences.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["removal", "health"]);
    }

    #[test]
    fn unknown_step_fields_are_rejected() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let path = temp_dir.path().join("bad.yaml");
        fs::write(&path, "steps:\n  - name: x\n    runner: a\n    depends_on: [y]\n").expect("write");

        assert!(parse_sequence_file(&path).is_err());
    }
}
