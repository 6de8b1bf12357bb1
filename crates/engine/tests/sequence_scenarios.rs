use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use runbook_engine::{
    BoundArgs, EchoInvoker, Inventory, ProcedureError, ProcedureInvoker, Scheduler, Sequence, SequenceDocument, StepExecutor,
    TargetResolver, TemplateContext,
};
use runbook_types::{
    BindingError, DispatchError, HaltCause, NodeId, NodeResult, RunState, StepError, StepStatus,
};
use serde_json::{Value, json};

const OSD_REMOVAL: &str = r#"
sequence: osd-removal
steps:
  - name: disengage
    runner: disengage.safety
  - name: remove_osd
    runner: remove.osd
    args: [0]
    kwargs: { delay: 1, timeout: 1 }
  - name: check
    state: ceph.tests.check
    target: self
  - name: restore
    state: ceph.tests.restore
    target: "roles:storage"
    target_type: compound
  - name: "wait ({{ label }})"
    state: ceph.wait.healthy
    target: self
"#;

#[derive(Clone, Copy)]
enum Scripted {
    Fail,
    Timeout,
}

/// Records each call with its bound arguments; scripted (procedure, node) pairs fail.
#[derive(Default)]
struct ScriptedInvoker {
    calls: Mutex<Vec<(String, Option<NodeId>, BoundArgs)>>,
    script: HashMap<(String, Option<String>), Scripted>,
}

impl ScriptedInvoker {
    fn with(mut self, procedure: &str, node: Option<&str>, behaviour: Scripted) -> Self {
        self.script.insert((procedure.to_string(), node.map(str::to_string)), behaviour);
        self
    }

    fn procedures(&self) -> Vec<String> {
        self.calls.lock().expect("calls").iter().map(|(procedure, _, _)| procedure.clone()).collect()
    }

    fn answer(&self, procedure: &str, node: Option<&NodeId>, args: &BoundArgs) -> Result<Value, ProcedureError> {
        self.calls
            .lock()
            .expect("calls")
            .push((procedure.to_string(), node.cloned(), args.clone()));
        let key = (procedure.to_string(), node.map(|node| node.to_string()));
        let any_node = (procedure.to_string(), None);
        match self.script.get(&key).or_else(|| self.script.get(&any_node)) {
            Some(Scripted::Fail) => Err(ProcedureError::Failed(format!("{procedure} failed"))),
            Some(Scripted::Timeout) => Err(ProcedureError::TimedOut(format!("{procedure} timed out"))),
            None => Ok(json!({ "ok": true })),
        }
    }
}

#[async_trait]
impl ProcedureInvoker for ScriptedInvoker {
    async fn invoke_runner(&self, procedure: &str, args: &BoundArgs) -> Result<Value, ProcedureError> {
        self.answer(procedure, None, args)
    }

    async fn invoke_state(&self, procedure: &str, node: &NodeId, args: &BoundArgs) -> Result<Value, ProcedureError> {
        self.answer(procedure, Some(node), args)
    }
}

fn inventory() -> Inventory {
    Inventory::new()
        .with_node("storage-1", json!({"roles": ["storage"]}))
        .with_node("storage-2", json!({"roles": ["storage", "mon"]}))
        .with_node("storage-3", json!({"roles": ["storage"]}))
        .with_node("mon-1", json!({"roles": ["mon"]}))
}

fn osd_removal() -> Sequence {
    let document: SequenceDocument = serde_yaml::from_str(OSD_REMOVAL).expect("parse sequence");
    document
        .render(&TemplateContext::default().with("label", json!("delay")))
        .expect("render sequence")
}

fn scheduler(invoker: Arc<dyn ProcedureInvoker>) -> Scheduler {
    Scheduler::new(TargetResolver::new(inventory(), "admin"), StepExecutor::new(invoker, "admin"))
}

#[tokio::test]
async fn failing_remove_osd_halts_before_any_state_step() {
    let invoker = Arc::new(ScriptedInvoker::default().with("remove.osd", None, Scripted::Fail));
    let outcome = scheduler(invoker.clone()).run(&osd_removal()).await;

    assert_eq!(outcome.halted_at(), Some("remove_osd"));
    assert_eq!(outcome.step("disengage").map(|report| report.status), Some(StepStatus::Success));
    assert_eq!(outcome.step("remove_osd").map(|report| report.status), Some(StepStatus::Failure));
    assert_eq!(outcome.not_attempted, vec!["check", "restore", "wait (delay)"]);
    assert_eq!(invoker.procedures(), vec!["disengage.safety", "remove.osd"]);

    let RunState::Halted { cause, .. } = &outcome.state else {
        panic!("expected halted run");
    };
    assert!(matches!(
        cause,
        HaltCause::StepFailed {
            error: StepError::Dispatch(DispatchError::Failed { .. })
        }
    ));
}

#[tokio::test]
async fn all_steps_succeeding_completes_with_a_report_per_step() {
    let invoker = Arc::new(ScriptedInvoker::default());
    let outcome = scheduler(invoker.clone()).run(&osd_removal()).await;

    assert!(outcome.is_completed());
    assert_eq!(outcome.sequence.as_deref(), Some("osd-removal"));
    let names: Vec<&str> = outcome.steps.iter().map(|report| report.name.as_str()).collect();
    assert_eq!(names, vec!["disengage", "remove_osd", "check", "restore", "wait (delay)"]);
    assert!(outcome.steps.iter().all(|report| report.status == StepStatus::Success));

    let restore = outcome.step("restore").expect("restore report");
    let targets: Vec<&str> = restore.results.keys().map(NodeId::as_str).collect();
    assert_eq!(targets, vec!["storage-1", "storage-2", "storage-3"]);

    let check = outcome.step("check").expect("check report");
    assert_eq!(check.results.len(), 1);
    assert!(check.results.contains_key(&NodeId::new("admin")));

    let calls = invoker.calls.lock().expect("calls");
    let (_, node, args) = &calls[1];
    assert_eq!(node, &None);
    assert_eq!(args.positional, vec![json!(0)]);
    assert_eq!(args.keyword.get("delay"), Some(&json!(1)));
    assert_eq!(args.keyword.get("timeout"), Some(&json!(1)));
}

#[tokio::test]
async fn partial_restore_halts_with_failed_nodes_named() {
    let invoker = Arc::new(ScriptedInvoker::default().with("ceph.tests.restore", Some("storage-2"), Scripted::Fail));
    let outcome = scheduler(invoker).run(&osd_removal()).await;

    assert_eq!(outcome.halted_at(), Some("restore"));
    let restore = outcome.step("restore").expect("restore report");
    assert_eq!(restore.status, StepStatus::Partial);
    assert!(matches!(restore.results[&NodeId::new("storage-2")], NodeResult::Failed { .. }));
    assert!(restore.results[&NodeId::new("storage-1")].is_success());
    match &restore.error {
        Some(StepError::PartialFailure(error)) => assert_eq!(error.failed, vec![NodeId::new("storage-2")]),
        other => panic!("expected partial failure, got {other:?}"),
    }
    assert_eq!(outcome.not_attempted, vec!["wait (delay)"]);
}

#[tokio::test]
async fn timed_out_wait_is_reported_as_timeout() {
    let invoker = Arc::new(ScriptedInvoker::default().with("ceph.wait.healthy", None, Scripted::Timeout));
    let outcome = scheduler(invoker).run(&osd_removal()).await;

    assert_eq!(outcome.halted_at(), Some("wait (delay)"));
    assert_eq!(
        outcome.step("wait (delay)").map(|report| report.status),
        Some(StepStatus::Timeout)
    );
    assert!(outcome.not_attempted.is_empty());
}

#[tokio::test]
async fn unbound_argument_halts_without_dispatch() {
    let document: SequenceDocument = serde_yaml::from_str(
        r#"
steps:
  - name: disengage
    runner: disengage.safety
  - name: remove_osd
    runner: remove.osd
    kwargs: { id: "{{ osd_id }}" }
  - name: check
    state: ceph.tests.check
    target: self
"#,
    )
    .expect("parse");
    let sequence = document.render(&TemplateContext::default()).expect("render");
    let invoker = Arc::new(ScriptedInvoker::default());
    let outcome = scheduler(invoker.clone()).run(&sequence).await;

    assert_eq!(outcome.halted_at(), Some("remove_osd"));
    assert_eq!(invoker.procedures(), vec!["disengage.safety"]);
    let report = outcome.step("remove_osd").expect("report");
    assert!(report.results.is_empty());
    assert_eq!(
        report.error,
        Some(StepError::Binding(BindingError::UndefinedVariable {
            name: "osd_id".into(),
            location: "kwargs.id".into(),
        }))
    );
}

#[tokio::test]
async fn echo_invoker_completes_the_sequence() {
    let outcome = scheduler(Arc::new(EchoInvoker::new())).run(&osd_removal()).await;
    assert!(outcome.is_completed());

    let failing = scheduler(Arc::new(EchoInvoker::new().failing(["ceph.tests.check"])))
        .run(&osd_removal())
        .await;
    assert_eq!(failing.halted_at(), Some("check"));
}
