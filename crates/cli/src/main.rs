use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::{Context, Result, anyhow};
use clap::{Arg, ArgAction, ArgMatches, Command};
use runbook_engine::{
    EchoInvoker, EngineConfig, Inventory, Scheduler, Sequence, StepExecutor, TargetResolver, TemplateContext, load_config,
    load_config_from_path, parse_sequence_file,
};
use runbook_types::{SequenceControl, SequenceEvent};
use serde_json::Value;
use tokio::sync::mpsc::unbounded_channel;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let matches = build_cli().get_matches();

    let result = match matches.subcommand() {
        Some(("plan", sub)) => plan_cmd(sub),
        Some(("run", sub)) => run_cmd(sub).await,
        _ => Err(anyhow!("expected a subcommand: plan, run")),
    };

    match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .try_init();
}

/// `RUST_LOG` directives, or `info` when unset or unparsable.
fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn build_cli() -> Command {
    let shared = [
        Arg::new("file")
            .long("file")
            .short('f')
            .required(true)
            .action(ArgAction::Set)
            .help("Path to sequence YAML/JSON"),
        Arg::new("name").long("name").action(ArgAction::Set).help("Sequence name within file"),
        Arg::new("inventory")
            .long("inventory")
            .short('i')
            .action(ArgAction::Set)
            .help("Path to node inventory YAML/JSON"),
        Arg::new("input")
            .long("input")
            .action(ArgAction::Append)
            .value_name("KEY=VALUE")
            .help("Template input; VALUE is parsed as YAML"),
        Arg::new("config").long("config").action(ArgAction::Set).help("Path to engine config JSON"),
        Arg::new("control-node")
            .long("control-node")
            .action(ArgAction::Set)
            .help("Node addressed by 'self'"),
    ];

    Command::new("runbook")
        .about("Plan and run orchestration sequences")
        .subcommand_required(true)
        .subcommand(
            Command::new("plan")
                .about("Resolve targets and bind arguments without dispatching")
                .args(shared.clone()),
        )
        .subcommand(
            Command::new("run")
                .about("Run a sequence against the echo backend")
                .args(shared)
                .arg(
                    Arg::new("fail")
                        .long("fail")
                        .action(ArgAction::Append)
                        .value_name("PROCEDURE")
                        .help("Make the echo backend fail this procedure"),
                ),
        )
}

/// Everything a subcommand needs, loaded from its arguments.
struct Session {
    sequence: Sequence,
    config: EngineConfig,
    resolver: TargetResolver,
    context: TemplateContext,
}

fn load_session(matches: &ArgMatches) -> Result<Session> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => load_config_from_path(&PathBuf::from(path))?,
        None => load_config()?,
    };
    if let Some(control_node) = matches.get_one::<String>("control-node") {
        config.control_node = control_node.clone();
    }

    let context = parse_inputs(matches.get_many::<String>("input").into_iter().flatten())?;

    let file = matches.get_one::<String>("file").context("missing --file")?;
    let bundle = parse_sequence_file(file)?;
    let name = matches.get_one::<String>("name").map(String::as_str);
    let document = bundle.select(name).ok_or_else(|| match name {
        Some(name) => anyhow!("sequence '{name}' not found in {file}"),
        None => anyhow!("{file} holds several sequences; choose one with --name"),
    })?;
    let sequence = document.render(&context)?;

    let inventory = match matches.get_one::<String>("inventory").map(PathBuf::from).or_else(|| config.inventory.clone()) {
        Some(path) => Inventory::from_path(path)?,
        None => {
            debug!("no inventory given; only 'self' targets will resolve");
            Inventory::new()
        }
    };
    let resolver = TargetResolver::new(inventory, config.control_node.as_str());

    Ok(Session {
        sequence,
        config,
        resolver,
        context,
    })
}

fn parse_inputs<'a>(inputs: impl IntoIterator<Item = &'a String>) -> Result<TemplateContext> {
    let mut context = TemplateContext::default();
    for input in inputs {
        let (key, raw) = input
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid --input '{input}'; expected KEY=VALUE"))?;
        let value: Value = serde_yaml::from_str(raw).with_context(|| format!("invalid value for input '{key}'"))?;
        context.insert(key.trim(), value);
    }
    Ok(context)
}

fn scheduler(session: &Session, invoker: EchoInvoker) -> Scheduler {
    let executor = StepExecutor::new(Arc::new(invoker), session.config.control_node.as_str())
        .with_max_concurrency(session.config.max_concurrency);
    Scheduler::new(session.resolver.clone(), executor).with_context(session.context.clone())
}

fn plan_cmd(matches: &ArgMatches) -> Result<ExitCode> {
    let session = load_session(matches)?;
    let plan = scheduler(&session, EchoInvoker::new()).plan(&session.sequence)?;
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(ExitCode::SUCCESS)
}

async fn run_cmd(matches: &ArgMatches) -> Result<ExitCode> {
    let session = load_session(matches)?;
    let failing: Vec<String> = matches.get_many::<String>("fail").into_iter().flatten().cloned().collect();
    let scheduler = scheduler(&session, EchoInvoker::new().failing(failing));

    let (control_tx, control_rx) = unbounded_channel();
    let (event_tx, mut event_rx) = unbounded_channel();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; halting after the current step");
            let _ = control_tx.send(SequenceControl::Halt);
        }
    });
    let events = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if let SequenceEvent::StepFinished { name, status, .. } = &event {
                eprintln!("{status:<8} {name}");
            }
        }
    });

    let outcome = scheduler.run_with_control(&session.sequence, control_rx, event_tx).await;
    let _ = events.await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    match outcome.halted_at() {
        None => Ok(ExitCode::SUCCESS),
        Some(step) => {
            info!(step, "sequence halted");
            Ok(ExitCode::FAILURE)
        }
    }
}
