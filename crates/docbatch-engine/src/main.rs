use anyhow::{bail, Context};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use serde_json::json;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use docbatch_core::{BatchId, BatchStatus, ConflictPolicy, EngineConfig, NodeId, OperationType, ProjectId, SubmitRequest, UserId};
use docbatch_engine::memory::MemoryBackend;
use docbatch_engine::{init_tracing, BatchCoordinator};

fn cli() -> Command {
    Command::new("docbatch")
        .version(docbatch_engine::VERSION)
        .about("Batch document operation engine")
        .arg(
            Arg::new("json")
                .long("json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit JSON output and JSON logs"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("simulate")
                .about("Run one batch end to end against an in-memory project")
                .arg(
                    Arg::new("folders")
                        .long("folders")
                        .default_value("4")
                        .value_parser(value_parser!(usize))
                        .help("Number of root folders to seed"),
                )
                .arg(
                    Arg::new("docs-per-folder")
                        .long("docs-per-folder")
                        .default_value("25")
                        .value_parser(value_parser!(usize))
                        .help("Documents seeded under each folder"),
                )
                .arg(
                    Arg::new("op")
                        .long("op")
                        .default_value("delete")
                        .value_parser(value_parser!(OperationType))
                        .help("Operation type: delete, move or copy"),
                )
                .arg(
                    Arg::new("atomic")
                        .long("atomic")
                        .action(ArgAction::SetTrue)
                        .help("All-or-nothing execution"),
                )
                .arg(
                    Arg::new("policy")
                        .long("policy")
                        .default_value("FailFast")
                        .value_parser(value_parser!(ConflictPolicy))
                        .help("Conflict policy: FailFast, SkipConflicts or ForceOverwrite"),
                )
                .arg(
                    Arg::new("cancel-after")
                        .long("cancel-after")
                        .value_parser(value_parser!(usize))
                        .help("Cancel once this many mutations have been applied"),
                )
                .arg(
                    Arg::new("undo")
                        .long("undo")
                        .action(ArgAction::SetTrue)
                        .help("Undo the batch after it finishes"),
                )
                .arg(
                    Arg::new("latency-ms")
                        .long("latency-ms")
                        .default_value("0")
                        .value_parser(value_parser!(u64))
                        .help("Simulated repository latency per mutation"),
                )
                .arg(
                    Arg::new("config")
                        .long("config")
                        .value_parser(value_parser!(std::path::PathBuf))
                        .help("Engine configuration file (TOML)"),
                ),
        )
}

// Single-threaded so the cancel hook sees the batch ID before the executor runs.
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();
    let json = matches.get_flag("json");
    init_tracing("info,docbatch_engine=debug", json);

    match matches.subcommand() {
        Some(("simulate", args)) => simulate(args, json).await,
        _ => bail!("unknown command"),
    }
}

async fn simulate(args: &ArgMatches, json: bool) -> anyhow::Result<()> {
    let config = match args.get_one::<std::path::PathBuf>("config") {
        Some(path) => EngineConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let folders = *args.get_one::<usize>("folders").context("missing --folders")?;
    let docs = *args.get_one::<usize>("docs-per-folder").context("missing --docs-per-folder")?;
    let op = *args.get_one::<OperationType>("op").context("missing --op")?;
    let policy = *args.get_one::<ConflictPolicy>("policy").context("missing --policy")?;
    let latency = *args.get_one::<u64>("latency-ms").context("missing --latency-ms")?;
    if folders < 2 && op != OperationType::Delete {
        bail!("move and copy need at least two folders");
    }

    let backend = MemoryBackend::new();
    let project = ProjectId::new("sim");
    let user = UserId::new("simulator");
    let seeded = backend.repository.seed_project(&project, folders, docs)?;
    backend.repository.set_latency(Duration::from_millis(latency));

    let request = match op {
        OperationType::Delete => SubmitRequest::new(project.clone(), op, seeded.folders.clone()).with_descendants(true),
        OperationType::Move | OperationType::Copy => {
            let first = &seeded.folders[0];
            let last = &seeded.folders[seeded.folders.len() - 1];
            let targets: Vec<NodeId> = seeded
                .documents
                .iter()
                .filter(|doc| doc.as_str().starts_with(&format!("{first}-")))
                .cloned()
                .collect();
            SubmitRequest::new(project.clone(), op, targets).with_payload("newParentId", json!(last.as_str()))
        }
    }
    .with_atomic(args.get_flag("atomic"))
    .with_policy(policy);

    let coordinator = BatchCoordinator::new(config, backend.collaborators());
    let running: Arc<OnceLock<(BatchCoordinator, BatchId)>> = Arc::new(OnceLock::new());
    if let Some(&threshold) = args.get_one::<usize>("cancel-after") {
        let slot = Arc::clone(&running);
        backend.repository.on_mutation(move |count| {
            if count == threshold {
                if let Some((coordinator, batch_id)) = slot.get() {
                    if let Err(err) = coordinator.cancel(*batch_id) {
                        tracing::warn!(%batch_id, error = %err, "cancel rejected");
                    }
                }
            }
        });
    }

    let response = coordinator.submit(&user, request).await?;
    let batch_id = response.batch_id;
    // Ignore a second set; the slot is only written here.
    let _ = running.set((coordinator.clone(), batch_id));
    tracing::info!(%batch_id, summary = ?response.preflight_summary, "submitted");

    let finished = wait_for_terminal(&coordinator, batch_id).await?;
    let mut undo_error = None;
    if args.get_flag("undo") && finished.is_undoable() {
        if let Err(err) = coordinator.undo(&user, batch_id).await {
            undo_error = Some(err.to_string());
        }
    }

    let record = coordinator.get_batch(batch_id)?;
    let remaining = backend.repository.snapshot(&project).len();
    if json {
        let report = json!({
            "submit": response,
            "batch": &*record,
            "liveNodes": remaining,
            "undoError": undo_error,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let counts = record.counts();
        println!("batch {batch_id} ({op}, atomic={}, {policy:?})", record.atomic);
        println!("  preflight: {:?}", response.preflight_summary);
        println!("  status:    {:?}", record.status);
        println!(
            "  items:     {} succeeded, {} skipped, {} failed, {} cancelled",
            counts.succeeded, counts.skipped, counts.failed, counts.cancelled
        );
        if let Some(failure) = &record.failure {
            println!("  failure:   {} {}", failure.code, failure.message);
        }
        if let Some(undo_failure) = &record.undo_failure {
            println!("  undo:      {} ({:?})", undo_failure.message, undo_failure.kind);
        }
        if let Some(err) = &undo_error {
            println!("  undo error: {err}");
        }
        println!("  live nodes: {remaining}");
    }
    Ok(())
}

async fn wait_for_terminal(coordinator: &BatchCoordinator, batch_id: BatchId) -> anyhow::Result<BatchStatus> {
    loop {
        let progress = coordinator.get_progress(batch_id)?;
        if progress.status.is_terminal() {
            return Ok(progress.status);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
