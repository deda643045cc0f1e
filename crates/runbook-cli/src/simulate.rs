//! Simulate command implementation for Runbook CLI.
//!
//! Registers cells against an in-memory runner, runs executions on every cell
//! concurrently, and prints what each cell ended up showing.

use std::sync::Arc;

use anyhow::Context;
use futures::future::join_all;
use runbook_core::{
    Cell, CellId, Collaborators, CoordinatorConfig, CoordinatorRegistry, MemoryBackend,
    MemoryPrompt, OutputCoordinator, OutputKind, StaticGenerator, TerminalKind,
};
use serde::Serialize;

/// Options for `runbook simulate`.
pub struct SimulateOptions {
    pub cells: u64,
    pub runs: usize,
    pub session: String,
    pub reconnect: Option<String>,
    pub terminal: Option<TerminalKind>,
    pub offline: bool,
    pub decline: bool,
}

#[derive(Debug, Serialize)]
struct Report {
    session: String,
    cells: Vec<CellReport>,
}

#[derive(Debug, Serialize)]
struct CellReport {
    cell: String,
    mru_session: Option<String>,
    outputs: Vec<OutputSummary>,
    replace_count: usize,
    execution_orders: Vec<Option<u64>>,
    /// Runs that got no execution because the runner prompt was declined.
    skipped_runs: usize,
}

#[derive(Debug, Serialize)]
struct OutputSummary {
    kind: Option<OutputKind>,
    mime: String,
}

/// Execute the simulation and print the report.
pub async fn execute(config: CoordinatorConfig, options: SimulateOptions) -> anyhow::Result<()> {
    let backend = if options.offline {
        MemoryBackend::detached()
    } else {
        MemoryBackend::new()
    };
    let prompt = if options.decline {
        MemoryPrompt::declining()
    } else {
        MemoryPrompt::attaching(backend.clone())
    };
    let collaborators = Collaborators::new(
        Arc::new(backend.clone()),
        Arc::new(prompt),
        Arc::new(StaticGenerator::all_panels()),
    );
    let registry = CoordinatorRegistry::new(collaborators, config);

    let options = Arc::new(options);
    let mut tasks = Vec::new();
    for id in 0..options.cells {
        let cell = Cell::new(CellId::new(id)).with_metadata("id", format!("cell-{}", id));
        let coordinator = registry.register_cell(&cell);
        if let Some(kind) = options.terminal {
            coordinator.register_terminal(kind);
        }
        // The runner reports its last order before any run is issued.
        coordinator.set_session_execution_order(&options.session, 0);

        let options = options.clone();
        tasks.push(tokio::spawn(async move {
            run_cell(coordinator, &options).await
        }));
    }

    let mut skipped = Vec::new();
    for task in tasks {
        skipped.push(task.await.context("simulation task panicked")??);
    }

    let cells = (0..options.cells)
        .zip(skipped)
        .map(|(id, skipped_runs)| {
            let cell_id = CellId::new(id);
            let coordinator = registry.get_coordinator(&Cell::new(cell_id));
            let record = backend.record(cell_id);
            CellReport {
                cell: coordinator.stable_id().to_string(),
                mru_session: coordinator.mru_session_id(),
                outputs: record
                    .outputs
                    .iter()
                    .map(|o| OutputSummary {
                        kind: o.kind,
                        mime: o.mime.clone(),
                    })
                    .collect(),
                replace_count: record.replace_count,
                execution_orders: record.runs.iter().map(|r| r.execution_order).collect(),
                skipped_runs,
            }
        })
        .collect();

    let closed = registry.close_cells((0..options.cells).map(CellId::new));
    tracing::debug!(closed, "Simulation finished");

    let report = Report {
        session: options.session.clone(),
        cells,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Issue every run of one cell, switching sessions halfway if asked.
///
/// Returns how many runs were skipped.
async fn run_cell(
    coordinator: Arc<OutputCoordinator>,
    options: &SimulateOptions,
) -> runbook_core::Result<usize> {
    let half = options.runs / 2;
    let (first, second) = if options.reconnect.is_some() {
        (0..half, half..options.runs)
    } else {
        (0..options.runs, options.runs..options.runs)
    };

    let mut skipped = run_batch(&coordinator, first).await?;
    if let Some(ref session) = options.reconnect {
        coordinator.set_mru_session_id(session);
        skipped += run_batch(&coordinator, second).await?;
    }
    Ok(skipped)
}

/// Issue a batch of runs at once; they queue on the coordinator.
async fn run_batch(
    coordinator: &OutputCoordinator,
    runs: std::ops::Range<usize>,
) -> runbook_core::Result<usize> {
    let results = join_all(runs.map(|run| run_once(coordinator, run))).await;
    let mut skipped = 0;
    for result in results {
        if !result? {
            skipped += 1;
        }
    }
    Ok(skipped)
}

/// One run: start, write terminal output, show annotations, end.
///
/// Returns `false` when no execution could be created.
async fn run_once(coordinator: &OutputCoordinator, run: usize) -> runbook_core::Result<bool> {
    let Some(execution) = coordinator.create_execution().await? else {
        tracing::warn!(cell = %coordinator.stable_id(), run, "Run skipped: no runner");
        return Ok(false);
    };

    execution.start(None).await?;
    coordinator.write_terminal(format!("run {} of {}\r\n", run, coordinator.stable_id()).as_bytes());

    // The run is ended even when a surface fails to show.
    let shown = show_surfaces(coordinator).await;
    let ended = execution.end(Some(shown.is_ok()), None).await;
    shown?;
    ended?;
    Ok(true)
}

async fn show_surfaces(coordinator: &OutputCoordinator) -> runbook_core::Result<()> {
    if !coordinator.is_output_enabled(OutputKind::Annotations) {
        coordinator.show_output(OutputKind::Annotations, true).await?;
    }
    if coordinator.terminal_kind().is_some() && !coordinator.is_terminal_enabled() {
        coordinator.show_terminal(true).await?;
    }
    Ok(())
}
