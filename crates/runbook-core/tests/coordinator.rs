//! Integration tests for output coordination against the in-memory runner.

use std::sync::Arc;
use std::time::{Duration, Instant};

use runbook_core::memory::RunRecord;
use runbook_core::{
    Cell, CellId, Collaborators, CoordinatorConfig, CoordinatorRegistry, Error, MemoryBackend,
    MemoryPrompt, OutputCoordinator, OutputItem, OutputKind, StaticGenerator, TerminalKind,
};

// =============================================================================
// Test Helpers
// =============================================================================

struct Fixture {
    backend: MemoryBackend,
    prompt: Arc<MemoryPrompt>,
    registry: CoordinatorRegistry,
}

impl Fixture {
    fn new() -> Self {
        Self::build(
            MemoryBackend::new(),
            MemoryPrompt::declining(),
            StaticGenerator::all_panels(),
            CoordinatorConfig::default(),
        )
    }

    fn build(
        backend: MemoryBackend,
        prompt: MemoryPrompt,
        generator: StaticGenerator,
        config: CoordinatorConfig,
    ) -> Self {
        let prompt = Arc::new(prompt);
        let collaborators = Collaborators::new(
            Arc::new(backend.clone()),
            prompt.clone(),
            Arc::new(generator),
        );
        Self {
            backend,
            prompt,
            registry: CoordinatorRegistry::new(collaborators, config),
        }
    }

    fn cell(&self, id: u64) -> Arc<OutputCoordinator> {
        let cell = Cell::new(CellId::new(id)).with_metadata("id", format!("c{}", id));
        self.registry.register_cell(&cell)
    }

    fn kinds(&self, id: u64) -> Vec<Option<OutputKind>> {
        self.backend
            .outputs(CellId::new(id))
            .iter()
            .map(|o| o.kind)
            .collect()
    }
}

const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Execution sequencing
// =============================================================================

#[tokio::test]
async fn test_executions_never_overlap() {
    let fixture = Fixture::new();
    let coordinator = fixture.cell(1);

    let first = coordinator.create_execution().await.unwrap().unwrap();
    first.start(None).await.unwrap();

    let queued = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.create_execution().await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fixture.backend.contexts_created(), 1);
    assert!(!queued.is_finished());

    first.end(Some(true), None).await.unwrap();

    let second = tokio::time::timeout(WAIT, queued)
        .await
        .expect("queued execution should be created after end")
        .unwrap()
        .unwrap()
        .expect("runner is attached");
    assert_eq!(fixture.backend.contexts_created(), 2);
    assert!(!second.ptr_eq(&first));
    assert!(coordinator.current_execution().is_some_and(|h| h.ptr_eq(&second)));

    second.end(Some(true), None).await.unwrap();
    assert!(coordinator.current_execution().is_none());
}

#[tokio::test]
async fn test_dropped_execution_releases_queue() {
    let fixture = Fixture::new();
    let coordinator = fixture.cell(1);

    let abandoned = coordinator.create_execution().await.unwrap().unwrap();
    drop(abandoned);
    assert!(coordinator.current_execution().is_none());

    let next = tokio::time::timeout(WAIT, coordinator.create_execution())
        .await
        .expect("dropped execution must not block the cell")
        .unwrap();
    assert!(next.is_some());
    next.unwrap().end(None, None).await.unwrap();
}

#[tokio::test]
async fn test_finish_timeout_reports_hung_execution() {
    let fixture = Fixture::build(
        MemoryBackend::new(),
        MemoryPrompt::declining(),
        StaticGenerator::all_panels(),
        CoordinatorConfig::default().with_finish_timeout(Duration::from_millis(50)),
    );
    let coordinator = fixture.cell(3);

    let hung = coordinator.create_execution().await.unwrap().unwrap();
    hung.start(None).await.unwrap();

    let err = coordinator.create_execution().await.unwrap_err();
    assert!(matches!(err, Error::ExecutionTimeout(id) if id == CellId::new(3)));
    assert_eq!(fixture.backend.contexts_created(), 1);
    assert!(!hung.has_ended());
    assert!(coordinator.current_execution().is_some_and(|h| h.ptr_eq(&hung)));

    hung.end(Some(false), None).await.unwrap();
    let retried = coordinator.create_execution().await.unwrap();
    assert!(retried.is_some());
    retried.unwrap().end(None, None).await.unwrap();
}

#[tokio::test]
async fn test_finish_timeout_does_not_stack_for_queued_callers() {
    let timeout = Duration::from_millis(300);
    let fixture = Fixture::build(
        MemoryBackend::new(),
        MemoryPrompt::declining(),
        StaticGenerator::all_panels(),
        CoordinatorConfig::default().with_finish_timeout(timeout),
    );
    let coordinator = fixture.cell(3);
    let hung = coordinator.create_execution().await.unwrap().unwrap();

    let asked = Instant::now();
    let callers: Vec<_> = (0..2)
        .map(|_| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                let result = coordinator.create_execution().await;
                (result, asked.elapsed())
            })
        })
        .collect();

    for caller in callers {
        let (result, waited) = caller.await.unwrap();
        assert!(matches!(result, Err(Error::ExecutionTimeout(_))));
        assert!(
            waited < timeout + Duration::from_millis(200),
            "queued caller waited {:?}",
            waited
        );
    }
    assert_eq!(fixture.backend.contexts_created(), 1);
    hung.end(None, None).await.unwrap();
}

// =============================================================================
// Context lifecycle
// =============================================================================

#[tokio::test]
async fn test_write_without_execution_uses_throwaway_context() {
    let fixture = Fixture::new();
    let coordinator = fixture.cell(1);

    coordinator
        .show_output(OutputKind::Annotations, true)
        .await
        .unwrap();

    assert_eq!(fixture.backend.contexts_created(), 1);
    assert_eq!(
        fixture.backend.runs(CellId::new(1)),
        vec![RunRecord {
            started: true,
            ended: true,
            success: None,
            execution_order: None,
        }]
    );
    assert_eq!(fixture.kinds(1), vec![Some(OutputKind::Annotations)]);
}

#[tokio::test]
async fn test_write_during_execution_reuses_it() {
    let fixture = Fixture::new();
    let coordinator = fixture.cell(1);

    let execution = coordinator.create_execution().await.unwrap().unwrap();
    execution.start(None).await.unwrap();
    coordinator
        .show_output(OutputKind::Annotations, true)
        .await
        .unwrap();

    assert_eq!(fixture.backend.contexts_created(), 1);
    assert_eq!(fixture.backend.replace_count(CellId::new(1)), 1);
    assert_eq!(fixture.kinds(1), vec![Some(OutputKind::Annotations)]);
    let runs = fixture.backend.runs(CellId::new(1));
    assert_eq!(runs.len(), 1);
    assert!(runs[0].started && !runs[0].ended);

    execution.end(Some(true), None).await.unwrap();
    assert_eq!(fixture.backend.contexts_created(), 1);
    assert!(fixture.backend.runs(CellId::new(1))[0].ended);
}

// =============================================================================
// Recovery
// =============================================================================

#[tokio::test]
async fn test_not_ready_and_declined_yields_none() {
    let fixture = Fixture::build(
        MemoryBackend::detached(),
        MemoryPrompt::declining(),
        StaticGenerator::all_panels(),
        CoordinatorConfig::default(),
    );
    let coordinator = fixture.cell(1);

    let execution = coordinator.create_execution().await.unwrap();
    assert!(execution.is_none());
    assert_eq!(fixture.prompt.prompts(), 1);
    assert_eq!(fixture.backend.contexts_created(), 0);
}

#[tokio::test]
async fn test_recovery_attaches_runner() {
    let backend = MemoryBackend::detached();
    let fixture = Fixture::build(
        backend.clone(),
        MemoryPrompt::attaching(backend),
        StaticGenerator::all_panels(),
        CoordinatorConfig::default(),
    );
    let coordinator = fixture.cell(1);

    let execution = coordinator.create_execution().await.unwrap();
    assert!(execution.is_some());
    assert_eq!(fixture.prompt.prompts(), 1);
    assert!(fixture.backend.is_ready());
    execution.unwrap().end(Some(true), None).await.unwrap();
}

#[tokio::test]
async fn test_recovery_retries_once() {
    let fixture = Fixture::build(
        MemoryBackend::detached(),
        MemoryPrompt::resolving(),
        StaticGenerator::all_panels(),
        CoordinatorConfig::default(),
    );
    let coordinator = fixture.cell(1);

    assert!(coordinator.create_execution().await.unwrap().is_none());
    assert_eq!(fixture.prompt.prompts(), 1);
}

#[tokio::test]
async fn test_backend_failure_propagates() {
    let fixture = Fixture::new();
    fixture.backend.fail_with(Some("runner crashed"));
    let coordinator = fixture.cell(1);

    let err = coordinator.create_execution().await.unwrap_err();
    assert!(matches!(err, Error::Backend(_)));
    assert_eq!(fixture.prompt.prompts(), 0);
}

#[tokio::test]
async fn test_refresh_without_runner_is_dropped() {
    let fixture = Fixture::build(
        MemoryBackend::detached(),
        MemoryPrompt::declining(),
        StaticGenerator::all_panels(),
        CoordinatorConfig::default(),
    );
    let coordinator = fixture.cell(1);

    coordinator
        .show_output(OutputKind::Annotations, true)
        .await
        .unwrap();
    assert_eq!(fixture.backend.replace_count(CellId::new(1)), 0);
    assert_eq!(fixture.prompt.prompts(), 1);
}

// =============================================================================
// Output surfaces
// =============================================================================

#[tokio::test]
async fn test_toggle_round_trip() {
    let fixture = Fixture::new();
    let coordinator = fixture.cell(1);
    let before = fixture.backend.outputs(CellId::new(1));

    coordinator.toggle_output(OutputKind::Annotations).await.unwrap();
    assert_eq!(fixture.kinds(1), vec![Some(OutputKind::Annotations)]);
    assert_eq!(
        fixture.backend.outputs(CellId::new(1))[0].text(),
        "annotations for c1"
    );

    coordinator.toggle_output(OutputKind::Annotations).await.unwrap();
    assert_eq!(fixture.backend.replace_count(CellId::new(1)), 2);
    assert_eq!(fixture.backend.outputs(CellId::new(1)), before);
    assert!(!coordinator.is_output_enabled(OutputKind::Annotations));
}

#[tokio::test]
async fn test_refresh_absent_kind_writes_nothing() {
    let fixture = Fixture::new();
    let coordinator = fixture.cell(1);

    coordinator
        .refresh_output_kinds(&[OutputKind::Deploy])
        .await
        .unwrap();
    assert_eq!(fixture.backend.replace_count(CellId::new(1)), 0);
    assert_eq!(fixture.backend.contexts_created(), 0);
}

#[tokio::test]
async fn test_refresh_present_kind_rewrites() {
    let fixture = Fixture::new();
    let coordinator = fixture.cell(1);
    coordinator.show_output(OutputKind::Deploy, true).await.unwrap();

    coordinator
        .refresh_output_kinds(&[OutputKind::Gcp, OutputKind::Deploy])
        .await
        .unwrap();
    assert_eq!(fixture.backend.replace_count(CellId::new(1)), 2);
}

#[tokio::test]
async fn test_external_edits_survive() {
    let fixture = Fixture::new();
    let coordinator = fixture.cell(1);
    coordinator.show_output(OutputKind::Annotations, true).await.unwrap();

    // Someone else adds a deploy panel to the live list.
    let mut live = fixture.backend.outputs(CellId::new(1));
    live.push(OutputItem::new(OutputKind::Deploy, "text/plain", "added elsewhere"));
    fixture.backend.set_outputs_externally(CellId::new(1), live);

    coordinator.toggle_output(OutputKind::Aws).await.unwrap();
    assert_eq!(
        fixture.kinds(1),
        vec![
            Some(OutputKind::Annotations),
            Some(OutputKind::Deploy),
            Some(OutputKind::Aws)
        ]
    );
    assert!(coordinator.is_output_enabled(OutputKind::Deploy));
}

#[tokio::test]
async fn test_generator_error_releases_mutex() {
    let fixture = Fixture::build(
        MemoryBackend::new(),
        MemoryPrompt::declining(),
        StaticGenerator::all_panels().with_failure(OutputKind::Gcp),
        CoordinatorConfig::default(),
    );
    let coordinator = fixture.cell(1);

    let err = coordinator
        .show_output(OutputKind::Gcp, true)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Generator { .. }));
    assert_eq!(fixture.backend.replace_count(CellId::new(1)), 0);

    tokio::time::timeout(WAIT, coordinator.show_output(OutputKind::Annotations, true))
        .await
        .expect("mutex must be released after a failed refresh")
        .unwrap();
    assert_eq!(fixture.kinds(1), vec![Some(OutputKind::Annotations)]);
}

#[tokio::test]
async fn test_concurrent_toggles_are_serialized() {
    let fixture = Fixture::new();
    let coordinator = fixture.cell(1);

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.toggle_output(OutputKind::Dagger).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(fixture.backend.replace_count(CellId::new(1)), 10);
    assert!(fixture.kinds(1).is_empty());
}

#[tokio::test]
async fn test_passthrough_outputs_follow_panels() {
    let fixture = Fixture::new();
    let coordinator = fixture.cell(1);
    coordinator.show_output(OutputKind::GitHub, true).await.unwrap();

    coordinator
        .replace_outputs(vec![OutputItem::passthrough("text/html", "<b>hi</b>")])
        .await
        .unwrap();

    let outputs = fixture.backend.outputs(CellId::new(1));
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs[0].kind, Some(OutputKind::GitHub));
    assert_eq!(outputs[1].kind, None);
    assert_eq!(outputs[1].mime, "text/html");
    assert_eq!(coordinator.passthrough_outputs(), vec![outputs[1].clone()]);
}

#[tokio::test]
async fn test_generator_sees_matching_state() {
    let fixture = Fixture::new();
    let coordinator = fixture.cell(1);
    coordinator.set_state(OutputKind::Annotations, "edited".to_string());

    coordinator
        .show_output(OutputKind::Annotations, true)
        .await
        .unwrap();
    assert_eq!(
        fixture.backend.outputs(CellId::new(1))[0].text(),
        "annotations for c1: edited"
    );

    // The generator's peek does not discard the cache.
    assert!(coordinator
        .get_cell_state::<String>(OutputKind::Annotations)
        .is_some());
}

// =============================================================================
// Terminal
// =============================================================================

#[tokio::test]
async fn test_terminal_requires_attachment() {
    let fixture = Fixture::new();
    let coordinator = fixture.cell(1);

    assert!(!coordinator.show_terminal(true).await.unwrap());
    assert!(!coordinator.toggle_terminal().await.unwrap());
    assert_eq!(fixture.backend.replace_count(CellId::new(1)), 0);
}

#[tokio::test]
async fn test_last_terminal_write_wins() {
    let fixture = Fixture::new();
    let coordinator = fixture.cell(1);
    coordinator.register_terminal(TerminalKind::Local);
    assert!(coordinator.show_terminal(true).await.unwrap());

    let execution = coordinator.create_execution().await.unwrap().unwrap();
    execution.start(None).await.unwrap();
    assert!(coordinator.write_terminal(b"building\n"));
    assert!(coordinator.write_terminal(b"done\n"));
    execution.end(Some(true), None).await.unwrap();

    let outputs = fixture.backend.outputs(CellId::new(1));
    let terminal = outputs.last().unwrap();
    assert_eq!(terminal.kind, Some(OutputKind::Terminal));
    assert_eq!(terminal.mime, TerminalKind::Local.mime());
    assert_eq!(terminal.text(), "building\ndone\n");
}

#[tokio::test]
async fn test_interactive_terminal_toggle() {
    let fixture = Fixture::new();
    let coordinator = fixture.cell(1);
    coordinator.register_terminal(TerminalKind::Interactive);
    coordinator.write_terminal(b"hello");

    assert!(coordinator.toggle_terminal().await.unwrap());
    assert!(coordinator.is_terminal_enabled());
    assert_eq!(fixture.kinds(1), vec![Some(OutputKind::Terminal)]);
    assert!(fixture.backend.outputs(CellId::new(1))[0].text().contains("hello"));

    coordinator
        .show_output(OutputKind::Terminal, false)
        .await
        .unwrap();
    assert!(!coordinator.is_terminal_enabled());
    assert!(fixture.kinds(1).is_empty());
}

// =============================================================================
// Sessions
// =============================================================================

#[tokio::test]
async fn test_session_order_invalidation() {
    let fixture = Fixture::new();
    let coordinator = fixture.cell(1);

    coordinator.set_session_execution_order("s1", 5);
    assert_eq!(coordinator.current_execution_order(), Some(5));

    assert!(coordinator.set_mru_session_id("s2"));
    assert_eq!(coordinator.current_execution_order(), None);

    coordinator.set_session_execution_order("s2", 1);
    assert_eq!(coordinator.current_execution_order(), Some(1));

    assert!(coordinator.set_mru_session_id("s1"));
    assert_eq!(coordinator.current_execution_order(), Some(5));
    assert_eq!(coordinator.mru_session_id().as_deref(), Some("s1"));
}

#[tokio::test]
async fn test_executions_are_stamped() {
    let fixture = Fixture::new();
    let coordinator = fixture.cell(1);
    coordinator.set_session_execution_order("s1", 5);

    for expected in [6, 7] {
        let execution = coordinator.create_execution().await.unwrap().unwrap();
        assert_eq!(execution.execution_order(), Some(expected));
        execution.start(None).await.unwrap();
        execution.end(Some(true), None).await.unwrap();
    }

    coordinator.set_mru_session_id("s2");
    let unstamped = coordinator.create_execution().await.unwrap().unwrap();
    assert_eq!(unstamped.execution_order(), None);
    unstamped.end(None, None).await.unwrap();

    let orders: Vec<_> = fixture
        .backend
        .runs(CellId::new(1))
        .iter()
        .map(|run| run.execution_order)
        .collect();
    assert_eq!(orders, vec![Some(6), Some(7), None]);
}

// =============================================================================
// Registry
// =============================================================================

#[tokio::test]
async fn test_cells_are_independent() {
    let fixture = Fixture::new();
    let first = fixture.cell(1);
    let second = fixture.cell(2);

    let hung = first.create_execution().await.unwrap().unwrap();
    let other = tokio::time::timeout(WAIT, second.create_execution())
        .await
        .expect("other cells must not wait on this one")
        .unwrap()
        .unwrap();

    other.end(Some(true), None).await.unwrap();
    hung.end(Some(true), None).await.unwrap();
    assert_eq!(fixture.backend.contexts_created(), 2);
}

#[tokio::test]
async fn test_registration_is_idempotent() {
    let fixture = Fixture::new();
    let cell = Cell::new(CellId::new(8));

    let first = fixture.registry.register_cell(&cell);
    let second = fixture.registry.register_cell(&cell);
    assert!(Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(&first, &fixture.registry.get_coordinator(&cell)));
}
