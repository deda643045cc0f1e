//! In-process implementations of every collaborator.
//!
//! [`MemoryBackend`] keeps each cell's live output list and a record of every
//! run in memory. It backs the `runbook` CLI and the test suites.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use async_trait::async_trait;
use rustc_hash::FxHashMap;

use crate::backend::{
    ExecutionBackend, ExecutionContext, IntegrationState, OutputGenerator, Recovery,
    RecoveryPrompt,
};
use crate::cell::{Cell, CellId, OutputItem, OutputKind};
use crate::error::{Error, Result};

/// What happened to one run of a cell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunRecord {
    pub started: bool,
    pub ended: bool,
    pub success: Option<bool>,
    pub execution_order: Option<u64>,
}

/// Everything the backend knows about one cell.
#[derive(Debug, Clone, Default)]
pub struct CellRecord {
    /// Live output list.
    pub outputs: Vec<OutputItem>,
    /// Number of `replace_outputs` calls made by contexts.
    pub replace_count: usize,
    /// One entry per created context, in creation order.
    pub runs: Vec<RunRecord>,
}

struct Shared {
    ready: AtomicBool,
    contexts_created: AtomicUsize,
    failure: Mutex<Option<String>>,
    cells: Mutex<FxHashMap<CellId, CellRecord>>,
}

/// Execution backend that runs nothing and records everything.
#[derive(Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// A backend with a runner attached.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                ready: AtomicBool::new(true),
                contexts_created: AtomicUsize::new(0),
                failure: Mutex::new(None),
                cells: Mutex::new(FxHashMap::default()),
            }),
        }
    }

    /// A backend with no runner attached; context creation fails with `NotReady`.
    pub fn detached() -> Self {
        let backend = Self::new();
        backend.set_ready(false);
        backend
    }

    pub fn set_ready(&self, ready: bool) {
        self.shared.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::SeqCst)
    }

    /// Make context creation fail with `Error::Backend(message)`, or clear the failure.
    pub fn fail_with(&self, message: Option<&str>) {
        *lock(&self.shared.failure) = message.map(str::to_string);
    }

    /// Total contexts handed out, across all cells.
    pub fn contexts_created(&self) -> usize {
        self.shared.contexts_created.load(Ordering::SeqCst)
    }

    pub fn record(&self, cell_id: CellId) -> CellRecord {
        lock(&self.shared.cells)
            .get(&cell_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn outputs(&self, cell_id: CellId) -> Vec<OutputItem> {
        self.record(cell_id).outputs
    }

    pub fn replace_count(&self, cell_id: CellId) -> usize {
        self.record(cell_id).replace_count
    }

    pub fn runs(&self, cell_id: CellId) -> Vec<RunRecord> {
        self.record(cell_id).runs
    }

    /// Overwrite a cell's live outputs as if edited outside the engine.
    pub fn set_outputs_externally(&self, cell_id: CellId, outputs: Vec<OutputItem>) {
        lock(&self.shared.cells).entry(cell_id).or_default().outputs = outputs;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl ExecutionBackend for MemoryBackend {
    async fn create_context(&self, cell: &Cell) -> Result<Box<dyn ExecutionContext>> {
        if let Some(message) = lock(&self.shared.failure).clone() {
            return Err(Error::Backend(message));
        }
        if !self.is_ready() {
            return Err(Error::NotReady("no runner attached".to_string()));
        }

        self.shared.contexts_created.fetch_add(1, Ordering::SeqCst);
        let run = {
            let mut cells = lock(&self.shared.cells);
            let record = cells.entry(cell.id()).or_default();
            record.runs.push(RunRecord::default());
            record.runs.len() - 1
        };

        Ok(Box::new(MemoryContext {
            cell_id: cell.id(),
            run,
            shared: self.shared.clone(),
        }))
    }

    fn has_output_kind(&self, cell: &Cell, kind: OutputKind) -> bool {
        lock(&self.shared.cells)
            .get(&cell.id())
            .is_some_and(|record| record.outputs.iter().any(|o| o.kind == Some(kind)))
    }
}

/// Context for one run against a [`MemoryBackend`].
pub struct MemoryContext {
    cell_id: CellId,
    run: usize,
    shared: Arc<Shared>,
}

impl MemoryContext {
    fn update(&self, f: impl FnOnce(&mut CellRecord)) {
        let mut cells = lock(&self.shared.cells);
        f(cells.entry(self.cell_id).or_default());
    }

    fn update_run(&self, f: impl FnOnce(&mut RunRecord)) {
        let run = self.run;
        self.update(|record| {
            if let Some(entry) = record.runs.get_mut(run) {
                f(entry);
            }
        });
    }
}

#[async_trait]
impl ExecutionContext for MemoryContext {
    async fn start(&mut self, _time: Option<SystemTime>) {
        self.update_run(|run| run.started = true);
    }

    async fn end(&mut self, success: Option<bool>, _time: Option<SystemTime>) {
        self.update_run(|run| {
            run.ended = true;
            run.success = success;
        });
    }

    async fn replace_outputs(&mut self, outputs: Vec<OutputItem>) -> Result<()> {
        self.update(|record| {
            record.outputs = outputs;
            record.replace_count += 1;
        });
        Ok(())
    }

    fn set_execution_order(&mut self, order: u64) {
        self.update_run(|run| run.execution_order = Some(order));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PromptBehavior {
    Attach,
    Resolve,
    Decline,
}

/// Recovery prompt with a scripted answer.
pub struct MemoryPrompt {
    behavior: PromptBehavior,
    backend: Option<MemoryBackend>,
    prompts: AtomicUsize,
}

impl MemoryPrompt {
    /// Attach the runner to `backend`, then resolve.
    pub fn attaching(backend: MemoryBackend) -> Self {
        Self {
            behavior: PromptBehavior::Attach,
            backend: Some(backend),
            prompts: AtomicUsize::new(0),
        }
    }

    /// Resolve without attaching anything.
    pub fn resolving() -> Self {
        Self {
            behavior: PromptBehavior::Resolve,
            backend: None,
            prompts: AtomicUsize::new(0),
        }
    }

    pub fn declining() -> Self {
        Self {
            behavior: PromptBehavior::Decline,
            backend: None,
            prompts: AtomicUsize::new(0),
        }
    }

    /// Number of prompts shown.
    pub fn prompts(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecoveryPrompt for MemoryPrompt {
    async fn prompt_for_recovery(&self) -> Recovery {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            PromptBehavior::Attach => {
                if let Some(ref backend) = self.backend {
                    backend.set_ready(true);
                }
                Recovery::Resolved
            }
            PromptBehavior::Resolve => Recovery::Resolved,
            PromptBehavior::Decline => Recovery::Declined,
        }
    }
}

/// Generator producing a `text/plain` payload for a fixed set of kinds.
#[derive(Debug, Clone, Default)]
pub struct StaticGenerator {
    kinds: Vec<OutputKind>,
    failing: Option<OutputKind>,
}

impl StaticGenerator {
    pub fn new(kinds: impl IntoIterator<Item = OutputKind>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
            failing: None,
        }
    }

    /// Generates every panel kind.
    pub fn all_panels() -> Self {
        Self::new(OutputKind::PANELS)
    }

    /// Fail whenever `kind` is generated.
    pub fn with_failure(mut self, kind: OutputKind) -> Self {
        self.failing = Some(kind);
        self
    }
}

#[async_trait]
impl OutputGenerator for StaticGenerator {
    async fn generate(
        &self,
        kind: OutputKind,
        cell: &Cell,
        state: Option<IntegrationState>,
    ) -> Result<Option<OutputItem>> {
        if self.failing == Some(kind) {
            return Err(Error::Generator {
                kind: kind.to_string(),
                message: "generator configured to fail".to_string(),
            });
        }
        if !self.kinds.contains(&kind) {
            return Ok(None);
        }

        let mut text = format!("{} for {}", kind, cell.stable_id());
        if let Some(detail) = state.as_ref().and_then(|s| s.downcast_ref::<String>()) {
            text.push_str(": ");
            text.push_str(detail);
        }
        Ok(Some(OutputItem::new(kind, "text/plain", text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_detached_backend_not_ready() {
        let backend = MemoryBackend::detached();
        let cell = Cell::new(CellId::new(0));
        let err = backend.create_context(&cell).await.err().unwrap();
        assert!(err.is_not_ready());
        assert_eq!(backend.contexts_created(), 0);
    }

    #[tokio::test]
    async fn test_context_records_run() {
        let backend = MemoryBackend::new();
        let cell = Cell::new(CellId::new(0));

        let mut context = backend.create_context(&cell).await.unwrap();
        context.set_execution_order(3);
        context.start(None).await;
        context
            .replace_outputs(vec![OutputItem::new(OutputKind::Aws, "text/plain", "x")])
            .await
            .unwrap();
        context.end(Some(true), None).await;

        assert!(backend.has_output_kind(&cell, OutputKind::Aws));
        assert!(!backend.has_output_kind(&cell, OutputKind::Gcp));
        assert_eq!(backend.replace_count(cell.id()), 1);
        assert_eq!(
            backend.runs(cell.id()),
            vec![RunRecord {
                started: true,
                ended: true,
                success: Some(true),
                execution_order: Some(3),
            }]
        );
    }

    #[tokio::test]
    async fn test_configured_failure() {
        let backend = MemoryBackend::new();
        backend.fail_with(Some("runner crashed"));
        let err = backend
            .create_context(&Cell::new(CellId::new(0)))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Backend(ref m) if m == "runner crashed"));
    }

    #[tokio::test]
    async fn test_attaching_prompt() {
        let backend = MemoryBackend::detached();
        let prompt = MemoryPrompt::attaching(backend.clone());
        assert_eq!(prompt.prompt_for_recovery().await, Recovery::Resolved);
        assert!(backend.is_ready());
        assert_eq!(prompt.prompts(), 1);
    }

    #[tokio::test]
    async fn test_static_generator() {
        let generator = StaticGenerator::new([OutputKind::Annotations]);
        let cell = Cell::new(CellId::new(2)).with_metadata("id", "abc");

        let state: IntegrationState = Arc::new("edited".to_string());
        let item = generator
            .generate(OutputKind::Annotations, &cell, Some(state))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.text(), "annotations for abc: edited");

        let none = generator
            .generate(OutputKind::Deploy, &cell, None)
            .await
            .unwrap();
        assert!(none.is_none());
    }
}
