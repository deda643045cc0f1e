//! Per-cell output coordinator.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::FutureExt;
use tokio::sync::watch;

use crate::backend::{Collaborators, ExecutionContext, IntegrationState, Recovery};
use crate::cell::{Cell, OutputItem, OutputKind};
use crate::config::CoordinatorConfig;
use crate::error::{Error, Result};
use crate::execution::{ExecutionHandle, WeakExecutionHandle};
use crate::lock::SerialMutex;
use crate::terminal::{TerminalBuffer, TerminalKind};

use super::session::SessionOrders;

/// Mutable coordinator state.
///
/// Guarded by a plain mutex that is never held across an `.await`; the
/// ordering of refresh cycles is enforced separately by [`SerialMutex`].
struct OutputState {
    /// Enabled flag per tracked panel kind. Keys are fixed at construction.
    enabled: BTreeMap<OutputKind, bool>,
    /// Pass-through outputs appended verbatim.
    outputs: Vec<OutputItem>,
    current_execution: Option<WeakExecutionHandle>,
    /// Flips to `true` when the current execution has ended.
    finished: Option<watch::Receiver<bool>>,
    terminal: Option<TerminalBuffer>,
    terminal_enabled: bool,
    cell_state: Option<(OutputKind, IntegrationState)>,
    sessions: SessionOrders,
}

/// Everything a refresh needs once the state lock is released.
struct RefreshPlan {
    kinds: Vec<OutputKind>,
    cached: Option<(OutputKind, IntegrationState)>,
    terminal: Option<OutputItem>,
    passthrough: Vec<OutputItem>,
}

/// Coordinates executions and output surfaces for one cell.
///
/// Every change to the cell's output list goes through
/// `refresh_output_internal`, which runs under the coordinator's
/// [`SerialMutex`] and replaces the whole list in one write. Executions are
/// strictly sequential: `create_execution` does not create a new context until
/// the previous execution has ended.
pub struct OutputCoordinator {
    this: Weak<OutputCoordinator>,
    cell: Cell,
    stable_id: String,
    collaborators: Collaborators,
    config: Arc<CoordinatorConfig>,
    mutex: SerialMutex,
    /// Serializes `create_execution` callers against each other.
    creation: tokio::sync::Mutex<()>,
    state: Mutex<OutputState>,
}

impl OutputCoordinator {
    pub fn new(
        cell: Cell,
        collaborators: Collaborators,
        config: Arc<CoordinatorConfig>,
    ) -> Arc<Self> {
        let enabled = config
            .panels
            .iter()
            .filter(|kind| kind.is_panel())
            .map(|kind| (*kind, false))
            .collect();

        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            stable_id: cell.stable_id(),
            cell,
            collaborators,
            config,
            mutex: SerialMutex::new(),
            creation: tokio::sync::Mutex::new(()),
            state: Mutex::new(OutputState {
                enabled,
                outputs: Vec::new(),
                current_execution: None,
                finished: None,
                terminal: None,
                terminal_enabled: false,
                cell_state: None,
                sessions: SessionOrders::new(),
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, OutputState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cell(&self) -> &Cell {
        &self.cell
    }

    pub fn stable_id(&self) -> &str {
        &self.stable_id
    }

    // =========================================================================
    // Executions
    // =========================================================================

    /// Create the next execution of this cell.
    ///
    /// Waits for the previous execution to end first. Returns `Ok(None)` when
    /// no runner is attached and the user declined to attach one.
    pub async fn create_execution(&self) -> Result<Option<ExecutionHandle>> {
        let _creating = self.wait_for_turn().await?;

        let Some(context) = self.new_context().await? else {
            return Ok(None);
        };
        let handle = ExecutionHandle::new(self.cell.id(), context);

        // Final refresh before the run is reported over, so the last write wins.
        let coordinator = self.this.clone();
        handle.on_will_end(move || {
            async move {
                match coordinator.upgrade() {
                    Some(coordinator) => coordinator.refresh_output().await,
                    None => Ok(()),
                }
            }
            .boxed()
        });

        // The sender lives in the hook list; if the handle is dropped without
        // ending, the sender goes with it and waiters are released.
        let (finished_tx, finished_rx) = watch::channel(false);
        let coordinator = self.this.clone();
        let weak_handle = handle.downgrade();
        handle.on_end(move || {
            if let Some(coordinator) = coordinator.upgrade() {
                coordinator.clear_current_execution(&weak_handle);
            }
            finished_tx.send_replace(true);
            Ok(())
        })?;

        let order = self.state().sessions.next_order();
        if let Some(order) = order {
            handle.set_execution_order(order).await;
            tracing::debug!(cell = %self.stable_id, order, "Stamped execution order");
        }

        {
            let mut state = self.state();
            state.current_execution = Some(handle.downgrade());
            state.finished = Some(finished_rx);
        }

        tracing::debug!(cell = %self.stable_id, "Created execution");
        Ok(Some(handle))
    }

    /// The live execution, if one exists and has not ended.
    pub fn current_execution(&self) -> Option<ExecutionHandle> {
        let current = self.state().current_execution.clone();
        current
            .and_then(|weak| weak.upgrade())
            .filter(|handle| !handle.has_ended())
    }

    fn clear_current_execution(&self, ended: &WeakExecutionHandle) {
        let mut state = self.state();
        if state
            .current_execution
            .as_ref()
            .is_some_and(|current| current.ptr_eq(ended))
        {
            state.current_execution = None;
        }
    }

    /// Take the creation lock, then wait for the previous execution to end.
    ///
    /// `finish_timeout` bounds both steps together, so a caller queued behind
    /// other callers still fails once the timeout has elapsed since it asked.
    async fn wait_for_turn(&self) -> Result<tokio::sync::MutexGuard<'_, ()>> {
        let turn = async {
            let creating = self.creation.lock().await;
            self.wait_for_finish().await;
            creating
        };

        match self.config.finish_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, turn).await.map_err(|_| {
                tracing::warn!(
                    cell = %self.stable_id,
                    ?timeout,
                    "Previous execution did not finish in time"
                );
                Error::ExecutionTimeout(self.cell.id())
            }),
            None => Ok(turn.await),
        }
    }

    async fn wait_for_finish(&self) {
        let finished = self.state().finished.clone();
        if let Some(mut finished) = finished {
            // A closed channel means the execution was dropped without ending.
            let _ = finished.wait_for(|done| *done).await;
        }
    }

    /// Obtain a fresh context, prompting once for recovery when no runner is ready.
    async fn new_context(&self) -> Result<Option<Box<dyn ExecutionContext>>> {
        let backend = &self.collaborators.backend;
        match backend.create_context(&self.cell).await {
            Ok(context) => Ok(Some(context)),
            Err(e) if e.is_not_ready() => {
                tracing::warn!(cell = %self.stable_id, "No runner attached: {}", e);
                match self.collaborators.prompt.prompt_for_recovery().await {
                    Recovery::Declined => {
                        tracing::debug!(cell = %self.stable_id, "Runner selection declined");
                        Ok(None)
                    }
                    Recovery::Resolved => match backend.create_context(&self.cell).await {
                        Ok(context) => Ok(Some(context)),
                        Err(e) if e.is_not_ready() => {
                            tracing::warn!(
                                cell = %self.stable_id,
                                "Runner still not ready after recovery: {}",
                                e
                            );
                            Ok(None)
                        }
                        Err(e) => Err(e),
                    },
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Write `outputs` through the live execution, or through a throwaway one.
    async fn write_outputs(&self, outputs: Vec<OutputItem>) -> Result<()> {
        if let Some(handle) = self.current_execution() {
            return handle.replace_outputs(outputs).await;
        }

        let Some(mut context) = self.new_context().await? else {
            tracing::warn!(
                cell = %self.stable_id,
                "Dropping output refresh: no execution context available"
            );
            return Ok(());
        };
        context.start(None).await;
        let result = context.replace_outputs(outputs).await;
        context.end(None, None).await;
        result
    }

    // =========================================================================
    // Output surfaces
    // =========================================================================

    /// Resync flags from the live output list, apply `mutator`, then rewrite the
    /// whole list. Returns whether a write happened.
    async fn refresh_output_internal<F>(&self, mutator: F) -> Result<bool>
    where
        F: FnOnce(&mut OutputState) -> bool + Send,
    {
        self.mutex.with_lock(|| self.refresh_locked(mutator)).await
    }

    async fn refresh_locked<F>(&self, mutator: F) -> Result<bool>
    where
        F: FnOnce(&mut OutputState) -> bool + Send,
    {
        let plan = {
            let mut state = self.state();
            self.resync(&mut state);
            if !mutator(&mut *state) {
                return Ok(false);
            }
            RefreshPlan {
                kinds: state
                    .enabled
                    .iter()
                    .filter(|(_, enabled)| **enabled)
                    .map(|(kind, _)| *kind)
                    .collect(),
                cached: state.cell_state.clone(),
                terminal: if state.terminal_enabled {
                    state.terminal.as_ref().map(TerminalBuffer::to_output)
                } else {
                    None
                },
                passthrough: state.outputs.clone(),
            }
        };

        let mut outputs = Vec::new();
        for kind in plan.kinds {
            let cached = plan
                .cached
                .as_ref()
                .filter(|(tag, _)| *tag == kind)
                .map(|(_, state)| state.clone());
            if let Some(item) = self
                .collaborators
                .generator
                .generate(kind, &self.cell, cached)
                .await?
            {
                outputs.push(item);
            }
        }
        outputs.extend(plan.terminal);
        outputs.extend(plan.passthrough);

        tracing::debug!(cell = %self.stable_id, items = outputs.len(), "Replacing outputs");
        self.write_outputs(outputs).await?;
        Ok(true)
    }

    /// Re-derive enabled flags from what is actually in the cell's output list.
    fn resync(&self, state: &mut OutputState) {
        let backend = &self.collaborators.backend;
        for (kind, enabled) in state.enabled.iter_mut() {
            *enabled = backend.has_output_kind(&self.cell, *kind);
        }
        if state.terminal.is_some() {
            state.terminal_enabled = backend.has_output_kind(&self.cell, OutputKind::Terminal);
        }
    }

    /// Show or hide an output surface.
    pub async fn show_output(&self, kind: OutputKind, enabled: bool) -> Result<()> {
        self.show_output_with(kind, move |_| enabled).await
    }

    /// Set a surface's visibility from its current (resynced) visibility.
    pub async fn show_output_with<F>(&self, kind: OutputKind, predicate: F) -> Result<()>
    where
        F: FnOnce(bool) -> bool + Send,
    {
        if kind == OutputKind::Terminal {
            self.update_terminal(predicate).await?;
            return Ok(());
        }

        let stable_id = &self.stable_id;
        self.refresh_output_internal(move |state| match state.enabled.get_mut(&kind) {
            Some(enabled) => {
                *enabled = predicate(*enabled);
                true
            }
            None => {
                tracing::warn!(cell = %stable_id, %kind, "Output kind is not tracked");
                false
            }
        })
        .await?;
        Ok(())
    }

    pub async fn toggle_output(&self, kind: OutputKind) -> Result<()> {
        self.show_output_with(kind, |enabled| !enabled).await
    }

    /// Show or hide the terminal. Returns `false` when no terminal is attached.
    pub async fn show_terminal(&self, visible: bool) -> Result<bool> {
        self.update_terminal(move |_| visible).await
    }

    /// Flip terminal visibility. Returns `false` when no terminal is attached.
    pub async fn toggle_terminal(&self) -> Result<bool> {
        self.update_terminal(|visible| !visible).await
    }

    async fn update_terminal<F>(&self, predicate: F) -> Result<bool>
    where
        F: FnOnce(bool) -> bool + Send,
    {
        if self.state().terminal.is_none() {
            return Ok(false);
        }
        self.refresh_output_internal(move |state| {
            if state.terminal.is_none() {
                return false;
            }
            state.terminal_enabled = predicate(state.terminal_enabled);
            true
        })
        .await?;
        Ok(true)
    }

    /// Rewrite the output list from current state.
    pub async fn refresh_output(&self) -> Result<()> {
        self.refresh_output_internal(|_| true).await?;
        Ok(())
    }

    /// Rewrite the output list only if one of `kinds` is currently shown.
    pub async fn refresh_output_kinds(&self, kinds: &[OutputKind]) -> Result<()> {
        let backend = &self.collaborators.backend;
        let cell = &self.cell;
        self.refresh_output_internal(move |_| {
            kinds.iter().any(|kind| backend.has_output_kind(cell, *kind))
        })
        .await?;
        Ok(())
    }

    /// Set the pass-through outputs and rewrite the list.
    pub async fn replace_outputs(&self, outputs: Vec<OutputItem>) -> Result<()> {
        self.refresh_output_internal(move |state| {
            state.outputs = outputs;
            true
        })
        .await?;
        Ok(())
    }

    /// Snapshot of the enabled flag per tracked kind, as of the last refresh.
    pub fn enabled_outputs(&self) -> Vec<(OutputKind, bool)> {
        self.state()
            .enabled
            .iter()
            .map(|(kind, enabled)| (*kind, *enabled))
            .collect()
    }

    pub fn is_output_enabled(&self, kind: OutputKind) -> bool {
        if kind == OutputKind::Terminal {
            return self.is_terminal_enabled();
        }
        self.state().enabled.get(&kind).copied().unwrap_or(false)
    }

    pub fn is_terminal_enabled(&self) -> bool {
        let state = self.state();
        state.terminal.is_some() && state.terminal_enabled
    }

    /// Pass-through outputs last set with [`replace_outputs`](Self::replace_outputs).
    pub fn passthrough_outputs(&self) -> Vec<OutputItem> {
        self.state().outputs.clone()
    }

    // =========================================================================
    // Terminal
    // =========================================================================

    /// Attach a new terminal of `kind`, sized from configuration.
    pub fn register_terminal(&self, kind: TerminalKind) {
        let buffer = TerminalBuffer::from_config(kind, &self.config.terminal);
        self.attach_terminal(buffer);
    }

    /// Attach `buffer`, replacing any previous terminal.
    pub fn attach_terminal(&self, buffer: TerminalBuffer) {
        tracing::debug!(cell = %self.stable_id, kind = %buffer.output_kind(), "Attached terminal");
        self.state().terminal = Some(buffer);
    }

    pub fn terminal_kind(&self) -> Option<TerminalKind> {
        self.state().terminal.as_ref().map(TerminalBuffer::output_kind)
    }

    /// Feed process output into the terminal. Returns `false` when none is attached.
    pub fn write_terminal(&self, data: &[u8]) -> bool {
        match self.state().terminal.as_mut() {
            Some(terminal) => {
                terminal.write(data);
                true
            }
            None => false,
        }
    }

    // =========================================================================
    // Integration state
    // =========================================================================

    /// Cache `value` as the integration state of `kind`, replacing any other.
    pub fn set_state<T: Any + Send + Sync>(&self, kind: OutputKind, value: T) {
        self.state().cell_state = Some((kind, Arc::new(value)));
    }

    /// Cached integration state for `kind`.
    ///
    /// Asking for a different kind than the cached one discards the cache.
    pub fn get_cell_state<T: Any + Send + Sync>(&self, kind: OutputKind) -> Option<Arc<T>> {
        let mut state = self.state();
        let tag = state.cell_state.as_ref().map(|(tag, _)| *tag)?;
        if tag != kind {
            state.cell_state = None;
            return None;
        }
        state
            .cell_state
            .as_ref()
            .and_then(|(_, value)| value.clone().downcast::<T>().ok())
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Bind to session `id`. Returns whether the session changed.
    pub fn set_mru_session_id(&self, id: &str) -> bool {
        let changed = self.state().sessions.set_mru_session_id(id);
        if changed {
            tracing::debug!(cell = %self.stable_id, session = id, "Session changed");
        }
        changed
    }

    pub fn mru_session_id(&self) -> Option<String> {
        self.state().sessions.mru_session_id().map(str::to_string)
    }

    /// Record the last execution order seen in session `id`.
    pub fn set_session_execution_order(&self, id: &str, order: u64) {
        self.state().sessions.set_execution_order(id, order);
        tracing::debug!(cell = %self.stable_id, session = id, order, "Recorded execution order");
    }

    /// Last execution order in the current session, if known.
    pub fn current_execution_order(&self) -> Option<u64> {
        self.state().sessions.current_order()
    }
}
