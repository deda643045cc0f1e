//! Execution handles.
//!
//! An [`ExecutionHandle`] wraps one run of a cell: it owns the
//! [`ExecutionContext`] borrowed from the backend and drives the
//! `Created -> Running -> Ended` lifecycle, running hooks around the end.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::SystemTime;

use futures::future::BoxFuture;

use crate::backend::ExecutionContext;
use crate::cell::{CellId, OutputItem};
use crate::error::{Error, Result};

/// Hook run before the underlying context is told the run is over.
///
/// Will-end hooks may still write outputs through the handle.
pub type WillEndHook = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Hook run after the underlying context has ended. Bookkeeping only.
pub type EndHook = Box<dyn FnOnce() -> Result<()> + Send>;

/// Lifecycle phase of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPhase {
    Created,
    Running,
    /// `end` is running hooks or the delegate end call.
    Ending,
    Ended,
}

struct Lifecycle {
    phase: ExecutionPhase,
    will_end: Vec<WillEndHook>,
    /// Set once will-end hooks have been drained; later registrations are refused.
    will_end_closed: bool,
    on_end: Vec<EndHook>,
    execution_order: Option<u64>,
}

struct HandleInner {
    cell_id: CellId,
    context: tokio::sync::Mutex<Box<dyn ExecutionContext>>,
    lifecycle: Mutex<Lifecycle>,
}

impl HandleInner {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        let phase = self.lifecycle().phase;
        if phase != ExecutionPhase::Ended {
            tracing::warn!(cell = %self.cell_id, ?phase, "Execution dropped before it ended");
        }
    }
}

/// Handle to one run of a cell.
///
/// Cloning is cheap; all clones drive the same run.
#[derive(Clone)]
pub struct ExecutionHandle {
    inner: Arc<HandleInner>,
}

impl ExecutionHandle {
    /// Wrap a freshly created context.
    pub fn new(cell_id: CellId, context: Box<dyn ExecutionContext>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                cell_id,
                context: tokio::sync::Mutex::new(context),
                lifecycle: Mutex::new(Lifecycle {
                    phase: ExecutionPhase::Created,
                    will_end: Vec::new(),
                    will_end_closed: false,
                    on_end: Vec::new(),
                    execution_order: None,
                }),
            }),
        }
    }

    pub fn cell_id(&self) -> CellId {
        self.inner.cell_id
    }

    pub fn phase(&self) -> ExecutionPhase {
        self.inner.lifecycle().phase
    }

    pub fn has_ended(&self) -> bool {
        self.phase() == ExecutionPhase::Ended
    }

    /// Order stamped on this run, if any.
    pub fn execution_order(&self) -> Option<u64> {
        self.inner.lifecycle().execution_order
    }

    /// Whether both handles drive the same run.
    pub fn ptr_eq(&self, other: &ExecutionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn downgrade(&self) -> WeakExecutionHandle {
        WeakExecutionHandle(Arc::downgrade(&self.inner))
    }

    /// Start the run. Must be called exactly once, from `Created`.
    pub async fn start(&self, time: Option<SystemTime>) -> Result<()> {
        {
            let mut lifecycle = self.inner.lifecycle();
            if lifecycle.phase != ExecutionPhase::Created {
                return Err(Error::InvalidOperation(format!(
                    "cannot start execution of {} in phase {:?}",
                    self.inner.cell_id, lifecycle.phase
                )));
            }
            lifecycle.phase = ExecutionPhase::Running;
        }

        self.inner.context.lock().await.start(time).await;
        tracing::debug!(cell = %self.inner.cell_id, "Execution started");
        Ok(())
    }

    /// End the run.
    ///
    /// Runs will-end hooks, then the context's end, then end hooks, then marks
    /// the handle ended. A failing hook does not stop the sequence; the first
    /// failure is returned once the handle has ended.
    pub async fn end(&self, success: Option<bool>, time: Option<SystemTime>) -> Result<()> {
        {
            let mut lifecycle = self.inner.lifecycle();
            match lifecycle.phase {
                ExecutionPhase::Created | ExecutionPhase::Running => {
                    lifecycle.phase = ExecutionPhase::Ending;
                }
                phase => {
                    return Err(Error::InvalidOperation(format!(
                        "cannot end execution of {} in phase {:?}",
                        self.inner.cell_id, phase
                    )));
                }
            }
        }

        let mut first_error: Option<Error> = None;

        // Hooks may register further hooks; drain until empty.
        loop {
            let hooks = {
                let mut lifecycle = self.inner.lifecycle();
                if lifecycle.will_end.is_empty() {
                    lifecycle.will_end_closed = true;
                    break;
                }
                std::mem::take(&mut lifecycle.will_end)
            };
            for hook in hooks {
                if let Err(e) = hook().await {
                    tracing::warn!(cell = %self.inner.cell_id, "Will-end hook failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        self.inner.context.lock().await.end(success, time).await;

        loop {
            let hooks = {
                let mut lifecycle = self.inner.lifecycle();
                if lifecycle.on_end.is_empty() {
                    lifecycle.phase = ExecutionPhase::Ended;
                    break;
                }
                std::mem::take(&mut lifecycle.on_end)
            };
            for hook in hooks {
                if let Err(e) = hook() {
                    tracing::warn!(cell = %self.inner.cell_id, "End hook failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        tracing::debug!(cell = %self.inner.cell_id, ?success, "Execution ended");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Register a hook to run at the start of `end`.
    ///
    /// Returns `false` (dropping the hook) when will-end hooks have already run.
    pub fn on_will_end<F>(&self, hook: F) -> bool
    where
        F: FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
    {
        let mut lifecycle = self.inner.lifecycle();
        if lifecycle.will_end_closed {
            return false;
        }
        lifecycle.will_end.push(Box::new(hook));
        true
    }

    /// Register a hook to run after the context has ended.
    ///
    /// If the handle has already ended the hook runs immediately.
    pub fn on_end<F>(&self, hook: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        {
            let mut lifecycle = self.inner.lifecycle();
            if lifecycle.phase != ExecutionPhase::Ended {
                lifecycle.on_end.push(Box::new(hook));
                return Ok(());
            }
        }
        hook()
    }

    /// Replace the cell's output list through this run's context.
    pub async fn replace_outputs(&self, outputs: Vec<OutputItem>) -> Result<()> {
        self.inner.context.lock().await.replace_outputs(outputs).await
    }

    /// Stamp this run with an explicit execution order.
    pub async fn set_execution_order(&self, order: u64) {
        self.inner.context.lock().await.set_execution_order(order);
        self.inner.lifecycle().execution_order = Some(order);
    }
}

impl fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lifecycle = self.inner.lifecycle();
        f.debug_struct("ExecutionHandle")
            .field("cell_id", &self.inner.cell_id)
            .field("phase", &lifecycle.phase)
            .field("execution_order", &lifecycle.execution_order)
            .finish()
    }
}

/// Non-owning reference to an execution, held by its coordinator.
#[derive(Clone)]
pub(crate) struct WeakExecutionHandle(Weak<HandleInner>);

impl WeakExecutionHandle {
    pub(crate) fn upgrade(&self) -> Option<ExecutionHandle> {
        self.0.upgrade().map(|inner| ExecutionHandle { inner })
    }

    pub(crate) fn ptr_eq(&self, other: &WeakExecutionHandle) -> bool {
        Weak::ptr_eq(&self.0, &other.0)
    }
}
