//! Collaborator interfaces the engine calls through.
//!
//! The engine never runs programs, renders outputs or talks to the user
//! itself. It reaches the outside world only through these traits:
//!
//! - [`ExecutionBackend`] creates per-run [`ExecutionContext`]s and answers
//!   "is this kind currently in the cell's output list?"
//! - [`RecoveryPrompt`] asks the user to attach a runner when none is ready.
//! - [`OutputGenerator`] produces the payload for each output kind.

use std::any::Any;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;

use crate::cell::{Cell, OutputItem, OutputKind};
use crate::error::Result;

/// Opaque integration payload cached per cell, tagged by [`OutputKind`].
pub type IntegrationState = Arc<dyn Any + Send + Sync>;

/// Source of execution contexts for cells.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Create a fresh context for one run of `cell`.
    ///
    /// Fails with [`Error::NotReady`](crate::Error::NotReady) when no runner
    /// is attached.
    async fn create_context(&self, cell: &Cell) -> Result<Box<dyn ExecutionContext>>;

    /// Whether `kind` is present in the cell's live output list.
    fn has_output_kind(&self, cell: &Cell, kind: OutputKind) -> bool;
}

/// One run of a cell as seen by the execution framework.
#[async_trait]
pub trait ExecutionContext: Send {
    async fn start(&mut self, time: Option<SystemTime>);

    async fn end(&mut self, success: Option<bool>, time: Option<SystemTime>);

    /// Replace the cell's whole output list in one operation.
    async fn replace_outputs(&mut self, outputs: Vec<OutputItem>) -> Result<()>;

    /// Stamp the run with an explicit execution order.
    fn set_execution_order(&mut self, order: u64);
}

/// Outcome of asking the user to attach a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    Resolved,
    Declined,
}

/// Prompts the user to select or attach a runner.
#[async_trait]
pub trait RecoveryPrompt: Send + Sync {
    async fn prompt_for_recovery(&self) -> Recovery;
}

/// Produces the current payload for an output kind.
#[async_trait]
pub trait OutputGenerator: Send + Sync {
    /// Payload for `kind`, or `None` when the kind has nothing to show.
    ///
    /// `state` is the cell's cached integration state when its tag is `kind`.
    async fn generate(
        &self,
        kind: OutputKind,
        cell: &Cell,
        state: Option<IntegrationState>,
    ) -> Result<Option<OutputItem>>;
}

/// The collaborator set shared by every coordinator of a notebook.
#[derive(Clone)]
pub struct Collaborators {
    pub backend: Arc<dyn ExecutionBackend>,
    pub prompt: Arc<dyn RecoveryPrompt>,
    pub generator: Arc<dyn OutputGenerator>,
}

impl Collaborators {
    pub fn new(
        backend: Arc<dyn ExecutionBackend>,
        prompt: Arc<dyn RecoveryPrompt>,
        generator: Arc<dyn OutputGenerator>,
    ) -> Self {
        Self {
            backend,
            prompt,
            generator,
        }
    }
}
