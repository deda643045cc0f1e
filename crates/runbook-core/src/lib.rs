//! Cell execution and output coordination engine for Runbook notebooks.
//!
//! This crate provides:
//! - Per-cell output coordinators that serialize output rewrites
//! - Execution handles with will-end/end hooks
//! - A registry mapping open cells to their coordinators
//! - Session-aware execution order tracking
//! - Interactive (vt100) and local terminal buffers
//! - An in-memory runner implementing every collaborator

pub mod backend;
pub mod cell;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod execution;
pub mod lock;
pub mod memory;
pub mod terminal;

pub use backend::{
    Collaborators, ExecutionBackend, ExecutionContext, IntegrationState, OutputGenerator,
    Recovery, RecoveryPrompt,
};
pub use cell::{Cell, CellId, OutputItem, OutputKind};
pub use config::{CoordinatorConfig, TerminalConfig};
pub use coordinator::{CoordinatorRegistry, OutputCoordinator, SessionOrders};
pub use error::{Error, Result};
pub use execution::{EndHook, ExecutionHandle, ExecutionPhase, WillEndHook};
pub use lock::SerialMutex;
pub use memory::{MemoryBackend, MemoryPrompt, StaticGenerator};
pub use terminal::{TerminalBuffer, TerminalKind};
