//! Registry of per-cell coordinators.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rustc_hash::FxHashMap;

use crate::backend::Collaborators;
use crate::cell::{Cell, CellId};
use crate::config::CoordinatorConfig;

use super::manager::OutputCoordinator;

/// Owns one [`OutputCoordinator`] per open cell.
///
/// Coordinators live until their cell is closed with
/// [`close_cell`](Self::close_cell) or [`close_cells`](Self::close_cells).
pub struct CoordinatorRegistry {
    collaborators: Collaborators,
    config: Arc<CoordinatorConfig>,
    coordinators: Mutex<FxHashMap<CellId, Arc<OutputCoordinator>>>,
}

impl CoordinatorRegistry {
    pub fn new(collaborators: Collaborators, config: CoordinatorConfig) -> Self {
        Self {
            collaborators,
            config: Arc::new(config),
            coordinators: Mutex::new(FxHashMap::default()),
        }
    }

    fn coordinators(&self) -> MutexGuard<'_, FxHashMap<CellId, Arc<OutputCoordinator>>> {
        self.coordinators
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// Coordinator for `cell`, creating it on first registration.
    pub fn register_cell(&self, cell: &Cell) -> Arc<OutputCoordinator> {
        let mut coordinators = self.coordinators();
        if let Some(existing) = coordinators.get(&cell.id()) {
            return existing.clone();
        }

        let coordinator = OutputCoordinator::new(
            cell.clone(),
            self.collaborators.clone(),
            self.config.clone(),
        );
        if self.config.terminal.attach_on_register {
            coordinator.register_terminal(self.config.terminal.default_kind);
        }
        coordinators.insert(cell.id(), coordinator.clone());

        tracing::debug!(cell = %coordinator.stable_id(), "Registered cell");
        coordinator
    }

    /// Coordinator for a registered `cell`.
    ///
    /// An unregistered cell is a caller bug; it is logged and registered anyway.
    pub fn get_coordinator(&self, cell: &Cell) -> Arc<OutputCoordinator> {
        if let Some(existing) = self.coordinators().get(&cell.id()) {
            return existing.clone();
        }
        tracing::error!(
            cell = %cell.stable_id(),
            "Coordinator requested for unregistered cell"
        );
        self.register_cell(cell)
    }

    /// Drop the coordinator of a closed cell, returning it if it existed.
    pub fn close_cell(&self, id: CellId) -> Option<Arc<OutputCoordinator>> {
        let removed = self.coordinators().remove(&id);
        if removed.is_some() {
            tracing::debug!(cell = %id, "Closed cell");
        }
        removed
    }

    /// Drop the coordinators of every cell in a closed document.
    ///
    /// Returns how many coordinators were removed.
    pub fn close_cells(&self, ids: impl IntoIterator<Item = CellId>) -> usize {
        let removed = {
            let mut coordinators = self.coordinators();
            ids.into_iter()
                .filter(|id| coordinators.remove(id).is_some())
                .count()
        };
        tracing::debug!(removed, "Closed cells");
        removed
    }

    pub fn contains(&self, id: CellId) -> bool {
        self.coordinators().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.coordinators().len()
    }

    pub fn is_empty(&self) -> bool {
        self.coordinators().is_empty()
    }
}
