//! Output coordination.
//!
//! One [`OutputCoordinator`] per cell owns that cell's output surfaces and
//! sequences its executions. The [`CoordinatorRegistry`] maps cells to their
//! coordinators.

mod manager;
mod registry;
mod session;

pub use manager::OutputCoordinator;
pub use registry::CoordinatorRegistry;
pub use session::SessionOrders;
