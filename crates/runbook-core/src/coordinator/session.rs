//! Per-session execution order bookkeeping.

use rustc_hash::FxHashMap;

/// Execution-order counters keyed by session, plus the most recently used session.
///
/// Orders are only comparable within one session: after a reconnect to a
/// different session the current order is unknown until that session reports
/// one. Switching back to a session seen before resumes its counter.
#[derive(Debug, Default, Clone)]
pub struct SessionOrders {
    mru: Option<String>,
    orders: FxHashMap<String, u64>,
}

impl SessionOrders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mru_session_id(&self) -> Option<&str> {
        self.mru.as_deref()
    }

    /// Bind to `id`. Returns whether the MRU session changed.
    pub fn set_mru_session_id(&mut self, id: &str) -> bool {
        if self.mru.as_deref() == Some(id) {
            return false;
        }
        self.mru = Some(id.to_string());
        true
    }

    /// Record `order` for `id` and make `id` the MRU session.
    pub fn set_execution_order(&mut self, id: &str, order: u64) {
        self.set_mru_session_id(id);
        self.orders.insert(id.to_string(), order);
    }

    /// Order last assigned in the MRU session, if known.
    pub fn current_order(&self) -> Option<u64> {
        self.mru
            .as_ref()
            .and_then(|id| self.orders.get(id))
            .copied()
    }

    /// Advance the MRU session's counter and return the new order.
    ///
    /// Returns `None`, touching nothing, while the current order is unknown.
    pub fn next_order(&mut self) -> Option<u64> {
        let id = self.mru.clone()?;
        let next = self.orders.get(&id)? + 1;
        self.orders.insert(id, next);
        Some(next)
    }
}
