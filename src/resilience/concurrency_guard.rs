//! Entity-level concurrency guard: at most one in-flight run per
//! `(entity_type, entity_id)` pair (spec.md §4.4, §5).
//!
//! Grounded on `worker/backpressure.rs`'s load-gating pattern, with the
//! actual mutual-exclusion mechanics modeled on a database partial
//! unique index: `try_acquire` either wins the slot or fails outright,
//! there is no queueing. [`crate::ledger::postgres::PostgresLedger`]
//! implements this trait over a real partial unique index so the guard
//! holds across process restarts; [`InMemoryConcurrencyGuard`] is the
//! single-process equivalent used by `MemoryExecutor`/`LocalExecutor`
//! tests and the in-memory ledger.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::TaskforgeError;

#[async_trait]
pub trait ConcurrencyGuard: Send + Sync {
    /// Attempt to acquire the slot for `(entity_type, entity_id)` on
    /// behalf of `run_id`. Returns `false` if another run already holds
    /// it; never blocks.
    async fn try_acquire(&self, entity_type: &str, entity_id: &str, run_id: &str) -> Result<bool, TaskforgeError>;

    /// Release the slot. A no-op if `run_id` isn't the current holder
    /// (e.g. a late release racing a reclaim).
    async fn release(&self, entity_type: &str, entity_id: &str, run_id: &str) -> Result<(), TaskforgeError>;

    /// Current holder of the slot, if any.
    async fn holder(&self, entity_type: &str, entity_id: &str) -> Result<Option<String>, TaskforgeError>;
}

/// In-process concurrency guard backed by a `dashmap`, the same
/// concurrent-map crate the teacher's dependency set already carries.
#[derive(Default)]
pub struct InMemoryConcurrencyGuard {
    held: DashMap<(String, String), String>,
}

impl InMemoryConcurrencyGuard {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConcurrencyGuard for InMemoryConcurrencyGuard {
    async fn try_acquire(&self, entity_type: &str, entity_id: &str, run_id: &str) -> Result<bool, TaskforgeError> {
        let key = (entity_type.to_string(), entity_id.to_string());
        match self.held.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(run_id.to_string());
                Ok(true)
            }
        }
    }

    async fn release(&self, entity_type: &str, entity_id: &str, run_id: &str) -> Result<(), TaskforgeError> {
        let key = (entity_type.to_string(), entity_id.to_string());
        if let Some(held_by) = self.held.get(&key) {
            if held_by.as_str() == run_id {
                drop(held_by);
                self.held.remove(&key);
            }
        }
        Ok(())
    }

    async fn holder(&self, entity_type: &str, entity_id: &str) -> Result<Option<String>, TaskforgeError> {
        let key = (entity_type.to_string(), entity_id.to_string());
        Ok(self.held.get(&key).map(|v| v.clone()))
    }
}
