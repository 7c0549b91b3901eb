//! The collision guard: per-work-unit reservations over files, symbols,
//! graph mutations and external gates. Acquisition is an atomic
//! check-and-insert under the table lock; the guard is per-process and
//! never persisted.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reservation {
    pub operation_id: String,
    pub files: Vec<String>,
    pub symbols: Vec<String>,
    pub graph_mutations: Vec<String>,
    pub external_gates: Vec<String>,
}

impl Reservation {
    fn overlaps(&self, other: &Reservation) -> bool {
        overlap(&self.files, &other.files)
            || overlap(&self.symbols, &other.symbols)
            || overlap(&self.graph_mutations, &other.graph_mutations)
            || overlap(&self.external_gates, &other.external_gates)
    }
}

fn overlap(a: &[String], b: &[String]) -> bool {
    a.iter().any(|item| b.contains(item))
}

#[derive(Default)]
pub struct CollisionGuard {
    // Keyed by `runSessionId:workId`.
    table: Mutex<HashMap<String, Vec<Reservation>>>,
}

impl CollisionGuard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Atomically acquire `reservation` under `work_key`. Returns a handle
    /// that releases on drop, or `None` when any declared file, symbol,
    /// graph mutation or external gate overlaps an active reservation.
    pub fn acquire(
        self: &Arc<Self>,
        work_key: &str,
        reservation: Reservation,
    ) -> Option<ReservationHandle> {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        let active = table.entry(work_key.to_string()).or_default();
        if active.iter().any(|held| held.overlaps(&reservation)) {
            return None;
        }
        let operation_id = reservation.operation_id.clone();
        active.push(reservation);
        Some(ReservationHandle {
            guard: Arc::clone(self),
            work_key: work_key.to_string(),
            operation_id,
        })
    }

    fn release(&self, work_key: &str, operation_id: &str) {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(active) = table.get_mut(work_key) {
            active.retain(|r| r.operation_id != operation_id);
            if active.is_empty() {
                table.remove(work_key);
            }
        }
    }

    pub fn active_count(&self, work_key: &str) -> usize {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.get(work_key).map_or(0, Vec::len)
    }
}

/// Releases its reservation when dropped, on completion and failure alike.
pub struct ReservationHandle {
    guard: Arc<CollisionGuard>,
    work_key: String,
    operation_id: String,
}

impl Drop for ReservationHandle {
    fn drop(&mut self) {
        self.guard.release(&self.work_key, &self.operation_id);
    }
}
