// In-Process Coordinator
//
// Thread-safe coordinator used by tests, the CLI, and embedded callers.
// Locking is a single exclusive write lock per table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{CoordinatorError, LockStatus, TxnCoordinator};
use crate::txn::TxnId;

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Coordinator-side status of an allocated transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordStatus {
    Open,
    Committed,
    Aborted,
}

#[derive(Debug)]
struct TxnRecord {
    status: RecordStatus,
    last_heartbeat: Instant,
}

#[derive(Default)]
struct State {
    txns: HashMap<TxnId, TxnRecord>,
    locks: HashMap<String, TxnId>,
}

/// In-memory transaction coordinator.
///
/// Transactions that stop heartbeating are aborted by
/// [`reap_expired`](InMemoryCoordinator::reap_expired) once their idle
/// time exceeds the configured timeout.
pub struct InMemoryCoordinator {
    next_txn_id: AtomicU64,
    state: Mutex<State>,
    idle_timeout: Duration,
    total_committed: AtomicU64,
    total_aborted: AtomicU64,
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        Self::with_idle_timeout(DEFAULT_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(idle_timeout: Duration) -> Self {
        Self {
            next_txn_id: AtomicU64::new(1),
            state: Mutex::new(State::default()),
            idle_timeout,
            total_committed: AtomicU64::new(0),
            total_aborted: AtomicU64::new(0),
        }
    }

    /// Total committed transactions (for monitoring).
    pub fn total_committed(&self) -> u64 {
        self.total_committed.load(Ordering::Relaxed)
    }

    /// Total aborted transactions, reaped ones included.
    pub fn total_aborted(&self) -> u64 {
        self.total_aborted.load(Ordering::Relaxed)
    }

    /// Abort open transactions whose last heartbeat is older than the
    /// idle timeout. Returns the reaped ids.
    pub fn reap_expired(&self) -> Vec<TxnId> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let now = Instant::now();

        let mut reaped = Vec::new();
        for (id, record) in state.txns.iter_mut() {
            if record.status == RecordStatus::Open
                && now.duration_since(record.last_heartbeat) >= self.idle_timeout
            {
                record.status = RecordStatus::Aborted;
                reaped.push(*id);
            }
        }
        for id in &reaped {
            state.locks.retain(|_, holder| *holder != *id);
            warn!(txn = id.0, "transaction reaped after idle timeout");
        }
        self.total_aborted
            .fetch_add(reaped.len() as u64, Ordering::Relaxed);
        reaped.sort();
        reaped
    }
}

impl Default for InMemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl TxnCoordinator for InMemoryCoordinator {
    fn allocate(&self, count: usize) -> Result<Vec<TxnId>, CoordinatorError> {
        let first = self.next_txn_id.fetch_add(count as u64, Ordering::SeqCst);
        let ids: Vec<TxnId> = (first..first + count as u64).map(TxnId).collect();

        let mut state = self.state.lock();
        let now = Instant::now();
        for id in &ids {
            state.txns.insert(
                *id,
                TxnRecord {
                    status: RecordStatus::Open,
                    last_heartbeat: now,
                },
            );
        }
        debug!(count, first, "allocated transaction batch");
        Ok(ids)
    }

    fn acquire_lock(&self, txn: TxnId, table: &str) -> Result<LockStatus, CoordinatorError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let status = state
            .txns
            .get(&txn)
            .map(|r| r.status)
            .ok_or(CoordinatorError::UnknownTxn(txn))?;
        match status {
            RecordStatus::Aborted => return Err(CoordinatorError::TxnAborted(txn)),
            RecordStatus::Committed => return Err(CoordinatorError::AlreadyResolved(txn)),
            RecordStatus::Open => {}
        }

        match state.locks.get(table) {
            Some(holder) if *holder != txn => Ok(LockStatus::Waiting),
            _ => {
                state.locks.insert(table.to_string(), txn);
                Ok(LockStatus::Granted)
            }
        }
    }

    fn commit(&self, txn: TxnId) -> Result<(), CoordinatorError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let record = state
            .txns
            .get_mut(&txn)
            .ok_or(CoordinatorError::UnknownTxn(txn))?;
        match record.status {
            RecordStatus::Open => record.status = RecordStatus::Committed,
            RecordStatus::Aborted => return Err(CoordinatorError::TxnAborted(txn)),
            RecordStatus::Committed => return Err(CoordinatorError::AlreadyResolved(txn)),
        }
        state.locks.retain(|_, holder| *holder != txn);

        self.total_committed.fetch_add(1, Ordering::Relaxed);
        debug!(txn = txn.0, "transaction committed");
        Ok(())
    }

    fn abort(&self, txn: TxnId) -> Result<(), CoordinatorError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let record = state
            .txns
            .get_mut(&txn)
            .ok_or(CoordinatorError::UnknownTxn(txn))?;
        match record.status {
            RecordStatus::Open => record.status = RecordStatus::Aborted,
            // Idempotent: a reaped transaction may be aborted again.
            RecordStatus::Aborted => return Ok(()),
            RecordStatus::Committed => return Err(CoordinatorError::AlreadyResolved(txn)),
        }
        state.locks.retain(|_, holder| *holder != txn);

        self.total_aborted.fetch_add(1, Ordering::Relaxed);
        debug!(txn = txn.0, "transaction aborted");
        Ok(())
    }

    fn heartbeat(&self, txns: &[TxnId]) -> Result<(), CoordinatorError> {
        let mut state = self.state.lock();
        let now = Instant::now();

        for txn in txns {
            let record = state
                .txns
                .get_mut(txn)
                .ok_or(CoordinatorError::UnknownTxn(*txn))?;
            match record.status {
                RecordStatus::Open => record.last_heartbeat = now,
                RecordStatus::Aborted => return Err(CoordinatorError::TxnAborted(*txn)),
                RecordStatus::Committed => return Err(CoordinatorError::AlreadyResolved(*txn)),
            }
        }
        Ok(())
    }
}
