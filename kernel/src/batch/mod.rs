// Transaction Batch
//
// Sequences a fixed group of coordinator-allocated transactions and
// gates all record writes on the currently open one. Slots are consumed
// strictly in order; a resolved slot is never revisited.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordinator::{CoordinatorError, LockStatus, TxnCoordinator};
use crate::txn::{StateError, TxnId, TxnSlot, TxnState};
use crate::writer::{RecordWriter, WriterError};

const DEFAULT_LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Errors surfaced by batch operations.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("no transactions remain in this batch")]
    BatchExhausted,

    #[error("no open transaction")]
    NoOpenTransaction,

    #[error("transaction {0} is still open")]
    TxnStillOpen(TxnId),

    #[error("transaction batch is closed")]
    Closed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("writer error: {0}")]
    Writer(#[from] WriterError),
}

/// A pre-sized, ordered group of transactions consumed one at a time by
/// a single writer session.
///
/// Batch instances are single-owner; separate batches (with separate
/// writers) may be used for concurrent ingestion into the same table,
/// each serializing its own transactions.
pub struct TxnBatch<C, W> {
    coordinator: Arc<C>,
    writer: W,
    table: String,
    slots: Vec<TxnSlot>,
    /// Index of the slot most recently opened. `None` before the first
    /// `begin_next_transaction` call.
    cursor: Option<usize>,
    closed: bool,
    shutdown: CancellationToken,
    lock_poll_interval: Duration,
}

impl<C: TxnCoordinator, W: RecordWriter> TxnBatch<C, W> {
    pub(crate) fn new(
        coordinator: Arc<C>,
        writer: W,
        table: String,
        ids: Vec<TxnId>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            coordinator,
            writer,
            table,
            slots: ids.into_iter().map(TxnSlot::new).collect(),
            cursor: None,
            closed: false,
            shutdown,
            lock_poll_interval: DEFAULT_LOCK_POLL_INTERVAL,
        }
    }

    /// Activate the next unused transaction in the batch.
    ///
    /// Acquires the table write lock from the coordinator, polling while
    /// it is held elsewhere. Fails with [`BatchError::Cancelled`] if the
    /// batch is cancelled mid-wait and with [`BatchError::BatchExhausted`]
    /// once every slot has been consumed.
    pub fn begin_next_transaction(&mut self) -> Result<TxnId, BatchError> {
        self.ensure_not_closed()?;
        if let Some(i) = self.open_index() {
            return Err(BatchError::TxnStillOpen(self.slots[i].id()));
        }

        let next = self.cursor.map_or(0, |i| i + 1);
        if next >= self.slots.len() {
            return Err(BatchError::BatchExhausted);
        }

        let id = self.slots[next].id();
        self.wait_for_lock(id)?;
        self.slots[next].open()?;
        self.cursor = Some(next);

        debug!(txn = id.0, table = %self.table, "transaction opened");
        Ok(id)
    }

    /// Id of the currently open transaction, if any.
    pub fn current_txn_id(&self) -> Option<TxnId> {
        self.open_index().map(|i| self.slots[i].id())
    }

    /// State of the current transaction slot.
    ///
    /// `Inactive` before the first activation; terminal states remain
    /// visible until the next slot is opened.
    pub fn current_state(&self) -> TxnState {
        self.cursor.map_or(TxnState::Inactive, |i| self.slots[i].state())
    }

    /// Number of slots not yet opened. The open slot and resolved slots
    /// are excluded.
    pub fn remaining_transactions(&self) -> usize {
        self.slots.len() - self.cursor.map_or(0, |i| i + 1)
    }

    /// Append one record to the currently open transaction.
    pub fn write(&mut self, record: &[u8]) -> Result<(), BatchError> {
        self.ensure_not_closed()?;
        if self.shutdown.is_cancelled() {
            return Err(BatchError::Cancelled);
        }
        let txn = self.current_txn_id().ok_or(BatchError::NoOpenTransaction)?;
        self.writer.write(txn, record)?;
        Ok(())
    }

    /// Append a collection of records to the currently open transaction.
    pub fn write_all<I, R>(&mut self, records: I) -> Result<(), BatchError>
    where
        I: IntoIterator<Item = R>,
        R: AsRef<[u8]>,
    {
        for record in records {
            self.write(record.as_ref())?;
        }
        Ok(())
    }

    /// Commit the currently open transaction.
    ///
    /// Flushes its records, then resolves the transaction at the
    /// coordinator. A commit rejected because the coordinator already
    /// aborted the transaction (e.g. after an idle timeout) marks the
    /// slot aborted locally and surfaces the coordinator error.
    pub fn commit(&mut self) -> Result<(), BatchError> {
        self.ensure_not_closed()?;
        if self.shutdown.is_cancelled() {
            return Err(BatchError::Cancelled);
        }
        let i = self.open_index().ok_or(BatchError::NoOpenTransaction)?;
        let id = self.slots[i].id();

        self.writer.flush(id)?;
        match self.coordinator.commit(id) {
            Ok(()) => {
                self.slots[i].commit()?;
                info!(txn = id.0, table = %self.table, "transaction committed");
                Ok(())
            }
            Err(CoordinatorError::TxnAborted(_)) => {
                self.slots[i].abort()?;
                Err(BatchError::Coordinator(CoordinatorError::TxnAborted(id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Abort the currently open transaction, discarding its buffered
    /// records.
    pub fn abort(&mut self) -> Result<(), BatchError> {
        self.ensure_not_closed()?;
        let i = self.open_index().ok_or(BatchError::NoOpenTransaction)?;
        let id = self.slots[i].id();

        self.writer.discard(id)?;
        self.coordinator.abort(id)?;
        self.slots[i].abort()?;

        info!(txn = id.0, table = %self.table, "transaction aborted");
        Ok(())
    }

    /// Keepalive for the open transaction and every slot not yet opened.
    pub fn heartbeat(&self) -> Result<(), BatchError> {
        self.ensure_not_closed()?;

        let mut pending: Vec<TxnId> = Vec::new();
        if let Some(i) = self.open_index() {
            pending.push(self.slots[i].id());
        }
        let next = self.cursor.map_or(0, |i| i + 1);
        pending.extend(self.slots[next..].iter().map(|s| s.id()));

        if pending.is_empty() {
            return Ok(());
        }
        self.coordinator.heartbeat(&pending)?;
        debug!(table = %self.table, txns = pending.len(), "heartbeat sent");
        Ok(())
    }

    /// Close the batch, releasing writer and coordinator resources.
    ///
    /// A still-open transaction is aborted, and slots that were never
    /// opened are aborted at the coordinator so they do not linger until
    /// the idle reaper finds them. Idempotent.
    pub fn close(&mut self) -> Result<(), BatchError> {
        if self.closed {
            return Ok(());
        }

        if let Some(i) = self.open_index() {
            let id = self.slots[i].id();
            warn!(txn = id.0, table = %self.table, "batch closed with an open transaction, aborting it");
            self.writer.discard(id)?;
            self.coordinator.abort(id)?;
            self.slots[i].abort()?;
        }

        let next = self.cursor.map_or(0, |i| i + 1);
        for slot in &self.slots[next..] {
            self.coordinator.abort(slot.id())?;
        }

        self.writer.close()?;
        self.closed = true;
        info!(table = %self.table, "transaction batch closed");
        Ok(())
    }

    /// The writer this batch feeds.
    pub fn writer(&self) -> &W {
        &self.writer
    }

    fn open_index(&self) -> Option<usize> {
        self.cursor.filter(|&i| self.slots[i].state() == TxnState::Open)
    }

    fn ensure_not_closed(&self) -> Result<(), BatchError> {
        if self.closed {
            Err(BatchError::Closed)
        } else {
            Ok(())
        }
    }

    fn wait_for_lock(&self, txn: TxnId) -> Result<(), BatchError> {
        loop {
            if self.shutdown.is_cancelled() {
                return Err(BatchError::Cancelled);
            }
            match self.coordinator.acquire_lock(txn, &self.table)? {
                LockStatus::Granted => return Ok(()),
                LockStatus::Waiting => {
                    debug!(txn = txn.0, table = %self.table, "write lock busy, waiting");
                    std::thread::sleep(self.lock_poll_interval);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::InMemoryCoordinator;
    use crate::writer::SegmentWriter;
    use tempfile::{tempdir, TempDir};

    fn batch_of(size: usize) -> (TxnBatch<InMemoryCoordinator, SegmentWriter>, TempDir) {
        let dir = tempdir().unwrap();
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let ids = coordinator.allocate(size).unwrap();
        let writer = SegmentWriter::new(dir.path(), "events").unwrap();
        let batch = TxnBatch::new(
            coordinator,
            writer,
            "db.events".to_string(),
            ids,
            CancellationToken::new(),
        );
        (batch, dir)
    }

    #[test]
    fn slots_are_consumed_in_order_until_exhausted() {
        let (mut batch, _dir) = batch_of(3);

        for expected in 1..=3u64 {
            let id = batch.begin_next_transaction().unwrap();
            assert_eq!(id, TxnId(expected));
            batch.commit().unwrap();
        }

        let err = batch.begin_next_transaction().unwrap_err();
        assert!(matches!(err, BatchError::BatchExhausted));
    }

    #[test]
    fn at_most_one_transaction_is_open() {
        let (mut batch, _dir) = batch_of(2);

        let id = batch.begin_next_transaction().unwrap();
        let err = batch.begin_next_transaction().unwrap_err();
        assert!(matches!(err, BatchError::TxnStillOpen(open) if open == id));
    }

    #[test]
    fn write_without_open_transaction_fails() {
        let (mut batch, _dir) = batch_of(2);

        let err = batch.write(b"too early").unwrap_err();
        assert!(matches!(err, BatchError::NoOpenTransaction));
        assert_eq!(batch.current_txn_id(), None);
        assert_eq!(batch.current_state(), TxnState::Inactive);
    }

    #[test]
    fn resolved_transactions_are_no_longer_writable() {
        let (mut batch, _dir) = batch_of(2);

        batch.begin_next_transaction().unwrap();
        batch.write(b"row").unwrap();
        batch.commit().unwrap();

        assert_eq!(batch.current_state(), TxnState::Committed);
        assert_eq!(batch.current_txn_id(), None);

        let err = batch.write(b"late").unwrap_err();
        assert!(matches!(err, BatchError::NoOpenTransaction));
    }

    #[test]
    fn remaining_transactions_decrease_per_activation() {
        let (mut batch, _dir) = batch_of(3);
        assert_eq!(batch.remaining_transactions(), 3);

        batch.begin_next_transaction().unwrap();
        assert_eq!(batch.remaining_transactions(), 2);
        batch.commit().unwrap();
        assert_eq!(batch.remaining_transactions(), 2);

        batch.begin_next_transaction().unwrap();
        assert_eq!(batch.remaining_transactions(), 1);
        batch.abort().unwrap();

        batch.begin_next_transaction().unwrap();
        assert_eq!(batch.remaining_transactions(), 0);
    }

    #[test]
    fn full_batch_lifecycle() {
        let (mut batch, _dir) = batch_of(3);

        let first = batch.begin_next_transaction().unwrap();
        batch.write(b"one").unwrap();
        batch.commit().unwrap();
        assert_eq!(batch.remaining_transactions(), 2);

        let second = batch.begin_next_transaction().unwrap();
        batch.write(b"two").unwrap();
        batch.abort().unwrap();
        assert_eq!(batch.remaining_transactions(), 1);

        let third = batch.begin_next_transaction().unwrap();
        batch.write_all([b"three".as_slice(), b"four".as_slice()]).unwrap();
        batch.commit().unwrap();
        assert_eq!(batch.remaining_transactions(), 0);

        assert!(matches!(
            batch.begin_next_transaction().unwrap_err(),
            BatchError::BatchExhausted
        ));

        // Committed segments are durable, the aborted one never lands
        assert!(batch.writer().segment_path(first).exists());
        assert!(!batch.writer().segment_path(second).exists());
        assert!(batch.writer().segment_path(third).exists());
    }

    #[test]
    fn begin_is_allowed_after_abort() {
        let (mut batch, _dir) = batch_of(2);

        batch.begin_next_transaction().unwrap();
        batch.abort().unwrap();
        assert_eq!(batch.current_state(), TxnState::Aborted);

        let id = batch.begin_next_transaction().unwrap();
        assert_eq!(id, TxnId(2));
    }

    #[test]
    fn close_aborts_the_open_transaction() {
        let (mut batch, _dir) = batch_of(2);

        let id = batch.begin_next_transaction().unwrap();
        batch.write(b"dangling").unwrap();
        batch.close().unwrap();

        assert!(!batch.writer().segment_path(id).exists());
        assert!(matches!(batch.write(b"x").unwrap_err(), BatchError::Closed));
        assert!(matches!(batch.commit().unwrap_err(), BatchError::Closed));
        assert!(matches!(
            batch.begin_next_transaction().unwrap_err(),
            BatchError::Closed
        ));

        // Idempotent
        batch.close().unwrap();
    }

    #[test]
    fn heartbeat_covers_open_and_unopened_slots() {
        let (mut batch, _dir) = batch_of(3);

        batch.heartbeat().unwrap();
        batch.begin_next_transaction().unwrap();
        batch.heartbeat().unwrap();
        batch.commit().unwrap();
        batch.heartbeat().unwrap();
    }

    #[test]
    fn commit_of_a_reaped_transaction_surfaces_the_abort() {
        let dir = tempdir().unwrap();
        let coordinator = Arc::new(InMemoryCoordinator::with_idle_timeout(Duration::ZERO));
        let ids = coordinator.allocate(1).unwrap();
        let writer = SegmentWriter::new(dir.path(), "events").unwrap();
        let mut batch = TxnBatch::new(
            Arc::clone(&coordinator),
            writer,
            "db.events".to_string(),
            ids,
            CancellationToken::new(),
        );

        let id = batch.begin_next_transaction().unwrap();
        batch.write(b"row").unwrap();

        let reaped = coordinator.reap_expired();
        assert_eq!(reaped, vec![id]);

        let err = batch.commit().unwrap_err();
        assert!(matches!(
            err,
            BatchError::Coordinator(CoordinatorError::TxnAborted(_))
        ));
        assert_eq!(batch.current_state(), TxnState::Aborted);
    }

    #[test]
    fn cancellation_interrupts_a_lock_wait() {
        let dir = tempdir().unwrap();
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let holder_ids = coordinator.allocate(1).unwrap();
        let waiter_ids = coordinator.allocate(1).unwrap();

        let holder_writer = SegmentWriter::new(dir.path(), "events").unwrap();
        let mut holder = TxnBatch::new(
            Arc::clone(&coordinator),
            holder_writer,
            "db.events".to_string(),
            holder_ids,
            CancellationToken::new(),
        );
        holder.begin_next_transaction().unwrap();

        let token = CancellationToken::new();
        let waiter_writer = SegmentWriter::new(dir.path(), "events").unwrap();
        let mut waiter = TxnBatch::new(
            Arc::clone(&coordinator),
            waiter_writer,
            "db.events".to_string(),
            waiter_ids,
            token.clone(),
        );
        waiter.lock_poll_interval = Duration::from_millis(5);

        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            token.cancel();
        });

        let err = waiter.begin_next_transaction().unwrap_err();
        assert!(matches!(err, BatchError::Cancelled));
        canceller.join().unwrap();

        holder.abort().unwrap();
    }

    #[test]
    fn writes_fail_once_cancelled() {
        let dir = tempdir().unwrap();
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let ids = coordinator.allocate(1).unwrap();
        let writer = SegmentWriter::new(dir.path(), "events").unwrap();
        let token = CancellationToken::new();
        let mut batch = TxnBatch::new(
            coordinator,
            writer,
            "db.events".to_string(),
            ids,
            token.clone(),
        );

        batch.begin_next_transaction().unwrap();
        token.cancel();

        assert!(matches!(batch.write(b"row").unwrap_err(), BatchError::Cancelled));
        assert!(matches!(batch.commit().unwrap_err(), BatchError::Cancelled));

        // Abort still works so the caller can clean up
        batch.abort().unwrap();
    }
}
