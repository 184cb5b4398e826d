// Record Writer Abstraction
//
// Defines the contract for serializing opaque records into the
// destination table format on behalf of a transaction batch.
//
// This module defines *interfaces only*; implementations live in
// submodules.

pub mod segment;

pub use segment::SegmentWriter;

use crate::txn::TxnId;

/// Errors surfaced by a record writer.
#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("writer is closed")]
    Closed,

    #[error("record of {0} bytes exceeds the frame limit")]
    RecordTooLarge(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Destination-format writer bound to a single batch.
///
/// Properties required from implementations:
/// - Records are buffered per transaction until `flush`
/// - Records from a discarded transaction never become visible
/// - `close` is idempotent
pub trait RecordWriter {
    /// Buffer one record under `txn`.
    fn write(&mut self, txn: TxnId, record: &[u8]) -> Result<(), WriterError>;

    /// Make all records buffered under `txn` durable.
    ///
    /// Called when the transaction commits.
    fn flush(&mut self, txn: TxnId) -> Result<(), WriterError>;

    /// Drop all records buffered under `txn`.
    ///
    /// Called when the transaction aborts.
    fn discard(&mut self, txn: TxnId) -> Result<(), WriterError>;

    /// Release underlying resources.
    fn close(&mut self) -> Result<(), WriterError>;
}
