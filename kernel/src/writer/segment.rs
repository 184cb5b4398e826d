// Segment File Writer
//
// Buffers records per transaction and appends them to one segment file
// per committed transaction. Records are length-prefixed (u32 LE).

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{RecordWriter, WriterError};
use crate::txn::TxnId;

/// File-backed [`RecordWriter`].
///
/// A committed transaction with at least one record produces a segment
/// file named `<table>-<txn>.seg` under the base directory. Aborted
/// transactions leave no file behind.
pub struct SegmentWriter {
    dir: PathBuf,
    table: String,
    buffered: HashMap<TxnId, Vec<Vec<u8>>>,
    closed: bool,
}

impl SegmentWriter {
    pub fn new(dir: impl AsRef<Path>, table: impl Into<String>) -> Result<Self, WriterError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            table: table.into(),
            buffered: HashMap::new(),
            closed: false,
        })
    }

    /// Path of the segment file a committed transaction produces.
    pub fn segment_path(&self, txn: TxnId) -> PathBuf {
        self.dir.join(format!("{}-{:020}.seg", self.table, txn.0))
    }
}

impl RecordWriter for SegmentWriter {
    fn write(&mut self, txn: TxnId, record: &[u8]) -> Result<(), WriterError> {
        if self.closed {
            return Err(WriterError::Closed);
        }
        if record.len() > u32::MAX as usize {
            return Err(WriterError::RecordTooLarge(record.len()));
        }
        self.buffered.entry(txn).or_default().push(record.to_vec());
        Ok(())
    }

    fn flush(&mut self, txn: TxnId) -> Result<(), WriterError> {
        if self.closed {
            return Err(WriterError::Closed);
        }
        let Some(records) = self.buffered.remove(&txn) else {
            // Committing without writes is legal and leaves no file
            return Ok(());
        };

        let path = self.segment_path(txn);
        let mut out = BufWriter::new(File::create(&path)?);
        for record in &records {
            out.write_all(&(record.len() as u32).to_le_bytes())?;
            out.write_all(record)?;
        }
        out.flush()?;

        debug!(
            txn = txn.0,
            records = records.len(),
            path = %path.display(),
            "segment flushed"
        );
        Ok(())
    }

    fn discard(&mut self, txn: TxnId) -> Result<(), WriterError> {
        if self.closed {
            return Err(WriterError::Closed);
        }
        self.buffered.remove(&txn);
        Ok(())
    }

    fn close(&mut self) -> Result<(), WriterError> {
        if self.closed {
            return Ok(());
        }
        self.buffered.clear();
        self.closed = true;
        Ok(())
    }
}
