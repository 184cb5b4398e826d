// Streaming Session
//
// Binds a destination table to a coordinator and mints transaction
// batches for it. Separate batches (with separate writers) may ingest
// concurrently; each batch serializes its own transactions.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::batch::{BatchError, TxnBatch};
use crate::coordinator::TxnCoordinator;
use crate::writer::RecordWriter;

/// Destination table reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    pub database: String,
    pub table: String,
}

impl TableRef {
    /// Fully qualified `database.table` name, used as the lock key.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.database, self.table)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("expected <database>.<table>, got `{0}`")]
pub struct ParseTableRefError(String);

impl std::str::FromStr for TableRef {
    type Err = ParseTableRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((database, table))
                if !database.is_empty() && !table.is_empty() && !table.contains('.') =>
            {
                Ok(Self {
                    database: database.to_string(),
                    table: table.to_string(),
                })
            }
            _ => Err(ParseTableRefError(s.to_string())),
        }
    }
}

/// A writer session against one destination table.
pub struct StreamSession<C> {
    id: Uuid,
    table: TableRef,
    coordinator: Arc<C>,
    shutdown: CancellationToken,
}

impl<C: TxnCoordinator> StreamSession<C> {
    pub fn new(table: TableRef, coordinator: Arc<C>) -> Self {
        Self::with_shutdown(table, coordinator, CancellationToken::new())
    }

    /// Create a session whose batches observe an external cancellation
    /// signal.
    pub fn with_shutdown(
        table: TableRef,
        coordinator: Arc<C>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            table,
            coordinator,
            shutdown,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    /// Allocate `size` transactions from the coordinator and bind them
    /// to `writer` as a new batch.
    pub fn open_batch<W: RecordWriter>(
        &self,
        size: usize,
        writer: W,
    ) -> Result<TxnBatch<C, W>, BatchError> {
        let ids = self.coordinator.allocate(size)?;
        info!(
            session = %self.id,
            table = %self.table.qualified_name(),
            size,
            "opened transaction batch"
        );
        Ok(TxnBatch::new(
            Arc::clone(&self.coordinator),
            writer,
            self.table.qualified_name(),
            ids,
            self.shutdown.child_token(),
        ))
    }
}
