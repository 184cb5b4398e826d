use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sluice_kernel::coordinator::InMemoryCoordinator;
use sluice_kernel::session::{StreamSession, TableRef};
use sluice_kernel::writer::SegmentWriter;

/// Sluice streaming ingest CLI
#[derive(Parser, Debug)]
#[command(name = "sluice")]
#[command(about = "Stream newline-delimited records into a transactional table", long_about = None)]
struct Cli {
    /// Path to newline-delimited input records
    #[arg(long)]
    input: PathBuf,

    /// Destination table as <database>.<table>
    #[arg(long)]
    table: Option<String>,

    /// Path to a table reference JSON file
    #[arg(long)]
    table_config: Option<PathBuf>,

    /// Records committed per transaction
    #[arg(long, default_value_t = 100)]
    records_per_txn: usize,

    /// Transactions allocated per batch
    #[arg(long, default_value_t = 10)]
    txns_per_batch: usize,

    /// Directory for segment output
    #[arg(long, default_value = "segments")]
    out_dir: PathBuf,
}

/// Wrapper for JSON output
#[derive(Debug, Serialize)]
struct IngestReport {
    session: String,
    table: String,
    records_written: usize,
    transactions_committed: u64,
    transactions_aborted: u64,
    batches_used: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // ----------------------------
    // Resolve the destination table
    // ----------------------------
    let table: TableRef = if let Some(path) = &cli.table_config {
        let data = fs::read_to_string(path)?;
        serde_json::from_str(&data)?
    } else if let Some(name) = &cli.table {
        name.parse()?
    } else {
        anyhow::bail!("either --table or --table-config is required");
    };

    // ----------------------------
    // Load input records
    // ----------------------------
    let data = fs::read_to_string(&cli.input)?;
    let records: Vec<&str> = data.lines().filter(|line| !line.is_empty()).collect();
    info!(records = records.len(), "loaded input");

    // ----------------------------
    // Open the writer session
    // ----------------------------
    let coordinator = Arc::new(InMemoryCoordinator::new());
    let session = StreamSession::new(table.clone(), Arc::clone(&coordinator));

    // ----------------------------
    // Stream records, one chunk per transaction
    // ----------------------------
    let mut records_written = 0;
    let mut batches_used = 0;

    let mut chunks = records.chunks(cli.records_per_txn.max(1)).peekable();
    while chunks.peek().is_some() {
        let size = cli.txns_per_batch.max(1).min(chunks.len());
        let writer = SegmentWriter::new(&cli.out_dir, &table.table)?;
        let mut batch = session.open_batch(size, writer)?;
        batches_used += 1;

        while batch.remaining_transactions() > 0 {
            let Some(chunk) = chunks.next() else { break };
            batch.begin_next_transaction()?;
            for record in chunk {
                batch.write(record.as_bytes())?;
            }
            batch.commit()?;
            records_written += chunk.len();
        }

        batch.close()?;
    }

    // ----------------------------
    // Output
    // ----------------------------
    let report = IngestReport {
        session: session.id().to_string(),
        table: table.qualified_name(),
        records_written,
        transactions_committed: coordinator.total_committed(),
        transactions_aborted: coordinator.total_aborted(),
        batches_used,
    };

    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
