//! JSON-lines sensor ingestion
//!
//! Reads one reading per line from a file or stdin and inserts it into the
//! sensor store. Stands in for the plant's ingestion device when running
//! locally: `clearwell ingest --file readings.jsonl` or
//! `cat readings.jsonl | clearwell ingest`.

use chrono::Utc;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

use crate::pipeline::IdempotencyGuard;
use crate::storage::StoreError;
use crate::types::IncomingReading;

/// Outcome of one ingest run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestSummary {
    pub inserted: usize,
    pub rejected: usize,
}

/// Insert every parsable line. Malformed lines are logged and counted; a
/// store failure aborts the run.
pub async fn ingest_lines<R>(reader: R, guard: &IdempotencyGuard) -> Result<IngestSummary, IngestError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut summary = IngestSummary::default();
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let reading: IncomingReading = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                warn!(line = line_no, error = %e, "Skipping malformed reading");
                summary.rejected += 1;
                continue;
            }
        };

        let record = reading.into_record(Utc::now());
        debug!(line = line_no, id = %record.id, "Ingesting reading");
        guard
            .call(move |store| store.insert_sensor_record(&record))
            .await?;
        summary.inserted += 1;
    }

    Ok(summary)
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Failed to read input: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}
