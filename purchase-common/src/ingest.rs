//! # Ingest
//!
//! Stream NDJSON purchase records out of any `AsyncRead` one line at a time.
//!
//! Memory use is bounded by the longest line in the stream: lines are read into a single
//! reusable buffer, decoded, and handed to the caller before the next line is read.
use std::future::Future;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::decode::{decode, DecodeError};
use crate::purchase::{PurchaseInput, UpsertOutcome};

/// Capacity of the read buffer sitting in front of the source stream.
/// Lines longer than this are still read in full; the line buffer grows to fit them.
pub const READ_BUFFER_CAPACITY: usize = 64 * 1024;

/// Enumeration of errors that abort an ingest.
#[derive(Error, Debug)]
pub enum IngestError<E> {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("line {line}: failed to store record: {error}")]
    Record { line: u64, error: E },
    #[error("line {line}: failed to read input: {error}")]
    Io { line: u64, error: std::io::Error },
}

impl<E> IngestError<E> {
    /// The 1-based line number at which ingest was aborted.
    pub fn line(&self) -> u64 {
        match self {
            IngestError::Decode(error) => error.line(),
            IngestError::Record { line, .. } | IngestError::Io { line, .. } => *line,
        }
    }
}

/// Counters accumulated over a whole ingest.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub created: u64,
    pub updated: u64,
    pub total: u64,
}

impl IngestSummary {
    pub fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Created => self.created += 1,
            UpsertOutcome::Updated => self.updated += 1,
        }
        self.total += 1;
    }
}

/// A pull-based reader yielding one validated record per non-blank line.
pub struct RecordReader<R> {
    reader: BufReader<R>,
    buffer: Vec<u8>,
    line: u64,
}

impl<R: AsyncRead + Unpin> RecordReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::with_capacity(READ_BUFFER_CAPACITY, reader),
            buffer: Vec::new(),
            line: 0,
        }
    }

    /// The number of the last line read, blank lines included.
    pub fn line(&self) -> u64 {
        self.line
    }

    /// Read lines until a non-blank one is found and decode it.
    /// Returns `Ok(None)` once the stream is exhausted.
    pub async fn next_record<E>(&mut self) -> Result<Option<(u64, PurchaseInput)>, IngestError<E>> {
        loop {
            self.buffer.clear();

            let read = self
                .reader
                .read_until(b'\n', &mut self.buffer)
                .await
                .map_err(|error| IngestError::Io {
                    line: self.line + 1,
                    error,
                })?;

            if read == 0 {
                return Ok(None);
            }

            self.line += 1;

            let raw = trim_ascii_whitespace(&self.buffer);
            if raw.is_empty() {
                continue;
            }

            let input = decode(self.line, raw)?;
            return Ok(Some((self.line, input)));
        }
    }
}

fn trim_ascii_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

/// Decode every record in `reader` and hand it to `on_record`, stopping at the first
/// failure.
///
/// Records delivered before a failing line have already been acted on by `on_record`; this
/// function does no storage work of its own and cannot undo them. An empty stream is a
/// success with zero records.
pub async fn stream_ingest<R, F, Fut, E>(
    reader: R,
    mut on_record: F,
) -> Result<IngestSummary, IngestError<E>>
where
    R: AsyncRead + Unpin,
    F: FnMut(PurchaseInput) -> Fut,
    Fut: Future<Output = Result<UpsertOutcome, E>>,
{
    let mut records = RecordReader::new(reader);
    let mut summary = IngestSummary::default();

    while let Some((line, input)) = records.next_record().await? {
        let outcome = on_record(input)
            .await
            .map_err(|error| IngestError::Record { line, error })?;
        summary.record(outcome);
    }

    Ok(summary)
}
