//! Chunked inserts that tolerate partial failure.
//!
//! [`BatchInserter`] splits prepared records into chunks, hands each chunk to a [`BatchSink`]
//! and keeps going whatever the chunk's fate. Driver-reported successes are only a hint: once
//! every chunk has been attempted the sink is re-queried for all attempted ids and only records
//! found there count as inserted.

use crate::{Error, Result, context::TenantScope, metrics};
use async_trait::async_trait;
use serde_json::Value;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

pub const DEFAULT_BATCH_SIZE: usize = 1000;
/// Upper bound keeping one multi-row insert under the Postgres bind-parameter limit.
pub const MAX_BATCH_SIZE: usize = 5000;

/// A validated record ready to be written.
#[derive(Clone, Debug, PartialEq)]
pub struct PreparedRecord {
    pub id: Uuid,
    pub tenant: TenantScope,
    pub code: Option<String>,
    pub natural_key: Option<String>,
    pub doc: Value,
    pub created_by: Option<String>,
    /// Position in the caller's original input list.
    pub source_index: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordFailure {
    pub id: Uuid,
    pub reason: String,
}

/// What a sink reports for one chunk.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChunkOutcome {
    pub inserted: Vec<Uuid>,
    pub failed: Vec<RecordFailure>,
}

#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Insert a chunk without letting one bad record abort the rest.
    ///
    /// An `Err(Error::PartialInsert { .. })` carries the ids that did get written; any other
    /// error means the whole chunk is treated as failed.
    async fn insert_chunk(&self, chunk: Vec<PreparedRecord>) -> Result<ChunkOutcome>;

    /// Ids out of `ids` that are actually persisted.
    async fn verify(&self, ids: &[Uuid]) -> Result<HashSet<Uuid>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchOptions {
    pub batch_size: usize,
    /// Chunks in flight per wave; 1 runs chunks strictly in order.
    pub concurrency: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            concurrency: 1,
        }
    }
}

impl BatchOptions {
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    fn normalized(self) -> Self {
        Self {
            batch_size: self.batch_size.clamp(1, MAX_BATCH_SIZE),
            concurrency: self.concurrency.max(1),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct BatchOutcome {
    /// Verified records, in input order.
    pub inserted: Vec<PreparedRecord>,
    pub failed_count: usize,
    /// Per-record failures where a reason is known, in input order.
    pub failures: Vec<(PreparedRecord, String)>,
    pub chunks_attempted: usize,
    pub chunks_failed: usize,
}

impl BatchOutcome {
    pub fn inserted_ids(&self) -> Vec<Uuid> {
        self.inserted.iter().map(|r| r.id).collect()
    }
}

// What the inserter learned about one chunk before verification.
#[derive(Default)]
struct ChunkReport {
    claimed: Vec<Uuid>,
    reasons: Vec<RecordFailure>,
    chunk_error: Option<String>,
}

pub struct BatchInserter {
    sink: Arc<dyn BatchSink>,
    options: BatchOptions,
}

impl BatchInserter {
    pub fn new(sink: Arc<dyn BatchSink>, options: BatchOptions) -> Self {
        Self {
            sink,
            options: options.normalized(),
        }
    }

    pub fn options(&self) -> BatchOptions {
        self.options
    }

    /// Run sequentially or in waves depending on the configured concurrency.
    pub async fn insert(&self, records: Vec<PreparedRecord>) -> BatchOutcome {
        if self.options.concurrency > 1 {
            self.insert_in_waves(records).await
        } else {
            self.insert_in_batches(records).await
        }
    }

    /// Insert chunk after chunk, in order.
    #[instrument(skip_all, fields(records = records.len(), batch_size = self.options.batch_size))]
    pub async fn insert_in_batches(&self, records: Vec<PreparedRecord>) -> BatchOutcome {
        if records.is_empty() {
            return BatchOutcome::default();
        }
        let mut reports = Vec::new();
        for (idx, chunk) in records.chunks(self.options.batch_size).enumerate() {
            let report = run_chunk(self.sink.as_ref(), idx, chunk.to_vec()).await;
            reports.push(report);
        }
        self.finish(records, reports).await
    }

    /// Insert up to `concurrency` chunks at a time; each wave settles before the next starts.
    #[instrument(skip_all, fields(records = records.len(), batch_size = self.options.batch_size, concurrency = self.options.concurrency))]
    pub async fn insert_in_waves(&self, records: Vec<PreparedRecord>) -> BatchOutcome {
        if records.is_empty() {
            return BatchOutcome::default();
        }
        let chunks: Vec<Vec<PreparedRecord>> = records
            .chunks(self.options.batch_size)
            .map(<[PreparedRecord]>::to_vec)
            .collect();
        let mut reports: Vec<Option<ChunkReport>> = (0..chunks.len()).map(|_| None).collect();

        let mut pending = chunks.into_iter().enumerate().peekable();
        while pending.peek().is_some() {
            let mut wave = JoinSet::new();
            for (idx, chunk) in pending.by_ref().take(self.options.concurrency) {
                let sink = self.sink.clone();
                wave.spawn(async move { (idx, run_chunk(sink.as_ref(), idx, chunk).await) });
            }
            while let Some(joined) = wave.join_next().await {
                match joined {
                    Ok((idx, report)) => reports[idx] = Some(report),
                    Err(err) => {
                        // panicked or cancelled task; its slot stays empty and counts as failed
                        warn!(error = %err, "batch insert task did not complete");
                    }
                }
            }
        }

        let reports = reports
            .into_iter()
            .map(|r| {
                r.unwrap_or_else(|| ChunkReport {
                    chunk_error: Some("insert task did not complete".to_string()),
                    ..ChunkReport::default()
                })
            })
            .collect();
        self.finish(records, reports).await
    }

    async fn finish(&self, records: Vec<PreparedRecord>, reports: Vec<ChunkReport>) -> BatchOutcome {
        let chunks_attempted = reports.len();
        let chunks_failed = reports.iter().filter(|r| r.chunk_error.is_some()).count();

        let attempted: Vec<Uuid> = records.iter().map(|r| r.id).collect();
        let verified = self.verify_all(&attempted).await;

        let mut claimed: HashSet<Uuid> = HashSet::new();
        let mut reasons: HashMap<Uuid, String> = HashMap::new();
        for (chunk_idx, report) in reports.into_iter().enumerate() {
            claimed.extend(report.claimed);
            for failure in report.reasons {
                reasons.insert(failure.id, failure.reason);
            }
            if let Some(err) = report.chunk_error {
                let start = chunk_idx * self.options.batch_size;
                let end = (start + self.options.batch_size).min(records.len());
                for rec in &records[start..end] {
                    reasons.entry(rec.id).or_insert_with(|| err.clone());
                }
            }
        }

        let mut outcome = BatchOutcome {
            chunks_attempted,
            chunks_failed,
            ..BatchOutcome::default()
        };
        for rec in records {
            if verified.contains(&rec.id) {
                outcome.inserted.push(rec);
                continue;
            }
            let reason = match reasons.remove(&rec.id) {
                Some(reason) => reason,
                None if claimed.contains(&rec.id) => "not found after insert".to_string(),
                None => "not persisted".to_string(),
            };
            outcome.failures.push((rec, reason));
        }
        outcome.failed_count = outcome.failures.len();

        let unconfirmed = claimed
            .iter()
            .filter(|id| !verified.contains(*id))
            .count();
        if unconfirmed > 0 {
            warn!(unconfirmed, "records reported inserted were not found on verification");
        }
        metrics::record_batch(
            outcome.inserted.len() as u64,
            outcome.failed_count as u64,
            chunks_failed as u64,
        );
        debug!(
            inserted = outcome.inserted.len(),
            failed = outcome.failed_count,
            chunks = chunks_attempted,
            chunks_failed,
            "batch insert finished"
        );
        outcome
    }

    async fn verify_all(&self, ids: &[Uuid]) -> HashSet<Uuid> {
        let mut found = HashSet::with_capacity(ids.len());
        for slice in ids.chunks(self.options.batch_size) {
            match self.sink.verify(slice).await {
                Ok(mut present) => {
                    let asked: HashSet<&Uuid> = slice.iter().collect();
                    present.retain(|id| asked.contains(id));
                    found.extend(present);
                }
                Err(err) => {
                    warn!(error = %err, ids = slice.len(), "verification query failed; treating slice as not persisted");
                }
            }
        }
        found
    }
}

async fn run_chunk(sink: &dyn BatchSink, idx: usize, chunk: Vec<PreparedRecord>) -> ChunkReport {
    let size = chunk.len();
    match sink.insert_chunk(chunk).await {
        Ok(outcome) => {
            for failure in &outcome.failed {
                warn!(chunk = idx, id = %failure.id, reason = %failure.reason, "record rejected");
            }
            debug!(chunk = idx, size, inserted = outcome.inserted.len(), "chunk inserted");
            ChunkReport {
                claimed: outcome.inserted,
                reasons: outcome.failed,
                chunk_error: None,
            }
        }
        Err(Error::PartialInsert { inserted, detail }) => {
            warn!(chunk = idx, size, recovered = inserted.len(), detail = %detail, "chunk partially inserted");
            ChunkReport {
                claimed: inserted,
                reasons: Vec::new(),
                chunk_error: Some(detail),
            }
        }
        Err(err) => {
            warn!(chunk = idx, size, error = %err, "chunk insert failed");
            ChunkReport {
                claimed: Vec::new(),
                reasons: Vec::new(),
                chunk_error: Some(err.to_string()),
            }
        }
    }
}
