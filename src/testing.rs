//! Helpers for tests: schema bootstrap for a real Postgres and in-memory stand-ins for the
//! storage seams.

use crate::{
    Error, Result,
    audit::{AuditEntry, AuditWriter},
    batch::{BatchSink, ChunkOutcome, PreparedRecord, RecordFailure},
    context::TenantScope,
    import::SinkProvider,
    schema::{SchemaConfig, SchemaManager},
    sequence::{SequenceKey, SequenceSource},
};
use async_trait::async_trait;
use serde_json::{Value, json};
use sqlx::PgPool;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};
use uuid::Uuid;

pub async fn migrate_core_schema(pool: &PgPool) -> Result<()> {
    SchemaManager::new(pool.clone())
        .sync(&SchemaConfig::default())
        .await?;
    Ok(())
}

/// A record for tenant `test` whose natural key and code are unique per `i`/`name`.
pub fn prepared(i: usize, name: &str) -> PreparedRecord {
    PreparedRecord {
        id: Uuid::new_v4(),
        tenant: TenantScope::client("test"),
        code: Some(format!("{:06}", i + 1)),
        natural_key: Some(name.trim().to_lowercase()),
        doc: json!({ "name": name }),
        created_by: None,
        source_index: i,
    }
}

fn simulated(what: &str) -> Error {
    Error::Io(std::io::Error::other(format!("simulated {what}")))
}

#[derive(Default)]
struct SinkState {
    rows: Vec<PreparedRecord>,
    ids: HashSet<Uuid>,
    natural_keys: HashSet<(TenantScope, String)>,
    codes: HashSet<(TenantScope, String)>,
    chunk_sizes: Vec<usize>,
}

impl SinkState {
    // Same uniqueness rules as the records table indexes.
    fn store(&mut self, rec: &PreparedRecord) -> bool {
        if self.ids.contains(&rec.id) {
            return false;
        }
        let key = rec.natural_key.clone().map(|k| (rec.tenant.clone(), k));
        let code = rec.code.clone().map(|c| (rec.tenant.clone(), c));
        if key.as_ref().is_some_and(|k| self.natural_keys.contains(k))
            || code.as_ref().is_some_and(|c| self.codes.contains(c))
        {
            return false;
        }
        self.natural_keys.extend(key);
        self.codes.extend(code);
        self.ids.insert(rec.id);
        self.rows.push(rec.clone());
        true
    }
}

/// In-memory [`BatchSink`] with switches for injecting failures.
#[derive(Default)]
pub struct MemorySink {
    state: Mutex<SinkState>,
    insert_calls: AtomicUsize,
    verify_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fail_chunks: HashSet<usize>,
    partial_chunks: HashMap<usize, usize>,
    lost: HashSet<usize>,
    fail_verify: bool,
    delay_ms: u64,
}

impl MemorySink {
    /// Fail the `call`-th insert (0-based) outright.
    pub fn fail_chunk(mut self, call: usize) -> Self {
        self.fail_chunks.insert(call);
        self
    }

    /// Persist only the first `ok` records of the `call`-th insert and report a partial error.
    pub fn partial_chunk(mut self, call: usize, ok: usize) -> Self {
        self.partial_chunks.insert(call, ok);
        self
    }

    /// Report the record with this source index as inserted without keeping it.
    pub fn lose_record(mut self, source_index: usize) -> Self {
        self.lost.insert(source_index);
        self
    }

    pub fn fail_verify(mut self) -> Self {
        self.fail_verify = true;
        self
    }

    pub fn with_delay_ms(mut self, ms: u64) -> Self {
        self.delay_ms = ms;
        self
    }

    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    pub fn verify_calls(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn chunk_sizes(&self) -> Vec<usize> {
        self.lock().chunk_sizes.clone()
    }

    pub fn records(&self) -> Vec<PreparedRecord> {
        self.lock().rows.clone()
    }

    /// Stored documents in insertion order.
    pub fn documents(&self) -> Vec<Value> {
        self.lock().rows.iter().map(|r| r.doc.clone()).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn apply(&self, call: usize, chunk: &[PreparedRecord]) -> Result<ChunkOutcome> {
        let mut state = self.lock();
        state.chunk_sizes.push(chunk.len());

        if self.fail_chunks.contains(&call) {
            return Err(simulated("chunk failure"));
        }
        if let Some(ok) = self.partial_chunks.get(&call) {
            let inserted = chunk
                .iter()
                .take(*ok)
                .filter(|rec| state.store(rec))
                .map(|rec| rec.id)
                .collect();
            return Err(Error::PartialInsert {
                inserted,
                detail: "simulated partial failure".to_string(),
            });
        }

        let mut outcome = ChunkOutcome::default();
        for rec in chunk {
            if self.lost.contains(&rec.source_index) || state.store(rec) {
                outcome.inserted.push(rec.id);
            } else {
                outcome.failed.push(RecordFailure {
                    id: rec.id,
                    reason: "duplicate key".to_string(),
                });
            }
        }
        Ok(outcome)
    }
}

#[async_trait]
impl BatchSink for MemorySink {
    async fn insert_chunk(&self, chunk: Vec<PreparedRecord>) -> Result<ChunkOutcome> {
        let call = self.insert_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        let result = self.apply(call, &chunk);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn verify(&self, ids: &[Uuid]) -> Result<HashSet<Uuid>> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_verify {
            return Err(simulated("verification failure"));
        }
        let state = self.lock();
        Ok(ids
            .iter()
            .filter(|id| state.ids.contains(*id))
            .copied()
            .collect())
    }
}

/// In-memory counters with the same increment-and-return contract as the Postgres ones.
#[derive(Default)]
pub struct MemorySequences {
    counters: Mutex<HashMap<SequenceKey, i64>>,
    calls: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemorySequences {
    /// Counters that fail every call.
    pub fn failing() -> Self {
        let seqs = Self::default();
        seqs.unavailable.store(true, Ordering::SeqCst);
        seqs
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn current(&self, key: &SequenceKey) -> Option<i64> {
        self.counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .copied()
    }
}

#[async_trait]
impl SequenceSource for MemorySequences {
    async fn next_sequence(&self, key: &SequenceKey, count: u32) -> Result<i64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(simulated("sequence store outage"));
        }
        if count == 0 {
            return Err(Error::InvalidSequenceCount);
        }
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let seq = counters.entry(key.clone()).or_insert(0);
        *seq += i64::from(count);
        Ok(*seq)
    }
}

/// One [`MemorySink`] per collection plus shared [`MemorySequences`].
pub struct MemoryStore {
    sinks: Mutex<HashMap<String, Arc<MemorySink>>>,
    sequences: Arc<MemorySequences>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            sinks: Mutex::new(HashMap::new()),
            sequences: Arc::new(MemorySequences::default()),
        }
    }
}

impl MemoryStore {
    pub fn failing_sequences(mut self) -> Self {
        self.sequences = Arc::new(MemorySequences::failing());
        self
    }

    pub fn sequences(&self) -> Arc<MemorySequences> {
        self.sequences.clone()
    }

    pub fn sequence_calls(&self) -> usize {
        self.sequences.calls()
    }

    /// The sink backing `name`, created empty on first access.
    pub fn collection(&self, name: &str) -> Arc<MemorySink> {
        self.sinks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(name.to_string())
            .or_default()
            .clone()
    }
}

impl SinkProvider for MemoryStore {
    fn sink(&self, collection: &str) -> Arc<dyn BatchSink> {
        self.collection(collection)
    }
}

/// Keeps audit entries in memory; can fail or stall on demand.
#[derive(Default)]
pub struct MemoryAuditWriter {
    entries: Mutex<Vec<AuditEntry>>,
    failures_left: AtomicUsize,
    delay_ms: u64,
}

impl MemoryAuditWriter {
    pub fn failing_first(n: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(n),
            ..Self::default()
        }
    }

    pub fn with_delay_ms(mut self, ms: u64) -> Self {
        self.delay_ms = ms;
        self
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl AuditWriter for MemoryAuditWriter {
    async fn write(&self, entry: &AuditEntry) -> Result<()> {
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(simulated("audit write failure"));
        }
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(entry.clone());
        Ok(())
    }
}
