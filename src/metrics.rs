use std::fmt::Write as _;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct Metrics {
    // Imports
    pub import_requests_total: AtomicU64,
    pub records_received_total: AtomicU64,
    pub records_rejected_total: AtomicU64,

    // Batch inserts
    pub records_inserted_total: AtomicU64,
    pub records_failed_total: AtomicU64,
    pub chunks_failed_total: AtomicU64,

    // Sequences
    pub sequence_values_total: AtomicU64,

    // Audit queue
    pub audit_written_total: AtomicU64,
    pub audit_dropped_total: AtomicU64,
    pub audit_failed_total: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            import_requests_total: AtomicU64::new(0),
            records_received_total: AtomicU64::new(0),
            records_rejected_total: AtomicU64::new(0),
            records_inserted_total: AtomicU64::new(0),
            records_failed_total: AtomicU64::new(0),
            chunks_failed_total: AtomicU64::new(0),
            sequence_values_total: AtomicU64::new(0),
            audit_written_total: AtomicU64::new(0),
            audit_dropped_total: AtomicU64::new(0),
            audit_failed_total: AtomicU64::new(0),
        }
    }
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::default)
}

pub(crate) fn record_import(received: u64, rejected: u64) {
    let m = metrics();
    m.import_requests_total.fetch_add(1, Ordering::Relaxed);
    m.records_received_total.fetch_add(received, Ordering::Relaxed);
    m.records_rejected_total.fetch_add(rejected, Ordering::Relaxed);
}

pub(crate) fn record_batch(inserted: u64, failed: u64, chunks_failed: u64) {
    let m = metrics();
    m.records_inserted_total.fetch_add(inserted, Ordering::Relaxed);
    m.records_failed_total.fetch_add(failed, Ordering::Relaxed);
    m.chunks_failed_total.fetch_add(chunks_failed, Ordering::Relaxed);
}

pub(crate) fn record_sequence_allocation(values: u64) {
    metrics()
        .sequence_values_total
        .fetch_add(values, Ordering::Relaxed);
}

pub(crate) fn record_audit_written() {
    metrics().audit_written_total.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_audit_dropped() {
    metrics().audit_dropped_total.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_audit_failed() {
    metrics().audit_failed_total.fetch_add(1, Ordering::Relaxed);
}

pub fn render_prometheus() -> String {
    let m = metrics();
    let mut s = String::new();
    let counters: [(&str, &str, &AtomicU64); 10] = [
        ("import_requests_total", "counter", &m.import_requests_total),
        ("records_received_total", "counter", &m.records_received_total),
        ("records_rejected_total", "counter", &m.records_rejected_total),
        ("records_inserted_total", "counter", &m.records_inserted_total),
        ("records_failed_total", "counter", &m.records_failed_total),
        ("chunks_failed_total", "counter", &m.chunks_failed_total),
        ("sequence_values_total", "counter", &m.sequence_values_total),
        ("audit_written_total", "counter", &m.audit_written_total),
        ("audit_dropped_total", "counter", &m.audit_dropped_total),
        ("audit_failed_total", "counter", &m.audit_failed_total),
    ];
    for (name, kind, value) in counters {
        let _ = writeln!(
            s,
            "# TYPE {name} {kind}\n{name} {}",
            value.load(Ordering::Relaxed)
        );
    }
    s
}
