//! Fire-and-forget audit trail.
//!
//! Requests push [`AuditEntry`] values onto a bounded queue and move on; a single background
//! task drains the queue into an [`AuditWriter`]. A full queue or a failing write never reaches
//! the caller, it is logged and counted instead.

use crate::{Result, context::TenantScope, metrics};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{debug, warn};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub tenant: TenantScope,
    pub actor: Option<String>,
    pub action: String,
    pub entity_type: String,
    pub detail: Value,
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        tenant: TenantScope,
        action: impl Into<String>,
        entity_type: impl Into<String>,
        detail: Value,
    ) -> Self {
        Self {
            tenant,
            actor: None,
            action: action.into(),
            entity_type: entity_type.into(),
            detail,
            at: Utc::now(),
        }
    }

    pub fn actor(mut self, actor: Option<String>) -> Self {
        self.actor = actor;
        self
    }
}

#[async_trait]
pub trait AuditWriter: Send + Sync {
    async fn write(&self, entry: &AuditEntry) -> Result<()>;
}

#[derive(Clone, Copy, Debug)]
pub struct AuditOptions {
    pub capacity: usize,
}

impl Default for AuditOptions {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

/// Cloneable handle onto the audit queue.
#[derive(Clone)]
pub struct AuditLog {
    tx: mpsc::Sender<AuditEntry>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl AuditLog {
    /// Start the background writer. Must be called inside a tokio runtime.
    pub fn spawn(writer: Arc<dyn AuditWriter>, opts: AuditOptions) -> Self {
        let (tx, mut rx) = mpsc::channel::<AuditEntry>(opts.capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                match writer.write(&entry).await {
                    Ok(()) => {
                        metrics::record_audit_written();
                        debug!(action = %entry.action, entity = %entry.entity_type, tenant = %entry.tenant, "audit entry written");
                    }
                    Err(err) => {
                        metrics::record_audit_failed();
                        warn!(error = %err, action = %entry.action, entity = %entry.entity_type, tenant = %entry.tenant, "audit write failed");
                    }
                }
            }
        });
        Self {
            tx,
            worker: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Queue `entry` without waiting. Returns whether it was accepted.
    pub fn record(&self, entry: AuditEntry) -> bool {
        match self.tx.try_send(entry) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(entry)) => {
                metrics::record_audit_dropped();
                warn!(action = %entry.action, entity = %entry.entity_type, "audit queue full; entry dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(entry)) => {
                metrics::record_audit_dropped();
                warn!(action = %entry.action, entity = %entry.entity_type, "audit queue closed; entry dropped");
                false
            }
        }
    }

    /// Close this handle's side of the queue and wait until queued entries are written.
    ///
    /// The worker only finishes once every clone has been dropped or shut down, so this waits
    /// for the other handles too. Concurrent callers all return after the drain: the first one
    /// holds the worker lock while awaiting it and the rest find the slot empty afterwards.
    pub async fn shutdown(self) {
        let Self { tx, worker } = self;
        drop(tx);
        let mut slot = worker.lock().await;
        if let Some(handle) = slot.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "audit worker ended abnormally");
            }
        }
    }
}

/// Writes entries into the `audit_log` table.
#[derive(Clone)]
pub struct PgAuditWriter {
    pool: PgPool,
}

impl PgAuditWriter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditWriter for PgAuditWriter {
    async fn write(&self, entry: &AuditEntry) -> Result<()> {
        sqlx::query(
            r#"insert into audit_log (client_id, company_id, actor, action, entity_type, detail, created_at)
                values ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(&entry.tenant.client)
        .bind(&entry.tenant.company)
        .bind(&entry.actor)
        .bind(&entry.action)
        .bind(&entry.entity_type)
        .bind(&entry.detail)
        .bind(entry.at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryAuditWriter;
    use serde_json::json;

    fn entry(n: i64) -> AuditEntry {
        AuditEntry::new(
            TenantScope::client("acme"),
            "bulk_import",
            "vendor",
            json!({ "n": n }),
        )
    }

    #[tokio::test]
    async fn drains_queue_on_shutdown() {
        let writer = Arc::new(MemoryAuditWriter::default());
        let log = AuditLog::spawn(writer.clone(), AuditOptions::default());
        for n in 0..10 {
            assert!(log.record(entry(n)));
        }
        log.shutdown().await;
        let written = writer.entries();
        assert_eq!(written.len(), 10);
        assert_eq!(written[9].detail, json!({"n": 9}));
    }

    #[tokio::test]
    async fn write_failures_do_not_stop_the_worker() {
        let writer = Arc::new(MemoryAuditWriter::failing_first(2));
        let log = AuditLog::spawn(writer.clone(), AuditOptions::default());
        for n in 0..5 {
            log.record(entry(n));
        }
        log.shutdown().await;
        assert_eq!(writer.entries().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_shutdowns_both_wait_for_drain() {
        let writer = Arc::new(MemoryAuditWriter::default().with_delay_ms(5));
        let log = AuditLog::spawn(writer.clone(), AuditOptions::default());
        let other = log.clone();
        for n in 0..6 {
            assert!(log.record(entry(n)));
        }
        let a = tokio::spawn({
            let writer = writer.clone();
            async move {
                log.shutdown().await;
                writer.entries().len()
            }
        });
        let b = tokio::spawn({
            let writer = writer.clone();
            async move {
                other.shutdown().await;
                writer.entries().len()
            }
        });
        assert_eq!(a.await.unwrap(), 6);
        assert_eq!(b.await.unwrap(), 6);
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let writer = Arc::new(MemoryAuditWriter::default().with_delay_ms(50));
        let log = AuditLog::spawn(writer.clone(), AuditOptions { capacity: 1 });
        let accepted = (0..20).filter(|n| log.record(entry(*n))).count();
        assert!(accepted < 20);
        log.shutdown().await;
        assert_eq!(writer.entries().len(), accepted);
    }
}
