//! Bulk import of one entity type per call.
//!
//! [`BulkImporter::import`] validates the candidate records against the entity's configuration,
//! reserves one code range for every record that needs a code, stamps tenant and actor onto the
//! prepared records and hands them to the [`BatchInserter`]. Only configuration problems and a
//! failed code reservation abort the call; everything else ends up as counts in the
//! [`ImportReport`].

use crate::{
    Error, Result,
    audit::{AuditEntry, AuditLog},
    batch::{BatchInserter, BatchOptions, BatchSink, PreparedRecord},
    context::ImportContext,
    csv_import::{self, CsvOptions},
    entity::{EntityConfig, EntityRegistry},
    metrics,
    sequence::SequenceSource,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value, json};
use std::{collections::HashMap, io::Read, sync::Arc};
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Hands out the sink backing a named collection.
pub trait SinkProvider: Send + Sync {
    fn sink(&self, collection: &str) -> Arc<dyn BatchSink>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportError {
    pub index: usize,
    pub error: String,
    /// CSV lines the failed document was built from; empty for JSON input.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lines: Vec<u64>,
}

impl ImportError {
    pub fn new(index: usize, error: impl Into<String>) -> Self {
        Self {
            index,
            error: error.into(),
            lines: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub total_received: usize,
    pub total_inserted: usize,
    pub total_failed: usize,
    pub inserted_ids: Vec<Uuid>,
    pub errors: Vec<ImportError>,
}

impl ImportReport {
    pub fn reconciles(&self) -> bool {
        self.total_received == self.total_inserted + self.total_failed
            && self.inserted_ids.len() == self.total_inserted
    }
}

pub struct BulkImporter {
    registry: EntityRegistry,
    sequences: Arc<dyn SequenceSource>,
    sinks: Arc<dyn SinkProvider>,
    options: BatchOptions,
    audit: Option<AuditLog>,
}

impl BulkImporter {
    pub fn new(
        registry: EntityRegistry,
        sequences: Arc<dyn SequenceSource>,
        sinks: Arc<dyn SinkProvider>,
    ) -> Self {
        Self {
            registry,
            sequences,
            sinks,
            options: BatchOptions::default(),
            audit: None,
        }
    }

    pub fn with_options(mut self, options: BatchOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub async fn import(
        &self,
        ctx: &ImportContext,
        entity_type: &str,
        records: Vec<Value>,
    ) -> Result<ImportReport> {
        self.import_traced(ctx, entity_type, records, &[]).await
    }

    #[instrument(skip_all, fields(entity = %entity_type, tenant = %ctx.tenant, received = records.len()))]
    async fn import_traced(
        &self,
        ctx: &ImportContext,
        entity_type: &str,
        records: Vec<Value>,
        lines: &[Vec<u64>],
    ) -> Result<ImportReport> {
        let config = self.registry.get(entity_type)?;
        let total_received = records.len();
        if records.is_empty() {
            return Ok(ImportReport::default());
        }

        let (candidates, mut errors) = screen(config, records);
        metrics::record_import(total_received as u64, errors.len() as u64);

        let prepared = self.prepare(ctx, config, candidates).await?;

        let inserter = BatchInserter::new(self.sinks.sink(&config.collection), self.options);
        let outcome = inserter.insert(prepared).await;

        for (rec, reason) in &outcome.failures {
            errors.push(ImportError::new(rec.source_index, reason.clone()));
        }
        errors.sort_by_key(|e| e.index);
        for err in &mut errors {
            if let Some(source) = lines.get(err.index) {
                err.lines = source.clone();
            }
        }

        let total_inserted = outcome.inserted.len();
        let report = ImportReport {
            total_received,
            total_inserted,
            total_failed: total_received - total_inserted,
            inserted_ids: outcome.inserted_ids(),
            errors,
        };

        info!(
            inserted = report.total_inserted,
            failed = report.total_failed,
            chunks = outcome.chunks_attempted,
            chunks_failed = outcome.chunks_failed,
            "bulk import finished"
        );

        if let Some(audit) = &self.audit {
            audit.record(
                AuditEntry::new(
                    ctx.tenant.clone(),
                    "bulk_import",
                    entity_type,
                    json!({
                        "collection": config.collection,
                        "totalReceived": report.total_received,
                        "totalInserted": report.total_inserted,
                        "totalFailed": report.total_failed,
                        "correlationId": ctx.correlation_id,
                        "headers": ctx.headers,
                    }),
                )
                .actor(ctx.actor.clone()),
            );
        }

        Ok(report)
    }

    /// Parse CSV rows, apply the entity's row grouping if any, then [`import`](Self::import).
    ///
    /// Counts and error indexes refer to the documents after grouping; each error also lists
    /// the CSV lines its document came from.
    pub async fn import_csv<R: Read>(
        &self,
        ctx: &ImportContext,
        entity_type: &str,
        reader: R,
        opts: CsvOptions,
    ) -> Result<ImportReport> {
        let config = self.registry.get(entity_type)?;
        let rows = csv_import::read_records_with_lines(reader, opts)?;
        let (docs, lines): (Vec<Value>, Vec<Vec<u64>>) = match &config.grouping {
            Some(grouping) => grouping.group_with_lines(rows).into_iter().unzip(),
            None => rows
                .into_iter()
                .map(|(line, doc)| (doc, vec![line]))
                .unzip(),
        };
        self.import_traced(ctx, entity_type, docs, &lines).await
    }

    async fn prepare(
        &self,
        ctx: &ImportContext,
        config: &EntityConfig,
        candidates: Vec<Candidate>,
    ) -> Result<Vec<PreparedRecord>> {
        let mut codes = match &config.code {
            Some(code) => {
                let needing = candidates
                    .iter()
                    .filter(|c| !has_code(&c.doc, &code.field))
                    .count();
                if needing == 0 {
                    Vec::new().into_iter()
                } else {
                    let key = code.sequence_key(&config.entity_type, &ctx.tenant);
                    let count = u32::try_from(needing).map_err(|_| {
                        Error::Config(format!("cannot reserve {needing} codes at once"))
                    })?;
                    let range = self.sequences.next_range(&key, count).await?;
                    range.codes(&code.format()).into_iter()
                }
            }
            None => Vec::new().into_iter(),
        };

        let mut prepared = Vec::with_capacity(candidates.len());
        for mut candidate in candidates {
            let mut code_value = None;
            if let Some(code) = &config.code {
                if has_code(&candidate.doc, &code.field) {
                    code_value = candidate
                        .doc
                        .get(&code.field)
                        .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()));
                } else if let Some(generated) = codes.next() {
                    candidate
                        .doc
                        .insert(code.field.clone(), Value::String(generated.clone()));
                    code_value = Some(generated);
                } else {
                    warn!(index = candidate.index, "code range exhausted before every record was coded");
                }
            }
            prepared.push(PreparedRecord {
                id: Uuid::new_v4(),
                tenant: ctx.tenant.clone(),
                code: code_value,
                natural_key: candidate.natural_key,
                doc: Value::Object(candidate.doc),
                created_by: ctx.actor.clone(),
                source_index: candidate.index,
            });
        }
        Ok(prepared)
    }
}

struct Candidate {
    index: usize,
    doc: JsonMap<String, Value>,
    natural_key: Option<String>,
}

// Validation, in-request duplicate detection and defaults. No I/O.
fn screen(config: &EntityConfig, records: Vec<Value>) -> (Vec<Candidate>, Vec<ImportError>) {
    let validator = config.validator();
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut candidates = Vec::with_capacity(records.len());
    let mut errors = Vec::new();

    for (index, record) in records.into_iter().enumerate() {
        if let Some(reason) = validator.check(&record) {
            errors.push(ImportError::new(index, reason));
            continue;
        }
        let natural_key = config.natural_key_of(&record);
        if let Some(key) = &natural_key {
            if let Some(first) = seen.get(key) {
                errors.push(ImportError::new(
                    index,
                    format!("duplicate natural key `{key}` in request (first at index {first})"),
                ));
                continue;
            }
            seen.insert(key.clone(), index);
        }
        let Value::Object(mut doc) = record else {
            continue;
        };
        for (field, value) in &config.defaults {
            if !doc.contains_key(field) {
                doc.insert(field.clone(), value.clone());
            }
        }
        candidates.push(Candidate {
            index,
            doc,
            natural_key,
        });
    }
    (candidates, errors)
}

fn has_code(doc: &JsonMap<String, Value>, field: &str) -> bool {
    match doc.get(field) {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audit::AuditOptions,
        context::TenantScope,
        entity::CodeConfig,
        testing::{MemoryAuditWriter, MemoryStore},
    };
    use serde_json::json;

    fn registry() -> EntityRegistry {
        EntityRegistry::new()
            .with(EntityConfig::new("thing", "things").required(["name"]))
            .with(
                EntityConfig::new("vendor", "vendors")
                    .required(["name"])
                    .code(CodeConfig::new("vendor_code", 6))
                    .natural_key(["name"])
                    .default_value("status", json!("active")),
            )
    }

    fn ctx() -> ImportContext {
        ImportContext::builder(TenantScope::company("acme", "north"))
            .actor("ops")
            .build()
    }

    fn importer(store: &Arc<MemoryStore>) -> BulkImporter {
        BulkImporter::new(registry(), store.sequences(), store.clone())
    }

    #[tokio::test]
    async fn skips_invalid_and_inserts_rest() {
        let store = Arc::new(MemoryStore::default());
        let importer = importer(&store).with_options(BatchOptions::default().batch_size(2));
        let report = importer
            .import(
                &ctx(),
                "thing",
                vec![json!({"name": "A"}), json!({"name": ""}), json!({"name": "C"})],
            )
            .await
            .unwrap();
        assert_eq!(report.total_received, 3);
        assert_eq!(report.total_inserted, 2);
        assert_eq!(report.total_failed, 1);
        assert_eq!(
            report.errors,
            vec![ImportError::new(1, "missing required field `name`")]
        );
        assert!(report.reconciles());
        let sink = store.collection("things");
        assert_eq!(sink.insert_calls(), 1);
        assert_eq!(sink.verify(&report.inserted_ids).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn empty_input_touches_nothing() {
        let store = Arc::new(MemoryStore::default());
        let report = importer(&store)
            .import(&ctx(), "vendor", Vec::new())
            .await
            .unwrap();
        assert_eq!(report, ImportReport::default());
        assert_eq!(store.sequence_calls(), 0);
        assert_eq!(store.collection("vendors").insert_calls(), 0);
    }

    #[tokio::test]
    async fn all_invalid_never_inserts() {
        let store = Arc::new(MemoryStore::default());
        let report = importer(&store)
            .import(&ctx(), "vendor", vec![json!({}), json!({"name": null}), json!(7)])
            .await
            .unwrap();
        assert_eq!(report.total_inserted, 0);
        assert_eq!(report.total_failed, 3);
        assert_eq!(report.errors.len(), 3);
        assert_eq!(store.sequence_calls(), 0);
        assert_eq!(store.collection("vendors").insert_calls(), 0);
    }

    #[tokio::test]
    async fn unknown_entity_is_fatal() {
        let store = Arc::new(MemoryStore::default());
        let err = importer(&store)
            .import(&ctx(), "spaceship", vec![json!({"name": "x"})])
            .await
            .expect_err("unknown entity");
        assert!(matches!(err, Error::UnknownEntity(_)));
    }

    #[tokio::test]
    async fn codes_come_from_one_range_and_keep_supplied_codes() {
        let store = Arc::new(MemoryStore::default());
        let importer = importer(&store);
        let report = importer
            .import(
                &ctx(),
                "vendor",
                vec![
                    json!({"name": "A"}),
                    json!({"name": "B", "vendor_code": "LEGACY-1"}),
                    json!({"name": "C"}),
                ],
            )
            .await
            .unwrap();
        assert_eq!(report.total_inserted, 3);
        assert_eq!(store.sequence_calls(), 1);

        let docs = store.collection("vendors").documents();
        let codes: Vec<&str> = docs
            .iter()
            .map(|d| d["vendor_code"].as_str().unwrap())
            .collect();
        assert_eq!(codes, vec!["000001", "LEGACY-1", "000002"]);
        assert!(docs.iter().all(|d| d["status"] == json!("active")));

        let second = importer
            .import(&ctx(), "vendor", vec![json!({"name": "D"})])
            .await
            .unwrap();
        assert_eq!(second.total_inserted, 1);
        let docs = store.collection("vendors").documents();
        assert_eq!(docs[3]["vendor_code"], json!("000003"));
    }

    #[tokio::test]
    async fn sequence_failure_aborts_before_insert() {
        let store = Arc::new(MemoryStore::default().failing_sequences());
        let err = importer(&store)
            .import(&ctx(), "vendor", vec![json!({"name": "A"})])
            .await
            .expect_err("sequence down");
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(store.collection("vendors").insert_calls(), 0);
    }

    #[tokio::test]
    async fn duplicate_natural_keys_in_request_are_rejected() {
        let store = Arc::new(MemoryStore::default());
        let report = importer(&store)
            .import(
                &ctx(),
                "vendor",
                vec![json!({"name": "Acme"}), json!({"name": " ACME "})],
            )
            .await
            .unwrap();
        assert_eq!(report.total_inserted, 1);
        assert_eq!(report.errors[0].index, 1);
        assert!(report.errors[0].error.contains("duplicate natural key"));
        let again = importer(&store)
            .import(&ctx(), "vendor", vec![json!({"name": "acme"})])
            .await
            .unwrap();
        assert_eq!(again.total_inserted, 0);
        assert_eq!(again.errors[0].error, "duplicate key");
        assert!(again.reconciles());
    }

    #[tokio::test]
    async fn audit_entry_is_queued() {
        let store = Arc::new(MemoryStore::default());
        let writer = Arc::new(MemoryAuditWriter::default());
        let audit = AuditLog::spawn(writer.clone(), AuditOptions::default());
        let importer = importer(&store).with_audit(audit.clone());
        let mut ctx = ctx();
        ctx.merge_headers(json!({"source_file": "things.json"}));
        importer
            .import(&ctx, "thing", vec![json!({"name": "A"})])
            .await
            .unwrap();
        drop(importer);
        audit.shutdown().await;
        let entries = writer.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "bulk_import");
        assert_eq!(entries[0].detail["totalInserted"], json!(1));
        assert_eq!(entries[0].actor.as_deref(), Some("ops"));
        assert_eq!(
            entries[0].detail["headers"],
            json!({"source_file": "things.json"})
        );
    }

    #[tokio::test]
    async fn csv_import_groups_price_slabs() {
        let store = Arc::new(MemoryStore::default());
        let importer = BulkImporter::new(
            EntityRegistry::erp_defaults(),
            store.sequences(),
            store.clone(),
        );
        let data = "name,item,min_qty,price\n\
                    Retail,SKU-1,10,9.5\n\
                    Retail,SKU-1,1,10\n\
                    Wholesale,,1,3\n\
                    Wholesale,,5,2\n";
        let report = importer
            .import_csv(&ctx(), "price_list", data.as_bytes(), CsvOptions::default())
            .await
            .unwrap();
        assert_eq!(report.total_received, 2);
        assert_eq!(report.total_inserted, 1);
        let docs = store.collection("price_lists").documents();
        assert_eq!(docs[0]["slabs"][0], json!({"min_qty": 1, "price": 10}));
        // the failed document names both CSV lines it was merged from
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].index, 1);
        assert_eq!(report.errors[0].lines, vec![4, 5]);
    }

    #[tokio::test]
    async fn json_import_errors_carry_no_lines() {
        let store = Arc::new(MemoryStore::default());
        let report = importer(&store)
            .import(&ctx(), "thing", vec![json!({})])
            .await
            .unwrap();
        assert!(report.errors[0].lines.is_empty());
        assert!(
            serde_json::to_value(&report).unwrap()["errors"][0]
                .get("lines")
                .is_none()
        );
    }

    #[test]
    fn report_serializes_camel_case() {
        let report = ImportReport {
            total_received: 1,
            total_inserted: 0,
            total_failed: 1,
            inserted_ids: Vec::new(),
            errors: vec![ImportError::new(0, "x")],
        };
        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            json!({
                "totalReceived": 1,
                "totalInserted": 0,
                "totalFailed": 1,
                "insertedIds": [],
                "errors": [{"index": 0, "error": "x"}]
            })
        );
    }
}
