//! Bulkflow: batched bulk imports and atomic code sequences for multi-tenant document
//! collections, powered by Postgres.

pub mod audit;
pub mod batch;
pub mod collections;
pub mod context;
pub mod csv_import;
pub mod entity;
mod error;
pub mod grouping;
pub mod import;
pub mod metrics;
pub mod schema;
pub mod sequence;
pub mod store;
pub mod testing;
pub mod validate;

pub use audit::{AuditEntry, AuditLog, AuditOptions, AuditWriter};
pub use batch::{BatchInserter, BatchOptions, BatchSink, PreparedRecord};
pub use collections::Collection;
pub use context::{ImportContext, TenantScope};
pub use entity::{CodeConfig, CodeScope, EntityConfig, EntityRegistry};
pub use error::{Error, Result, WithContext};
pub use import::{BulkImporter, ImportError, ImportReport, SinkProvider};
pub use schema::{SchemaConfig, SchemaManager, SchemaPlan};
pub use sequence::{SequenceKey, SequenceRange, SequenceSource, Sequences};
pub use store::Store;
pub use validate::{MissingPolicy, RecordValidator};

pub mod prelude {
    pub use crate::{
        BulkImporter, EntityRegistry, ImportContext, ImportReport, Result, Store, TenantScope,
    };
}
