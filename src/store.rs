use crate::{
    Result,
    audit::{AuditLog, AuditOptions, PgAuditWriter},
    batch::BatchSink,
    collections::Collection,
    entity::EntityRegistry,
    import::{BulkImporter, SinkProvider},
    schema::{SchemaConfig, SchemaManager},
    sequence::Sequences,
};
use sqlx::{
    PgPool,
    postgres::{PgConnectOptions, PgPoolOptions},
};
use std::{str::FromStr, sync::Arc, time::Duration};
use tracing::info;

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    base_schema: String,
}

impl Store {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPool::connect(url).await?;
        Ok(Self {
            pool,
            base_schema: "public".to_string(),
        })
    }

    pub fn builder(url: impl Into<String>) -> StoreBuilder {
        StoreBuilder::new(url)
    }

    pub fn collection(&self, name: impl Into<String>) -> Collection {
        Collection::new(self.pool.clone(), name)
    }

    pub fn sequences(&self) -> Sequences {
        Sequences::new(self.pool.clone())
    }

    pub fn schema(&self) -> SchemaManager {
        SchemaManager::new(self.pool.clone())
    }

    /// Schema config matching the schema this store was connected to.
    pub fn schema_config(&self) -> SchemaConfig {
        SchemaConfig::with_base_schema(self.base_schema.clone())
    }

    pub fn audit_writer(&self) -> PgAuditWriter {
        PgAuditWriter::new(self.pool.clone())
    }

    /// Start a background audit queue writing into `audit_log`.
    pub fn audit_log(&self, opts: AuditOptions) -> AuditLog {
        AuditLog::spawn(Arc::new(self.audit_writer()), opts)
    }

    /// Importer writing into this store's collections and counters.
    pub fn importer(&self, registry: EntityRegistry) -> BulkImporter {
        BulkImporter::new(
            registry,
            Arc::new(self.sequences()),
            Arc::new(self.clone()),
        )
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Lightweight liveness check for the connection pool.
    pub async fn pool_health(&self) -> Result<PoolHealth> {
        let one: i32 = sqlx::query_scalar("select 1").fetch_one(&self.pool).await?;
        Ok(PoolHealth { ok: one == 1 })
    }
}

impl SinkProvider for Store {
    fn sink(&self, collection: &str) -> Arc<dyn BatchSink> {
        Arc::new(self.collection(collection))
    }
}

pub struct StoreBuilder {
    url: String,
    max_connections: Option<u32>,
    connect_timeout: Option<Duration>,
    base_schema: Option<String>,
    prepared_statement_cache_size: Option<usize>,
}

impl StoreBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: None,
            connect_timeout: None,
            base_schema: None,
            prepared_statement_cache_size: None,
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = Some(max.max(1));
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Put `schema` first on every connection's search path.
    pub fn base_schema(mut self, schema: impl Into<String>) -> Self {
        self.base_schema = Some(schema.into());
        self
    }

    /// Hint for prepared statement cache size. Actual behavior depends on driver.
    pub fn prepared_statement_cache_size(mut self, size: usize) -> Self {
        self.prepared_statement_cache_size = Some(size.max(1));
        self
    }

    pub async fn build(self) -> Result<Store> {
        let mut opts = PgPoolOptions::new();
        if let Some(max) = self.max_connections {
            opts = opts.max_connections(max);
        }
        if let Some(t) = self.connect_timeout {
            opts = opts.acquire_timeout(t);
        }

        let mut connect_opts = PgConnectOptions::from_str(&self.url)?;
        if let Some(cap) = self.prepared_statement_cache_size {
            connect_opts = connect_opts.statement_cache_capacity(cap);
        }
        let base_schema = self
            .base_schema
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "public".to_string());
        if base_schema != "public" {
            connect_opts = connect_opts.options([("search_path", base_schema.as_str())]);
        }

        let pool = opts.connect_with(connect_opts).await?;
        info!(schema = %base_schema, "store connected");
        Ok(Store { pool, base_schema })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PoolHealth {
    pub ok: bool,
}
