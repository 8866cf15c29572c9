use std::collections::HashSet;

use crate::Result;
use indoc::formatdoc;
use sqlx::PgPool;

#[derive(Clone, Debug)]
pub struct SchemaManager {
    pool: PgPool,
}

impl SchemaManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn plan(&self, config: &SchemaConfig) -> Result<SchemaPlan> {
        let mut plan = SchemaPlan::default();
        let schema = config.base_schema.trim();

        if schema.is_empty() {
            plan.push_warning("schema name is empty; skipping".to_string());
            return Ok(plan);
        }

        let existing_schemas = self.existing_schemas().await?;
        let schema_exists = existing_schemas.contains(schema);
        if !schema_exists {
            plan.push_action(
                format!("create schema {}", quote_ident(schema)),
                format!("create schema if not exists {}", quote_ident(schema)),
            );
        }

        let existing_tables = if schema_exists {
            self.existing_tables(schema).await?
        } else {
            HashSet::new()
        };
        ensure_table(
            &mut plan,
            schema,
            &existing_tables,
            "records",
            build_records_table_sql,
        );
        ensure_table(
            &mut plan,
            schema,
            &existing_tables,
            "sequence_counters",
            build_sequence_counters_table_sql,
        );
        ensure_table(
            &mut plan,
            schema,
            &existing_tables,
            "audit_log",
            build_audit_log_table_sql,
        );

        let existing_indexes = if schema_exists {
            self.existing_indexes(schema).await?
        } else {
            HashSet::new()
        };
        ensure_index(
            &mut plan,
            schema,
            &existing_indexes,
            "records_natural_key_uq",
            |s| build_records_unique_index_sql(s, "records_natural_key_uq", "natural_key"),
        );
        ensure_index(
            &mut plan,
            schema,
            &existing_indexes,
            "records_code_uq",
            |s| build_records_unique_index_sql(s, "records_code_uq", "code"),
        );
        ensure_index(
            &mut plan,
            schema,
            &existing_indexes,
            "records_doc_gin",
            build_records_doc_index_sql,
        );
        ensure_index(
            &mut plan,
            schema,
            &existing_indexes,
            "audit_log_tenant_idx",
            build_audit_log_index_sql,
        );

        Ok(plan)
    }

    pub async fn apply(&self, plan: &SchemaPlan) -> Result<()> {
        if plan.actions.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for action in &plan.actions {
            sqlx::query(action.sql()).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn sync(&self, config: &SchemaConfig) -> Result<SchemaPlan> {
        let plan = self.plan(config).await?;
        if !plan.is_empty() {
            self.apply(&plan).await?;
        }
        Ok(plan)
    }

    async fn existing_schemas(&self) -> Result<HashSet<String>> {
        let rows =
            sqlx::query_scalar::<_, String>("select schema_name from information_schema.schemata")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }

    async fn existing_tables(&self, schema: &str) -> Result<HashSet<String>> {
        let rows = sqlx::query_scalar::<_, String>(
            "select table_name from information_schema.tables where table_schema = $1",
        )
        .bind(schema)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn existing_indexes(&self, schema: &str) -> Result<HashSet<String>> {
        let rows = sqlx::query_scalar::<_, String>(
            "select indexname from pg_indexes where schemaname = $1",
        )
        .bind(schema)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }
}

#[derive(Clone, Debug)]
pub struct SchemaConfig {
    pub base_schema: String,
}

impl SchemaConfig {
    pub fn with_base_schema(schema: impl Into<String>) -> Self {
        Self {
            base_schema: schema.into(),
        }
    }
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            base_schema: "public".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SchemaPlan {
    actions: Vec<SchemaAction>,
    warnings: Vec<String>,
}

impl SchemaPlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn actions(&self) -> &[SchemaAction] {
        &self.actions
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    fn push_action(&mut self, description: String, sql: String) {
        self.actions.push(SchemaAction { description, sql });
    }

    fn push_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }
}

#[derive(Clone, Debug)]
pub struct SchemaAction {
    description: String,
    sql: String,
}

impl SchemaAction {
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

fn ensure_table<F>(
    plan: &mut SchemaPlan,
    schema: &str,
    existing: &HashSet<String>,
    table: &str,
    build: F,
) where
    F: Fn(&str) -> String,
{
    if existing.contains(table) {
        return;
    }
    plan.push_action(
        format!("create table {}", qualified_name(schema, table)),
        build(schema),
    );
}

fn ensure_index<F>(
    plan: &mut SchemaPlan,
    schema: &str,
    existing: &HashSet<String>,
    index: &str,
    build: F,
) where
    F: Fn(&str) -> String,
{
    if existing.contains(index) {
        return;
    }
    plan.push_action(
        format!("create index {}", qualified_name(schema, index)),
        build(schema),
    );
}

fn build_records_table_sql(schema: &str) -> String {
    formatdoc!(
        "
        create table if not exists {table} (
            id uuid primary key,
            collection text not null,
            client_id text not null,
            company_id text null,
            code text null,
            natural_key text null,
            doc jsonb not null,
            created_at timestamptz not null default now(),
            created_by text null
        )
        ",
        table = qualified_name(schema, "records"),
    )
}

fn build_sequence_counters_table_sql(schema: &str) -> String {
    formatdoc!(
        "
        create table if not exists {table} (
            scope text not null,
            entity_type text not null,
            seq bigint not null default 0 check (seq >= 0),
            updated_at timestamptz not null default now(),
            primary key (scope, entity_type)
        )
        ",
        table = qualified_name(schema, "sequence_counters"),
    )
}

fn build_audit_log_table_sql(schema: &str) -> String {
    formatdoc!(
        "
        create table if not exists {table} (
            id bigserial primary key,
            client_id text not null,
            company_id text null,
            actor text null,
            action text not null,
            entity_type text not null,
            detail jsonb not null default '{{}}'::jsonb,
            created_at timestamptz not null default now()
        )
        ",
        table = qualified_name(schema, "audit_log"),
    )
}

// One value per tenant and collection; rows with a null column are not constrained.
fn build_records_unique_index_sql(schema: &str, index: &str, column: &str) -> String {
    formatdoc!(
        "
        create unique index if not exists {index}
            on {table} (collection, client_id, coalesce(company_id, ''), {column})
            where {column} is not null
        ",
        index = quote_ident(index),
        table = qualified_name(schema, "records"),
        column = quote_ident(column),
    )
}

fn build_records_doc_index_sql(schema: &str) -> String {
    format!(
        "create index if not exists {} on {} using gin (doc)",
        quote_ident("records_doc_gin"),
        qualified_name(schema, "records"),
    )
}

fn build_audit_log_index_sql(schema: &str) -> String {
    format!(
        "create index if not exists {} on {} (client_id, company_id, created_at)",
        quote_ident("audit_log_tenant_idx"),
        qualified_name(schema, "audit_log"),
    )
}

pub fn qualified_name(schema: &str, ident: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(ident))
}

pub fn quote_ident(value: &str) -> String {
    let escaped = value.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified() {
        assert_eq!(qualified_name("public", "records"), "\"public\".\"records\"");
    }

    #[test]
    fn quote_handles_quotes() {
        assert_eq!(quote_ident("weird\"name"), "\"weird\"\"name\"");
    }

    #[test]
    fn ensure_table_skips_existing() {
        let mut plan = SchemaPlan::default();
        let existing: HashSet<String> = ["records".to_string()].into_iter().collect();
        ensure_table(&mut plan, "public", &existing, "records", build_records_table_sql);
        ensure_table(
            &mut plan,
            "public",
            &existing,
            "audit_log",
            build_audit_log_table_sql,
        );
        assert_eq!(plan.actions().len(), 1);
        assert_eq!(
            plan.actions()[0].description(),
            "create table \"public\".\"audit_log\""
        );
        assert!(plan.actions()[0].sql().contains("'{}'::jsonb"));
    }

    #[test]
    fn unique_index_is_partial_per_tenant() {
        let sql = build_records_unique_index_sql("erp", "records_code_uq", "code");
        assert!(sql.contains("on \"erp\".\"records\" (collection, client_id, coalesce(company_id, ''), \"code\")"));
        assert!(sql.contains("where \"code\" is not null"));
    }
}
