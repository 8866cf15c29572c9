use crate::{
    Error, Result,
    batch::{BatchSink, ChunkOutcome, PreparedRecord, RecordFailure},
    context::TenantScope,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use sqlx::{PgPool, Postgres, QueryBuilder, types::Json};
use std::collections::HashSet;
use uuid::Uuid;

/// A named, tenant-partitioned set of JSON documents in the `records` table.
#[derive(Clone, Debug)]
pub struct Collection {
    pub(crate) pool: PgPool,
    pub(crate) name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub id: Uuid,
    pub code: Option<String>,
    pub natural_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub created_by: Option<String>,
}

impl Collection {
    pub fn new(pool: PgPool, name: impl Into<String>) -> Self {
        Self {
            pool,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get<T: DeserializeOwned>(&self, id: &Uuid) -> Result<Option<T>> {
        let doc: Option<Value> =
            sqlx::query_scalar("select doc from records where collection = $1 and id = $2")
                .bind(&self.name)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        doc.map(|v| serde_json::from_value(v).map_err(Error::from))
            .transpose()
    }

    pub async fn get_with_metadata<T: DeserializeOwned>(
        &self,
        id: &Uuid,
    ) -> Result<(T, RecordMetadata)> {
        let row: Option<(Value, Option<String>, Option<String>, DateTime<Utc>, Option<String>)> =
            sqlx::query_as(
                "select doc, code, natural_key, created_at, created_by from records where collection = $1 and id = $2",
            )
            .bind(&self.name)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let (value, code, natural_key, created_at, created_by) = row.ok_or(Error::RecordNotFound)?;
        let doc: T = serde_json::from_value(value)?;
        Ok((
            doc,
            RecordMetadata {
                id: *id,
                code,
                natural_key,
                created_at,
                created_by,
            },
        ))
    }

    pub async fn find_by_code<T: DeserializeOwned>(
        &self,
        tenant: &TenantScope,
        code: &str,
    ) -> Result<Option<(Uuid, T)>> {
        let row: Option<(Uuid, Value)> = sqlx::query_as(
            r#"select id, doc from records
                where collection = $1 and client_id = $2
                  and company_id is not distinct from $3 and code = $4"#,
        )
        .bind(&self.name)
        .bind(&tenant.client)
        .bind(&tenant.company)
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some((id, value)) => Ok(Some((id, serde_json::from_value(value)?))),
            None => Ok(None),
        }
    }

    pub async fn count(&self, tenant: &TenantScope) -> Result<i64> {
        let n: i64 = sqlx::query_scalar(
            r#"select count(*) from records
                where collection = $1 and client_id = $2 and company_id is not distinct from $3"#,
        )
        .bind(&self.name)
        .bind(&tenant.client)
        .bind(&tenant.company)
        .fetch_one(&self.pool)
        .await?;
        Ok(n)
    }

    /// Multi-row insert that skips rows violating a unique index and reports the rest.
    pub async fn insert_many(&self, records: &[PreparedRecord]) -> Result<ChunkOutcome> {
        if records.is_empty() {
            return Ok(ChunkOutcome::default());
        }

        let mut qb = QueryBuilder::<Postgres>::new(
            "insert into records (id, collection, client_id, company_id, code, natural_key, doc, created_by) ",
        );
        qb.push_values(records, |mut row, rec| {
            row.push_bind(rec.id)
                .push_bind(self.name.clone())
                .push_bind(rec.tenant.client.clone())
                .push_bind(rec.tenant.company.clone())
                .push_bind(rec.code.clone())
                .push_bind(rec.natural_key.clone())
                .push_bind(Json(rec.doc.clone()))
                .push_bind(rec.created_by.clone());
        });
        qb.push(" on conflict do nothing returning id");

        let inserted: Vec<Uuid> = qb
            .build_query_scalar::<Uuid>()
            .fetch_all(&self.pool)
            .await
            .map_err(Error::from_db)?;

        let written: HashSet<Uuid> = inserted.iter().copied().collect();
        let failed = records
            .iter()
            .filter(|rec| !written.contains(&rec.id))
            .map(|rec| RecordFailure {
                id: rec.id,
                reason: "duplicate key".to_string(),
            })
            .collect();
        Ok(ChunkOutcome { inserted, failed })
    }

    /// Ids out of `ids` present in this collection.
    pub async fn existing_ids(&self, ids: &[Uuid]) -> Result<HashSet<Uuid>> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let found: Vec<Uuid> =
            sqlx::query_scalar("select id from records where collection = $1 and id = any($2)")
                .bind(&self.name)
                .bind(ids)
                .fetch_all(&self.pool)
                .await?;
        Ok(found.into_iter().collect())
    }
}

#[async_trait]
impl BatchSink for Collection {
    async fn insert_chunk(&self, chunk: Vec<PreparedRecord>) -> Result<ChunkOutcome> {
        self.insert_many(&chunk).await
    }

    async fn verify(&self, ids: &[Uuid]) -> Result<HashSet<Uuid>> {
        self.existing_ids(ids).await
    }
}
