//! Atomic per-scope counters used to hand out human-readable record codes.
//!
//! A counter is identified by a [`SequenceKey`] and only ever moves forward through a single
//! `insert .. on conflict do update .. returning` statement, so concurrent callers can never be
//! handed overlapping ranges. Counters are created on first use.

use crate::{Error, Result, metrics};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::fmt;
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SequenceKey {
    pub scope: String,
    pub entity_type: String,
}

impl SequenceKey {
    pub fn new(scope: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            entity_type: entity_type.into(),
        }
    }
}

impl fmt::Display for SequenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope, self.entity_type)
    }
}

/// Inclusive range of sequence values reserved by one call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceRange {
    pub start: i64,
    pub end: i64,
}

impl SequenceRange {
    /// Range ending at `value` (the post-increment counter) holding `count` values.
    pub fn ending_at(value: i64, count: u32) -> Self {
        Self {
            start: value - i64::from(count) + 1,
            end: value,
        }
    }

    pub fn len(&self) -> usize {
        (self.end - self.start + 1).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn overlaps(&self, other: &SequenceRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn values(&self) -> impl Iterator<Item = i64> {
        self.start..=self.end
    }

    pub fn codes(&self, format: &CodeFormat) -> Vec<String> {
        self.values().map(|v| format.render(v)).collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeFormat {
    pub width: usize,
    #[serde(default)]
    pub prefix: String,
}

impl Default for CodeFormat {
    fn default() -> Self {
        Self {
            width: 6,
            prefix: String::new(),
        }
    }
}

impl CodeFormat {
    pub fn render(&self, value: i64) -> String {
        format!("{}{}", self.prefix, format_code(value, self.width))
    }
}

/// Left-pad `value` with zeros to `width` digits. Wider values are kept whole.
pub fn format_code(value: i64, width: usize) -> String {
    format!("{value:0width$}")
}

#[async_trait]
pub trait SequenceSource: Send + Sync {
    /// Atomically add `count` to the counter and return its new value.
    async fn next_sequence(&self, key: &SequenceKey, count: u32) -> Result<i64>;

    async fn next_range(&self, key: &SequenceKey, count: u32) -> Result<SequenceRange> {
        if count == 0 {
            return Err(Error::InvalidSequenceCount);
        }
        let value = self.next_sequence(key, count).await?;
        let range = SequenceRange::ending_at(value, count);
        metrics::record_sequence_allocation(u64::from(count));
        debug!(key = %key, start = range.start, end = range.end, "sequence range reserved");
        Ok(range)
    }
}

/// Postgres-backed counters in the `sequence_counters` table.
#[derive(Clone)]
pub struct Sequences {
    pub(crate) pool: PgPool,
}

impl Sequences {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Current value without incrementing; `None` before first use.
    pub async fn current(&self, key: &SequenceKey) -> Result<Option<i64>> {
        let value: Option<i64> = sqlx::query_scalar(
            "select seq from sequence_counters where scope = $1 and entity_type = $2",
        )
        .bind(&key.scope)
        .bind(&key.entity_type)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }
}

#[async_trait]
impl SequenceSource for Sequences {
    async fn next_sequence(&self, key: &SequenceKey, count: u32) -> Result<i64> {
        if count == 0 {
            return Err(Error::InvalidSequenceCount);
        }
        let value: Option<i64> = sqlx::query_scalar(
            r#"insert into sequence_counters (scope, entity_type, seq)
                values ($1, $2, $3)
                on conflict (scope, entity_type) do update
                  set seq = sequence_counters.seq + excluded.seq,
                      updated_at = now()
                returning seq"#,
        )
        .bind(&key.scope)
        .bind(&key.entity_type)
        .bind(i64::from(count))
        .fetch_optional(&self.pool)
        .await?;
        value.ok_or_else(|| Error::SequenceUnavailable {
            scope: key.scope.clone(),
            entity_type: key.entity_type.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemorySequences;

    #[test]
    fn pads_to_width() {
        assert_eq!(format_code(7, 6), "000007");
        assert_eq!(format_code(42, 12), "000000000042");
        assert_eq!(format_code(1234567, 6), "1234567");
    }

    #[test]
    fn range_math() {
        let r = SequenceRange::ending_at(8, 3);
        assert_eq!((r.start, r.end), (6, 8));
        assert_eq!(r.len(), 3);
        assert!(!r.overlaps(&SequenceRange::ending_at(5, 5)));
        assert!(r.overlaps(&SequenceRange::ending_at(6, 1)));
    }

    #[test]
    fn codes_with_prefix() {
        let fmt = CodeFormat {
            width: 4,
            prefix: "VEN-".into(),
        };
        let codes = SequenceRange { start: 9, end: 11 }.codes(&fmt);
        assert_eq!(codes, vec!["VEN-0009", "VEN-0010", "VEN-0011"]);
    }

    #[tokio::test]
    async fn consecutive_ranges_follow_each_other() {
        let seqs = MemorySequences::default();
        let key = SequenceKey::new("acme/north", "vendor");
        let first = seqs.next_range(&key, 5).await.unwrap();
        let second = seqs.next_range(&key, 3).await.unwrap();
        assert_eq!(first, SequenceRange { start: 1, end: 5 });
        assert_eq!(second, SequenceRange { start: 6, end: 8 });
    }

    #[tokio::test]
    async fn zero_count_is_rejected_without_touching_counter() {
        let seqs = MemorySequences::default();
        let key = SequenceKey::new("acme", "agent");
        let err = seqs.next_range(&key, 0).await.expect_err("zero count");
        assert!(matches!(err, Error::InvalidSequenceCount));
        assert_eq!(seqs.calls(), 0);
        assert_eq!(seqs.next_range(&key, 1).await.unwrap().start, 1);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let seqs = MemorySequences::default();
        let a = SequenceKey::new("acme", "agent");
        let b = SequenceKey::new("acme", "vendor");
        seqs.next_range(&a, 10).await.unwrap();
        assert_eq!(seqs.next_range(&b, 2).await.unwrap().start, 1);
    }
}
