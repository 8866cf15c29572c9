use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("unknown entity type: {0}")]
    UnknownEntity(String),
    #[error("sequence count must be at least 1")]
    InvalidSequenceCount,
    #[error("sequence counter for {scope}/{entity_type} returned no value")]
    SequenceUnavailable { scope: String, entity_type: String },
    #[error("record not found")]
    RecordNotFound,
    #[error("configuration error: {0}")]
    Config(String),
    #[error("constraint violation on `{constraint}`: {detail}")]
    ConstraintViolation { constraint: String, detail: String },
    #[error("bulk insert partially failed ({} inserted): {detail}", inserted.len())]
    PartialInsert { inserted: Vec<Uuid>, detail: String },
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Map a driver error into a constraint violation when Postgres names the constraint.
    pub(crate) fn from_db(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if let Some(constraint) = db.constraint() {
                return Error::ConstraintViolation {
                    constraint: constraint.to_string(),
                    detail: db.message().to_string(),
                };
            }
        }
        Error::Db(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub trait WithContext<T> {
    fn context(self, msg: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<Error>> WithContext<T> for std::result::Result<T, E> {
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Context {
            context: msg.into(),
            source: Box::new(e.into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_wraps_source() {
        let res: Result<()> = Err(Error::UnknownEntity("widget".into()));
        let err = res.context("loading import").expect_err("should wrap");
        assert_eq!(err.to_string(), "loading import: unknown entity type: widget");
    }

    #[test]
    fn context_converts_foreign_errors() {
        let err = std::fs::read_to_string("/definitely/not/here.json")
            .context("reading /definitely/not/here.json")
            .expect_err("missing file");
        assert!(matches!(&err, Error::Context { source, .. } if matches!(**source, Error::Io(_))));
        assert!(err.to_string().starts_with("reading /definitely/not/here.json: io error:"));
    }

    #[test]
    fn partial_insert_reports_count() {
        let err = Error::PartialInsert {
            inserted: vec![Uuid::new_v4(), Uuid::new_v4()],
            detail: "duplicate key".into(),
        };
        assert_eq!(
            err.to_string(),
            "bulk insert partially failed (2 inserted): duplicate key"
        );
    }
}
