//! Data access error taxonomy.
//!
//! Storage failures are classified by SQLSTATE so callers can decide
//! between retrying, surfacing a conflict, or giving up.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DataErrorKind {
    NotFound,
    Conflict,
    Validation,
    Transient,
    Unknown,
}

impl DataErrorKind {
    /// Classification for a Postgres SQLSTATE code.
    pub fn from_sql_state(state: &str) -> Self {
        match state {
            "P0002" => Self::NotFound,
            "23505" => Self::Conflict,
            "23503" | "23514" | "23502" | "22001" => Self::Validation,
            "40001" | "40P01" | "53300" | "57014" => Self::Transient,
            _ => Self::Unknown,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

#[derive(Debug, Error)]
#[error("{operation} failed ({kind:?}): {source}")]
pub struct DataError {
    pub kind: DataErrorKind,
    pub operation: &'static str,
    pub sql_state: Option<String>,
    #[source]
    pub source: sqlx::Error,
}

impl DataError {
    /// Wraps a driver error with its classification.
    pub fn translate(operation: &'static str, source: sqlx::Error) -> Self {
        let sql_state = source
            .as_database_error()
            .and_then(|db| db.code())
            .map(|code| code.into_owned());

        let kind = match (&source, sql_state.as_deref()) {
            (_, Some(state)) => DataErrorKind::from_sql_state(state),
            (sqlx::Error::RowNotFound, None) => DataErrorKind::NotFound,
            (
                sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::Protocol(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed,
                None,
            ) => DataErrorKind::Transient,
            _ => DataErrorKind::Unknown,
        };

        Self {
            kind,
            operation,
            sql_state,
            source,
        }
    }

    /// Closure form for `map_err`.
    pub fn during(operation: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| Self::translate(operation, source)
    }
}
