//! Column encoding shared by the SQLite adapters.
//!
//! Timestamps are RFC 3339 text, ids are hyphenated UUID text, and
//! structured fields are JSON text.

use std::str::FromStr;

use autoflow_types::error::RepositoryError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid id '{s}': {e}")))
}

pub(crate) fn parse_enum<T: FromStr<Err = String>>(s: &str) -> Result<T, RepositoryError> {
    s.parse().map_err(RepositoryError::Query)
}

pub(crate) fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(e.to_string()))
}

pub(crate) fn from_json<T: DeserializeOwned>(s: &str, column: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {column} JSON: {e}")))
}

/// Map a driver error, surfacing constraint violations as conflicts.
pub(crate) fn query_err(e: sqlx::Error) -> RepositoryError {
    if let sqlx::Error::Database(ref db_err) = e {
        if db_err.message().contains("UNIQUE") {
            return RepositoryError::Conflict(db_err.message().to_string());
        }
        if db_err.message().contains("FOREIGN KEY") {
            return RepositoryError::NotFound;
        }
    }
    RepositoryError::Query(e.to_string())
}

/// `?, ?, ?` for an `IN` list of `n` values.
pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}
