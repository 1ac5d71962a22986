//! Listing store (SQLite via sqlx) + outbound HTTP fetch utilities for lotwatch.

mod http;
mod reports;
mod store;

use thiserror::Error;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use reports::{BestValueRow, MakeModelStats, PriceDropRow, StoreStats};
pub use store::{ListingStore, StoreTx};

pub const CRATE_NAME: &str = "lotwatch-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    /// Transient contention (busy/locked database, key collision with a concurrent writer).
    #[error("write conflict: {0}")]
    Conflict(#[source] sqlx::Error),
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        let transient = match &err {
            sqlx::Error::PoolTimedOut => true,
            sqlx::Error::Database(db) => {
                db.is_unique_violation()
                    // SQLITE_BUSY, SQLITE_LOCKED and their extended variants.
                    || matches!(db.code().as_deref(), Some("5" | "6" | "261" | "262" | "517"))
            }
            _ => false,
        };
        if transient {
            Self::Conflict(err)
        } else {
            Self::Database(err)
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
