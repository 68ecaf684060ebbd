//! Error taxonomy for the engine, matching §7 of the spec: transient store
//! errors, blocking/retryable/terminal crawl errors, policy skips, and fatal
//! infrastructure conditions. Typed end to end rather than collapsed into
//! `anyhow::Result` the way the teacher's `ProcessStore` trait does, since
//! the retry/backoff and blocked/retryable/terminal classification this
//! spec needs has to inspect the error's shape, not just its message.

use thiserror::Error;

/// Errors surfaced by the `JobStore` trait.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("transient store error: {0}")]
    Transient(String),

    #[error("pool saturated: {0} in-flight transactions")]
    PoolSaturated(usize),

    #[error("constraint or data error: {0}")]
    Data(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// §4.1 failure semantics: transient errors (serialisation failure,
    /// deadlock, connection loss, pool saturation) are retried with
    /// exponential backoff; everything else is final.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Transient(_) | StoreError::PoolSaturated(_) => true,
            StoreError::Data(_) | StoreError::Serialization(_) => false,
            #[cfg(feature = "postgres")]
            StoreError::Database(e) => database_error_is_transient(e),
        }
    }
}

#[cfg(feature = "postgres")]
fn database_error_is_transient(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db_err) => {
            // Postgres SQLSTATE 40001 = serialization_failure, 40P01 = deadlock_detected.
            matches!(db_err.code().as_deref(), Some("40001") | Some("40P01"))
        }
        _ => false,
    }
}

/// Error category returned by the `Crawler` capability (§4.5, §7). The
/// core never string-matches error text to infer this — the crawler is
/// contractually required to classify.
#[derive(Error, Debug, Clone)]
pub enum CrawlError {
    #[error("blocking response: status={status_code:?} retry_after_ms={retry_after_ms:?}")]
    Blocking {
        status_code: Option<u16>,
        retry_after_ms: Option<u64>,
    },

    #[error("retryable crawl error: {message}")]
    Retryable { message: String },

    #[error("terminal crawl error: status={status_code:?} message={message}")]
    Terminal {
        status_code: Option<u16>,
        message: String,
    },

    #[error("policy skip: {reason}")]
    Skip { reason: String },
}

/// Top-level engine error for job-manager and pool-facing operations.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("job not found: {0}")]
    JobNotFound(uuid::Uuid),

    #[error("fatal infrastructure error: {0}")]
    FatalInfrastructure(String),
}
