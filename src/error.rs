//! Typed error kinds for the forensic pipeline.
//!
//! Most plumbing uses `anyhow::Result` with `.context()`; these kinds exist
//! where callers need to branch (REST status mapping, retry policy).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForensicsError {
    /// RPC transport failure after retries were exhausted.
    #[error("upstream RPC failure: {0}")]
    Upstream(String),

    /// Malformed log payload. Counted and dropped, never fatal.
    #[error("malformed log: {0}")]
    Decode(String),

    /// Query miss (404 for REST).
    #[error("not found: {0}")]
    NotFound(String),

    /// Subscriber queue overflow.
    #[error("subscriber capacity exceeded")]
    Capacity,

    /// Durable-store write failure; rolled back and retried on the next tick.
    #[error("durable store failure: {0}")]
    Persistence(String),

    /// Cooperative cancellation; partial results are still valid.
    #[error("cancelled")]
    Cancelled,
}

impl ForensicsError {
    /// HTTP status code a REST handler should map this error to.
    pub fn status_code(&self) -> u16 {
        match self {
            ForensicsError::Upstream(_) => 502,
            ForensicsError::Decode(_) => 422,
            ForensicsError::NotFound(_) => 404,
            ForensicsError::Capacity => 429,
            ForensicsError::Persistence(_) => 500,
            ForensicsError::Cancelled => 200,
        }
    }
}
