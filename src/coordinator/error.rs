//! Coordinator error types

use std::time::Duration;
use thiserror::Error;

/// Errors from the awaitable fetch path.
///
/// Everything else in the coordinator treats errors as data: transient
/// upstream failures are recorded per key via `set_error` and surface in
/// result snapshots, never as `Err`.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The submit was dropped (coordinator closed, empty key set, or a
    /// UNIQUE duplicate)
    #[error("query was rejected at submit")]
    Rejected,

    /// The query was dropped before emitting, by replacement or close
    #[error("query was dropped before a result was emitted")]
    Dropped,

    /// No result within the given window
    #[error("no result within {0:?}")]
    Timeout(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(FetchError::Rejected.to_string(), "query was rejected at submit");
        assert!(FetchError::Timeout(Duration::from_secs(5)).to_string().contains("5s"));
    }
}
