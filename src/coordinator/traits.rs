//! Requester and listener capability traits

use std::collections::HashSet;

use async_trait::async_trait;

use super::core::BulkCoordinator;
use super::query::ResultSnapshot;

/// Performs the actual data gathering, typically an API request.
///
/// The coordinator hands over three disjoint key sets in priority order. The
/// implementation may act on any subset of `asap` and `normal` and may ignore
/// `backlog` entirely (it lists keys that are known of but not yet due, so a
/// bulk request that is going out anyway can pick them up for free).
///
/// Contract: every key the implementation accepts must be passed to
/// [`BulkCoordinator::mark_requested`] before any I/O, so it is excluded from
/// later dispatch cycles, and must eventually be answered through one of the
/// result methods (`set_value`, `set_not_found`, `set_error`).
#[async_trait]
pub trait Requester<K, V>: Send + Sync {
    async fn request(
        &self,
        coordinator: &BulkCoordinator<K, V>,
        asap: HashSet<K>,
        normal: HashSet<K>,
        backlog: HashSet<K>,
    );
}

/// Receives result snapshots for a query.
///
/// Called without the coordinator lock held, so the implementation is free to
/// call back into the coordinator. A listener must not assume it is called
/// exactly once unless the query completes in one step; under PARTIAL or
/// RETRY it sees every distinct intermediate snapshot.
#[async_trait]
pub trait ResultListener<K, V>: Send + Sync {
    async fn on_result(&self, result: ResultSnapshot<K, V>);
}
