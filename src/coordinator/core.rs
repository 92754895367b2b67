//! Main coordinator implementation
//!
//! [`BulkCoordinator`] aggregates per-key interests into batched upstream
//! requests, caches successful results, retries transient errors with a
//! back-off curve and fans finished results out to query listeners.
//!
//! All mutable state lives behind one coarse mutex. Requester and listener
//! callbacks are always invoked after the lock has been released, so they can
//! freely call back into the coordinator.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::config::CoordinatorConfig;
use super::error::FetchError;
use super::query::{Query, QueryToken, ResultSnapshot};
use super::store::CacheStore;
use super::traits::{Requester, ResultListener};
use crate::policy::Policy;

/// Internal state protected by the coordinator mutex
struct CoordinatorState<K, V> {
    /// Registered queries in submission order; replacement keeps the slot
    queries: Vec<(QueryToken, Query<K, V>)>,
    store: CacheStore<K, V>,
}

impl<K, V> CoordinatorState<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone + PartialEq,
{
    /// A response of some kind arrived for `key`: clear its pending record
    /// and note the response in every query that contains the key.
    fn response_received(&mut self, key: &K) {
        self.store.clear_pending(key);
        for (_, query) in &mut self.queries {
            query.response_received(key);
        }
    }

    fn apply_value(&mut self, key: K, value: V) {
        self.store.insert_value(key.clone(), value);
        self.response_received(&key);
    }
}

/// Cached bulk request coordinator, parameterized over key and value types.
///
/// One instance per data domain. Callers register queries with [`submit`]
/// (or the [`get_or_submit`] family); the configured [`Requester`] is invoked
/// with batches of due keys on a periodic tick, or immediately for ASAP
/// queries; results flow back in through `set_value` / `set_not_found` /
/// `set_error` and out to listeners as queries complete.
///
/// [`submit`]: BulkCoordinator::submit
/// [`get_or_submit`]: BulkCoordinator::get_or_submit
pub struct BulkCoordinator<K, V> {
    config: CoordinatorConfig,
    requester: Arc<dyn Requester<K, V>>,
    inner: Mutex<CoordinatorState<K, V>>,
    dispatching: AtomicBool,
    closed: AtomicBool,
    shutdown: Notify,
}

impl<K, V> BulkCoordinator<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a coordinator and spawn its tick task.
    ///
    /// Must be called inside a tokio runtime. The tick task runs detached
    /// until [`close`](Self::close) is called.
    pub fn new(requester: Arc<dyn Requester<K, V>>, config: CoordinatorConfig) -> Arc<Self> {
        info!(
            tick_secs = config.tick_interval_secs,
            policy = %config.policy,
            "BulkCoordinator started"
        );
        let coordinator = Arc::new(Self {
            config,
            requester,
            inner: Mutex::new(CoordinatorState {
                queries: Vec::new(),
                store: CacheStore::new(),
            }),
            dispatching: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        });
        tokio::spawn(Arc::clone(&coordinator).run_ticker());
        coordinator
    }

    /// Drive [`dispatch`](Self::dispatch) once per tick interval until close
    async fn run_ticker(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.config.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first interval tick completes immediately; the first dispatch
        // belongs one full interval after construction
        tick.tick().await;
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if self.closed.load(Ordering::SeqCst) {
                        break;
                    }
                    self.dispatch().await;
                }
                _ = self.shutdown.notified() => break,
            }
        }
        debug!("BulkCoordinator ticker stopped");
    }

    /// Stop the tick task, drop all registered queries and refuse further
    /// submits. Idempotent. Listeners of dropped queries are never called
    /// again.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_waiters();
        let dropped = {
            let mut state = self.inner.lock().await;
            state.queries.drain(..).count()
        };
        info!(dropped_queries = dropped, "BulkCoordinator closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    //=============
    // Add queries
    //=============

    /// Register a query for `keys`, returning the token it is registered
    /// under.
    ///
    /// An empty key set is dropped silently, as is a submit after close.
    /// Passing `None` for `token` mints a fresh unique token; reusing a
    /// token replaces the query registered under it (unless NO_REPLACE is
    /// set). With UNIQUE the submit is dropped when an equal query (same
    /// keys, listener identity and policy) is already registered. With
    /// REFRESH the listed keys are evicted from the value cache first. With
    /// ASAP a dispatch runs before this method returns.
    pub async fn submit(
        &self,
        token: Option<QueryToken>,
        listener: Option<Arc<dyn ResultListener<K, V>>>,
        policy: Policy,
        keys: impl IntoIterator<Item = K>,
    ) -> Option<QueryToken> {
        let keys: HashSet<K> = keys.into_iter().collect();
        debug!(key_count = keys.len(), policy = %policy, "BulkCoordinator::submit: called");
        if keys.is_empty() {
            return None;
        }
        if self.closed.load(Ordering::SeqCst) {
            warn!("BulkCoordinator::submit: coordinator closed, dropping query");
            return None;
        }
        let token = token.unwrap_or_else(QueryToken::mint);
        let query = Query::new(listener, policy, keys);
        let effective = policy | self.config.policy;
        {
            let mut state = self.inner.lock().await;
            if effective.contains(Policy::UNIQUE) && state.queries.iter().any(|(_, q)| q.matches(&query)) {
                debug!("BulkCoordinator::submit: equal query already registered, dropping");
                return None;
            }
            if effective.contains(Policy::NO_REPLACE) && state.queries.iter().any(|(t, _)| *t == token) {
                debug!(%token, "BulkCoordinator::submit: token already registered, dropping");
                return None;
            }
            if effective.contains(Policy::REFRESH) {
                for key in &query.keys {
                    state.store.evict_value(key);
                }
            }
            if let Some(entry) = state.queries.iter_mut().find(|(t, _)| *t == token) {
                debug!(%token, "BulkCoordinator::submit: replacing query under token");
                entry.1 = query;
            } else {
                state.queries.push((token.clone(), query));
            }
        }
        // the new query may already be satisfiable from cache
        self.run_completion().await;

        if effective.contains(Policy::ASAP) && self.is_registered(&token).await {
            self.dispatch().await;
        }
        Some(token)
    }

    async fn is_registered(&self, token: &QueryToken) -> bool {
        let state = self.inner.lock().await;
        state.queries.iter().any(|(t, _)| t == token)
    }

    //=================
    // Get cached data
    //=================

    /// The cached value for a key, if any
    pub async fn get(&self, key: &K) -> Option<V> {
        let state = self.inner.lock().await;
        state.store.value(key).cloned()
    }

    /// Compute a synchronous snapshot for `keys` under `policy`; register a
    /// query only when the snapshot does not resolve every key.
    ///
    /// The snapshot follows the same RETRY/WAIT rules as regular completion,
    /// so it may be `None` even when some keys are resolved. The returned
    /// token is `None` when no query was registered.
    pub async fn get_or_submit(
        &self,
        token: Option<QueryToken>,
        listener: Option<Arc<dyn ResultListener<K, V>>>,
        policy: Policy,
        keys: impl IntoIterator<Item = K>,
    ) -> (Option<ResultSnapshot<K, V>>, Option<QueryToken>) {
        let keys: HashSet<K> = keys.into_iter().collect();
        debug!(key_count = keys.len(), policy = %policy, "BulkCoordinator::get_or_submit: called");
        if keys.is_empty() {
            return (None, None);
        }
        let snapshot = {
            let state = self.inner.lock().await;
            let mut probe = Query::new(listener.clone(), policy, keys.clone());
            compute_result(&self.config, &state.store, &mut probe)
        };
        match snapshot {
            Some(snapshot) if snapshot.has_all_keys() => (Some(snapshot), None),
            snapshot => {
                let token = self.submit(token, listener, policy, keys).await;
                (snapshot, token)
            }
        }
    }

    /// Single-key convenience: the cached value if present, otherwise
    /// register a query and return `None`
    pub async fn get_or_submit_single(
        &self,
        token: Option<QueryToken>,
        listener: Option<Arc<dyn ResultListener<K, V>>>,
        policy: Policy,
        key: K,
    ) -> Option<V> {
        if let Some(value) = self.get(&key).await {
            return Some(value);
        }
        self.submit(token, listener, policy, [key]).await;
        None
    }

    /// Awaitable submit: register a query whose listener resolves a oneshot
    /// channel, and wait for the first emitted snapshot.
    ///
    /// Meant for WAIT- or RETRY-style policies where the first emission is
    /// the complete answer. On timeout the query stays registered and may
    /// still complete into the cache; only the channel is abandoned.
    pub async fn fetch(
        &self,
        policy: Policy,
        keys: impl IntoIterator<Item = K>,
        timeout: Duration,
    ) -> Result<ResultSnapshot<K, V>, FetchError> {
        let (tx, rx) = oneshot::channel();
        let listener: Arc<dyn ResultListener<K, V>> = Arc::new(ChannelListener {
            tx: StdMutex::new(Some(tx)),
        });
        if self.submit(None, Some(listener), policy, keys).await.is_none() {
            return Err(FetchError::Rejected);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(snapshot)) => Ok(snapshot),
            Ok(Err(_)) => Err(FetchError::Dropped),
            Err(_) => Err(FetchError::Timeout(timeout)),
        }
    }

    //=================
    // Request results
    //=================

    /// Record a successful value for a key
    pub async fn set_value(&self, key: K, value: V) {
        debug!("BulkCoordinator::set_value: called");
        {
            let mut state = self.inner.lock().await;
            state.apply_value(key, value);
        }
        self.run_completion().await;
    }

    /// Record successful values in bulk; listeners see one combined update
    pub async fn set_values(&self, values: impl IntoIterator<Item = (K, V)>) {
        debug!("BulkCoordinator::set_values: called");
        {
            let mut state = self.inner.lock().await;
            for (key, value) in values {
                state.apply_value(key, value);
            }
        }
        self.run_completion().await;
    }

    /// Record a permanent not-found resolution for keys
    pub async fn set_not_found(&self, keys: impl IntoIterator<Item = K>) {
        debug!("BulkCoordinator::set_not_found: called");
        {
            let mut state = self.inner.lock().await;
            for key in keys {
                state.store.insert_not_found(key.clone());
                state.response_received(&key);
            }
        }
        self.run_completion().await;
    }

    /// Record a transient error for keys. Increments each key's consecutive
    /// error count, which drives the re-request back-off. Cached values are
    /// retained.
    pub async fn set_error(&self, keys: impl IntoIterator<Item = K>) {
        debug!("BulkCoordinator::set_error: called");
        {
            let mut state = self.inner.lock().await;
            for key in keys {
                state.store.record_error(key.clone());
                state.response_received(&key);
            }
        }
        self.run_completion().await;
    }

    /// Mark keys as in flight upstream. The requester must call this for
    /// every key it accepts, before any I/O, so the keys are excluded from
    /// subsequent dispatch cycles.
    pub async fn mark_requested(&self, keys: impl IntoIterator<Item = K>) {
        let mut state = self.inner.lock().await;
        for key in keys {
            state.store.mark_pending(key);
        }
    }

    /// Pick up to `limit` keys from the given sets in priority order and
    /// mark them requested in one step. Returns the picked keys.
    pub async fn take_requested(
        &self,
        asap: &HashSet<K>,
        normal: &HashSet<K>,
        backlog: &HashSet<K>,
        limit: usize,
    ) -> HashSet<K> {
        let mut picked = HashSet::new();
        add_limited(asap, &mut picked, limit);
        add_limited(normal, &mut picked, limit);
        add_limited(backlog, &mut picked, limit);
        self.mark_requested(picked.iter().cloned()).await;
        picked
    }

    //============
    // Requesting
    //============

    /// Run one dispatch cycle: classify due keys into asap / normal /
    /// backlog and invoke the requester outside the lock.
    ///
    /// Called by the tick task and by ASAP submits; overlapping invocations
    /// are dropped.
    pub async fn dispatch(&self) {
        if self.dispatching.swap(true, Ordering::SeqCst) {
            warn!("BulkCoordinator::dispatch: already in progress, dropping overlapping call");
            return;
        }
        let (asap, normal, backlog) = {
            let state = self.inner.lock().await;
            let mut asap = HashSet::new();
            let mut normal = HashSet::new();
            let mut backlog = HashSet::new();
            for (_, query) in &state.queries {
                for key in &query.keys {
                    if state.store.is_pending(key) || query.is_accepted(key) {
                        continue;
                    }
                    if is_due(&self.config, &state.store, query, key) {
                        if (query.policy | self.config.policy).contains(Policy::ASAP) {
                            asap.insert(key.clone());
                        } else {
                            normal.insert(key.clone());
                        }
                    } else {
                        backlog.insert(key.clone());
                    }
                }
            }
            // resolve overlaps by priority
            for key in &asap {
                normal.remove(key);
                backlog.remove(key);
            }
            for key in &normal {
                backlog.remove(key);
            }
            (asap, normal, backlog)
        };
        if !asap.is_empty() || !normal.is_empty() {
            debug!(
                asap = asap.len(),
                normal = normal.len(),
                backlog = backlog.len(),
                "BulkCoordinator::dispatch: invoking requester"
            );
            let requester = Arc::clone(&self.requester);
            requester.request(self, asap, normal, backlog).await;
        }
        self.dispatching.store(false, Ordering::SeqCst);
    }

    //===================
    // Completed queries
    //===================

    /// Recompute every registered query against the cache, remove completed
    /// ones and call the affected listeners (outside the lock, in registry
    /// order).
    async fn run_completion(&self) {
        let emitted = {
            let mut state = self.inner.lock().await;
            if state.queries.is_empty() {
                return;
            }
            let CoordinatorState { queries, store } = &mut *state;
            let mut emitted = Vec::new();
            let mut i = 0;
            while i < queries.len() {
                let (_, query) = &mut queries[i];
                if let Some(snapshot) = compute_result(&self.config, store, query) {
                    let done = snapshot.has_all_keys();
                    emitted.push((query.listener.clone(), snapshot));
                    if done {
                        queries.remove(i);
                        continue;
                    }
                }
                i += 1;
            }
            emitted
        };
        for (listener, snapshot) in emitted {
            if let Some(listener) = listener {
                listener.on_result(snapshot).await;
            }
        }
    }

    //=================
    // Debugging/stuff
    //=================

    /// Short state summary for logs
    pub async fn debug_status(&self) -> String {
        let state = self.inner.lock().await;
        format!("queries: {} pending: {}", state.queries.len(), state.store.pending_len())
    }

    /// Number of registered queries
    pub async fn pending_requests(&self) -> usize {
        self.inner.lock().await.queries.len()
    }
}

/// Copy up to `limit - to.len()` keys from `from` into `to`
fn add_limited<K>(from: &HashSet<K>, to: &mut HashSet<K>, limit: usize)
where
    K: Clone + Eq + Hash,
{
    for key in from {
        if to.len() >= limit {
            return;
        }
        to.insert(key.clone());
    }
}

/// Re-request delay for a key in whole seconds: `base * errors^exponent`,
/// capped. The base drops from 10 to 2 for ASAP queries.
fn error_delay_secs<K, V>(config: &CoordinatorConfig, store: &CacheStore<K, V>, key: &K, effective: Policy) -> u64
where
    K: Clone + Eq + Hash,
{
    let errors = store.error_count(key);
    let base = if effective.contains(Policy::ASAP) {
        config.asap_error_base_secs
    } else {
        config.error_base_secs
    };
    let delay = base as f64 * (errors as f64).powi(config.error_backoff_exponent as i32);
    delay.min(config.max_error_delay_secs as f64) as u64
}

fn in_cooloff<K, V>(config: &CoordinatorConfig, store: &CacheStore<K, V>, key: &K, effective: Policy) -> bool
where
    K: Clone + Eq + Hash,
{
    match store.seconds_since_error(key) {
        Some(secs) => secs < error_delay_secs(config, store, key, effective),
        None => false,
    }
}

/// Whether a key may be re-requested for this query: REFRESH queries get one
/// free pass until a response arrives, otherwise the key's error cool-off
/// must have elapsed.
fn is_due<K, V>(config: &CoordinatorConfig, store: &CacheStore<K, V>, query: &Query<K, V>, key: &K) -> bool
where
    K: Clone + Eq + Hash,
    V: Clone + PartialEq,
{
    let effective = query.policy | config.policy;
    if effective.contains(Policy::REFRESH) && !query.is_responded(key) {
        return true;
    }
    match store.seconds_since_error(key) {
        Some(secs) => secs > error_delay_secs(config, store, key, effective),
        None => true,
    }
}

/// Compute the result snapshot a query would emit right now, if any.
///
/// Marks every key placed into the snapshot as accepted by the query, and
/// records the snapshot as the query's last result when it is emitted. The
/// caller removes the query when the snapshot has all keys.
fn compute_result<K, V>(
    config: &CoordinatorConfig,
    store: &CacheStore<K, V>,
    query: &mut Query<K, V>,
) -> Option<ResultSnapshot<K, V>>
where
    K: Clone + Eq + Hash,
    V: Clone + PartialEq,
{
    let effective = query.policy | config.policy;
    let mut entries: HashMap<K, Option<V>> = HashMap::new();
    let mut wait_errors = 0usize;
    for key in &query.keys {
        // REFRESH queries only count keys answered after submission
        if effective.contains(Policy::REFRESH) && !query.is_responded(key) {
            continue;
        }
        if let Some(value) = store.value(key) {
            entries.insert(key.clone(), Some(value.clone()));
        } else if store.is_not_found(key) {
            entries.insert(key.clone(), None);
        } else if in_cooloff(config, store, key, effective) {
            if effective.contains(Policy::RETRY) || effective.contains(Policy::WAIT) {
                // key is held back until a retry succeeds
                wait_errors += 1;
            } else {
                entries.insert(key.clone(), None);
            }
        }
    }
    let accepted: Vec<K> = entries.keys().cloned().collect();
    for key in accepted {
        query.accept(key);
    }

    // A query is removed once every key is in the snapshot. Short of that,
    // a snapshot goes out only for PARTIAL or RETRY queries, and only when
    // it differs from the previous one.
    let has_all = entries.len() == query.keys.len();
    let has_all_or_errors = entries.len() + wait_errors == query.keys.len();
    let streaming = effective.contains(Policy::PARTIAL) || effective.contains(Policy::RETRY);
    let enough_keys = effective.contains(Policy::PARTIAL) || has_all_or_errors;
    if has_all || (streaming && !entries.is_empty() && enough_keys) {
        let snapshot = ResultSnapshot::new(entries, has_all);
        if !query.same_result(&snapshot) {
            query.set_result(snapshot.clone());
            return Some(snapshot);
        }
    }
    None
}

/// Listener resolving a oneshot channel with the first emitted snapshot
struct ChannelListener<K, V> {
    tx: StdMutex<Option<oneshot::Sender<ResultSnapshot<K, V>>>>,
}

#[async_trait]
impl<K, V> ResultListener<K, V> for ChannelListener<K, V>
where
    K: Send + Sync,
    V: Send + Sync,
{
    async fn on_result(&self, result: ResultSnapshot<K, V>) {
        if let Ok(mut tx) = self.tx.lock()
            && let Some(tx) = tx.take()
        {
            let _ = tx.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NopRequester;

    #[async_trait]
    impl Requester<String, i64> for NopRequester {
        async fn request(
            &self,
            _coordinator: &BulkCoordinator<String, i64>,
            _asap: HashSet<String>,
            _normal: HashSet<String>,
            _backlog: HashSet<String>,
        ) {
        }
    }

    fn coordinator() -> Arc<BulkCoordinator<String, i64>> {
        BulkCoordinator::new(Arc::new(NopRequester), CoordinatorConfig::default())
    }

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_error_delay_curve() {
        let config = CoordinatorConfig::default();
        let mut store: CacheStore<String, i64> = CacheStore::new();
        let key = "a".to_string();

        // no errors yet: next tick may retry
        assert_eq!(error_delay_secs(&config, &store, &key, Policy::NONE), 0);

        // one error: one base period
        store.record_error(key.clone());
        assert_eq!(error_delay_secs(&config, &store, &key, Policy::NONE), 10);
        assert_eq!(error_delay_secs(&config, &store, &key, Policy::ASAP), 2);

        // the exponent makes the second error saturate the cap
        store.record_error(key.clone());
        assert_eq!(error_delay_secs(&config, &store, &key, Policy::NONE), 1800);
        assert_eq!(error_delay_secs(&config, &store, &key, Policy::ASAP), 1800);
    }

    #[test]
    fn test_is_due_fresh_key() {
        let config = CoordinatorConfig::default();
        let store: CacheStore<String, i64> = CacheStore::new();
        let query: Query<String, i64> = Query::new(None, Policy::NONE, keys(&["a"]).into_iter().collect());
        assert!(is_due(&config, &store, &query, &"a".to_string()));
    }

    #[test]
    fn test_is_due_respects_cooloff() {
        let config = CoordinatorConfig::default();
        let mut store: CacheStore<String, i64> = CacheStore::new();
        let query: Query<String, i64> = Query::new(None, Policy::NONE, keys(&["a"]).into_iter().collect());

        store.record_error("a".to_string());
        assert!(!is_due(&config, &store, &query, &"a".to_string()));
    }

    #[test]
    fn test_is_due_refresh_bypasses_cooloff_until_response() {
        let config = CoordinatorConfig::default();
        let mut store: CacheStore<String, i64> = CacheStore::new();
        let mut query: Query<String, i64> = Query::new(None, Policy::REFRESH, keys(&["a"]).into_iter().collect());

        store.record_error("a".to_string());
        assert!(is_due(&config, &store, &query, &"a".to_string()));

        query.response_received(&"a".to_string());
        assert!(!is_due(&config, &store, &query, &"a".to_string()));
    }

    #[test]
    fn test_compute_result_complete() {
        let config = CoordinatorConfig::default();
        let mut store: CacheStore<String, i64> = CacheStore::new();
        store.insert_value("a".to_string(), 1);
        store.insert_not_found("b".to_string());

        let mut query: Query<String, i64> = Query::new(None, Policy::NONE, keys(&["a", "b"]).into_iter().collect());
        let snapshot = compute_result(&config, &store, &mut query).expect("should emit");

        assert!(snapshot.has_all_keys());
        assert_eq!(snapshot.get(&"a".to_string()), Some(&1));
        assert_eq!(snapshot.get(&"b".to_string()), None);
        assert!(snapshot.contains(&"b".to_string()));
    }

    #[test]
    fn test_compute_result_incomplete_default_policy() {
        let config = CoordinatorConfig::default();
        let mut store: CacheStore<String, i64> = CacheStore::new();
        store.insert_value("a".to_string(), 1);

        // "b" has no resolution: nothing is emitted without PARTIAL/RETRY
        let mut query: Query<String, i64> = Query::new(None, Policy::NONE, keys(&["a", "b"]).into_iter().collect());
        assert!(compute_result(&config, &store, &mut query).is_none());
        assert!(query.is_accepted(&"a".to_string()));
    }

    #[test]
    fn test_compute_result_error_surfaces_as_none_by_default() {
        let config = CoordinatorConfig::default();
        let mut store: CacheStore<String, i64> = CacheStore::new();
        store.insert_value("a".to_string(), 1);
        store.record_error("b".to_string());

        let mut query: Query<String, i64> = Query::new(None, Policy::NONE, keys(&["a", "b"]).into_iter().collect());
        let snapshot = compute_result(&config, &store, &mut query).expect("errored key counts as resolved");
        assert!(snapshot.has_all_keys());
        assert_eq!(snapshot.get(&"b".to_string()), None);
    }

    #[test]
    fn test_compute_result_retry_holds_errored_keys() {
        let config = CoordinatorConfig::default();
        let mut store: CacheStore<String, i64> = CacheStore::new();
        store.record_error("a".to_string());

        let mut query: Query<String, i64> = Query::new(None, Policy::RETRY, keys(&["a"]).into_iter().collect());
        assert!(compute_result(&config, &store, &mut query).is_none());
    }

    #[test]
    fn test_compute_result_dedupes_repeat_emission() {
        let config = CoordinatorConfig::default();
        let mut store: CacheStore<String, i64> = CacheStore::new();
        store.insert_value("a".to_string(), 1);

        let mut query: Query<String, i64> =
            Query::new(None, Policy::PARTIAL, keys(&["a", "b"]).into_iter().collect());
        assert!(compute_result(&config, &store, &mut query).is_some());
        assert!(compute_result(&config, &store, &mut query).is_none());

        store.insert_value("b".to_string(), 2);
        let snapshot = compute_result(&config, &store, &mut query).expect("changed map emits again");
        assert!(snapshot.has_all_keys());
    }

    #[tokio::test]
    async fn test_submit_empty_keys_rejected() {
        let coordinator = coordinator();
        assert!(coordinator.submit(None, None, Policy::NONE, Vec::new()).await.is_none());
        assert_eq!(coordinator.pending_requests().await, 0);
    }

    #[tokio::test]
    async fn test_submit_mints_distinct_tokens() {
        let coordinator = coordinator();
        let a = coordinator.submit(None, None, Policy::NONE, keys(&["a"])).await.unwrap();
        let b = coordinator.submit(None, None, Policy::NONE, keys(&["b"])).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(coordinator.pending_requests().await, 2);
    }

    #[tokio::test]
    async fn test_submit_replaces_under_same_token() {
        let coordinator = coordinator();
        let token = QueryToken::named("badges");
        coordinator
            .submit(Some(token.clone()), None, Policy::NONE, keys(&["a"]))
            .await
            .unwrap();
        coordinator
            .submit(Some(token.clone()), None, Policy::NONE, keys(&["b"]))
            .await
            .unwrap();
        assert_eq!(coordinator.pending_requests().await, 1);
    }

    #[tokio::test]
    async fn test_submit_no_replace() {
        let coordinator = coordinator();
        let token = QueryToken::named("badges");
        coordinator
            .submit(Some(token.clone()), None, Policy::NONE, keys(&["a"]))
            .await
            .unwrap();
        let second = coordinator
            .submit(Some(token), None, Policy::NO_REPLACE, keys(&["b"]))
            .await;
        assert!(second.is_none());
        assert_eq!(coordinator.pending_requests().await, 1);
    }

    #[tokio::test]
    async fn test_submit_after_close_rejected() {
        let coordinator = coordinator();
        coordinator.submit(None, None, Policy::NONE, keys(&["a"])).await.unwrap();
        coordinator.close().await;

        assert!(coordinator.is_closed());
        assert_eq!(coordinator.pending_requests().await, 0);
        assert!(coordinator.submit(None, None, Policy::NONE, keys(&["a"])).await.is_none());
    }

    #[tokio::test]
    async fn test_refresh_evicts_value_but_not_history() {
        let coordinator = coordinator();
        coordinator.set_value("a".to_string(), 1).await;
        coordinator.set_not_found(keys(&["b"])).await;

        coordinator.submit(None, None, Policy::REFRESH, keys(&["a", "b"])).await;

        assert_eq!(coordinator.get(&"a".to_string()).await, None);
        // not-found survives a refresh
        let state = coordinator.inner.lock().await;
        assert!(state.store.is_not_found(&"b".to_string()));
    }

    #[tokio::test]
    async fn test_debug_status() {
        let coordinator = coordinator();
        coordinator.submit(None, None, Policy::NONE, keys(&["a", "b"])).await;
        coordinator.mark_requested(keys(&["a"])).await;
        assert_eq!(coordinator.debug_status().await, "queries: 1 pending: 1");
    }

    #[tokio::test]
    async fn test_take_requested_limit_and_priority() {
        let coordinator = coordinator();
        let asap: HashSet<String> = keys(&["a"]).into_iter().collect();
        let normal: HashSet<String> = keys(&["b"]).into_iter().collect();
        let backlog: HashSet<String> = keys(&["c"]).into_iter().collect();

        let picked = coordinator.take_requested(&asap, &normal, &backlog, 2).await;
        assert_eq!(picked.len(), 2);
        assert!(picked.contains("a"));
        assert!(picked.contains("b"));
        assert_eq!(coordinator.debug_status().await, "queries: 0 pending: 2");
    }
}
