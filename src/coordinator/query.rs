//! Query registry types
//!
//! A [`Query`] is one caller's registered interest in a set of keys, together
//! with its policy, optional listener and completion bookkeeping. Queries are
//! registered under a [`QueryToken`] so a later submit can replace them.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use uuid::Uuid;

use super::traits::ResultListener;
use crate::policy::Policy;

/// Handle identifying a registered query for replacement and deduplication.
///
/// Tokens minted by the coordinator are unique by construction; tokens named
/// by the caller are compared by value, so reusing a name replaces the query
/// registered under it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryToken {
    /// Minted by the coordinator for submits without a caller token
    Minted(Uuid),
    /// Caller-supplied, compared by value
    Named(String),
}

impl QueryToken {
    /// Mint a fresh token, distinct from every other token
    pub fn mint() -> Self {
        Self::Minted(Uuid::new_v4())
    }

    /// A caller-named token
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }
}

impl fmt::Display for QueryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Minted(id) => write!(f, "minted:{}", id),
            Self::Named(name) => write!(f, "named:{}", name),
        }
    }
}

/// Snapshot of a query's results at one point in time.
///
/// Maps each resolved key to `Some(value)` or, for not-found keys (and for
/// errored keys under the default policy), to `None`. Keys that have no
/// resolution yet are absent from the map entirely.
#[derive(Debug, Clone)]
pub struct ResultSnapshot<K, V> {
    entries: HashMap<K, Option<V>>,
    has_all_keys: bool,
}

impl<K, V> ResultSnapshot<K, V>
where
    K: Eq + Hash,
{
    pub(crate) fn new(entries: HashMap<K, Option<V>>, has_all_keys: bool) -> Self {
        Self { entries, has_all_keys }
    }

    /// The value for a key, or `None` if the key errored, was not found, or
    /// has no resolution in this snapshot
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).and_then(|v| v.as_ref())
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Whether every key of the originating query is in this snapshot. A
    /// snapshot with all keys may still hold `None` entries, but the query
    /// that produced it has completed and been removed.
    pub fn has_all_keys(&self) -> bool {
        self.has_all_keys
    }

    /// The resolved entries. `None` values mark not-found or errored keys.
    pub fn entries(&self) -> &HashMap<K, Option<V>> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K, V> PartialEq for ResultSnapshot<K, V>
where
    K: Eq + Hash,
    V: PartialEq,
{
    /// Snapshots compare by their entry maps alone, which is what emission
    /// deduplication keys on.
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

/// A registered query: fixed keys and policy, plus completion bookkeeping
pub(crate) struct Query<K, V> {
    pub policy: Policy,
    pub listener: Option<Arc<dyn ResultListener<K, V>>>,
    pub keys: HashSet<K>,
    /// Keys already handed to the caller in an emitted snapshot
    accepted: HashSet<K>,
    /// Keys a response of any kind has arrived for since submission
    responded: HashSet<K>,
    last_result: Option<ResultSnapshot<K, V>>,
}

impl<K, V> Query<K, V>
where
    K: Clone + Eq + Hash,
    V: PartialEq,
{
    pub fn new(listener: Option<Arc<dyn ResultListener<K, V>>>, policy: Policy, keys: HashSet<K>) -> Self {
        Self {
            policy,
            listener,
            keys,
            accepted: HashSet::new(),
            responded: HashSet::new(),
            last_result: None,
        }
    }

    /// Equality for UNIQUE deduplication: same policy, same listener identity
    /// and same key set
    pub fn matches(&self, other: &Self) -> bool {
        self.policy == other.policy && self.keys == other.keys && same_listener(&self.listener, &other.listener)
    }

    pub fn response_received(&mut self, key: &K) {
        if self.keys.contains(key) {
            self.responded.insert(key.clone());
        }
    }

    pub fn is_responded(&self, key: &K) -> bool {
        self.responded.contains(key)
    }

    pub fn accept(&mut self, key: K) {
        self.accepted.insert(key);
    }

    pub fn is_accepted(&self, key: &K) -> bool {
        self.accepted.contains(key)
    }

    /// True when `snapshot` equals the previously emitted result
    pub fn same_result(&self, snapshot: &ResultSnapshot<K, V>) -> bool {
        self.last_result.as_ref() == Some(snapshot)
    }

    pub fn set_result(&mut self, snapshot: ResultSnapshot<K, V>) {
        self.last_result = Some(snapshot);
    }
}

fn same_listener<K, V>(
    a: &Option<Arc<dyn ResultListener<K, V>>>,
    b: &Option<Arc<dyn ResultListener<K, V>>>,
) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}
