//! Query policy flags
//!
//! A [`Policy`] is a small bitset that modifies how the coordinator treats a
//! query: when it is dispatched, how errored keys are handled, and when its
//! listener is called. Flags combine with `|`. The coordinator itself can
//! also carry policy bits which apply to every query it holds.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Policy bits for queries (and, for some bits, the coordinator itself)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Policy(u32);

impl Policy {
    /// Defaults: requests go out on the timer through the `normal` set, the
    /// query completes as soon as only errored or not-found keys are left,
    /// and errored keys surface as `None` in the result.
    pub const NONE: Policy = Policy(0);

    /// Keep the query registered while keys are still in error cool-off.
    /// Partial results where only errored keys remain are returned; the
    /// errored keys are held back rather than surfaced as `None`.
    pub const RETRY: Policy = Policy(1);

    /// Dispatch immediately on submit, route keys through the `asap` set and
    /// use the reduced error re-request delay.
    pub const ASAP: Policy = Policy(1 << 1);

    /// Only return the result (and remove the query) once every key has a
    /// concrete resolution (value or not-found). Errored keys are retried,
    /// never surfaced.
    pub const WAIT: Policy = Policy(1 << 2);

    /// Evict the query's keys from the value cache on submit and require a
    /// fresh response before a key becomes eligible for completion.
    pub const REFRESH: Policy = Policy(1 << 3);

    /// Coordinator-level only: run the request timer detached. Has no effect
    /// on individual queries.
    pub const DAEMON: Policy = Policy(1 << 4);

    /// Drop the submit if an equal query (same keys, listener and policy) is
    /// already registered.
    pub const UNIQUE: Policy = Policy(1 << 5);

    /// Return every partial result as the result map changes (each emission
    /// is still deduplicated against the previous one).
    pub const PARTIAL: Policy = Policy(1 << 6);

    /// Drop the submit if a query is already registered under the same token.
    pub const NO_REPLACE: Policy = Policy(1 << 7);

    /// Check whether all bits of `other` are set in `self`
    pub fn contains(self, other: Policy) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw bit value
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Construct from a raw bit value
    pub fn from_bits(bits: u32) -> Policy {
        Policy(bits)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Policy {
    type Output = Policy;

    fn bitor(self, rhs: Policy) -> Policy {
        Policy(self.0 | rhs.0)
    }
}

impl BitOrAssign for Policy {
    fn bitor_assign(&mut self, rhs: Policy) {
        self.0 |= rhs.0;
    }
}

const FLAG_NAMES: &[(Policy, &str)] = &[
    (Policy::RETRY, "retry"),
    (Policy::ASAP, "asap"),
    (Policy::WAIT, "wait"),
    (Policy::REFRESH, "refresh"),
    (Policy::DAEMON, "daemon"),
    (Policy::UNIQUE, "unique"),
    (Policy::PARTIAL, "partial"),
    (Policy::NO_REPLACE, "no_replace"),
];

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let mut first = true;
        for (flag, name) in FLAG_NAMES {
            if self.contains(*flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl FromStr for Policy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        debug!(%s, "Policy::from_str: called");
        let mut policy = Policy::NONE;
        for part in s.split('|').map(str::trim) {
            if part.eq_ignore_ascii_case("none") || part.is_empty() {
                continue;
            }
            let flag = FLAG_NAMES
                .iter()
                .find(|(_, name)| part.eq_ignore_ascii_case(name))
                .map(|(flag, _)| *flag)
                .ok_or_else(|| ParsePolicyError(part.to_string()))?;
            policy |= flag;
        }
        Ok(policy)
    }
}

/// Error parsing a policy flag name
#[derive(Debug, Error)]
#[error("unknown policy flag: '{0}'")]
pub struct ParsePolicyError(String);
