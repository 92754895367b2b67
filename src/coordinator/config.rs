//! Coordinator configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::policy::Policy;

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Interval between dispatch ticks in seconds
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Error back-off base in seconds for normal queries
    #[serde(default = "default_error_base_secs")]
    pub error_base_secs: u64,

    /// Error back-off base in seconds for ASAP queries
    #[serde(default = "default_asap_error_base_secs")]
    pub asap_error_base_secs: u64,

    /// Upper bound on the error re-request delay in seconds
    #[serde(default = "default_max_error_delay_secs")]
    pub max_error_delay_secs: u64,

    /// Exponent applied to the consecutive error count in the back-off curve
    #[serde(default = "default_error_backoff_exponent")]
    pub error_backoff_exponent: u32,

    /// Coordinator-level policy bits, applied to every query
    #[serde(default)]
    pub policy: Policy,
}

fn default_tick_interval_secs() -> u64 {
    debug!("default_tick_interval_secs: called");
    10
}

fn default_error_base_secs() -> u64 {
    debug!("default_error_base_secs: called");
    10
}

fn default_asap_error_base_secs() -> u64 {
    debug!("default_asap_error_base_secs: called");
    2
}

fn default_max_error_delay_secs() -> u64 {
    debug!("default_max_error_delay_secs: called");
    1800
}

fn default_error_backoff_exponent() -> u32 {
    debug!("default_error_backoff_exponent: called");
    10
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        debug!("CoordinatorConfig::default: called");
        Self {
            tick_interval_secs: 10,
            error_base_secs: 10,
            asap_error_base_secs: 2,
            max_error_delay_secs: 1800,
            error_backoff_exponent: 10,
            policy: Policy::NONE,
        }
    }
}

impl CoordinatorConfig {
    /// Get the tick interval as a Duration
    pub fn tick_interval(&self) -> Duration {
        debug!(%self.tick_interval_secs, "CoordinatorConfig::tick_interval: called");
        Duration::from_secs(self.tick_interval_secs)
    }
}
