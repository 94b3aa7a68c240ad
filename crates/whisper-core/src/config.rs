//! Tunable constants the spec leaves as named defaults.
//!
//! Passed explicitly into [`crate::api::initialize`]; the core never reads
//! the environment itself (see DESIGN.md's resolution of the "no process
//! globals" design note). The demo binary layers environment overrides on
//! top of [`RuntimeConfig::default`] before calling in.

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// §4.1 check 1: max allowed skew between envelope timestamp and
    /// `timeService.serverTime`.
    pub timestamp_freshness_ms: i64,
    /// §4.3 backoff: `max(reconnect_backoff_base_ms + reconnect_backoff_step_ms * retries, reconnect_backoff_min_ms)`.
    pub reconnect_backoff_base_ms: u64,
    pub reconnect_backoff_step_ms: u64,
    pub reconnect_backoff_min_ms: u64,
    /// §4.5 / §5: default saga attempt deadline, overridable per saga.
    pub attempt_deadline_secs: u64,
    /// §4.7 watchdog: first re-open threshold for an undelivered message.
    pub watchdog_first_threshold_ms: i64,
    /// §4.7 watchdog: second re-open threshold.
    pub watchdog_second_threshold_ms: i64,
    /// Default ICE servers handed to the embedding application's
    /// peer-connection setup (§6 `initialize(config).iceServers`).
    pub default_ice_servers: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            timestamp_freshness_ms: 5_000,
            reconnect_backoff_base_ms: 1_000,
            reconnect_backoff_step_ms: 1_000,
            reconnect_backoff_min_ms: 5_000,
            attempt_deadline_secs: 60,
            watchdog_first_threshold_ms: 5_000,
            watchdog_second_threshold_ms: 30_000,
            default_ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

impl RuntimeConfig {
    /// The backoff delay for the n-th reconnect attempt (§4.3).
    pub fn reconnect_backoff_ms(&self, retries: u32) -> u64 {
        (self.reconnect_backoff_base_ms + self.reconnect_backoff_step_ms * retries as u64)
            .max(self.reconnect_backoff_min_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_matches_spec_formula() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.reconnect_backoff_ms(0), 5_000);
        assert_eq!(cfg.reconnect_backoff_ms(5), 6_000);
    }
}
