//! Client↔relay clock delta.
//!
//! Conceptually process-global (§5): one instance is shared by every
//! connection in a `WhisperHandle`. Implemented as a cheaply-cloneable
//! handle around an atomic rather than a `static`, per the design note
//! against process-wide singletons (see DESIGN.md).

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone, Default)]
pub struct TimeService {
    delta_ms: Arc<AtomicI64>,
}

impl TimeService {
    pub fn new() -> Self {
        Self {
            delta_ms: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Milliseconds since the Unix epoch, per this process's own clock.
    pub fn local_now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the Unix epoch")
            .as_millis() as i64
    }

    /// `localNow + delta` — the timestamp to stamp on peer-directed envelopes.
    pub fn server_time(&self) -> i64 {
        self.local_now_ms() + self.delta_ms.load(Ordering::Relaxed)
    }

    /// Update the delta from a relay response's timestamp (§4.2 step 4).
    pub fn record_server_timestamp(&self, server_timestamp_ms: i64) {
        let delta = server_timestamp_ms - self.local_now_ms();
        self.delta_ms.store(delta, Ordering::Relaxed);
    }

    pub fn delta_ms(&self) -> i64 {
        self.delta_ms.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_time_tracks_recorded_delta() {
        let time = TimeService::new();
        let local = time.local_now_ms();
        time.record_server_timestamp(local + 10_000);
        // Allow a few ms of test execution slack.
        assert!((time.server_time() - (local + 10_000)).abs() < 50);
    }

    #[test]
    fn shared_handle_observes_updates() {
        let time = TimeService::new();
        let clone = time.clone();
        time.record_server_timestamp(time.local_now_ms() + 5_000);
        assert_eq!(time.delta_ms(), clone.delta_ms());
    }
}
