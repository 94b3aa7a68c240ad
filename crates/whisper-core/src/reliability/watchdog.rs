//! Reconnect watchdog for undelivered outgoing messages (§4.7).
//!
//! Polls [`UpdateLog::oldest_undelivered_age_ms`] and fires `on_reopen` once
//! when the oldest unacknowledged message crosses the first threshold, and
//! again if it's still unacknowledged at the second. Clears (and can fire
//! again later) once every outgoing message has a `delivered` stamp.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::RuntimeConfig;
use crate::reliability::log::UpdateLog;

const POLL_INTERVAL_MS: u64 = 1_000;

pub fn spawn(
    log: Arc<UpdateLog>,
    config: RuntimeConfig,
    on_reopen: Arc<dyn Fn() + Send + Sync>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut fired_first = false;
        let mut fired_second = false;
        loop {
            tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            match log.oldest_undelivered_age_ms().await {
                None => {
                    fired_first = false;
                    fired_second = false;
                }
                Some(age_ms) => {
                    if age_ms >= config.watchdog_first_threshold_ms && !fired_first {
                        fired_first = true;
                        on_reopen();
                    }
                    if age_ms >= config.watchdog_second_threshold_ms && !fired_second {
                        fired_second = true;
                        on_reopen();
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::channel::LoopbackChannel;
    use crate::reliability::log::NullSink;
    use crate::time::TimeService;

    #[tokio::test(start_paused = true)]
    async fn fires_once_past_each_threshold_then_clears() {
        let time = TimeService::new();
        let log = Arc::new(UpdateLog::new("peer".into(), Arc::new(NullSink), time.clone()));
        let (a, _b) = LoopbackChannel::pair();
        let id = log.send_text(&*a, "hi").await.unwrap();

        let mut config = RuntimeConfig::default();
        config.watchdog_first_threshold_ms = 5_000;
        config.watchdog_second_threshold_ms = 30_000;

        let fires = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let fires_clone = Arc::clone(&fires);
        let handle = spawn(Arc::clone(&log), config, Arc::new(move || {
            fires_clone.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }));

        time.record_server_timestamp(time.server_time() + 6_000);
        tokio::time::advance(Duration::from_millis(6_500)).await;
        assert_eq!(fires.load(std::sync::atomic::Ordering::Relaxed), 1);

        time.record_server_timestamp(time.server_time() + 25_000);
        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert_eq!(fires.load(std::sync::atomic::Ordering::Relaxed), 2);

        use crate::reliability::update::{MarkerField, Update};
        log.merge_incoming(Update { id, delivered: Some(MarkerField { timestamp: id + 1 }), ..Update::new(id) })
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(1_500)).await;

        handle.abort();
    }
}
