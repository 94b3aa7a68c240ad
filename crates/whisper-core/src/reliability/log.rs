//! Per-connection update log: outgoing persistence, incoming merge, and the
//! resend-on-reconnect loop (§4.7).

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::connection::channel::DataChannel;
use crate::error::Result;
use crate::reliability::update::{MarkerField, ReactionField, TextField, Update};
use crate::time::TimeService;

/// Who materialized a [`HistoryEntry`] (§4.7 `sendText`: "locally insert
/// into history as sender=you").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sender {
    You,
    Peer,
}

/// A materialized chat message, the unit [`UpdateLog::history`] renders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub sender: Sender,
    pub text: Option<String>,
    pub delivered: bool,
    pub seen: bool,
    pub reaction: Option<String>,
}

impl HistoryEntry {
    fn new(id: i64, sender: Sender) -> Self {
        Self { id, sender, text: None, delivered: false, seen: false, reaction: None }
    }

    fn apply(&mut self, update: &Update) {
        if let Some(message) = &update.message {
            self.text = Some(message.text.clone());
        }
        if update.delivered.is_some() {
            self.delivered = true;
        }
        if update.seen.is_some() {
            self.seen = true;
        }
        if let Some(reaction) = &update.reaction {
            self.reaction = Some(reaction.value.clone());
        }
    }
}

/// Where the persisted cache and history are written (§4.8's KV store, kept
/// as a seam so this crate doesn't depend on `whisper-store` directly).
#[async_trait::async_trait]
pub trait UpdateSink: Send + Sync {
    async fn persist_cache(&self, peer_public_key: &str, cache: &BTreeMap<i64, Update>) -> Result<()>;
    async fn persist_history(&self, peer_public_key: &str, history: &[HistoryEntry]) -> Result<()>;
}

/// A no-op sink for tests and for applications that don't need persistence.
pub struct NullSink;

#[async_trait::async_trait]
impl UpdateSink for NullSink {
    async fn persist_cache(&self, _peer_public_key: &str, _cache: &BTreeMap<i64, Update>) -> Result<()> {
        Ok(())
    }

    async fn persist_history(&self, _peer_public_key: &str, _history: &[HistoryEntry]) -> Result<()> {
        Ok(())
    }
}

pub struct UpdateLog {
    peer_public_key: String,
    sink: Arc<dyn UpdateSink>,
    time: TimeService,
    cache: Mutex<BTreeMap<i64, Update>>,
    history: Mutex<Vec<HistoryEntry>>,
    own_ids: Mutex<std::collections::HashSet<i64>>,
}

impl UpdateLog {
    pub fn new(peer_public_key: String, sink: Arc<dyn UpdateSink>, time: TimeService) -> Self {
        Self {
            peer_public_key,
            sink,
            time,
            cache: Mutex::new(BTreeMap::new()),
            history: Mutex::new(Vec::new()),
            own_ids: Mutex::new(std::collections::HashSet::new()),
        }
    }

    pub async fn history(&self) -> Vec<HistoryEntry> {
        self.history.lock().await.clone()
    }

    /// Merge an update received over the data channel (§4.7 merge rules).
    pub async fn merge_incoming(&self, update: Update) -> Result<()> {
        let is_own = self.own_ids.lock().await.contains(&update.id);
        let mut cache = self.cache.lock().await;
        match cache.get_mut(&update.id) {
            Some(existing) => {
                existing.merge_from(&update);
            }
            None => {
                if !update.is_useful() {
                    return Ok(());
                }
                cache.insert(update.id, update.clone().into_cached());
            }
        }
        let merged = cache.get(&update.id).cloned();
        self.sink.persist_cache(&self.peer_public_key, &cache).await?;
        drop(cache);

        if let Some(merged) = merged {
            self.materialize(update.id, if is_own { Sender::You } else { Sender::Peer }, &merged).await;
        }
        Ok(())
    }

    async fn materialize(&self, id: i64, sender: Sender, update: &Update) {
        let mut history = self.history.lock().await;
        match history.iter_mut().find(|entry| entry.id == id) {
            Some(entry) => entry.apply(update),
            None => {
                let mut entry = HistoryEntry::new(id, sender);
                entry.apply(update);
                history.push(entry);
            }
        }
        let _ = self.sink.persist_history(&self.peer_public_key, &history).await;
    }

    async fn emit(&self, channel: &dyn DataChannel, update: &Update) -> Result<()> {
        let json = serde_json::to_string(update)?;
        channel.send(&json).await
    }

    /// `sendText` (§4.7): assign `id = serverTime`, cache, send, materialize.
    pub async fn send_text(&self, channel: &dyn DataChannel, text: &str) -> Result<i64> {
        let id = self.time.server_time();
        let update = Update { id, message: Some(TextField { timestamp: id, text: text.to_string() }), ..Update::new(id) };
        self.own_ids.lock().await.insert(id);
        self.cache_and_persist(update.clone()).await?;
        self.emit(channel, &update).await?;
        self.materialize(id, Sender::You, &update).await;
        Ok(id)
    }

    pub async fn send_delivered(&self, channel: &dyn DataChannel, id: i64) -> Result<()> {
        let timestamp = self.time.server_time();
        let update = Update { id, delivered: Some(MarkerField { timestamp }), ..Update::new(id) };
        self.cache_and_persist(update.clone()).await?;
        self.emit(channel, &update).await?;
        self.materialize(id, Sender::Peer, &update).await;
        Ok(())
    }

    pub async fn send_seen(&self, channel: &dyn DataChannel, id: i64) -> Result<()> {
        let timestamp = self.time.server_time();
        let update = Update { id, seen: Some(MarkerField { timestamp }), ..Update::new(id) };
        self.cache_and_persist(update.clone()).await?;
        self.emit(channel, &update).await?;
        self.materialize(id, Sender::Peer, &update).await;
        Ok(())
    }

    pub async fn send_reaction(&self, channel: &dyn DataChannel, id: i64, value: &str) -> Result<()> {
        let timestamp = self.time.server_time();
        let update = Update {
            id,
            reaction: Some(ReactionField { timestamp, value: value.to_string() }),
            ..Update::new(id)
        };
        self.cache_and_persist(update.clone()).await?;
        self.emit(channel, &update).await?;
        let is_own = self.own_ids.lock().await.contains(&id);
        self.materialize(id, if is_own { Sender::You } else { Sender::Peer }, &update).await;
        Ok(())
    }

    /// `sendAction('typing')`: ephemeral, never cached (§4.7).
    pub async fn send_action(&self, channel: &dyn DataChannel, action: &str) -> Result<()> {
        let update = Update { id: self.time.server_time(), action: Some(action.to_string()), ..Default::default() };
        self.emit(channel, &update).await
    }

    async fn cache_and_persist(&self, update: Update) -> Result<()> {
        let mut cache = self.cache.lock().await;
        match cache.get_mut(&update.id) {
            Some(existing) => existing.merge_from(&update),
            None => {
                cache.insert(update.id, update.into_cached());
            }
        }
        self.sink.persist_cache(&self.peer_public_key, &cache).await
    }

    /// Re-emit the whole useful-updates cache in id order over a fresh
    /// channel (§4.7 resend loop, idempotent by the merge rules).
    pub async fn resend_all(&self, channel: &dyn DataChannel) -> Result<()> {
        let cache = self.cache.lock().await;
        for update in cache.values() {
            self.emit(channel, update).await?;
        }
        Ok(())
    }

    /// The age, in ms, of the oldest outgoing message still missing a
    /// `delivered` stamp — `None` once every outgoing message has one
    /// (§4.7 reconnect watchdog).
    pub async fn oldest_undelivered_age_ms(&self) -> Option<i64> {
        let own_ids = self.own_ids.lock().await;
        let cache = self.cache.lock().await;
        let oldest_id = own_ids
            .iter()
            .filter(|id| cache.get(id).map(|u| u.delivered.is_none()).unwrap_or(false))
            .min()
            .copied()?;
        Some(self.time.server_time() - oldest_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::channel::LoopbackChannel;

    fn log() -> UpdateLog {
        UpdateLog::new("peer".to_string(), Arc::new(NullSink), TimeService::new())
    }

    #[tokio::test]
    async fn send_text_materializes_history_as_self() {
        let log = log();
        let (a, _b) = LoopbackChannel::pair();
        let id = log.send_text(&*a, "hi").await.unwrap();
        let history = log.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, id);
        assert_eq!(history[0].sender, Sender::You);
        assert_eq!(history[0].text.as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn incoming_message_merges_and_materializes_as_peer() {
        let log = log();
        log.merge_incoming(Update {
            id: 42,
            message: Some(TextField { timestamp: 42, text: "yo".into() }),
            ..Update::new(42)
        })
        .await
        .unwrap();

        let history = log.history().await;
        assert_eq!(history[0].sender, Sender::Peer);
        assert_eq!(history[0].text.as_deref(), Some("yo"));
    }

    #[tokio::test]
    async fn action_only_update_is_never_cached() {
        let log = log();
        log.merge_incoming(Update { id: 1, action: Some("typing".into()), ..Update::new(1) })
            .await
            .unwrap();
        assert!(log.cache.lock().await.is_empty());
    }

    #[tokio::test]
    async fn watchdog_age_clears_once_delivered() {
        let log = log();
        let (a, _b) = LoopbackChannel::pair();
        let id = log.send_text(&*a, "hi").await.unwrap();
        assert!(log.oldest_undelivered_age_ms().await.is_some());

        // The peer's delivery ack for our own message arrives like any
        // other incoming update, merged rather than locally emitted.
        log.merge_incoming(Update { id, delivered: Some(MarkerField { timestamp: id + 1 }), ..Update::new(id) })
            .await
            .unwrap();
        assert!(log.oldest_undelivered_age_ms().await.is_none());
    }
}
