//! The `Update` wire shape and its merge rules (§3 glossary, §4.7).

use serde::{Deserialize, Serialize};

/// A timestamped message body (`message`/`reaction` fields).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextField {
    pub timestamp: i64,
    pub text: String,
}

/// A bare timestamp marker (`delivered`/`seen` fields).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarkerField {
    pub timestamp: i64,
}

/// A timestamped reaction value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionField {
    pub timestamp: i64,
    pub value: String,
}

/// An application-layer update, keyed by the sender-assigned relay-clock id
/// of the original message (§3 glossary "Update"/"Useful update").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Update {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<TextField>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub delivered: Option<MarkerField>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub seen: Option<MarkerField>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reaction: Option<ReactionField>,
}

impl Update {
    pub fn new(id: i64) -> Self {
        Self { id, ..Default::default() }
    }

    /// An update carrying none of {message, delivered, seen, reaction} is
    /// action-only (e.g. `typing`) and never cached (§3, §4.7).
    pub fn is_useful(&self) -> bool {
        self.message.is_some() || self.delivered.is_some() || self.seen.is_some() || self.reaction.is_some()
    }

    /// Merge `incoming`'s fields into `self` per §4.7's per-field rules:
    /// `message`/`reaction` are last-write-wins by timestamp, `delivered`/
    /// `seen` are first-write-wins (earliest timestamp kept).
    pub fn merge_from(&mut self, incoming: &Update) {
        merge_latest(&mut self.message, &incoming.message, |f| f.timestamp);
        merge_earliest(&mut self.delivered, &incoming.delivered, |f| f.timestamp);
        merge_earliest(&mut self.seen, &incoming.seen, |f| f.timestamp);
        merge_latest(&mut self.reaction, &incoming.reaction, |f| f.timestamp);
    }

    /// The cached form of a fresh useful update: the same fields, with
    /// `action` stripped (§4.7: "store `u` (strip `action`)").
    pub fn into_cached(mut self) -> Self {
        self.action = None;
        self
    }
}

fn merge_latest<T: Clone>(slot: &mut Option<T>, incoming: &Option<T>, ts: impl Fn(&T) -> i64) {
    let Some(incoming) = incoming else { return };
    match slot {
        Some(existing) if ts(existing) >= ts(incoming) => {}
        _ => *slot = Some(incoming.clone()),
    }
}

fn merge_earliest<T: Clone>(slot: &mut Option<T>, incoming: &Option<T>, ts: impl Fn(&T) -> i64) {
    let Some(incoming) = incoming else { return };
    match slot {
        Some(existing) if ts(existing) <= ts(incoming) => {}
        _ => *slot = Some(incoming.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_f_merge_sequence_matches_spec() {
        let mut cached = Update::new(1);
        cached.merge_from(&Update { id: 1, message: Some(TextField { timestamp: 100, text: "x".into() }), ..Update::new(1) });
        cached.merge_from(&Update { id: 1, delivered: Some(MarkerField { timestamp: 110 }), ..Update::new(1) });
        cached.merge_from(&Update { id: 1, message: Some(TextField { timestamp: 90, text: "stale".into() }), ..Update::new(1) });
        cached.merge_from(&Update { id: 1, reaction: Some(ReactionField { timestamp: 200, value: "👍".into() }), ..Update::new(1) });
        cached.merge_from(&Update { id: 1, delivered: Some(MarkerField { timestamp: 105 }), ..Update::new(1) });

        assert_eq!(cached.message.unwrap(), TextField { timestamp: 100, text: "x".into() });
        assert_eq!(cached.delivered.unwrap().timestamp, 105);
        assert_eq!(cached.reaction.unwrap().value, "👍");
    }

    #[test]
    fn merge_is_commutative_for_a_permuted_replay() {
        let updates = [
            Update { id: 1, message: Some(TextField { timestamp: 100, text: "x".into() }), ..Update::new(1) },
            Update { id: 1, delivered: Some(MarkerField { timestamp: 110 }), ..Update::new(1) },
            Update { id: 1, reaction: Some(ReactionField { timestamp: 200, value: "y".into() }), ..Update::new(1) },
        ];

        let mut forward = Update::new(1);
        for u in &updates {
            forward.merge_from(u);
        }

        let mut reversed = Update::new(1);
        for u in updates.iter().rev() {
            reversed.merge_from(u);
        }

        assert_eq!(forward.message, reversed.message);
        assert_eq!(forward.delivered.map(|d| d.timestamp), reversed.delivered.map(|d| d.timestamp));
        assert_eq!(forward.reaction.map(|r| r.value), reversed.reaction.map(|r| r.value));
    }

    #[test]
    fn action_only_update_is_not_useful() {
        let mut update = Update::new(1);
        update.action = Some("typing".into());
        assert!(!update.is_useful());
    }
}
