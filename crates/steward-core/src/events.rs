use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Typed runtime event held in a bounded ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    pub forward_to_user: bool,
    #[serde(default)]
    pub forwarded: bool,
}

impl EventRecord {
    pub fn new(event_type: impl Into<String>, payload: Value, forward_to_user: bool) -> Self {
        Self {
            event_id: format!("evt_{}", Uuid::new_v4().simple()),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            payload,
            forward_to_user,
            forwarded: false,
        }
    }
}

/// Bounded in-memory event ring. Oldest records drop when the cap is hit;
/// forwardable records are consumed at most once.
#[derive(Debug)]
pub struct EventRing {
    cap: usize,
    records: VecDeque<EventRecord>,
}

impl EventRing {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            records: VecDeque::new(),
        }
    }

    pub fn push(&mut self, record: EventRecord) {
        while self.records.len() >= self.cap {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn record(&mut self, event_type: impl Into<String>, payload: Value, forward_to_user: bool) {
        self.push(EventRecord::new(event_type, payload, forward_to_user));
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Most recent records, newest last.
    pub fn recent(&self, limit: usize) -> Vec<EventRecord> {
        let skip = self.records.len().saturating_sub(limit);
        self.records.iter().skip(skip).cloned().collect()
    }

    /// Unforwarded records flagged `forward_to_user`. With `consume`, they
    /// are marked forwarded atomically with the read.
    pub fn list_forward_events(&mut self, consume: bool) -> Vec<EventRecord> {
        let mut out = Vec::new();
        for record in self.records.iter_mut() {
            if !record.forward_to_user || record.forwarded {
                continue;
            }
            out.push(record.clone());
            if consume {
                record.forwarded = true;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ring_drops_oldest_at_cap() {
        let mut ring = EventRing::new(3);
        for idx in 0..5 {
            ring.record("tick", json!({"idx": idx}), false);
        }
        assert_eq!(ring.len(), 3);
        let recent = ring.recent(10);
        assert_eq!(recent[0].payload["idx"], 2);
        assert_eq!(recent[2].payload["idx"], 4);
    }

    #[test]
    fn forward_events_consume_once() {
        let mut ring = EventRing::new(10);
        ring.record("run_finished", json!({"run_id": "r1"}), true);
        ring.record("run_progress", json!({"run_id": "r1"}), false);

        let first = ring.list_forward_events(true);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].event_type, "run_finished");

        let second = ring.list_forward_events(true);
        assert!(second.is_empty());
    }

    #[test]
    fn peek_does_not_consume() {
        let mut ring = EventRing::new(10);
        ring.record("run_queued", json!({}), true);
        assert_eq!(ring.list_forward_events(false).len(), 1);
        assert_eq!(ring.list_forward_events(true).len(), 1);
    }
}
