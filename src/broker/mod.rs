//! Process-local implementation of the key/value + pub/sub broker contract.
//!
//! The engine talks to the broker through this thin client: atomic counters,
//! TTL'd keys, capped lists, channel publish/subscribe, and NX+PX locks.
//! Publishing on a sequenced channel injects the next value of the global
//! sequence counter into the message envelope.

pub mod channels;

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;

pub use channels::{Envelope, MessageType};

const CHANNEL_CAPACITY: usize = 1024;

struct TtlEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl TtlEntry {
    fn live(&self) -> bool {
        self.expires_at.map(|t| Instant::now() < t).unwrap_or(true)
    }
}

struct CounterEntry {
    value: i64,
    expires_at: Option<Instant>,
}

/// In-memory broker. All operations are atomic under their respective locks,
/// matching the semantics of the external store this mirrors.
pub struct Broker {
    keys: RwLock<HashMap<String, TtlEntry>>,
    counters: RwLock<HashMap<String, CounterEntry>>,
    lists: RwLock<HashMap<String, VecDeque<String>>>,
    senders: RwLock<HashMap<String, broadcast::Sender<Envelope>>>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            counters: RwLock::new(HashMap::new()),
            lists: RwLock::new(HashMap::new()),
            senders: RwLock::new(HashMap::new()),
        }
    }

    // ------------------------------------------------------------------
    // Atomic counters
    // ------------------------------------------------------------------

    /// Atomically increment and return the new value.
    pub fn get_next(&self, key: &str) -> i64 {
        let mut counters = self.counters.write();
        let entry = counters.entry(key.to_string()).or_insert(CounterEntry {
            value: 0,
            expires_at: None,
        });
        if let Some(at) = entry.expires_at {
            if Instant::now() >= at {
                entry.value = 0;
                entry.expires_at = None;
            }
        }
        entry.value += 1;
        entry.value
    }

    /// Increment with a TTL applied on the first increment of the window.
    /// Used for `ratelimit:<agent>:<action>` style counters.
    pub fn incr_with_ttl(&self, key: &str, ttl: Duration) -> i64 {
        let mut counters = self.counters.write();
        let entry = counters.entry(key.to_string()).or_insert(CounterEntry {
            value: 0,
            expires_at: None,
        });
        let now = Instant::now();
        if entry.expires_at.map(|at| now >= at).unwrap_or(true) {
            entry.value = 0;
            entry.expires_at = Some(now + ttl);
        }
        entry.value += 1;
        entry.value
    }

    /// Read without incrementing.
    pub fn get_counter(&self, key: &str) -> i64 {
        let counters = self.counters.read();
        counters
            .get(key)
            .filter(|e| e.expires_at.map(|at| Instant::now() < at).unwrap_or(true))
            .map(|e| e.value)
            .unwrap_or(0)
    }

    pub fn set_counter(&self, key: &str, value: i64) {
        self.counters.write().insert(
            key.to_string(),
            CounterEntry {
                value,
                expires_at: None,
            },
        );
    }

    // ------------------------------------------------------------------
    // Plain key/value with optional TTL
    // ------------------------------------------------------------------

    pub fn set_key(&self, key: &str, value: impl Into<String>, ttl: Option<Duration>) {
        self.keys.write().insert(
            key.to_string(),
            TtlEntry {
                value: value.into(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
    }

    pub fn get_key(&self, key: &str) -> Option<String> {
        let keys = self.keys.read();
        keys.get(key).filter(|e| e.live()).map(|e| e.value.clone())
    }

    pub fn delete_key(&self, key: &str) -> bool {
        self.keys.write().remove(key).is_some()
    }

    // ------------------------------------------------------------------
    // Capped lists (rolling tick records for replay)
    // ------------------------------------------------------------------

    /// Push to the head of a list, trimming to `cap` entries.
    pub fn push_capped(&self, key: &str, value: impl Into<String>, cap: usize) {
        let mut lists = self.lists.write();
        let list = lists.entry(key.to_string()).or_default();
        list.push_front(value.into());
        while list.len() > cap {
            list.pop_back();
        }
    }

    /// Read up to `count` entries from the head (most recent first).
    pub fn list_range(&self, key: &str, count: usize) -> Vec<String> {
        let lists = self.lists.read();
        lists
            .get(key)
            .map(|l| l.iter().take(count).cloned().collect())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Distributed lock (NX + PX semantics)
    // ------------------------------------------------------------------

    /// Acquire `lock:<resource>` if not held; returns false when contended.
    pub fn try_lock(&self, resource: &str, ttl: Duration) -> bool {
        let key = channels::lock_key(resource);
        let mut keys = self.keys.write();
        if keys.get(&key).map(|e| e.live()).unwrap_or(false) {
            return false;
        }
        keys.insert(
            key,
            TtlEntry {
                value: "1".to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        true
    }

    pub fn unlock(&self, resource: &str) {
        self.keys.write().remove(&channels::lock_key(resource));
    }

    // ------------------------------------------------------------------
    // Pub/sub
    // ------------------------------------------------------------------

    fn sender(&self, channel: &str) -> broadcast::Sender<Envelope> {
        if let Some(tx) = self.senders.read().get(channel) {
            return tx.clone();
        }
        let mut senders = self.senders.write();
        senders
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Envelope> {
        self.sender(channel).subscribe()
    }

    /// Publish with an auto-injected global sequence number. Returns the
    /// sequence assigned to this message.
    pub fn publish<P: Serialize>(
        &self,
        channel: &str,
        message_type: MessageType,
        payload: &P,
    ) -> Result<i64> {
        let sequence = self.get_next(channels::KEY_GLOBAL_SEQUENCE);
        let envelope = Envelope {
            message_type,
            payload: serde_json::to_value(payload)?,
            timestamp: Utc::now().to_rfc3339(),
            sequence: Some(sequence),
        };
        // A send error only means no subscriber is currently listening.
        let _ = self.sender(channel).send(envelope);
        Ok(sequence)
    }

    /// Publish without a sequence number (heartbeat only).
    pub fn publish_raw<P: Serialize>(
        &self,
        channel: &str,
        message_type: MessageType,
        payload: &P,
    ) -> Result<()> {
        let envelope = Envelope {
            message_type,
            payload: serde_json::to_value(payload)?,
            timestamp: Utc::now().to_rfc3339(),
            sequence: None,
        };
        let _ = self.sender(channel).send(envelope);
        Ok(())
    }

    /// Current value of the global sequence counter (no increment).
    pub fn current_sequence(&self) -> i64 {
        self.get_counter(channels::KEY_GLOBAL_SEQUENCE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_monotone() {
        let broker = Broker::new();
        let a = broker.get_next("sequence:global");
        let b = broker.get_next("sequence:global");
        let c = broker.get_next("sequence:global");
        assert!(a < b && b < c);
        assert_eq!(broker.get_counter("sequence:global"), c);
    }

    #[test]
    fn ttl_keys_expire() {
        let broker = Broker::new();
        broker.set_key("k", "v", Some(Duration::from_millis(0)));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(broker.get_key("k"), None);

        broker.set_key("k2", "v2", None);
        assert_eq!(broker.get_key("k2").as_deref(), Some("v2"));
        assert!(broker.delete_key("k2"));
        assert_eq!(broker.get_key("k2"), None);
    }

    #[test]
    fn nx_lock_blocks_second_holder() {
        let broker = Broker::new();
        assert!(broker.try_lock("tick", Duration::from_secs(30)));
        assert!(!broker.try_lock("tick", Duration::from_secs(30)));
        broker.unlock("tick");
        assert!(broker.try_lock("tick", Duration::from_secs(30)));
    }

    #[test]
    fn capped_list_keeps_most_recent() {
        let broker = Broker::new();
        for i in 0..10 {
            broker.push_capped("records", format!("r{i}"), 3);
        }
        let got = broker.list_range("records", 10);
        assert_eq!(got, vec!["r9", "r8", "r7"]);
    }

    #[tokio::test]
    async fn publish_injects_increasing_sequences() {
        let broker = Broker::new();
        let mut rx = broker.subscribe("channel:prices");

        let s1 = broker
            .publish("channel:prices", MessageType::PriceUpdate, &serde_json::json!({"t": 1}))
            .unwrap();
        let s2 = broker
            .publish("channel:prices", MessageType::PriceUpdate, &serde_json::json!({"t": 2}))
            .unwrap();
        assert!(s1 < s2);

        let m1 = rx.recv().await.unwrap();
        let m2 = rx.recv().await.unwrap();
        assert_eq!(m1.sequence, Some(s1));
        assert_eq!(m2.sequence, Some(s2));
    }

    #[test]
    fn rate_limit_counter_resets_after_window() {
        let broker = Broker::new();
        assert_eq!(broker.incr_with_ttl("ratelimit:a:BUY", Duration::from_millis(50)), 1);
        assert_eq!(broker.incr_with_ttl("ratelimit:a:BUY", Duration::from_millis(50)), 2);
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(broker.incr_with_ttl("ratelimit:a:BUY", Duration::from_millis(50)), 1);
    }
}
