use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

/// A single structured event captured for a component.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    /// Timestamp at which the entry was tracked.
    pub ts: DateTime<Utc>,
    pub component: String,
    pub event: String,
    /// Free-form structured payload.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

/// Conventional event kinds used by the tracking helpers.
pub const EVENT_START: &str = "start";
pub const EVENT_SUCCESS: &str = "success";
pub const EVENT_FAILURE: &str = "failure";

const DEFAULT_CAPACITY: usize = 10;

// Chatty components keep smaller windows so a burst from one subsystem
// doesn't crowd out the interesting tail.
fn capacity_for(component: &str) -> usize {
    match component {
        "secrets" | "budget" => 5,
        "turn" | "voice" | "webrtc" => 6,
        "docker" | "rpc" => 8,
        "matrix" | "audit" => 10,
        _ => DEFAULT_CAPACITY,
    }
}

struct Ring {
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    fn push(&self, entry: LogEntry) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    // Last `n` entries, oldest-first within the returned slice.
    fn recent(&self, n: usize) -> Vec<LogEntry> {
        let entries = self.entries.lock().unwrap();
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

/// Process-wide registry of per-component bounded event rings.
/// Cloning is cheap and shares the underlying rings.
#[derive(Clone, Default)]
pub struct Rings {
    inner: Arc<RwLock<HashMap<String, Arc<Ring>>>>,
}

impl Rings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event for `component`, stamped with the current wall-clock.
    /// The ring is created on first use.
    pub fn track(&self, component: &str, event: &str, data: serde_json::Value) {
        self.ring(component).push(LogEntry {
            ts: Utc::now(),
            component: component.to_string(),
            event: event.to_string(),
            data,
        });
    }

    /// Track a conventional `start` event.
    pub fn track_start(&self, component: &str, data: serde_json::Value) {
        self.track(component, EVENT_START, data);
    }

    /// Track a conventional `success` event.
    pub fn track_success(&self, component: &str, data: serde_json::Value) {
        self.track(component, EVENT_SUCCESS, data);
    }

    /// Track a conventional `failure` event, merging the cause message into
    /// the payload. A map payload gains an `error` key; anything else is
    /// wrapped as `{data: <base>, extra: {error: <cause>}}`.
    pub fn track_failure(
        &self,
        component: &str,
        cause: &dyn std::fmt::Display,
        data: serde_json::Value,
    ) {
        let data = match data {
            serde_json::Value::Object(mut map) => {
                map.insert("error".to_string(), json!(cause.to_string()));
                serde_json::Value::Object(map)
            }
            serde_json::Value::Null => json!({"error": cause.to_string()}),
            other => json!({"data": other, "extra": {"error": cause.to_string()}}),
        };
        self.track(component, EVENT_FAILURE, data);
    }

    /// Last `n` entries for `component`, oldest-first.
    pub fn recent(&self, component: &str, n: usize) -> Vec<LogEntry> {
        match self.inner.read().unwrap().get(component) {
            Some(ring) => ring.recent(n),
            None => Vec::new(),
        }
    }

    /// Per-component last `n_per` entries, merged and stably sorted by
    /// timestamp ascending. Each ring is snapshotted independently; no
    /// cross-ring consistency is implied.
    pub fn multi_recent(&self, components: &[&str], n_per: usize) -> Vec<LogEntry> {
        let mut merged = Vec::new();
        for component in components {
            merged.extend(self.recent(component, n_per));
        }
        merged.sort_by_key(|entry| entry.ts);
        merged
    }

    pub fn clear_all(&self) {
        for ring in self.inner.read().unwrap().values() {
            ring.clear();
        }
    }

    /// Current entry count per component.
    pub fn stats(&self) -> BTreeMap<String, usize> {
        self.inner
            .read()
            .unwrap()
            .iter()
            .map(|(name, ring)| (name.clone(), ring.len()))
            .collect()
    }

    fn ring(&self, component: &str) -> Arc<Ring> {
        // Fast path: the ring already exists.
        if let Some(ring) = self.inner.read().unwrap().get(component) {
            return ring.clone();
        }
        // Slow path: take the write lock and re-check, since another tracker
        // may have created the ring between the two lock acquisitions.
        let mut map = self.inner.write().unwrap();
        map.entry(component.to_string())
            .or_insert_with(|| Arc::new(Ring::new(capacity_for(component))))
            .clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ring_overflow_keeps_last_entries_in_order() {
        let rings = Rings::new();
        for i in 0..25 {
            rings.track("worker", "tick", json!({"i": i}));
        }
        let recent = rings.recent("worker", 100);
        assert_eq!(recent.len(), DEFAULT_CAPACITY);
        let order: Vec<i64> = recent
            .iter()
            .map(|e| e.data["i"].as_i64().unwrap())
            .collect();
        assert_eq!(order, (15..25).collect::<Vec<i64>>());
    }

    #[test]
    fn recent_slices_oldest_first() {
        let rings = Rings::new();
        for i in 0..5 {
            rings.track("worker", "tick", json!({"i": i}));
        }
        let recent = rings.recent("worker", 2);
        assert_eq!(recent[0].data["i"], 3);
        assert_eq!(recent[1].data["i"], 4);
        assert!(rings.recent("unknown", 2).is_empty());
    }

    #[test]
    fn well_known_components_use_smaller_capacities() {
        let rings = Rings::new();
        for _ in 0..20 {
            rings.track("secrets", "rotate", serde_json::Value::Null);
        }
        assert_eq!(rings.recent("secrets", 100).len(), 5);

        for _ in 0..20 {
            rings.track("docker", "poll", serde_json::Value::Null);
        }
        assert_eq!(rings.recent("docker", 100).len(), 8);
    }

    #[test]
    fn multi_recent_merges_ascending() {
        let rings = Rings::new();
        rings.track("docker", "start", json!({"n": 1}));
        rings.track("secrets", "fetch", json!({"n": 2}));
        rings.track("docker", "ready", json!({"n": 3}));
        rings.track("secrets", "decrypt", json!({"n": 4}));

        let merged = rings.multi_recent(&["docker", "secrets"], 5);
        assert_eq!(merged.len(), 4);
        assert!(merged.windows(2).all(|w| w[0].ts <= w[1].ts));

        // Limits apply per ring.
        let limited = rings.multi_recent(&["docker", "secrets"], 1);
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn failure_merges_cause_into_map_payloads() {
        let rings = Rings::new();
        let cause = "connection refused";

        rings.track_failure("rpc", &cause, json!({"method": "Call"}));
        let entry = rings.recent("rpc", 1).pop().unwrap();
        assert_eq!(entry.event, EVENT_FAILURE);
        assert_eq!(entry.data["method"], "Call");
        assert_eq!(entry.data["error"], cause);

        rings.track_failure("rpc", &cause, serde_json::Value::Null);
        let entry = rings.recent("rpc", 1).pop().unwrap();
        assert_eq!(entry.data, json!({"error": cause}));

        rings.track_failure("rpc", &cause, json!("raw detail"));
        let entry = rings.recent("rpc", 1).pop().unwrap();
        assert_eq!(
            entry.data,
            json!({"data": "raw detail", "extra": {"error": cause}})
        );
    }

    #[test]
    fn stats_and_clear_all() {
        let rings = Rings::new();
        rings.track_start("docker", serde_json::Value::Null);
        rings.track_success("docker", serde_json::Value::Null);
        rings.track("matrix", "sync", serde_json::Value::Null);

        let stats = rings.stats();
        assert_eq!(stats.get("docker"), Some(&2));
        assert_eq!(stats.get("matrix"), Some(&1));

        rings.clear_all();
        let stats = rings.stats();
        assert_eq!(stats.get("docker"), Some(&0));
        assert_eq!(stats.get("matrix"), Some(&0));
    }

    #[test]
    fn entry_serialization_elides_null_data() {
        let entry = LogEntry {
            ts: Utc::now(),
            component: "docker".to_string(),
            event: "start".to_string(),
            data: serde_json::Value::Null,
        };
        let encoded = serde_json::to_string(&entry).unwrap();
        assert!(!encoded.contains("\"data\""));

        let decoded: LogEntry = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, entry);
    }
}
