use chrono::{DateTime, Utc};
use report::{Severity, TracedError};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Suppression window for repeated non-critical codes.
pub const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(5 * 60);
/// How long an idle record survives before cleanup.
pub const DEFAULT_RETENTION_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Per-code bookkeeping of recent occurrences.
#[derive(Clone, Debug, PartialEq)]
pub struct ErrorRecord {
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub count: u64,
    pub last_trace_id: String,
    pub notified: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SamplingStats {
    pub unique_codes: usize,
    pub total_occurrences: u64,
    pub unnotified: usize,
    pub rate_limit_window: Duration,
    pub retention_period: Duration,
}

struct State {
    records: HashMap<String, ErrorRecord>,
    last_cleanup: DateTime<Utc>,
}

/// Decides whether a traced error escapes to the notifier. Bursts of one
/// code inside the rate-limit window collapse into a single notification;
/// critical events are never suppressed.
///
/// All operations serialize on one mutex and never call out while holding it.
pub struct SamplingRegistry {
    state: Mutex<State>,
    rate_limit_window: Duration,
    retention_period: Duration,
}

impl SamplingRegistry {
    /// Zero durations fall back to the defaults.
    pub fn new(rate_limit_window: Duration, retention_period: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                records: HashMap::new(),
                last_cleanup: Utc::now(),
            }),
            rate_limit_window: non_zero_or(rate_limit_window, DEFAULT_RATE_LIMIT_WINDOW),
            retention_period: non_zero_or(retention_period, DEFAULT_RETENTION_PERIOD),
        }
    }

    /// Apply the sampling policy to `err`. Returns true when a notification
    /// should go out. Releasing a suppressed burst sets `err.repeat_count`
    /// to the size of the burst.
    pub fn should_notify(&self, err: &mut TracedError) -> bool {
        let mut state = self.state.lock().unwrap();
        Self::cleanup_locked_if_due(&mut state, self.retention_period);

        // Critical events always escape; the record still counts them.
        if err.severity == Severity::Critical {
            let record = state
                .records
                .entry(err.code.clone())
                .or_insert_with(|| fresh_record(err));
            record.count += 1;
            record.last_seen = err.timestamp;
            record.last_trace_id = err.trace_id.clone();
            record.notified = true;
            return true;
        }

        match state.records.get_mut(&err.code) {
            None => {
                let mut record = fresh_record(err);
                record.count = 1;
                record.notified = true;
                state.records.insert(err.code.clone(), record);
                true
            }
            Some(record) => {
                let delta = (err.timestamp - record.last_seen)
                    .to_std()
                    .unwrap_or_default();
                record.last_seen = err.timestamp;
                record.last_trace_id = err.trace_id.clone();
                if delta < self.rate_limit_window {
                    record.count += 1;
                    tracing::debug!(code = %err.code, count = record.count, "suppressing repeated error");
                    false
                } else {
                    err.repeat_count = record.count as u32;
                    record.count = 1;
                    record.notified = true;
                    true
                }
            }
        }
    }

    /// Bookkeeping without the notify policy. A record created here keeps
    /// `notified = false` until a `should_notify` pass lets it through.
    pub fn record(&self, err: &TracedError) {
        let mut state = self.state.lock().unwrap();
        Self::cleanup_locked_if_due(&mut state, self.retention_period);
        let record = state
            .records
            .entry(err.code.clone())
            .or_insert_with(|| fresh_record(err));
        record.count += 1;
        record.last_seen = err.timestamp;
        record.last_trace_id = err.trace_id.clone();
    }

    /// Defensive copy of the record for `code`.
    pub fn get_record(&self, code: &str) -> Option<ErrorRecord> {
        self.state.lock().unwrap().records.get(code).cloned()
    }

    /// Forget a code entirely; its next occurrence is a fresh first.
    pub fn mark_resolved(&self, code: &str) {
        self.state.lock().unwrap().records.remove(code);
    }

    /// Drop records idle longer than the retention period. Returns how many
    /// were removed.
    pub fn force_cleanup(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        Self::cleanup_locked(&mut state, self.retention_period)
    }

    /// Opportunistic cleanup, capped at one sweep per hour.
    pub fn maybe_cleanup(&self) {
        let mut state = self.state.lock().unwrap();
        Self::cleanup_locked_if_due(&mut state, self.retention_period);
    }

    pub fn stats(&self) -> SamplingStats {
        let state = self.state.lock().unwrap();
        SamplingStats {
            unique_codes: state.records.len(),
            total_occurrences: state.records.values().map(|r| r.count).sum(),
            unnotified: state.records.values().filter(|r| !r.notified).count(),
            rate_limit_window: self.rate_limit_window,
            retention_period: self.retention_period,
        }
    }

    fn cleanup_locked_if_due(state: &mut State, retention: Duration) {
        let due = (Utc::now() - state.last_cleanup)
            .to_std()
            .map(|idle| idle >= CLEANUP_INTERVAL)
            .unwrap_or(false);
        if due {
            Self::cleanup_locked(state, retention);
        }
    }

    fn cleanup_locked(state: &mut State, retention: Duration) -> usize {
        let now = Utc::now();
        let before = state.records.len();
        state.records.retain(|_, record| {
            (now - record.last_seen)
                .to_std()
                .map(|idle| idle < retention)
                .unwrap_or(true)
        });
        state.last_cleanup = now;
        before - state.records.len()
    }
}

fn fresh_record(err: &TracedError) -> ErrorRecord {
    ErrorRecord {
        first_seen: err.timestamp,
        last_seen: err.timestamp,
        count: 0,
        last_trace_id: err.trace_id.clone(),
        notified: false,
    }
}

fn non_zero_or(value: Duration, default: Duration) -> Duration {
    if value.is_zero() {
        default
    } else {
        value
    }
}
