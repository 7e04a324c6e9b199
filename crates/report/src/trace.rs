use crate::{codes, Severity};
use chrono::{DateTime, Utc};
use ringlog::LogEntry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// One-line instruction appended below the JSON block so an operator knows
/// the payload is meant for machine analysis. Emitted verbatim.
pub const COPY_INSTRUCTION: &str = "📋 Copy the JSON block above to analyze with an LLM.";

/// A single captured call frame, innermost first within a stack.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StackFrame {
    pub function: String,
    pub file: String,
    pub line: u32,
}

/// A fully-captured failure: code, severity, call site, input and state
/// snapshots, recent component events, and an optional wrapped cause.
///
/// Values are immutable after `build()`, except `repeat_count` which the
/// sampling layer sets when releasing a suppressed burst, and `recent_logs`
/// which the notifier fills when the builder captured none.
#[derive(Debug, Serialize, Deserialize)]
pub struct TracedError {
    pub code: String,
    pub category: String,
    pub severity: Severity,
    pub message: String,
    pub function: String,
    pub file: String,
    pub line: u32,
    pub trace_id: String,
    /// Wall-clock of construction, RFC3339 UTC in serialized form.
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub state: BTreeMap<String, serde_json::Value>,
    pub stack: Vec<StackFrame>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recent_logs: Vec<LogEntry>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub repeat_count: u32,
    /// Wrapped original error, exposed through `Error::source`. Not part of
    /// the JSON serialization.
    #[serde(skip)]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl TracedError {
    pub fn builder(code: &str, message: &str) -> TracedErrorBuilder {
        TracedErrorBuilder {
            code: code.to_string(),
            message: message.to_string(),
            category: None,
            severity: None,
            inputs: BTreeMap::new(),
            state: BTreeMap::new(),
            recent_logs: Vec::new(),
            cause: None,
            capture_stack: true,
        }
    }

    #[track_caller]
    pub fn new(code: &str, message: &str) -> TracedError {
        Self::builder(code, message).build()
    }

    #[track_caller]
    pub fn newf(code: &str, args: std::fmt::Arguments<'_>) -> TracedError {
        Self::builder(code, &args.to_string()).build()
    }

    #[track_caller]
    pub fn wrap(
        code: &str,
        cause: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> TracedError {
        Self::builder(code, "").caused_by(cause).build()
    }

    #[track_caller]
    pub fn wrap_with_message(
        code: &str,
        cause: impl Into<Box<dyn std::error::Error + Send + Sync>>,
        message: &str,
    ) -> TracedError {
        Self::builder(code, message).caused_by(cause).build()
    }

    /// Stable, pretty-printed JSON. Empty optionals are omitted.
    pub fn format_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("traced error always serializes")
    }

    /// Parse a serialized traced error back into the model. The cause chain
    /// is not serialized and does not round-trip.
    pub fn parse_json(encoded: &str) -> serde_json::Result<TracedError> {
        serde_json::from_str(encoded)
    }

    /// Short human line: severity glyph, code, message, cause and repeats.
    pub fn format_summary(&self) -> String {
        let mut out = format!("{} {}: {}", self.severity.glyph(), self.code, self.message);
        if let Some(cause) = &self.cause {
            out.push_str(&format!(" (cause: {cause})"));
        }
        if self.repeat_count > 0 {
            out.push_str(&format!(". Repeated {} times", self.repeat_count));
        }
        out
    }

    /// Hybrid human+machine rendering: summary paragraph, metadata block,
    /// fenced JSON, and the copy instruction.
    pub fn format_llm(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.format_summary());
        out.push_str("\n\n");
        out.push_str(&format!(
            "Code: {} | Category: {} | Severity: {}\n",
            self.code, self.category, self.severity
        ));
        out.push_str(&format!("Trace ID: {}\n", self.trace_id));
        if self.function.is_empty() {
            out.push_str(&format!("Location: {}:{}\n", self.file, self.line));
        } else {
            out.push_str(&format!(
                "Location: {} @ {}:{}\n",
                self.function, self.file, self.line
            ));
        }
        out.push_str(&format!("Time: {}\n", self.timestamp.to_rfc3339()));
        out.push_str("\n```json\n");
        out.push_str(&self.format_json());
        out.push_str("\n```\n\n");
        out.push_str(COPY_INSTRUCTION);
        out
    }

    /// Walk the cause chain looking for a concrete error type.
    pub fn has_cause<E: std::error::Error + 'static>(&self) -> bool {
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            if err.downcast_ref::<E>().is_some() {
                return true;
            }
            source = err.source();
        }
        false
    }
}

impl std::fmt::Display for TracedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.format_summary())
    }
}

impl std::error::Error for TracedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.cause {
            Some(cause) => Some(cause.as_ref()),
            None => None,
        }
    }
}

/// Accumulates fields for a [`TracedError`]. `build()` is the only place
/// trace ids are minted and stacks are captured.
pub struct TracedErrorBuilder {
    code: String,
    message: String,
    category: Option<String>,
    severity: Option<Severity>,
    inputs: BTreeMap<String, serde_json::Value>,
    state: BTreeMap<String, serde_json::Value>,
    recent_logs: Vec<LogEntry>,
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    capture_stack: bool,
}

impl TracedErrorBuilder {
    pub fn with_input(mut self, key: &str, value: serde_json::Value) -> Self {
        self.inputs.insert(key.to_string(), value);
        self
    }

    pub fn with_state(mut self, key: &str, value: serde_json::Value) -> Self {
        self.state.insert(key.to_string(), value);
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn with_category(mut self, category: &str) -> Self {
        self.category = Some(category.to_string());
        self
    }

    pub fn with_recent_logs(mut self, entries: Vec<LogEntry>) -> Self {
        self.recent_logs = entries;
        self
    }

    pub fn caused_by(
        mut self,
        cause: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Skip stack capture. Used for synthesized errors that have no
    /// meaningful call site, like quick operator notices.
    pub fn without_stack(mut self) -> Self {
        self.capture_stack = false;
        self
    }

    /// Produce the immutable traced error. Unset category, severity, and
    /// message fall back to the registry definition for the code.
    #[track_caller]
    pub fn build(self) -> TracedError {
        let location = std::panic::Location::caller();
        let def = codes::default_registry().lookup(&self.code);
        let stack = if self.capture_stack {
            capture_stack()
        } else {
            Vec::new()
        };
        let function = stack
            .first()
            .map(|frame| frame.function.clone())
            .unwrap_or_default();

        TracedError {
            code: self.code,
            category: self.category.unwrap_or(def.category),
            severity: self.severity.unwrap_or(def.severity),
            message: if self.message.is_empty() {
                def.message
            } else {
                self.message
            },
            function,
            file: location.file().to_string(),
            line: location.line(),
            trace_id: generate_trace_id(),
            timestamp: Utc::now(),
            inputs: self.inputs,
            state: self.state,
            stack,
            recent_logs: self.recent_logs,
            repeat_count: 0,
            cause: self.cause,
        }
    }
}

static NEXT_SEQ: AtomicU64 = AtomicU64::new(0);

// `tr_` + 24 hex chars: 48 bits of wall-clock nanos, a 16-bit process
// sequence, and 32 random bits. The sequence keeps ids unique within a
// process even if the clock stalls.
fn generate_trace_id() -> String {
    use rand::Rng;

    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
    let seq = NEXT_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut salt = [0u8; 4];
    rand::thread_rng().fill(&mut salt[..]);
    format!(
        "tr_{:012x}{:04x}{}",
        nanos & 0xffff_ffff_ffff,
        seq & 0xffff,
        hex::encode(salt)
    )
}

const MAX_FRAMES: usize = 16;

// Frames belonging to the builder and its helpers, skipped so the innermost
// reported frame is the user's call site.
fn is_builder_frame(name: &str) -> bool {
    name.contains("backtrace::")
        || name.contains("TracedErrorBuilder")
        || name.contains("TracedError::new")
        || name.contains("TracedError::wrap")
        || name.contains("::capture_stack")
}

// Runtime bootstrap below main; everything past it is noise.
fn is_runtime_frame(name: &str) -> bool {
    name.starts_with("std::rt::")
        || name.contains("lang_start")
        || name.contains("__libc_start_main")
        || name.starts_with("_start")
}

fn capture_stack() -> Vec<StackFrame> {
    let bt = backtrace::Backtrace::new();
    let mut frames = Vec::new();
    let mut in_user_code = false;

    for frame in bt.frames() {
        let Some(symbol) = frame.symbols().first() else {
            continue;
        };
        let function = symbol
            .name()
            .map(|name| name.to_string())
            .unwrap_or_default();

        if !in_user_code {
            if function.is_empty() || is_builder_frame(&function) {
                continue;
            }
            in_user_code = true;
        }
        if is_runtime_frame(&function) {
            break;
        }

        frames.push(StackFrame {
            function,
            file: symbol
                .filename()
                .map(|path| path.display().to_string())
                .unwrap_or_default(),
            line: symbol.lineno().unwrap_or(0),
        });
        if frames.len() == MAX_FRAMES {
            break;
        }
    }
    frames
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn trace_ids_are_prefixed_and_unique() {
        let ids: HashSet<String> = (0..1000).map(|_| generate_trace_id()).collect();
        assert_eq!(ids.len(), 1000);
        for id in &ids {
            assert!(id.starts_with("tr_"), "bad id {id}");
            assert!(id.len() >= 3 + 12);
            assert!(id[3..].chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn build_falls_back_to_registry_definition() {
        let err = TracedError::new("CTX-001", "");
        assert_eq!(err.category, "container");
        assert_eq!(err.severity, Severity::Error);
        assert_eq!(err.message, "container failed to start");
        assert_eq!(err.repeat_count, 0);

        let err = TracedError::new("CTX-001", "custom message");
        assert_eq!(err.message, "custom message");
    }

    #[test]
    fn build_overrides_win() {
        let err = TracedError::builder("CTX-001", "boom")
            .with_severity(Severity::Critical)
            .with_category("system")
            .build();
        assert_eq!(err.severity, Severity::Critical);
        assert_eq!(err.category, "system");
    }

    #[test]
    fn unknown_code_is_synthetic() {
        let err = TracedError::new("ZZZ-123", "");
        assert_eq!(err.category, "unknown");
        assert_eq!(err.severity, Severity::Error);
    }

    #[test]
    fn call_site_is_captured() {
        let err = TracedError::new("CTX-001", "boom");
        assert!(err.file.ends_with("trace.rs"), "file was {}", err.file);
        assert!(err.line > 0);
    }

    #[test]
    fn stack_excludes_builder_frames() {
        let err = TracedError::new("CTX-001", "boom");
        assert!(err.stack.len() <= MAX_FRAMES);
        for frame in &err.stack {
            assert!(
                !is_builder_frame(&frame.function),
                "builder frame leaked: {}",
                frame.function
            );
        }
    }

    #[test]
    fn without_stack_skips_capture() {
        let err = TracedError::builder("CTX-001", "boom").without_stack().build();
        assert!(err.stack.is_empty());
        assert!(err.function.is_empty());
    }

    #[test]
    fn cause_chain_is_exposed() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = TracedError::wrap("RPC-001", io);
        assert_eq!(err.message, "rpc request failed");
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.has_cause::<std::io::Error>());
        assert!(!err.has_cause::<std::fmt::Error>());
    }

    #[test]
    fn json_round_trip_and_elision() {
        let mut err = TracedError::builder("MAT-002", "send failed")
            .with_input("room", json!("!ops:example.org"))
            .with_state("retries", json!(3))
            .build();
        err.repeat_count = 2;

        let encoded = err.format_json();
        let decoded = TracedError::parse_json(&encoded).unwrap();
        assert_eq!(decoded.code, err.code);
        assert_eq!(decoded.category, err.category);
        assert_eq!(decoded.severity, err.severity);
        assert_eq!(decoded.message, err.message);
        assert_eq!(decoded.function, err.function);
        assert_eq!(decoded.file, err.file);
        assert_eq!(decoded.line, err.line);
        assert_eq!(decoded.trace_id, err.trace_id);
        assert_eq!(decoded.timestamp, err.timestamp);
        assert_eq!(decoded.inputs, err.inputs);
        assert_eq!(decoded.state, err.state);
        assert_eq!(decoded.stack, err.stack);
        assert_eq!(decoded.repeat_count, 2);

        // Empty optionals are elided entirely.
        let bare = TracedError::new("MAT-002", "send failed");
        let encoded = bare.format_json();
        assert!(!encoded.contains("\"inputs\""));
        assert!(!encoded.contains("\"state\""));
        assert!(!encoded.contains("\"recent_logs\""));
        assert!(!encoded.contains("\"repeat_count\""));
        assert!(encoded.contains("\"stack\""));
    }

    #[test]
    fn summary_shape() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let mut err = TracedError::wrap_with_message("SYS-001", io, "no space left");
        assert_eq!(
            err.format_summary(),
            "🔴 SYS-001: no space left (cause: disk full)"
        );

        err.repeat_count = 4;
        assert!(err.format_summary().ends_with(". Repeated 4 times"));

        let warn = TracedError::builder("BUD-001", "")
            .with_severity(Severity::Warning)
            .build();
        assert!(warn.format_summary().starts_with("⚠️ BUD-001:"));
    }

    #[test]
    fn llm_format_carries_fenced_json() {
        let err = TracedError::new("CTX-001", "boom");
        let text = err.format_llm();
        assert!(text.starts_with("❌ CTX-001: boom"));
        assert!(text.contains("```json\n{"));
        assert!(text.contains(&err.trace_id));
        assert!(text.ends_with(COPY_INSTRUCTION));

        let fenced = text
            .split("```json\n")
            .nth(1)
            .and_then(|rest| rest.split("\n```").next())
            .unwrap();
        TracedError::parse_json(fenced).unwrap();
    }
}
