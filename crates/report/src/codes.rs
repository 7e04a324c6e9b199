use crate::Severity;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Definition of a known error code. Codes follow `PREFIX-NNN` and carry a
/// short lowercase category tag, a default severity, a human message, and a
/// remediation hint.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CodeDef {
    pub code: String,
    pub category: String,
    pub severity: Severity,
    pub message: String,
    pub help: String,
}

/// Category assigned to codes the registry has never seen.
pub const CATEGORY_UNKNOWN: &str = "unknown";

/// Catalog of known error codes. Lookup is read-heavy; writes happen at
/// startup or when a plugin registers its own codes.
pub struct CodeRegistry {
    defs: RwLock<HashMap<String, CodeDef>>,
}

impl CodeRegistry {
    /// An empty registry, for tests or fully plugin-driven catalogs.
    pub fn new() -> Self {
        Self {
            defs: RwLock::new(HashMap::new()),
        }
    }

    /// A registry pre-populated with the built-in catalog.
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        for def in builtin_catalog() {
            registry.register(def);
        }
        registry
    }

    /// Register a definition, overwriting any existing entry with the same code.
    pub fn register(&self, def: CodeDef) {
        self.defs.write().unwrap().insert(def.code.clone(), def);
    }

    /// Look up a code. Never fails: a miss yields a synthetic
    /// `unknown`/`error` definition echoing the requested code.
    pub fn lookup(&self, code: &str) -> CodeDef {
        if let Some(def) = self.defs.read().unwrap().get(code) {
            return def.clone();
        }
        CodeDef {
            code: code.to_string(),
            category: CATEGORY_UNKNOWN.to_string(),
            severity: Severity::Error,
            message: format!("unrecognized error code {code}"),
            help: "this code is not in the catalog; check the reporting call site".to_string(),
        }
    }

    pub fn all(&self) -> Vec<CodeDef> {
        self.defs.read().unwrap().values().cloned().collect()
    }

    pub fn by_category(&self, category: &str) -> Vec<CodeDef> {
        self.defs
            .read()
            .unwrap()
            .values()
            .filter(|def| def.category == category)
            .cloned()
            .collect()
    }

    pub fn by_severity(&self, severity: Severity) -> Vec<CodeDef> {
        self.defs
            .read()
            .unwrap()
            .values()
            .filter(|def| def.severity == severity)
            .cloned()
            .collect()
    }
}

impl Default for CodeRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

lazy_static::lazy_static! {
    static ref DEFAULT_REGISTRY: CodeRegistry = CodeRegistry::with_builtin();
}

/// The process-default registry consulted by the traced-error builder.
/// Plugins extend it via `register`; tests that need full isolation build
/// their own `CodeRegistry` and wire it explicitly.
pub fn default_registry() -> &'static CodeRegistry {
    &DEFAULT_REGISTRY
}

fn builtin_catalog() -> Vec<CodeDef> {
    use Severity::{Critical, Error, Warning};

    let defs: &[(&str, &str, Severity, &str, &str)] = &[
        // Container lifecycle.
        ("CTX-001", "container", Error, "container failed to start",
         "inspect the container runtime logs, then restart the bridge container"),
        ("CTX-002", "container", Error, "container exited unexpectedly",
         "check the exit code and the last container logs before the exit"),
        ("CTX-003", "container", Warning, "container restart loop detected",
         "the container keeps restarting; look for a crashing entrypoint"),
        ("CTX-004", "container", Critical, "container runtime unreachable",
         "verify the runtime socket exists and the daemon is running"),
        ("CTX-005", "container", Error, "secret volume mount failed",
         "confirm the secrets path exists and is readable by the container user"),
        ("CTX-006", "container", Warning, "container image out of date",
         "pull the latest image and recreate the container"),
        // Matrix session and delivery.
        ("MAT-001", "matrix", Error, "matrix sync failed",
         "the sync loop returned an error; it will retry with backoff"),
        ("MAT-002", "matrix", Error, "failed to send matrix event",
         "check homeserver reachability and the room's power levels"),
        ("MAT-003", "matrix", Critical, "matrix session invalidated",
         "the access token was rejected; re-authenticate the bot account"),
        ("MAT-010", "matrix", Error, "admin room unavailable",
         "the configured admin room cannot be joined or queried"),
        ("MAT-011", "matrix", Warning, "matrix requests rate limited",
         "the homeserver asked us to back off; delivery is delayed, not lost"),
        // RPC surface.
        ("RPC-001", "rpc", Error, "rpc request failed",
         "the downstream handler returned an error; see the wrapped cause"),
        ("RPC-002", "rpc", Error, "rpc authentication rejected",
         "the caller's credentials were refused; rotate the shared secret if unexpected"),
        ("RPC-003", "rpc", Critical, "rpc listener stopped",
         "the listener loop exited; no further requests will be served"),
        ("RPC-004", "rpc", Warning, "rpc request timed out",
         "the handler exceeded its deadline; the caller will retry"),
        // Host system.
        ("SYS-001", "system", Critical, "out of disk space",
         "free space on the data volume; persistence is failing"),
        ("SYS-002", "system", Error, "error store unavailable",
         "the errors database cannot be opened; check path and permissions"),
        ("SYS-003", "system", Warning, "clock skew detected",
         "system time differs from the homeserver; enable NTP"),
        ("SYS-004", "system", Error, "config reload failed",
         "the new configuration did not parse; the previous one stays active"),
        ("SYS-005", "system", Critical, "panic in background task",
         "a worker task aborted; restart the service and report the trace"),
        // Budget guardrails.
        ("BUD-001", "budget", Warning, "budget threshold approached",
         "usage crossed the soft threshold; review spend before the cap"),
        ("BUD-002", "budget", Error, "budget exceeded",
         "usage crossed the configured budget; non-essential work is paused"),
        ("BUD-003", "budget", Critical, "hard budget cap reached",
         "all paid operations are halted until the cap is raised"),
        ("BUD-004", "budget", Warning, "usage report delayed",
         "the metering backend is lagging; budget decisions use stale data"),
        // Voice transport.
        ("VOI-001", "voice", Error, "voice call setup failed",
         "ICE negotiation failed; check TURN credentials and reachability"),
        ("VOI-002", "voice", Warning, "degraded audio quality reported",
         "packet loss is elevated; inspect the TURN relay path"),
        ("VOI-003", "voice", Error, "turn allocation failed",
         "the TURN server refused the allocation; verify shared secret and quota"),
        ("VOI-004", "voice", Critical, "webrtc stack crashed",
         "the media subprocess died; calls are down until it restarts"),
    ];

    defs.iter()
        .map(|(code, category, severity, message, help)| CodeDef {
            code: code.to_string(),
            category: category.to_string(),
            severity: *severity,
            message: message.to_string(),
            help: help.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lookup_known_code() {
        let registry = CodeRegistry::with_builtin();
        let def = registry.lookup("CTX-001");
        assert_eq!(def.category, "container");
        assert_eq!(def.severity, Severity::Error);
        assert!(!def.help.is_empty());
    }

    #[test]
    fn lookup_miss_is_synthetic() {
        let registry = CodeRegistry::with_builtin();
        let def = registry.lookup("NOPE-999");
        assert_eq!(def.code, "NOPE-999");
        assert_eq!(def.category, CATEGORY_UNKNOWN);
        assert_eq!(def.severity, Severity::Error);
    }

    #[test]
    fn register_overwrites() {
        let registry = CodeRegistry::with_builtin();
        registry.register(CodeDef {
            code: "CTX-001".to_string(),
            category: "container".to_string(),
            severity: Severity::Critical,
            message: "patched".to_string(),
            help: String::new(),
        });
        let def = registry.lookup("CTX-001");
        assert_eq!(def.severity, Severity::Critical);
        assert_eq!(def.message, "patched");
    }

    #[test]
    fn enumeration_filters() {
        let registry = CodeRegistry::with_builtin();
        let container = registry.by_category("container");
        assert!(container.iter().all(|def| def.category == "container"));
        assert!(container.iter().any(|def| def.code == "CTX-004"));

        let critical = registry.by_severity(Severity::Critical);
        assert!(critical.iter().all(|def| def.severity == Severity::Critical));
        assert!(critical.len() >= 5);

        assert_eq!(registry.all().len(), builtin_catalog().len());
    }
}
