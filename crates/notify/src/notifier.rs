use crate::{AdminResolver, AdminTarget, Error, SamplingRegistry};
use report::{CodeRegistry, Severity, TracedError, COPY_INSTRUCTION};
use ringlog::Rings;
use std::sync::{Arc, RwLock};
use store::ErrorStore;
use tokio_util::sync::CancellationToken;

/// Message kind handed to the transport: a non-intrusive admin alert.
pub const MESSAGE_KIND_NOTICE: &str = "m.notice";

// Per-component window pulled into a notification's recent logs.
const ENRICH_PER_COMPONENT: usize = 5;

/// Capability that delivers a formatted message to a recipient. Returns the
/// transport's message id.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn send_message(
        &self,
        ctx: &CancellationToken,
        recipient: &str,
        body: &str,
        kind: &str,
    ) -> anyhow::Result<String>;
}

struct Wiring {
    transport: Option<Arc<dyn Transport>>,
    resolver: Option<Arc<AdminResolver>>,
    store: Option<Arc<ErrorStore>>,
    registry: Option<Arc<CodeRegistry>>,
    enabled: bool,
}

// Snapshot taken under the read lock; all external calls happen after the
// lock is released, so a slow transport cannot stall other reporters.
struct Snapshot {
    transport: Option<Arc<dyn Transport>>,
    resolver: Option<Arc<AdminResolver>>,
    store: Option<Arc<ErrorStore>>,
    registry: Option<Arc<CodeRegistry>>,
    enabled: bool,
}

/// Orchestrates the reporting pipeline: sampling, log enrichment,
/// persistence, admin resolution, formatting, and transport hand-off.
pub struct Notifier {
    sampling: Arc<SamplingRegistry>,
    rings: Arc<Rings>,
    wiring: RwLock<Wiring>,
}

impl Notifier {
    pub fn new(sampling: Arc<SamplingRegistry>, rings: Arc<Rings>) -> Self {
        Self {
            sampling,
            rings,
            wiring: RwLock::new(Wiring {
                transport: None,
                resolver: None,
                store: None,
                registry: None,
                enabled: true,
            }),
        }
    }

    pub fn set_matrix_sender(&self, transport: Arc<dyn Transport>) {
        self.wiring.write().unwrap().transport = Some(transport);
    }

    pub fn set_resolver(&self, resolver: Arc<AdminResolver>) {
        self.wiring.write().unwrap().resolver = Some(resolver);
    }

    pub fn set_store(&self, store: Arc<ErrorStore>) {
        self.wiring.write().unwrap().store = Some(store);
    }

    pub fn set_registry(&self, registry: Arc<CodeRegistry>) {
        self.wiring.write().unwrap().registry = Some(registry);
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.wiring.write().unwrap().enabled = enabled;
    }

    pub fn sampling(&self) -> &Arc<SamplingRegistry> {
        &self.sampling
    }

    pub fn rings(&self) -> &Arc<Rings> {
        &self.rings
    }

    /// Run `err` through the pipeline. Suppressed and headless outcomes are
    /// successes; persistence failures are swallowed after logging, since a
    /// notification that cannot be stored should still reach the admin.
    pub async fn notify(&self, ctx: &CancellationToken, err: &mut TracedError) -> crate::Result<()> {
        let w = self.snapshot();
        if !w.enabled {
            // A disabled notifier is silent, but the durable trail still
            // accrues so operators can reconstruct events later.
            self.store_best_effort(&w, ctx, err);
            return Ok(());
        }

        if !self.sampling.should_notify(err) {
            // Suppressed occurrences still coalesce into the store.
            self.store_best_effort(&w, ctx, err);
            return Ok(());
        }

        if err.recent_logs.is_empty() {
            err.recent_logs = self
                .rings
                .multi_recent(&related_components(&err.category), ENRICH_PER_COMPONENT);
        }

        self.store_best_effort(&w, ctx, err);

        let Some(resolver) = &w.resolver else {
            return Err(Error::NoResolver);
        };
        let admin = resolver.resolve(ctx).await?;

        let body = format_message(err, &admin);
        if let Some(transport) = &w.transport {
            transport
                .send_message(ctx, &admin.mxid, &body, MESSAGE_KIND_NOTICE)
                .await
                .map_err(Error::Transport)?;
        }
        Ok(())
    }

    /// Synthesize a minimal traced error (no stack, no inputs) and route it
    /// through the pipeline.
    pub async fn notify_quick(
        &self,
        ctx: &CancellationToken,
        code: &str,
        message: &str,
        severity: Severity,
    ) -> crate::Result<()> {
        let registry = self.snapshot().registry;
        let category = match &registry {
            Some(registry) => registry.lookup(code).category,
            None => report::codes::default_registry().lookup(code).category,
        };
        let mut err = TracedError::builder(code, message)
            .with_severity(severity)
            .with_category(&category)
            .without_stack()
            .build();
        self.notify(ctx, &mut err).await
    }

    /// Notify, then terminate with `err` as the panic payload. Delivery is
    /// attempted before the process goes down; this never returns.
    pub async fn notify_and_panic(&self, ctx: &CancellationToken, mut err: TracedError) {
        if let Err(delivery) = self.notify(ctx, &mut err).await {
            tracing::error!(error = %delivery, trace_id = %err.trace_id, "failed to deliver fatal error notification");
        }
        panic!("fatal: {err}");
    }

    /// Notify and hand the error back for upstream logging. On transport
    /// failure the returned error carries both the traced error and the
    /// delivery failure.
    pub async fn notify_and_log(
        &self,
        ctx: &CancellationToken,
        mut err: TracedError,
    ) -> anyhow::Error {
        match self.notify(ctx, &mut err).await {
            Ok(()) => anyhow::Error::new(err),
            Err(delivery) => {
                anyhow::Error::new(err).context(format!("notification failed: {delivery}"))
            }
        }
    }

    fn snapshot(&self) -> Snapshot {
        let wiring = self.wiring.read().unwrap();
        Snapshot {
            transport: wiring.transport.clone(),
            resolver: wiring.resolver.clone(),
            store: wiring.store.clone(),
            registry: wiring.registry.clone(),
            enabled: wiring.enabled,
        }
    }

    fn store_best_effort(&self, w: &Snapshot, ctx: &CancellationToken, err: &TracedError) {
        let Some(store) = &w.store else {
            return;
        };
        if let Err(store_err) = store.store(ctx, err) {
            tracing::warn!(
                trace_id = %err.trace_id,
                code = %err.code,
                error = %store_err,
                "failed to persist reported error",
            );
        }
    }
}

/// Components whose recent events are relevant to an error category.
fn related_components(category: &str) -> Vec<&str> {
    match category {
        "container" => vec!["docker", "secrets"],
        "matrix" => vec!["matrix", "turn"],
        "rpc" => vec!["rpc", "audit"],
        "voice" => vec!["voice", "webrtc", "turn"],
        "budget" => vec!["budget", "audit"],
        other => vec![other],
    }
}

// Assemble the hybrid human+machine notification body. The glyphs are part
// of the external contract and are emitted verbatim.
fn format_message(err: &TracedError, admin: &AdminTarget) -> String {
    let mut out = format!(
        "{} {}: {}\n\n",
        err.severity.glyph(),
        err.severity.as_str().to_uppercase(),
        err.code
    );

    out.push_str(&err.message);
    if let Some(cause) = std::error::Error::source(err) {
        out.push_str(&format!(": {cause}"));
    }
    out.push_str("\n\n");

    if !err.function.is_empty() {
        out.push_str(&format!(
            "📍 Location: {} @ {}:{}\n",
            err.function, err.file, err.line
        ));
    }
    out.push_str(&format!("🏷️ Trace ID: {}\n", err.trace_id));
    out.push_str(&format!(
        "⏰ {}\n",
        err.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    if err.repeat_count > 0 {
        out.push_str(&format!(
            "🔁 Repeated {} times since last notification\n",
            err.repeat_count
        ));
    }
    out.push_str(&format!("👤 Admin: {} (via {})\n", admin.mxid, admin.source));

    out.push_str("\n```json\n");
    out.push_str(&err.format_json());
    out.push_str("\n```\n\n");
    out.push_str(COPY_INSTRUCTION);
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::AdminSource;

    #[test]
    fn category_component_mapping() {
        assert_eq!(related_components("container"), vec!["docker", "secrets"]);
        assert_eq!(related_components("voice"), vec!["voice", "webrtc", "turn"]);
        assert_eq!(related_components("unknown"), vec!["unknown"]);
        assert_eq!(related_components("plugin"), vec!["plugin"]);
    }

    #[test]
    fn message_layout() {
        let mut err = TracedError::builder("CTX-001", "container failed to start")
            .with_severity(Severity::Critical)
            .without_stack()
            .build();
        err.repeat_count = 3;
        let admin = AdminTarget {
            mxid: "@admin:example.org".to_string(),
            source: AdminSource::Config,
        };

        let body = format_message(&err, &admin);
        assert!(body.starts_with("🔴 CRITICAL: CTX-001\n\n"));
        assert!(body.contains("container failed to start\n\n"));
        assert!(body.contains(&format!("🏷️ Trace ID: {}\n", err.trace_id)));
        assert!(body.contains("🔁 Repeated 3 times since last notification\n"));
        assert!(body.contains("👤 Admin: @admin:example.org (via config)\n"));
        assert!(body.contains("```json\n{"));
        assert!(body.ends_with(COPY_INSTRUCTION));
        // No stack was captured, so no location line.
        assert!(!body.contains("📍 Location:"));

        let fenced = body
            .split("```json\n")
            .nth(1)
            .and_then(|rest| rest.split("\n```").next())
            .unwrap();
        let decoded = TracedError::parse_json(fenced).unwrap();
        assert_eq!(decoded.trace_id, err.trace_id);
        assert_eq!(decoded.repeat_count, 3);
    }

    #[test]
    fn message_includes_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "socket closed");
        let err = TracedError::wrap_with_message("MAT-002", io, "failed to send matrix event");
        let admin = AdminTarget {
            mxid: "@admin:example.org".to_string(),
            source: AdminSource::Fallback,
        };
        let body = format_message(&err, &admin);
        assert!(body.contains("failed to send matrix event: socket closed\n\n"));
        assert!(body.contains("(via fallback)"));
    }
}
