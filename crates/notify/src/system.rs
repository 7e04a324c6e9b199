use crate::{AdminResolver, Notifier, SamplingRegistry, Transport};
use anyhow::Context;
use report::TracedError;
use ringlog::Rings;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use store::ErrorStore;
use tokio_util::sync::CancellationToken;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Configuration of the reporting pipeline. Duration fields accept
/// humantime strings (`"5m"`, `"24h"`); zero or unparseable values fall
/// back to the defaults at construction time.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the errors database.
    pub store_path: PathBuf,
    /// Retention of resolved rows, in days.
    pub retention_days: u32,
    /// Suppression window for repeated non-critical codes.
    #[serde(with = "humantime_serde")]
    pub rate_limit_window: Duration,
    /// Idle lifetime of sampling records.
    #[serde(with = "humantime_serde")]
    pub retention_period: Duration,
    /// Lifetime of a resolved admin target.
    #[serde(with = "humantime_serde")]
    pub admin_cache_ttl: Duration,
    /// Tier-1 recipient.
    pub config_admin_mxid: String,
    /// Tier-2 recipient, captured during onboarding.
    pub setup_user_mxid: String,
    /// Tier-3 room whose membership is queried.
    pub admin_room_id: String,
    /// Tier-4 last-resort recipient.
    pub fallback_mxid: String,
    /// Where the setup user is persisted.
    pub setup_user_path: PathBuf,
    /// Master switch for the pipeline.
    pub enabled: bool,
    /// Enable durable storage.
    pub store_enabled: bool,
    /// Enable transport delivery.
    pub notify_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from(store::DEFAULT_STORE_PATH),
            retention_days: store::DEFAULT_RETENTION_DAYS,
            rate_limit_window: crate::sampling::DEFAULT_RATE_LIMIT_WINDOW,
            retention_period: crate::sampling::DEFAULT_RETENTION_PERIOD,
            admin_cache_ttl: crate::resolver::DEFAULT_CACHE_TTL,
            config_admin_mxid: String::new(),
            setup_user_mxid: String::new(),
            admin_room_id: String::new(),
            fallback_mxid: String::new(),
            setup_user_path: PathBuf::from(crate::resolver::DEFAULT_SETUP_USER_PATH),
            enabled: true,
            store_enabled: true,
            notify_enabled: true,
        }
    }
}

/// Parse a humantime duration string, falling back to `default` when the
/// string is empty, unparseable, or zero.
pub fn parse_duration_or(raw: &str, default: Duration) -> Duration {
    match humantime::parse_duration(raw.trim()) {
        Ok(parsed) if !parsed.is_zero() => parsed,
        _ => default,
    }
}

/// The coordinating object wiring sampling, persistence, admin resolution,
/// and the notifier. Constructed once at startup; `install` makes it the
/// target of the process-wide helpers.
pub struct System {
    config: Config,
    rings: Arc<Rings>,
    sampling: Arc<SamplingRegistry>,
    store: Option<Arc<ErrorStore>>,
    resolver: Arc<AdminResolver>,
    notifier: Arc<Notifier>,
    started: AtomicBool,
    shutdown: CancellationToken,
}

impl System {
    pub fn new(config: Config) -> anyhow::Result<System> {
        let rings = Arc::new(Rings::new());
        let sampling = Arc::new(SamplingRegistry::new(
            config.rate_limit_window,
            config.retention_period,
        ));

        let store = if config.store_enabled {
            let store = ErrorStore::open(&config.store_path, config.retention_days)
                .with_context(|| {
                    format!("opening error store at {}", config.store_path.display())
                })?;
            Some(Arc::new(store))
        } else {
            None
        };

        let resolver = Arc::new(
            AdminResolver::new(config.admin_cache_ttl)
                .with_setup_user_path(config.setup_user_path.clone()),
        );
        if !config.config_admin_mxid.is_empty() {
            resolver.set_config_admin(&config.config_admin_mxid);
        }
        if !config.setup_user_mxid.is_empty() {
            resolver.set_setup_user(&config.setup_user_mxid);
        }
        if !config.admin_room_id.is_empty() {
            resolver.set_admin_room(&config.admin_room_id);
        }
        if !config.fallback_mxid.is_empty() {
            resolver.set_fallback(&config.fallback_mxid);
        }

        let notifier = Arc::new(Notifier::new(sampling.clone(), rings.clone()));
        notifier.set_resolver(resolver.clone());
        notifier.set_enabled(config.enabled);
        if let Some(store) = &store {
            notifier.set_store(store.clone());
        }

        Ok(System {
            config,
            rings,
            sampling,
            store,
            resolver,
            notifier,
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    /// Wire the message transport. Ignored when delivery is disabled by
    /// configuration; the pipeline then runs headless.
    pub fn set_transport(&self, transport: Arc<dyn Transport>) {
        if !self.config.notify_enabled {
            tracing::debug!("transport delivery disabled by configuration");
            return;
        }
        self.notifier.set_matrix_sender(transport);
    }

    /// Start background maintenance: periodic sampling cleanup and store
    /// retention sweeps. Idempotent; must be called within a runtime.
    pub fn start(&self, ctx: &CancellationToken) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let ctx = ctx.clone();
        let shutdown = self.shutdown.clone();
        let sampling = self.sampling.clone();
        let store = self.store.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(MAINTENANCE_INTERVAL);
            tick.tick().await; // the first tick completes immediately
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        let removed = sampling.force_cleanup();
                        if removed > 0 {
                            tracing::debug!(removed, "dropped idle sampling records");
                        }
                        if let Some(store) = &store {
                            if let Err(err) = store.cleanup(&ctx) {
                                tracing::warn!(error = %err, "store retention sweep failed");
                            }
                        }
                    }
                }
            }
        });
        tracing::info!("error reporting started");
    }

    /// Stop maintenance and close the store. Idempotent.
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        if let Some(store) = &self.store {
            store.close();
        }
        tracing::info!("error reporting stopped");
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn rings(&self) -> &Arc<Rings> {
        &self.rings
    }

    pub fn sampling(&self) -> &Arc<SamplingRegistry> {
        &self.sampling
    }

    pub fn store(&self) -> Option<&Arc<ErrorStore>> {
        self.store.as_ref()
    }

    pub fn resolver(&self) -> &Arc<AdminResolver> {
        &self.resolver
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }
}

lazy_static::lazy_static! {
    static ref GLOBAL: RwLock<Option<Arc<System>>> = RwLock::new(None);
}

/// Install `system` as the target of the process-wide helpers. Tests
/// install a fresh instance to substitute the whole pipeline.
pub fn install(system: Arc<System>) {
    *GLOBAL.write().unwrap() = Some(system);
}

/// The currently installed system, if any.
pub fn global() -> Option<Arc<System>> {
    GLOBAL.read().unwrap().clone()
}

/// Report an error through the installed system. Failures are logged, not
/// propagated; reporting must never take the caller down.
pub async fn report(ctx: &CancellationToken, mut err: TracedError) {
    match global() {
        Some(system) => {
            if let Err(delivery) = system.notifier().notify(ctx, &mut err).await {
                tracing::warn!(
                    error = %delivery,
                    trace_id = %err.trace_id,
                    "error report failed",
                );
            }
        }
        None => {
            tracing::error!(error = %err, "error reported before reporting system installed")
        }
    }
}

/// Format-and-report convenience over [`report`].
#[track_caller]
pub fn reportf<'a>(
    ctx: &'a CancellationToken,
    code: &'a str,
    args: std::fmt::Arguments<'_>,
) -> impl std::future::Future<Output = ()> + 'a {
    let err = TracedError::newf(code, args);
    async move { report(ctx, err).await }
}

/// Track a component event through the installed system's rings.
pub fn track(component: &str, event: &str, data: serde_json::Value) {
    if let Some(system) = global() {
        system.rings().track(component, event, data);
    }
}

/// Notify through the installed system, surfacing pipeline errors to the
/// caller. Without an installed system this is a no-op success, matching
/// the disabled-notifier contract.
pub async fn global_notify(ctx: &CancellationToken, err: &mut TracedError) -> crate::Result<()> {
    match global() {
        Some(system) => system.notifier().notify(ctx, err).await,
        None => Ok(()),
    }
}

/// Install the stderr tracing subscriber used by binaries and integration
/// harnesses. Safe to call more than once.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .try_init();
}
