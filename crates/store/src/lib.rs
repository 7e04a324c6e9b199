use chrono::{DateTime, Duration, SecondsFormat, Utc};
use report::{Severity, TracedError};
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Default location of the errors database.
pub const DEFAULT_STORE_PATH: &str = "/var/lib/warden/errors.db";
/// Default retention of resolved rows, in days.
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

const DEFAULT_QUERY_LIMIT: usize = 20;
const MAX_QUERY_LIMIT: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no stored error with trace id '{0}'")]
    NotFound(String),
    #[error("persistent error store is closed or disabled")]
    Unavailable,
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("creating store directory {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("decoding stored trace")]
    Decode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A persisted error row. `trace_blob` is the serialized traced error of the
/// latest occurrence coalesced into this row.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredError {
    pub trace_id: String,
    pub code: String,
    pub category: String,
    pub severity: Severity,
    pub message: String,
    pub trace_blob: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub occurrences: u64,
    pub resolved: bool,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl StoredError {
    /// Decode the latest coalesced traced error.
    pub fn trace(&self) -> Result<TracedError> {
        Ok(TracedError::parse_json(&self.trace_blob)?)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum OrderBy {
    #[default]
    LastSeen,
    FirstSeen,
    Occurrences,
}

impl OrderBy {
    fn column(&self) -> &'static str {
        match self {
            OrderBy::LastSeen => "last_seen",
            OrderBy::FirstSeen => "first_seen",
            OrderBy::Occurrences => "occurrences",
        }
    }
}

/// Query filter. Unset fields do not constrain; the time window applies to
/// `first_seen`. Results default to newest-first by `last_seen`, limit 20.
#[derive(Clone, Debug, Default)]
pub struct Filter {
    pub code: Option<String>,
    pub category: Option<String>,
    pub severity: Option<Severity>,
    pub resolved: Option<bool>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub order_by: OrderBy,
    pub ascending: bool,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl Filter {
    fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_QUERY_LIMIT).min(MAX_QUERY_LIMIT)
    }
}

/// Aggregate store statistics.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Stats {
    pub total: u64,
    pub unresolved: u64,
    pub unique_codes: u64,
    pub by_severity: BTreeMap<String, u64>,
    pub by_category: BTreeMap<String, u64>,
}

/// Durable table of reported errors keyed by trace id, with occurrence
/// coalescing for unresolved runs of a code.
///
/// A single connection is shared behind a mutex: rusqlite connections are
/// not `Sync`, and the serialized read-modify-write is exactly what the
/// coalescing path needs. WAL plus a busy timeout keep concurrent external
/// readers workable.
pub struct ErrorStore {
    conn: Mutex<Option<Connection>>,
    retention_days: u32,
}

impl ErrorStore {
    /// Open (and initialize if needed) the store at `path`. The parent
    /// directory is created with mode 0750 when missing.
    pub fn open(path: &Path, retention_days: u32) -> Result<Self> {
        ensure_parent_dir(path)?;
        let conn = Connection::open(path)?;
        Self::init(conn, retention_days)
    }

    /// Open the store at the conventional system path.
    pub fn open_default() -> Result<Self> {
        Self::open(Path::new(DEFAULT_STORE_PATH), DEFAULT_RETENTION_DAYS)
    }

    /// An in-memory store, for tests.
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, DEFAULT_RETENTION_DAYS)
    }

    fn init(conn: Connection, retention_days: u32) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        // WAL lets external readers proceed while we write. The pragma
        // returns the resulting mode as a row, so query it rather than
        // executing it.
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS errors (
                trace_id    TEXT PRIMARY KEY,
                code        TEXT NOT NULL,
                category    TEXT NOT NULL,
                severity    TEXT NOT NULL,
                message     TEXT NOT NULL,
                trace_blob  TEXT NOT NULL,
                first_seen  TEXT NOT NULL,
                last_seen   TEXT NOT NULL,
                occurrences INTEGER NOT NULL DEFAULT 1,
                resolved    INTEGER NOT NULL DEFAULT 0,
                resolved_by TEXT,
                resolved_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_errors_code ON errors (code);
            CREATE INDEX IF NOT EXISTS idx_errors_category ON errors (category);
            CREATE INDEX IF NOT EXISTS idx_errors_severity ON errors (severity);
            CREATE INDEX IF NOT EXISTS idx_errors_resolved ON errors (resolved);
            CREATE INDEX IF NOT EXISTS idx_errors_first_seen ON errors (first_seen);",
        )?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            retention_days,
        })
    }

    /// Close the store. Subsequent operations fail with `Unavailable`.
    pub fn close(&self) {
        if let Some(conn) = self.conn.lock().unwrap().take() {
            if let Err((_conn, err)) = conn.close() {
                tracing::warn!(error = %err, "closing errors database");
            }
        }
    }

    /// Persist `err`. If an unresolved row for the same code exists, the
    /// newest such row is updated in place: its blob is replaced, last_seen
    /// bumped, and occurrences incremented. Resolved rows never coalesce.
    pub fn store(&self, ctx: &CancellationToken, err: &TracedError) -> Result<()> {
        check_cancelled(ctx)?;
        let mut guard = self.conn.lock().unwrap();
        let conn = guard.as_mut().ok_or(Error::Unavailable)?;
        let tx = conn.transaction()?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT trace_id FROM errors
                 WHERE code = ? AND resolved = 0
                 ORDER BY last_seen DESC LIMIT 1",
                params![err.code],
                |row| row.get(0),
            )
            .optional()?;

        let now = ts_to_sql(&err.timestamp);
        match existing {
            Some(trace_id) => {
                tx.execute(
                    "UPDATE errors
                     SET trace_blob = ?2, last_seen = ?3, occurrences = occurrences + 1
                     WHERE trace_id = ?1",
                    params![trace_id, err.format_json(), now],
                )?;
            }
            None => {
                tx.execute(
                    "INSERT INTO errors
                     (trace_id, code, category, severity, message, trace_blob, first_seen, last_seen)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                    params![
                        err.trace_id,
                        err.code,
                        err.category,
                        err.severity.as_str(),
                        err.message,
                        err.format_json(),
                        now,
                    ],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Fetch the row with exactly this trace id.
    pub fn get(&self, ctx: &CancellationToken, trace_id: &str) -> Result<StoredError> {
        check_cancelled(ctx)?;
        let guard = self.conn.lock().unwrap();
        let conn = guard.as_ref().ok_or(Error::Unavailable)?;
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM errors WHERE trace_id = ?"),
            params![trace_id],
            row_to_stored,
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(trace_id.to_string()))
    }

    /// Query rows matching `filter`. The limit defaults to 20 and is capped
    /// at 1000.
    pub fn query(&self, ctx: &CancellationToken, filter: &Filter) -> Result<Vec<StoredError>> {
        check_cancelled(ctx)?;
        let guard = self.conn.lock().unwrap();
        let conn = guard.as_ref().ok_or(Error::Unavailable)?;

        let severity = filter.severity.map(|s| s.as_str().to_string());
        let resolved = filter.resolved.map(|b| b as i64);
        let since = filter.since.as_ref().map(ts_to_sql);
        let until = filter.until.as_ref().map(ts_to_sql);
        let limit = filter.effective_limit() as i64;
        let offset = filter.offset.unwrap_or(0) as i64;

        let mut clauses: Vec<&str> = Vec::new();
        let mut binds: Vec<&dyn ToSql> = Vec::new();
        if let Some(code) = &filter.code {
            clauses.push("code = ?");
            binds.push(code);
        }
        if let Some(category) = &filter.category {
            clauses.push("category = ?");
            binds.push(category);
        }
        if let Some(severity) = &severity {
            clauses.push("severity = ?");
            binds.push(severity);
        }
        if let Some(resolved) = &resolved {
            clauses.push("resolved = ?");
            binds.push(resolved);
        }
        if let Some(since) = &since {
            clauses.push("first_seen >= ?");
            binds.push(since);
        }
        if let Some(until) = &until {
            clauses.push("first_seen <= ?");
            binds.push(until);
        }

        let mut sql = format!("SELECT {COLUMNS} FROM errors");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(&format!(
            " ORDER BY {} {} LIMIT ? OFFSET ?",
            filter.order_by.column(),
            if filter.ascending { "ASC" } else { "DESC" },
        ));
        binds.push(&limit);
        binds.push(&offset);

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(&binds[..], row_to_stored)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// The most recently seen rows, newest first.
    pub fn recent(&self, ctx: &CancellationToken, limit: usize) -> Result<Vec<StoredError>> {
        self.query(
            ctx,
            &Filter {
                limit: Some(limit),
                ..Filter::default()
            },
        )
    }

    /// Mark a row resolved by `by`.
    pub fn resolve(&self, ctx: &CancellationToken, trace_id: &str, by: &str) -> Result<()> {
        check_cancelled(ctx)?;
        let guard = self.conn.lock().unwrap();
        let conn = guard.as_ref().ok_or(Error::Unavailable)?;
        let changed = conn.execute(
            "UPDATE errors SET resolved = 1, resolved_by = ?2, resolved_at = ?3
             WHERE trace_id = ?1",
            params![trace_id, by, ts_to_sql(&Utc::now())],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(trace_id.to_string()));
        }
        Ok(())
    }

    /// Clear a row's resolution fields.
    pub fn unresolve(&self, ctx: &CancellationToken, trace_id: &str) -> Result<()> {
        check_cancelled(ctx)?;
        let guard = self.conn.lock().unwrap();
        let conn = guard.as_ref().ok_or(Error::Unavailable)?;
        let changed = conn.execute(
            "UPDATE errors SET resolved = 0, resolved_by = NULL, resolved_at = NULL
             WHERE trace_id = ?1",
            params![trace_id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(trace_id.to_string()));
        }
        Ok(())
    }

    /// Hard-remove a row. Removing an absent row is a no-op.
    pub fn delete(&self, ctx: &CancellationToken, trace_id: &str) -> Result<()> {
        check_cancelled(ctx)?;
        let guard = self.conn.lock().unwrap();
        let conn = guard.as_ref().ok_or(Error::Unavailable)?;
        conn.execute("DELETE FROM errors WHERE trace_id = ?1", params![trace_id])?;
        Ok(())
    }

    /// Remove resolved rows whose resolution is older than the retention
    /// window. Returns the number of rows removed.
    pub fn cleanup(&self, ctx: &CancellationToken) -> Result<usize> {
        check_cancelled(ctx)?;
        let cutoff = Utc::now() - Duration::days(i64::from(self.retention_days));
        let guard = self.conn.lock().unwrap();
        let conn = guard.as_ref().ok_or(Error::Unavailable)?;
        let removed = conn.execute(
            "DELETE FROM errors
             WHERE resolved = 1 AND resolved_at IS NOT NULL AND resolved_at < ?1",
            params![ts_to_sql(&cutoff)],
        )?;
        if removed > 0 {
            tracing::debug!(removed, "cleaned up resolved errors");
        }
        Ok(removed)
    }

    pub fn stats(&self, ctx: &CancellationToken) -> Result<Stats> {
        check_cancelled(ctx)?;
        let guard = self.conn.lock().unwrap();
        let conn = guard.as_ref().ok_or(Error::Unavailable)?;

        let (total, unresolved, unique_codes) = conn.query_row(
            "SELECT COUNT(*),
                    COUNT(*) FILTER (WHERE resolved = 0),
                    COUNT(DISTINCT code)
             FROM errors",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)? as u64,
                    row.get::<_, i64>(1)? as u64,
                    row.get::<_, i64>(2)? as u64,
                ))
            },
        )?;

        let mut stats = Stats {
            total,
            unresolved,
            unique_codes,
            ..Stats::default()
        };
        let mut stmt = conn.prepare("SELECT severity, COUNT(*) FROM errors GROUP BY severity")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        for row in rows {
            let (severity, count) = row?;
            stats.by_severity.insert(severity, count);
        }
        let mut stmt = conn.prepare("SELECT category, COUNT(*) FROM errors GROUP BY category")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        for row in rows {
            let (category, count) = row?;
            stats.by_category.insert(category, count);
        }
        Ok(stats)
    }
}

const COLUMNS: &str = "trace_id, code, category, severity, message, trace_blob, \
                       first_seen, last_seen, occurrences, resolved, resolved_by, resolved_at";

fn check_cancelled(ctx: &CancellationToken) -> Result<()> {
    if ctx.is_cancelled() {
        return Err(Error::Cancelled);
    }
    Ok(())
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    let Some(dir) = path.parent() else {
        return Ok(());
    };
    if dir.as_os_str().is_empty() || dir.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(dir).map_err(|source| Error::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o750)).map_err(
            |source| Error::Io {
                path: dir.to_path_buf(),
                source,
            },
        )?;
    }
    Ok(())
}

// Fixed-width RFC3339 with microseconds, so TEXT comparisons order correctly.
fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn ts_from_sql(column: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })
}

fn row_to_stored(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredError> {
    let severity: String = row.get(3)?;
    let severity = severity.parse::<Severity>().map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(err))
    })?;
    let resolved_at: Option<String> = row.get(11)?;
    Ok(StoredError {
        trace_id: row.get(0)?,
        code: row.get(1)?,
        category: row.get(2)?,
        severity,
        message: row.get(4)?,
        trace_blob: row.get(5)?,
        first_seen: ts_from_sql(6, row.get(6)?)?,
        last_seen: ts_from_sql(7, row.get(7)?)?,
        occurrences: row.get::<_, i64>(8)? as u64,
        resolved: row.get(9)?,
        resolved_by: row.get(10)?,
        resolved_at: resolved_at.map(|raw| ts_from_sql(11, raw)).transpose()?,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use report::TracedError;
    use serde_json::json;

    fn ctx() -> CancellationToken {
        CancellationToken::new()
    }

    fn sample(code: &str) -> TracedError {
        TracedError::builder(code, "")
            .with_input("attempt", json!(1))
            .build()
    }

    #[test]
    fn store_inserts_then_coalesces() {
        let store = ErrorStore::in_memory().unwrap();
        let first = sample("CTX-001");
        let second = sample("CTX-001");
        store.store(&ctx(), &first).unwrap();
        store.store(&ctx(), &second).unwrap();

        let row = store.get(&ctx(), &first.trace_id).unwrap();
        assert_eq!(row.occurrences, 2);
        assert_eq!(row.code, "CTX-001");
        // The blob is replaced by the latest occurrence.
        assert_eq!(row.trace().unwrap().trace_id, second.trace_id);
        assert!(row.last_seen >= row.first_seen);

        // The second trace id never became a row of its own.
        assert!(matches!(
            store.get(&ctx(), &second.trace_id),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn resolved_rows_do_not_coalesce() {
        let store = ErrorStore::in_memory().unwrap();
        let first = sample("CTX-001");
        store.store(&ctx(), &first).unwrap();
        store.resolve(&ctx(), &first.trace_id, "@admin:example.org").unwrap();

        let second = sample("CTX-001");
        store.store(&ctx(), &second).unwrap();

        let reopened = store.get(&ctx(), &second.trace_id).unwrap();
        assert_eq!(reopened.occurrences, 1);
        assert!(!reopened.resolved);

        let resolved = store.get(&ctx(), &first.trace_id).unwrap();
        assert!(resolved.resolved);
        assert_eq!(resolved.occurrences, 1);
    }

    #[test]
    fn resolve_and_unresolve_round_trip() {
        let store = ErrorStore::in_memory().unwrap();
        let err = sample("MAT-001");
        store.store(&ctx(), &err).unwrap();

        store.resolve(&ctx(), &err.trace_id, "@admin:example.org").unwrap();
        let row = store.get(&ctx(), &err.trace_id).unwrap();
        assert!(row.resolved);
        assert_eq!(row.resolved_by.as_deref(), Some("@admin:example.org"));
        assert!(row.resolved_at.is_some());

        store.unresolve(&ctx(), &err.trace_id).unwrap();
        let row = store.get(&ctx(), &err.trace_id).unwrap();
        assert!(!row.resolved);
        assert_eq!(row.resolved_by, None);
        assert_eq!(row.resolved_at, None);

        assert!(matches!(
            store.resolve(&ctx(), "tr_missing", "@x"),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            store.unresolve(&ctx(), "tr_missing"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn query_filters_and_ordering() {
        let store = ErrorStore::in_memory().unwrap();
        for code in ["CTX-001", "MAT-001", "RPC-002"] {
            store.store(&ctx(), &sample(code)).unwrap();
        }
        // A second CTX-001 bumps its occurrences to 2.
        store.store(&ctx(), &sample("CTX-001")).unwrap();

        let containers = store
            .query(
                &ctx(),
                &Filter {
                    category: Some("container".to_string()),
                    ..Filter::default()
                },
            )
            .unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].code, "CTX-001");

        let ctx_row = &containers[0];
        store.resolve(&ctx(), &ctx_row.trace_id, "@admin").unwrap();

        let unresolved = store
            .query(
                &ctx(),
                &Filter {
                    resolved: Some(false),
                    ..Filter::default()
                },
            )
            .unwrap();
        assert_eq!(unresolved.len(), 2);
        assert!(unresolved.iter().all(|row| row.code != "CTX-001"));

        let resolved = store
            .query(
                &ctx(),
                &Filter {
                    resolved: Some(true),
                    ..Filter::default()
                },
            )
            .unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].code, "CTX-001");

        let by_occurrences = store
            .query(
                &ctx(),
                &Filter {
                    order_by: OrderBy::Occurrences,
                    ..Filter::default()
                },
            )
            .unwrap();
        assert_eq!(by_occurrences[0].code, "CTX-001");

        let paged = store
            .query(
                &ctx(),
                &Filter {
                    order_by: OrderBy::Occurrences,
                    limit: Some(1),
                    offset: Some(1),
                    ..Filter::default()
                },
            )
            .unwrap();
        assert_eq!(paged.len(), 1);
        assert_ne!(paged[0].code, "CTX-001");
    }

    #[test]
    fn query_limit_caps_at_maximum() {
        let filter = Filter {
            limit: Some(5000),
            ..Filter::default()
        };
        assert_eq!(filter.effective_limit(), MAX_QUERY_LIMIT);
        assert_eq!(Filter::default().effective_limit(), DEFAULT_QUERY_LIMIT);
    }

    #[test]
    fn cleanup_removes_only_aged_resolved_rows() {
        let store = ErrorStore::init(Connection::open_in_memory().unwrap(), 0).unwrap();
        let resolved = sample("CTX-001");
        let open = sample("MAT-001");
        store.store(&ctx(), &resolved).unwrap();
        store.store(&ctx(), &open).unwrap();
        store.resolve(&ctx(), &resolved.trace_id, "@admin").unwrap();

        // retention_days = 0 makes anything resolved in the past eligible.
        std::thread::sleep(std::time::Duration::from_millis(5));
        let removed = store.cleanup(&ctx()).unwrap();
        assert_eq!(removed, 1);

        assert!(matches!(
            store.get(&ctx(), &resolved.trace_id),
            Err(Error::NotFound(_))
        ));
        store.get(&ctx(), &open.trace_id).unwrap();
    }

    #[test]
    fn stats_aggregate() {
        let store = ErrorStore::in_memory().unwrap();
        store.store(&ctx(), &sample("CTX-001")).unwrap();
        store.store(&ctx(), &sample("CTX-004")).unwrap();
        store.store(&ctx(), &sample("BUD-001")).unwrap();
        store.resolve(
            &ctx(),
            &store.query(&ctx(), &Filter { code: Some("BUD-001".into()), ..Filter::default() })
                .unwrap()[0]
                .trace_id,
            "@admin",
        )
        .unwrap();

        let stats = store.stats(&ctx()).unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.unresolved, 2);
        assert_eq!(stats.unique_codes, 3);
        assert_eq!(stats.by_category.get("container"), Some(&2));
        assert_eq!(stats.by_category.get("budget"), Some(&1));
        assert_eq!(stats.by_severity.get("critical"), Some(&1));
        assert_eq!(stats.by_severity.get("error"), Some(&1));
        assert_eq!(stats.by_severity.get("warning"), Some(&1));
    }

    #[test]
    fn blob_round_trips_through_store() {
        let store = ErrorStore::in_memory().unwrap();
        let err = TracedError::builder("VOI-001", "ice failed")
            .with_input("peer", json!("@bob:example.org"))
            .with_state("relay", json!({"host": "turn.example.org", "port": 3478}))
            .build();
        store.store(&ctx(), &err).unwrap();

        let decoded = store.get(&ctx(), &err.trace_id).unwrap().trace().unwrap();
        assert_eq!(decoded.trace_id, err.trace_id);
        assert_eq!(decoded.inputs, err.inputs);
        assert_eq!(decoded.state, err.state);
        assert_eq!(decoded.timestamp, err.timestamp);
    }

    #[test]
    fn opens_on_disk_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("errors.db");
        let err = sample("CTX-001");
        {
            let store = ErrorStore::open(&path, 30).unwrap();
            store.store(&ctx(), &err).unwrap();
            store.close();
            // Closed stores refuse further work.
            assert!(matches!(store.stats(&ctx()), Err(Error::Unavailable)));
        }
        let store = ErrorStore::open(&path, 30).unwrap();
        store.get(&ctx(), &err.trace_id).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(path.parent().unwrap())
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o750);
        }
    }

    #[test]
    fn cancellation_aborts() {
        let store = ErrorStore::in_memory().unwrap();
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            store.store(&token, &sample("CTX-001")),
            Err(Error::Cancelled)
        ));
        assert!(matches!(store.cleanup(&token), Err(Error::Cancelled)));
    }
}
