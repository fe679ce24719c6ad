#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use task_gateway_domain::{now_utc, AgentResult};
use task_gateway_idempotency_core::{
    expires_after, result_hash, unix_millis, Claim, EntryState, IdempotencyEntry,
    IdempotencyStore, TaskRecord,
};
use time::OffsetDateTime;

const IDEMPOTENCY_SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS idempotency_entries (
  idempotency_key TEXT PRIMARY KEY,
  state TEXT NOT NULL CHECK (state IN ('in_flight','completed')),
  task_id TEXT NOT NULL,
  result_json TEXT,
  result_hash TEXT,
  created_at TEXT NOT NULL,
  created_at_ms INTEGER NOT NULL,
  expires_at TEXT NOT NULL,
  expires_at_ms INTEGER NOT NULL,
  CHECK (state = 'in_flight' OR (result_json IS NOT NULL AND result_hash IS NOT NULL))
);

CREATE INDEX IF NOT EXISTS idx_idempotency_task ON idempotency_entries(task_id, created_at_ms);
CREATE INDEX IF NOT EXISTS idx_idempotency_expiry ON idempotency_entries(expires_at_ms);

CREATE TRIGGER IF NOT EXISTS trg_idempotency_completed_immutable
BEFORE UPDATE ON idempotency_entries
WHEN OLD.state = 'completed' AND NEW.created_at_ms < OLD.expires_at_ms
BEGIN
  SELECT RAISE(FAIL, 'completed idempotency entries are immutable until expiry');
END;
";

const CLAIM_SQL: &str = "INSERT INTO idempotency_entries(
    idempotency_key, state, task_id, result_json, result_hash,
    created_at, created_at_ms, expires_at, expires_at_ms
) VALUES (?1, 'in_flight', ?2, NULL, NULL, ?3, ?4, ?5, ?6)
ON CONFLICT(idempotency_key) DO UPDATE SET
    state = 'in_flight',
    task_id = excluded.task_id,
    result_json = NULL,
    result_hash = NULL,
    created_at = excluded.created_at,
    created_at_ms = excluded.created_at_ms,
    expires_at = excluded.expires_at,
    expires_at_ms = excluded.expires_at_ms
WHERE idempotency_entries.expires_at_ms <= excluded.created_at_ms";

const STORE_SQL: &str = "INSERT INTO idempotency_entries(
    idempotency_key, state, task_id, result_json, result_hash,
    created_at, created_at_ms, expires_at, expires_at_ms
) VALUES (?1, 'completed', ?2, ?3, ?4, ?5, ?6, ?7, ?8)
ON CONFLICT(idempotency_key) DO UPDATE SET
    state = 'completed',
    task_id = excluded.task_id,
    result_json = excluded.result_json,
    result_hash = excluded.result_hash,
    created_at = excluded.created_at,
    created_at_ms = excluded.created_at_ms,
    expires_at = excluded.expires_at,
    expires_at_ms = excluded.expires_at_ms";

const ENTRY_COLUMNS: &str =
    "idempotency_key, state, task_id, result_json, result_hash, created_at, expires_at";

pub struct SqliteIdempotencyStore {
    conn: Mutex<Connection>,
}

impl SqliteIdempotencyStore {
    /// Open or create a `SQLite` idempotency database and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("idempotency connection lock poisoned"))
    }
}

impl IdempotencyStore for SqliteIdempotencyStore {
    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(SCHEMA_V1)
            .context("failed to apply idempotency schema")?;

        let now = rfc3339(now_utc())?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![IDEMPOTENCY_SCHEMA_VERSION, now],
        )
        .context("failed to record idempotency migration")?;
        Ok(())
    }

    fn lookup(&self, key: &str) -> Result<Option<AgentResult>> {
        let now_ms = unix_millis(now_utc())?;
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT result_json FROM idempotency_entries
                 WHERE idempotency_key = ?1 AND state = 'completed' AND expires_at_ms > ?2",
                params![key, now_ms],
                |row| row.get(0),
            )
            .optional()
            .context("failed to look up idempotency key")?;
        raw.map(|value| parse_result(&value)).transpose()
    }

    fn begin(&self, key: &str, task_id: &str, ttl: Duration) -> Result<Claim> {
        let now = now_utc();
        let expires_at = expires_after(now, ttl)?;
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start idempotency claim transaction")?;

        let changed = tx
            .execute(
                CLAIM_SQL,
                params![
                    key,
                    task_id,
                    rfc3339(now)?,
                    unix_millis(now)?,
                    rfc3339(expires_at)?,
                    unix_millis(expires_at)?,
                ],
            )
            .context("failed to claim idempotency key")?;

        let claim = if changed == 1 {
            Claim::Acquired
        } else {
            let existing = select_entry(&tx, key)?
                .ok_or_else(|| anyhow!("idempotency key {key} vanished during claim"))?;
            match (existing.state, existing.result) {
                (EntryState::Completed, Some(result)) => Claim::Completed(Box::new(result)),
                _ => Claim::InFlight {
                    task_id: existing.task_id,
                },
            }
        };
        tx.commit().context("failed to commit idempotency claim")?;

        tracing::debug!(
            idempotency_key = key,
            task_id,
            outcome = claim_kind(&claim),
            "idempotency claim"
        );
        Ok(claim)
    }

    fn store(&self, key: &str, result: &AgentResult, ttl: Duration) -> Result<()> {
        let now = now_utc();
        let expires_at = expires_after(now, ttl)?;
        let hash = result_hash(result)?;
        let conn = self.lock()?;
        conn.execute(
            STORE_SQL,
            params![
                key,
                result.task_id,
                serde_json::to_string(result)?,
                hash,
                rfc3339(now)?,
                unix_millis(now)?,
                rfc3339(expires_at)?,
                unix_millis(expires_at)?,
            ],
        )
        .with_context(|| format!("failed to store result for idempotency key {key}"))?;
        Ok(())
    }

    fn entry(&self, key: &str) -> Result<Option<IdempotencyEntry>> {
        let conn = self.lock()?;
        select_entry(&conn, key)
    }

    fn lookup_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let now_ms = unix_millis(now_utc())?;
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM idempotency_entries
                     WHERE task_id = ?1 AND expires_at_ms > ?2
                     ORDER BY created_at_ms DESC, rowid DESC
                     LIMIT 1"
                ),
                params![task_id, now_ms],
                RawEntry::from_row,
            )
            .optional()
            .context("failed to look up task record")?;
        Ok(raw
            .map(RawEntry::into_entry)
            .transpose()?
            .map(TaskRecord::from_entry))
    }

    fn purge_expired(&self) -> Result<usize> {
        let now_ms = unix_millis(now_utc())?;
        let conn = self.lock()?;
        let purged = conn
            .execute(
                "DELETE FROM idempotency_entries WHERE expires_at_ms <= ?1",
                params![now_ms],
            )
            .context("failed to purge expired idempotency entries")?;
        Ok(purged)
    }
}

struct RawEntry {
    idempotency_key: String,
    state: String,
    task_id: String,
    result_json: Option<String>,
    result_hash: Option<String>,
    created_at: String,
    expires_at: String,
}

impl RawEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            idempotency_key: row.get(0)?,
            state: row.get(1)?,
            task_id: row.get(2)?,
            result_json: row.get(3)?,
            result_hash: row.get(4)?,
            created_at: row.get(5)?,
            expires_at: row.get(6)?,
        })
    }

    fn into_entry(self) -> Result<IdempotencyEntry> {
        Ok(IdempotencyEntry {
            idempotency_key: self.idempotency_key,
            state: parse_state(&self.state)?,
            task_id: self.task_id,
            result: self
                .result_json
                .map(|value| parse_result(&value))
                .transpose()?,
            result_hash: self.result_hash,
            created_at: parse_rfc3339(&self.created_at)?,
            expires_at: parse_rfc3339(&self.expires_at)?,
        })
    }
}

fn select_entry(conn: &Connection, key: &str) -> Result<Option<IdempotencyEntry>> {
    conn.query_row(
        &format!("SELECT {ENTRY_COLUMNS} FROM idempotency_entries WHERE idempotency_key = ?1"),
        params![key],
        RawEntry::from_row,
    )
    .optional()
    .context("failed to read idempotency entry")?
    .map(RawEntry::into_entry)
    .transpose()
}

fn claim_kind(claim: &Claim) -> &'static str {
    match claim {
        Claim::Acquired => "acquired",
        Claim::Completed(_) => "completed",
        Claim::InFlight { .. } => "in_flight",
    }
}

fn parse_state(value: &str) -> Result<EntryState> {
    match value {
        "in_flight" => Ok(EntryState::InFlight),
        "completed" => Ok(EntryState::Completed),
        other => Err(anyhow!("unknown idempotency entry state: {other}")),
    }
}

fn parse_result(value: &str) -> Result<AgentResult> {
    serde_json::from_str(value).context("invalid stored result_json")
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid datetime format: {err}"))
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 datetime: {err}"))
}
