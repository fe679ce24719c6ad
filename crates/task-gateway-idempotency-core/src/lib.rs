#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use task_gateway_domain::{hash_json, now_utc, AgentResult, DateTimeUtc};

pub const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(3_600);
pub const DEFAULT_IN_FLIGHT_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    InFlight,
    Completed,
}

impl EntryState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InFlight => "in_flight",
            Self::Completed => "completed",
        }
    }
}

/// One row of the idempotency store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdempotencyEntry {
    pub idempotency_key: String,
    pub state: EntryState,
    pub task_id: String,
    pub result: Option<AgentResult>,
    pub result_hash: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: DateTimeUtc,
}

impl IdempotencyEntry {
    #[must_use]
    pub fn is_live_at(&self, now: DateTimeUtc) -> bool {
        self.expires_at > now
    }
}

/// Outcome of trying to reserve a key for a new pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// The caller owns the key and must eventually `store` a result.
    Acquired,
    /// A live result already exists for the key.
    Completed(Box<AgentResult>),
    /// Another request holds the key and has not finished.
    InFlight { task_id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskRecord {
    InFlight {
        task_id: String,
        idempotency_key: String,
    },
    Completed(Box<AgentResult>),
}

pub trait IdempotencyStore: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> Result<()>;

    /// Live completed result for `key`, if any.
    #[allow(clippy::missing_errors_doc)]
    fn lookup(&self, key: &str) -> Result<Option<AgentResult>>;

    /// Atomically reserve `key` unless a live entry already holds it.
    #[allow(clippy::missing_errors_doc)]
    fn begin(&self, key: &str, task_id: &str, ttl: Duration) -> Result<Claim>;

    /// Persist the terminal result for `key`. A live completed entry is never
    /// overwritten.
    #[allow(clippy::missing_errors_doc)]
    fn store(&self, key: &str, result: &AgentResult, ttl: Duration) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn entry(&self, key: &str) -> Result<Option<IdempotencyEntry>>;

    /// Most recent live entry recorded for `task_id`.
    #[allow(clippy::missing_errors_doc)]
    fn lookup_task(&self, task_id: &str) -> Result<Option<TaskRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn purge_expired(&self) -> Result<usize>;
}

/// Expiry instant for an entry written at `now`.
///
/// # Errors
/// Returns an error when `ttl` does not fit the timestamp range.
pub fn expires_after(now: DateTimeUtc, ttl: Duration) -> Result<DateTimeUtc> {
    let ttl = time::Duration::try_from(ttl).map_err(|err| anyhow!("invalid ttl: {err}"))?;
    now.checked_add(ttl)
        .ok_or_else(|| anyhow!("ttl overflows the timestamp range"))
}

/// Milliseconds since the Unix epoch, the unit persisted stores compare on.
///
/// # Errors
/// Returns an error for instants outside the `i64` millisecond range.
pub fn unix_millis(value: DateTimeUtc) -> Result<i64> {
    i64::try_from(value.unix_timestamp_nanos() / 1_000_000)
        .map_err(|_| anyhow!("timestamp out of range: {value}"))
}

/// SHA-256 of the canonical JSON of a stored result.
///
/// # Errors
/// Returns an error if the result cannot be serialized.
pub fn result_hash(result: &AgentResult) -> Result<String> {
    hash_json(&serde_json::to_value(result)?)
}

impl TaskRecord {
    #[must_use]
    pub fn from_entry(entry: IdempotencyEntry) -> Self {
        match (entry.state, entry.result) {
            (EntryState::Completed, Some(result)) => Self::Completed(Box::new(result)),
            _ => Self::InFlight {
                task_id: entry.task_id,
                idempotency_key: entry.idempotency_key,
            },
        }
    }
}

/// Process-local store for tests and single-process embedding.
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    entries: Mutex<BTreeMap<String, IdempotencyEntry>>,
}

impl InMemoryIdempotencyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(
        &self,
        op: impl FnOnce(&mut BTreeMap<String, IdempotencyEntry>) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|_| anyhow!("idempotency store lock poisoned"))?;
        op(&mut guard)
    }
}

impl IdempotencyStore for InMemoryIdempotencyStore {
    fn migrate(&self) -> Result<()> {
        Ok(())
    }

    fn lookup(&self, key: &str) -> Result<Option<AgentResult>> {
        let now = now_utc();
        self.with_entries(|entries| {
            Ok(entries
                .get(key)
                .filter(|entry| entry.is_live_at(now) && entry.state == EntryState::Completed)
                .and_then(|entry| entry.result.clone()))
        })
    }

    fn begin(&self, key: &str, task_id: &str, ttl: Duration) -> Result<Claim> {
        let now = now_utc();
        let expires_at = expires_after(now, ttl)?;
        self.with_entries(|entries| {
            if let Some(existing) = entries.get(key).filter(|entry| entry.is_live_at(now)) {
                return Ok(match (&existing.state, &existing.result) {
                    (EntryState::Completed, Some(result)) => {
                        Claim::Completed(Box::new(result.clone()))
                    }
                    _ => Claim::InFlight {
                        task_id: existing.task_id.clone(),
                    },
                });
            }
            entries.insert(
                key.to_string(),
                IdempotencyEntry {
                    idempotency_key: key.to_string(),
                    state: EntryState::InFlight,
                    task_id: task_id.to_string(),
                    result: None,
                    result_hash: None,
                    created_at: now,
                    expires_at,
                },
            );
            Ok(Claim::Acquired)
        })
    }

    fn store(&self, key: &str, result: &AgentResult, ttl: Duration) -> Result<()> {
        let now = now_utc();
        let expires_at = expires_after(now, ttl)?;
        let hash = result_hash(result)?;
        self.with_entries(|entries| {
            if entries.get(key).is_some_and(|entry| {
                entry.state == EntryState::Completed && entry.is_live_at(now)
            }) {
                return Err(anyhow!(
                    "idempotency key {key} already holds a completed result"
                ));
            }
            entries.insert(
                key.to_string(),
                IdempotencyEntry {
                    idempotency_key: key.to_string(),
                    state: EntryState::Completed,
                    task_id: result.task_id.clone(),
                    result: Some(result.clone()),
                    result_hash: Some(hash),
                    created_at: now,
                    expires_at,
                },
            );
            Ok(())
        })
    }

    fn entry(&self, key: &str) -> Result<Option<IdempotencyEntry>> {
        self.with_entries(|entries| Ok(entries.get(key).cloned()))
    }

    fn lookup_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let now = now_utc();
        self.with_entries(|entries| {
            Ok(entries
                .values()
                .filter(|entry| entry.task_id == task_id && entry.is_live_at(now))
                .max_by_key(|entry| entry.created_at)
                .cloned()
                .map(TaskRecord::from_entry))
        })
    }

    fn purge_expired(&self) -> Result<usize> {
        let now = now_utc();
        self.with_entries(|entries| {
            let before = entries.len();
            entries.retain(|_, entry| entry.is_live_at(now));
            Ok(before - entries.len())
        })
    }
}
