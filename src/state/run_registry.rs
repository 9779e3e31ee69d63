//! Central run registry
//!
//! One SQLite database per run root, mapping (topic, config_fingerprint)
//! to run identity and checkpoint location so resume never has to scan the
//! filesystem. Single writer per host; the connection sits behind a mutex.

use crate::error::{ReviewError, ReviewResult};
use crate::state::checkpoint::find_summary_by_run_id;
use crate::state::RunId;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const REGISTRY_FILE: &str = "runs_registry.db";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS runs_registry (
    run_id TEXT PRIMARY KEY,
    topic TEXT NOT NULL,
    config_fingerprint TEXT NOT NULL,
    store_path TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'running',
    created_at TEXT DEFAULT (datetime('now')),
    updated_at TEXT DEFAULT (datetime('now')),
    heartbeat_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_registry_topic ON runs_registry(topic);
CREATE INDEX IF NOT EXISTS idx_registry_topic_fingerprint
    ON runs_registry(topic, config_fingerprint);
";

// Pre-dates the heartbeat column; fails harmlessly when already applied.
const MIGRATION_ADD_HEARTBEAT: &str =
    "ALTER TABLE runs_registry ADD COLUMN heartbeat_at TEXT";

/// Terminal and non-terminal run states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> ReviewResult<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "aborted" => Ok(RunStatus::Aborted),
            other => Err(ReviewError::Registry(format!(
                "unknown run status '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One row in the registry.
#[derive(Debug, Clone)]
pub struct RunRegistryEntry {
    pub run_id: RunId,
    pub topic: String,
    pub config_fingerprint: String,
    pub store_path: PathBuf,
    pub status: RunStatus,
    pub created_at: String,
    pub updated_at: String,
    pub heartbeat_at: Option<String>,
}

impl RunRegistryEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let run_id: String = row.get("run_id")?;
        let status: String = row.get("status")?;
        let store_path: String = row.get("store_path")?;
        Ok(Self {
            run_id: RunId::parse_str(&run_id).map_err(|_| {
                rusqlite::Error::InvalidColumnType(
                    0,
                    "run_id".to_string(),
                    rusqlite::types::Type::Text,
                )
            })?,
            topic: row.get("topic")?,
            config_fingerprint: row.get("config_fingerprint")?,
            store_path: PathBuf::from(store_path),
            status: RunStatus::parse(&status).map_err(|_| {
                rusqlite::Error::InvalidColumnType(
                    0,
                    "status".to_string(),
                    rusqlite::types::Type::Text,
                )
            })?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            heartbeat_at: row.get("heartbeat_at")?,
        })
    }
}

const SELECT_COLUMNS: &str = "run_id, topic, config_fingerprint, store_path, status, \
     created_at, updated_at, heartbeat_at";

/// Process-wide index of runs under one run root.
pub struct RunRegistry {
    run_root: PathBuf,
    conn: Mutex<Connection>,
}

impl RunRegistry {
    /// Open (creating if needed) the registry for a run root.
    pub fn open(run_root: &Path) -> ReviewResult<Self> {
        std::fs::create_dir_all(run_root)?;
        let conn = Connection::open(run_root.join(REGISTRY_FILE))?;
        conn.execute_batch(SCHEMA)?;
        // Migration for registries created before the heartbeat column.
        let _ = conn.execute(MIGRATION_ADD_HEARTBEAT, []);
        Ok(Self {
            run_root: run_root.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    /// Idempotent upsert keyed on run_id.
    pub fn register(
        &self,
        run_id: RunId,
        topic: &str,
        fingerprint: &str,
        store_path: &Path,
        status: RunStatus,
    ) -> ReviewResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO runs_registry \
             (run_id, topic, config_fingerprint, store_path, status, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, datetime('now'))",
            params![
                run_id.to_string(),
                topic,
                fingerprint,
                store_path.to_string_lossy(),
                status.as_str()
            ],
        )?;
        debug!(run_id = %run_id, topic = %topic, "registered run");
        Ok(())
    }

    /// Look up a run by ID. Returns `None` when unregistered or when the
    /// checkpoint directory no longer exists on disk.
    pub fn find_by_run_id(&self, run_id: RunId) -> ReviewResult<Option<RunRegistryEntry>> {
        let conn = self.conn.lock();
        let entry = conn
            .query_row(
                &format!(
                    "SELECT {} FROM runs_registry WHERE run_id = ?1",
                    SELECT_COLUMNS
                ),
                params![run_id.to_string()],
                RunRegistryEntry::from_row,
            )
            .optional()?;
        Ok(entry.filter(|e| e.store_path.is_dir()))
    }

    /// Entries matching a topic (case-insensitive), optionally filtered by
    /// fingerprint, most recent first. Entries whose store path has
    /// disappeared are excluded.
    pub fn find_by_topic(
        &self,
        topic: &str,
        fingerprint: Option<&str>,
    ) -> ReviewResult<Vec<RunRegistryEntry>> {
        let conn = self.conn.lock();
        let mut entries = Vec::new();
        match fingerprint {
            Some(fp) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM runs_registry \
                     WHERE LOWER(topic) = LOWER(?1) AND config_fingerprint = ?2 \
                     ORDER BY created_at DESC",
                    SELECT_COLUMNS
                ))?;
                let rows = stmt.query_map(params![topic, fp], RunRegistryEntry::from_row)?;
                for row in rows {
                    entries.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM runs_registry \
                     WHERE LOWER(topic) = LOWER(?1) \
                     ORDER BY created_at DESC",
                    SELECT_COLUMNS
                ))?;
                let rows = stmt.query_map(params![topic], RunRegistryEntry::from_row)?;
                for row in rows {
                    entries.push(row?);
                }
            }
        }
        entries.retain(|e| e.store_path.is_dir());
        Ok(entries)
    }

    pub fn update_status(&self, run_id: RunId, status: RunStatus) -> ReviewResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE runs_registry SET status = ?1, updated_at = datetime('now') \
             WHERE run_id = ?2",
            params![status.as_str(), run_id.to_string()],
        )?;
        Ok(())
    }

    /// Stamp `heartbeat_at` so observers can tell live runs from crashed
    /// ones. Called every ~60 s by the orchestrator's heartbeat task.
    pub fn update_heartbeat(&self, run_id: RunId) -> ReviewResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE runs_registry SET heartbeat_at = datetime('now') WHERE run_id = ?1",
            params![run_id.to_string()],
        )?;
        Ok(())
    }

    /// Registry lookup with filesystem fallback: when the row is missing
    /// but a `run_summary.json` for this run exists on disk, synthesize an
    /// entry from it.
    pub fn find_by_run_id_with_fallback(
        &self,
        run_id: RunId,
    ) -> ReviewResult<Option<RunRegistryEntry>> {
        if let Some(entry) = self.find_by_run_id(run_id)? {
            return Ok(Some(entry));
        }
        let Some(run_dir) = find_summary_by_run_id(&self.run_root, run_id)? else {
            return Ok(None);
        };
        let summary = crate::state::checkpoint::CheckpointStore::open(&self.run_root, run_id)?
            .read_summary()?;
        let Some(summary) = summary else {
            return Ok(None);
        };
        Ok(Some(RunRegistryEntry {
            run_id,
            topic: summary.topic,
            config_fingerprint: summary.fingerprint,
            store_path: run_dir,
            status: RunStatus::Running,
            created_at: String::new(),
            updated_at: String::new(),
            heartbeat_at: None,
        }))
    }
}
