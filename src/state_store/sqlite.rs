//! SQLite-backed state store implementation.
//!
//! This module provides [`SqliteStateStore`], a persistent implementation
//! of [`StateStore`] backed by SQLite.

use crate::directory::{AssignmentKey, RoleAssignment};
use crate::initiative::{Initiative, InitiativeId};
use crate::monitoring::{EntryId, MonitoringEntry};
use crate::role::{Identity, RoleCode};
use crate::stage::StageState;
use crate::timeline::{MilestoneId, TimelineEntry};
use crate::{Result, TollgateError};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::{StateStore, TransitionCommit};

/// Schema version for migrations.
const SCHEMA_VERSION: i32 = 1;

/// SQL for creating the initiatives table.
const CREATE_INITIATIVES_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS initiatives (
        id TEXT NOT NULL PRIMARY KEY,
        site TEXT NOT NULL,
        version INTEGER NOT NULL,
        data_json TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
"#;

/// SQL for creating the stage_states table.
const CREATE_STAGE_STATES_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS stage_states (
        initiative_id TEXT NOT NULL REFERENCES initiatives (id) ON DELETE CASCADE,
        stage_number INTEGER NOT NULL,
        state_json TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (initiative_id, stage_number)
    )
"#;

/// SQL for creating the role_assignments table.
///
/// `scope` is empty for the site roster and holds the initiative id for
/// initiative-scoped entries.
const CREATE_ROLE_ASSIGNMENTS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS role_assignments (
        site TEXT NOT NULL,
        stage_number INTEGER NOT NULL,
        scope TEXT NOT NULL DEFAULT '',
        role_code TEXT NOT NULL,
        identity TEXT NOT NULL,
        assigned_at TEXT NOT NULL,
        PRIMARY KEY (site, stage_number, scope)
    )
"#;

/// SQL for creating the monitoring_entries table.
const CREATE_MONITORING_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS monitoring_entries (
        id TEXT NOT NULL PRIMARY KEY,
        initiative_id TEXT NOT NULL REFERENCES initiatives (id) ON DELETE CASCADE,
        month TEXT NOT NULL,
        kpi TEXT NOT NULL,
        data_json TEXT NOT NULL,
        UNIQUE (initiative_id, month, kpi)
    )
"#;

/// SQL for creating the timeline_entries table.
const CREATE_TIMELINE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS timeline_entries (
        id TEXT NOT NULL PRIMARY KEY,
        initiative_id TEXT NOT NULL REFERENCES initiatives (id) ON DELETE CASCADE,
        planned_date TEXT NOT NULL,
        created_at TEXT NOT NULL,
        data_json TEXT NOT NULL
    )
"#;

/// SQL for creating the schema_version table.
const CREATE_SCHEMA_VERSION_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER NOT NULL
    )
"#;

/// Index for listing initiatives by site.
const CREATE_SITE_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_initiatives_site
    ON initiatives (site)
"#;

const TABLES: [&str; 6] = [
    "initiatives",
    "stage_states",
    "role_assignments",
    "monitoring_entries",
    "timeline_entries",
    "schema_version",
];

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn scope_of(key: &AssignmentKey) -> String {
    key.initiative.map(|id| id.to_string()).unwrap_or_default()
}

fn initiative_exists(tx: &Transaction<'_>, id: &str) -> Result<bool> {
    let found = tx
        .query_row(
            "SELECT 1 FROM initiatives WHERE id = ?1",
            params![id],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

fn entry_clash(tx: &Transaction<'_>, entry: &MonitoringEntry) -> Result<()> {
    let clash = tx
        .query_row(
            "SELECT id FROM monitoring_entries WHERE initiative_id = ?1 AND month = ?2 AND kpi = ?3 AND id != ?4",
            params![
                entry.initiative_id.to_string(),
                entry.month.to_string(),
                entry.kpi_description,
                entry.id.to_string()
            ],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    if clash.is_some() {
        return Err(TollgateError::DuplicateEntry {
            initiative_id: entry.initiative_id.to_string(),
            month: entry.month.to_string(),
            kpi: entry.kpi_description.clone(),
        });
    }
    Ok(())
}

fn assignment_from_row(
    site: String,
    stage_number: i64,
    scope: String,
    role_code: String,
    identity: String,
    assigned_at: String,
) -> Result<RoleAssignment> {
    let initiative = if scope.is_empty() {
        None
    } else {
        Some(scope.parse::<InitiativeId>().map_err(|e| {
            TollgateError::StateStore(format!("invalid assignment scope '{}': {}", scope, e))
        })?)
    };
    let role = role_code.parse::<RoleCode>().map_err(TollgateError::StateStore)?;
    let assigned_at = DateTime::parse_from_rfc3339(&assigned_at)
        .map_err(|e| TollgateError::StateStore(format!("invalid timestamp: {}", e)))?
        .with_timezone(&Utc);
    Ok(RoleAssignment {
        key: AssignmentKey {
            site,
            stage_number: stage_number as u32,
            initiative,
        },
        role,
        identity: Identity::new(identity),
        assigned_at,
    })
}

/// A SQLite-backed implementation of [`StateStore`].
///
/// This store persists all workflow state to a SQLite database, making
/// it suitable for production use where state must survive process restarts.
/// Monitoring and timeline rows reference their initiative with
/// `ON DELETE CASCADE`; each transition commit runs in one transaction.
///
/// # Thread Safety
///
/// The store wraps the SQLite connection in a `Mutex` and uses
/// `spawn_blocking` for all database operations, making it safe
/// for use in async contexts. Clones share the connection.
///
/// # Example
///
/// ```rust,ignore
/// use tollgate::SqliteStateStore;
///
/// // Open or create a database file
/// let store = SqliteStateStore::open("tollgate.db").await?;
///
/// // Or use an in-memory database for testing
/// let store = SqliteStateStore::open_in_memory().await?;
/// ```
#[derive(Clone)]
pub struct SqliteStateStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStateStore {
    /// Opens a SQLite database at the given path.
    ///
    /// Creates the database and schema if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the
    /// schema cannot be created.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let conn = tokio::task::spawn_blocking(move || Connection::open(&path))
            .await
            .map_err(|e| TollgateError::StateStore(format!("spawn_blocking failed: {}", e)))?
            .map_err(|e| TollgateError::StateStore(format!("failed to open database: {}", e)))?;

        Self::init(conn).await
    }

    /// Opens an in-memory SQLite database.
    ///
    /// Useful for testing. The database is lost when the store is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = tokio::task::spawn_blocking(Connection::open_in_memory)
            .await
            .map_err(|e| TollgateError::StateStore(format!("spawn_blocking failed: {}", e)))?
            .map_err(|e| {
                TollgateError::StateStore(format!("failed to open in-memory database: {}", e))
            })?;

        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            f(&mut conn)
        })
        .await
        .map_err(|e| TollgateError::StateStore(format!("spawn_blocking failed: {}", e)))?
    }

    /// Runs schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;

            // Create schema version table
            conn.execute(CREATE_SCHEMA_VERSION_TABLE, [])?;

            // Check current version
            let version: Option<i32> = conn
                .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                    row.get(0)
                })
                .optional()?;

            if version.map_or(true, |v| v < SCHEMA_VERSION) {
                let tx = conn.transaction()?;
                tx.execute(CREATE_INITIATIVES_TABLE, [])?;
                tx.execute(CREATE_STAGE_STATES_TABLE, [])?;
                tx.execute(CREATE_ROLE_ASSIGNMENTS_TABLE, [])?;
                tx.execute(CREATE_MONITORING_TABLE, [])?;
                tx.execute(CREATE_TIMELINE_TABLE, [])?;
                tx.execute(CREATE_SITE_INDEX, [])?;

                // Update version
                tx.execute("DELETE FROM schema_version", [])?;
                tx.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    params![SCHEMA_VERSION],
                )?;
                tx.commit()?;
            }

            Ok(())
        })
        .await
    }

    /// Checks if the required tables exist.
    ///
    /// Useful for testing that the schema was created correctly.
    pub async fn tables_exist(&self) -> Result<bool> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            )?;
            for table in TABLES {
                if stmt.query_row(params![table], |_| Ok(())).optional()?.is_none() {
                    return Ok(false);
                }
            }
            Ok(true)
        })
        .await
    }
}

// Debug implementation that doesn't expose connection details
impl std::fmt::Debug for SqliteStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStateStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn commit_transition(&mut self, commit: TransitionCommit) -> Result<Initiative> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let id = commit.initiative.id.to_string();

            let stored: Option<i64> = tx
                .query_row(
                    "SELECT version FROM initiatives WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            commit.check_version(stored.map(|v| v as u64))?;

            let mut initiative = commit.initiative.clone();
            initiative.version = commit.next_version();
            let data_json = serde_json::to_string(&initiative)?;

            tx.execute(
                "INSERT INTO initiatives (id, site, version, data_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (id) DO UPDATE SET
                    site = excluded.site,
                    version = excluded.version,
                    data_json = excluded.data_json,
                    updated_at = excluded.updated_at",
                params![
                    id,
                    initiative.site,
                    initiative.version as i64,
                    data_json,
                    timestamp(&initiative.created_at),
                    timestamp(&initiative.updated_at),
                ],
            )?;

            let now = timestamp(&Utc::now());
            for (number, state) in &commit.stage_states {
                tx.execute(
                    "INSERT OR REPLACE INTO stage_states (initiative_id, stage_number, state_json, updated_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![id, *number as i64, serde_json::to_string(state)?, now],
                )?;
            }

            for assignment in &commit.assignments {
                tx.execute(
                    "INSERT OR REPLACE INTO role_assignments (site, stage_number, scope, role_code, identity, assigned_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        assignment.key.site,
                        assignment.key.stage_number as i64,
                        scope_of(&assignment.key),
                        assignment.role.code(),
                        assignment.identity.as_str(),
                        timestamp(&assignment.assigned_at),
                    ],
                )?;
            }

            tx.commit()?;
            debug!(initiative_id = %id, version = initiative.version, "transition committed");
            Ok(initiative)
        })
        .await
    }

    async fn get_initiative(&self, id: &InitiativeId) -> Result<Option<Initiative>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT data_json FROM initiatives WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            match json {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn list_initiatives(&self) -> Result<Vec<Initiative>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT data_json FROM initiatives ORDER BY created_at, id")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

            let mut result = Vec::new();
            for row in rows {
                result.push(serde_json::from_str(&row?)?);
            }
            Ok(result)
        })
        .await
    }

    async fn delete_initiative(&mut self, id: &InitiativeId) -> Result<()> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM role_assignments WHERE scope = ?1", params![id])?;
            // stage, monitoring and timeline rows follow via ON DELETE CASCADE
            tx.execute("DELETE FROM initiatives WHERE id = ?1", params![id])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_stage_states(&self, id: &InitiativeId) -> Result<BTreeMap<u32, StageState>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT stage_number, state_json FROM stage_states WHERE initiative_id = ?1",
            )?;
            let rows = stmt.query_map(params![id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;

            let mut result = BTreeMap::new();
            for row in rows {
                let (number, json) = row?;
                result.insert(number as u32, serde_json::from_str(&json)?);
            }
            Ok(result)
        })
        .await
    }

    async fn get_assignment(&self, key: &AssignmentKey) -> Result<Option<RoleAssignment>> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT role_code, identity, assigned_at FROM role_assignments
                     WHERE site = ?1 AND stage_number = ?2 AND scope = ?3",
                    params![key.site, key.stage_number as i64, scope_of(&key)],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()?;
            match row {
                Some((role, identity, assigned_at)) => {
                    let scope = scope_of(&key);
                    Ok(Some(assignment_from_row(
                        key.site,
                        key.stage_number as i64,
                        scope,
                        role,
                        identity,
                        assigned_at,
                    )?))
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn save_assignment(&mut self, assignment: &RoleAssignment) -> Result<()> {
        let assignment = assignment.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO role_assignments (site, stage_number, scope, role_code, identity, assigned_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    assignment.key.site,
                    assignment.key.stage_number as i64,
                    scope_of(&assignment.key),
                    assignment.role.code(),
                    assignment.identity.as_str(),
                    timestamp(&assignment.assigned_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_assignments(&self, site: &str) -> Result<Vec<RoleAssignment>> {
        let site = site.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT site, stage_number, scope, role_code, identity, assigned_at
                 FROM role_assignments WHERE site = ?1
                 ORDER BY scope != '', stage_number, scope",
            )?;
            let rows = stmt.query_map(params![site], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?;

            let mut result = Vec::new();
            for row in rows {
                let (site, stage, scope, role, identity, assigned_at) = row?;
                result.push(assignment_from_row(site, stage, scope, role, identity, assigned_at)?);
            }
            Ok(result)
        })
        .await
    }

    async fn insert_monitoring_entry(&mut self, entry: &MonitoringEntry) -> Result<()> {
        let entry = entry.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            if !initiative_exists(&tx, &entry.initiative_id.to_string())? {
                return Err(TollgateError::InitiativeNotFound(entry.initiative_id.to_string()));
            }
            entry_clash(&tx, &entry)?;
            tx.execute(
                "INSERT INTO monitoring_entries (id, initiative_id, month, kpi, data_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    entry.id.to_string(),
                    entry.initiative_id.to_string(),
                    entry.month.to_string(),
                    entry.kpi_description,
                    serde_json::to_string(&entry)?,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_monitoring_entry(&self, id: &EntryId) -> Result<Option<MonitoringEntry>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT data_json FROM monitoring_entries WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            match json {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn save_monitoring_entry(&mut self, entry: &MonitoringEntry) -> Result<()> {
        let entry = entry.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            entry_clash(&tx, &entry)?;
            let updated = tx.execute(
                "UPDATE monitoring_entries SET month = ?2, kpi = ?3, data_json = ?4 WHERE id = ?1",
                params![
                    entry.id.to_string(),
                    entry.month.to_string(),
                    entry.kpi_description,
                    serde_json::to_string(&entry)?,
                ],
            )?;
            if updated == 0 {
                return Err(TollgateError::MonitoringEntryNotFound(entry.id.to_string()));
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn delete_monitoring_entry(&mut self, id: &EntryId) -> Result<()> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM monitoring_entries WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
    }

    async fn list_monitoring_entries(
        &self,
        initiative_id: &InitiativeId,
    ) -> Result<Vec<MonitoringEntry>> {
        let initiative_id = initiative_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT data_json FROM monitoring_entries WHERE initiative_id = ?1 ORDER BY month, kpi",
            )?;
            let rows = stmt.query_map(params![initiative_id], |row| row.get::<_, String>(0))?;

            let mut result = Vec::new();
            for row in rows {
                result.push(serde_json::from_str(&row?)?);
            }
            Ok(result)
        })
        .await
    }

    async fn insert_milestone(&mut self, entry: &TimelineEntry) -> Result<()> {
        let entry = entry.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            if !initiative_exists(&tx, &entry.initiative_id.to_string())? {
                return Err(TollgateError::InitiativeNotFound(entry.initiative_id.to_string()));
            }
            tx.execute(
                "INSERT INTO timeline_entries (id, initiative_id, planned_date, created_at, data_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    entry.id.to_string(),
                    entry.initiative_id.to_string(),
                    entry.planned_date.to_string(),
                    timestamp(&entry.created_at),
                    serde_json::to_string(&entry)?,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_milestone(&self, id: &MilestoneId) -> Result<Option<TimelineEntry>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT data_json FROM timeline_entries WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            match json {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn save_milestone(&mut self, entry: &TimelineEntry) -> Result<()> {
        let entry = entry.clone();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE timeline_entries SET planned_date = ?2, data_json = ?3 WHERE id = ?1",
                params![
                    entry.id.to_string(),
                    entry.planned_date.to_string(),
                    serde_json::to_string(&entry)?,
                ],
            )?;
            if updated == 0 {
                return Err(TollgateError::MilestoneNotFound(entry.id.to_string()));
            }
            Ok(())
        })
        .await
    }

    async fn delete_milestone(&mut self, id: &MilestoneId) -> Result<()> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM timeline_entries WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
    }

    async fn list_milestones(&self, initiative_id: &InitiativeId) -> Result<Vec<TimelineEntry>> {
        let initiative_id = initiative_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT data_json FROM timeline_entries WHERE initiative_id = ?1
                 ORDER BY planned_date, created_at",
            )?;
            let rows = stmt.query_map(params![initiative_id], |row| row.get::<_, String>(0))?;

            let mut result = Vec::new();
            for row in rows {
                result.push(serde_json::from_str(&row?)?);
            }
            Ok(result)
        })
        .await
    }
}
