use super::models::{StatusMask, Task, TaskStatus};
use super::schema::TASK_VERSIONED_SCHEMAS;
use super::{StoreError, TaskStore};
use crate::sqlite_persistence::BASE_DB_VERSION;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

const TASK_COLUMNS: &str =
    "id, worker_name, start_at, stop_at, status, output, options, redo_interval, expire";

/// SQLite-backed task store. Single writer behind a mutex; every statement
/// takes the lock for its duration.
pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
}

/// Task row before the options column has been parsed.
struct RawTask {
    id: String,
    worker_name: String,
    start_at: i64,
    stop_at: Option<i64>,
    status: TaskStatus,
    output: Option<String>,
    options: String,
    redo_interval: i64,
    expire: i64,
}

impl SqliteTaskStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        let is_new_db = !path.exists();

        let mut conn = Connection::open(path).context("Failed to open task database")?;

        if is_new_db {
            // Fresh database - create with latest schema
            info!("Creating new task database at {:?}", path);
            TASK_VERSIONED_SCHEMAS.last().unwrap().create(&conn)?;
        } else {
            // Existing database - check version and migrate if needed
            let raw_version: i64 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
            let db_version = raw_version - BASE_DB_VERSION as i64;

            if db_version < 1 {
                anyhow::bail!(
                    "Task database version {} is invalid (expected >= 1)",
                    db_version
                );
            }

            let current_schema_version = TASK_VERSIONED_SCHEMAS.last().unwrap().version as i64;

            let version_index = TASK_VERSIONED_SCHEMAS
                .iter()
                .position(|s| s.version == db_version as usize)
                .with_context(|| format!("Unknown task database version {}", db_version))?;
            TASK_VERSIONED_SCHEMAS[version_index]
                .validate(&conn)
                .with_context(|| {
                    format!(
                        "Task database schema validation failed for version {}",
                        db_version
                    )
                })?;

            if db_version < current_schema_version {
                info!(
                    "Migrating task database from version {} to {}",
                    db_version, current_schema_version
                );
                Self::migrate_if_needed(&mut conn, db_version as usize)?;
            }
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn migrate_if_needed(conn: &mut Connection, from_version: usize) -> Result<()> {
        let tx = conn.transaction()?;
        let mut latest_from = from_version;
        for schema in TASK_VERSIONED_SCHEMAS.iter().skip(from_version) {
            if schema.version > from_version {
                info!(
                    "Running task database migration from version {} to {}",
                    latest_from, schema.version
                );
                if let Some(migration_fn) = schema.migration {
                    migration_fn(&tx).with_context(|| {
                        format!("Failed to run migration to version {}", schema.version)
                    })?;
                }
                latest_from = schema.version;
            }
        }
        tx.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + latest_from),
            [],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn row_to_raw(row: &rusqlite::Row) -> rusqlite::Result<RawTask> {
        let status_bits: i64 = row.get("status")?;
        let status = TaskStatus::from_bit(status_bits as u16).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Integer,
                Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("invalid status bits {}", status_bits),
                )),
            )
        })?;

        Ok(RawTask {
            id: row.get("id")?,
            worker_name: row.get("worker_name")?,
            start_at: row.get("start_at")?,
            stop_at: row.get("stop_at")?,
            status,
            output: row.get("output")?,
            options: row.get("options")?,
            redo_interval: row.get("redo_interval")?,
            expire: row.get("expire")?,
        })
    }

    fn raw_into_task(raw: RawTask) -> Result<Task, StoreError> {
        let options =
            serde_json::from_str(&raw.options).map_err(|e| StoreError::CorruptOptions {
                id: raw.id.clone(),
                source: e,
            })?;

        Ok(Task {
            start_at: DateTime::from_timestamp(raw.start_at, 0).unwrap_or_else(Utc::now),
            stop_at: raw.stop_at.and_then(|s| DateTime::from_timestamp(s, 0)),
            id: raw.id,
            worker_name: raw.worker_name,
            status: raw.status,
            output: raw.output,
            options,
            redo_interval: raw.redo_interval,
            expire: raw.expire,
        })
    }

    fn options_to_string(task: &Task) -> Result<String, StoreError> {
        serde_json::to_string(&task.options).map_err(|e| StoreError::CorruptOptions {
            id: task.id.clone(),
            source: e,
        })
    }

    fn storage(op: &'static str, id: Option<&str>) -> impl FnOnce(rusqlite::Error) -> StoreError {
        let id = id.map(|s| s.to_string());
        move |source| StoreError::Storage { op, id, source }
    }

    /// Run a SELECT over task rows, skipping rows that cannot be read or
    /// whose options are corrupt.
    fn collect_tasks(
        stmt: &mut rusqlite::Statement,
        params: &[&dyn rusqlite::ToSql],
        op: &'static str,
    ) -> Result<Vec<Task>, StoreError> {
        let rows = stmt
            .query_map(params, Self::row_to_raw)
            .map_err(Self::storage(op, None))?;

        let mut tasks = Vec::new();
        for row in rows {
            let raw = match row {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("Skipping unreadable task row during {}: {}", op, e);
                    continue;
                }
            };
            match Self::raw_into_task(raw) {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    warn!("Skipping task with corrupt options during {}: {}", op, e);
                }
            }
        }
        Ok(tasks)
    }
}

impl TaskStore for SqliteTaskStore {
    fn insert(&self, task: &Task) -> Result<(), StoreError> {
        let options = Self::options_to_string(task)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tasks (id, worker_name, start_at, stop_at, status, output, options, redo_interval, expire)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                task.id,
                task.worker_name,
                task.start_at.timestamp(),
                task.stop_at.map(|dt| dt.timestamp()),
                task.status.bit(),
                task.output,
                options,
                task.redo_interval,
                task.expire,
            ],
        )
        .map_err(|e| match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::DuplicateId(task.id.clone())
            }
            _ => StoreError::Storage {
                op: "insert",
                id: Some(task.id.clone()),
                source: e,
            },
        })?;
        Ok(())
    }

    fn update(&self, task: &Task) -> Result<(), StoreError> {
        let options = Self::options_to_string(task)?;
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE tasks SET worker_name = ?1, start_at = ?2, stop_at = ?3, status = ?4,
                 output = ?5, options = ?6, redo_interval = ?7, expire = ?8 WHERE id = ?9",
                params![
                    task.worker_name,
                    task.start_at.timestamp(),
                    task.stop_at.map(|dt| dt.timestamp()),
                    task.status.bit(),
                    task.output,
                    options,
                    task.redo_interval,
                    task.expire,
                    task.id,
                ],
            )
            .map_err(Self::storage("update", Some(&task.id)))?;
        if changed == 0 {
            return Err(StoreError::NotFound(task.id.clone()));
        }
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])
            .map_err(Self::storage("delete", Some(id)))?;
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Task, StoreError> {
        let conn = self.conn.lock().unwrap();
        let raw = conn
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                params![id],
                Self::row_to_raw,
            )
            .optional()
            .map_err(Self::storage("get", Some(id)))?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Self::raw_into_task(raw)
    }

    fn list(&self) -> Result<Vec<Task>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM tasks ORDER BY start_at ASC, id ASC",
                TASK_COLUMNS
            ))
            .map_err(Self::storage("list", None))?;
        Self::collect_tasks(&mut stmt, &[], "list")
    }

    fn exists(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT 1 FROM tasks WHERE id = ?1", params![id], |_| {
            Ok(true)
        })
        .optional()
        .map(|found| found.unwrap_or(false))
        .map_err(Self::storage("exists", Some(id)))
    }

    fn count_by_status(&self, mask: StatusMask) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE (status & ?1) != 0",
            params![mask.as_u16()],
            |row| row.get::<_, i64>(0),
        )
        .map(|count| count as u64)
        .map_err(Self::storage("count_by_status", None))
    }

    fn recover(
        &self,
        in_flight: StatusMask,
        aborting: StatusMask,
        reset: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap();
        // An abort that was in progress when the process died is settled as
        // Aborted, never re-run
        let settled = conn
            .execute(
                "UPDATE tasks SET status = ?1, stop_at = ?2 WHERE (status & ?3) != 0",
                params![TaskStatus::Aborted.bit(), now.timestamp(), aborting.as_u16()],
            )
            .map_err(Self::storage("recover", None))?;
        let reset_count = conn
            .execute(
                "UPDATE tasks SET status = ?1, stop_at = ?2 WHERE (status & ?3) != 0",
                params![reset.bit(), now.timestamp(), in_flight.as_u16()],
            )
            .map_err(Self::storage("recover", None))?;
        Ok((settled + reset_count) as u64)
    }

    fn list_to_do(
        &self,
        mask: StatusMask,
        now: DateTime<Utc>,
        redo: bool,
    ) -> Result<Vec<Task>, StoreError> {
        let redo_clause = if redo {
            "redo_interval > 0"
        } else {
            "redo_interval = 0"
        };
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM tasks
                 WHERE (status & ?1) != 0 AND start_at <= ?2 AND {}
                 ORDER BY start_at ASC, id ASC",
                TASK_COLUMNS, redo_clause
            ))
            .map_err(Self::storage("list_to_do", None))?;
        Self::collect_tasks(
            &mut stmt,
            &[&mask.as_u16(), &now.timestamp()],
            "list_to_do",
        )
    }

    fn purge(&self, mask: StatusMask, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn
            .execute(
                "DELETE FROM tasks
                 WHERE (status & ?1) != 0 AND redo_interval = 0
                   AND stop_at IS NOT NULL AND stop_at + expire <= ?2",
                params![mask.as_u16(), now.timestamp()],
            )
            .map_err(Self::storage("purge", None))?;
        Ok(deleted as u64)
    }

    fn flush(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn
            .execute("DELETE FROM tasks", [])
            .map_err(Self::storage("flush", None))?;
        Ok(deleted as u64)
    }

    fn vacuum(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("VACUUM")
            .map_err(Self::storage("vacuum", None))
    }
}
