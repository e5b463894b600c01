//! SQLite schema definitions for the task database.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

/// Tasks table - the single persisted entity of the agent.
///
/// Datetimes are stored as epoch seconds, options as a JSON object string,
/// status as a single bit of the status set.
const TASKS_TABLE_V1: Table = Table {
    name: "tasks",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("worker_name", &SqlType::Text, non_null = true),
        sqlite_column!("start_at", &SqlType::Integer, non_null = true),
        sqlite_column!("stop_at", &SqlType::Integer),
        sqlite_column!("status", &SqlType::Integer, non_null = true),
        sqlite_column!("output", &SqlType::Text),
        sqlite_column!("options", &SqlType::Text, non_null = true),
        sqlite_column!("redo_interval", &SqlType::Integer, non_null = true),
        sqlite_column!("expire", &SqlType::Integer, non_null = true),
    ],
    indices: &[
        ("idx_tasks_status", "status"),
        ("idx_tasks_start_at", "start_at"),
    ],
};

/// All versioned schemas for the task database.
///
/// Version 1: tasks table
pub const TASK_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 1,
    tables: &[TASKS_TABLE_V1],
    migration: None, // Initial version has no migration
}];

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_v1_schema_creates_successfully() {
        let conn = Connection::open_in_memory().unwrap();
        let schema = &TASK_VERSIONED_SCHEMAS[0];
        schema.create(&conn).unwrap();
        schema.validate(&conn).unwrap();
    }

    #[test]
    fn test_tasks_indices_created() {
        let conn = Connection::open_in_memory().unwrap();
        TASK_VERSIONED_SCHEMAS[0].create(&conn).unwrap();

        for index_name in ["idx_tasks_status", "idx_tasks_start_at"] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='index' AND name=?1",
                    [index_name],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing index {}", index_name);
        }
    }

    #[test]
    fn test_tasks_table_columns() {
        let conn = Connection::open_in_memory().unwrap();
        TASK_VERSIONED_SCHEMAS[0].create(&conn).unwrap();

        conn.execute(
            "INSERT INTO tasks (id, worker_name, start_at, status, options, redo_interval, expire)
             VALUES ('t1', 'vacuum_db', 1700000000, 1, '{}', 0, 86400)",
            [],
        )
        .unwrap();

        let (id, worker_name, status): (String, String, i64) = conn
            .query_row(
                "SELECT id, worker_name, status FROM tasks WHERE id = 't1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(id, "t1");
        assert_eq!(worker_name, "vacuum_db");
        assert_eq!(status, 1);
    }

    #[test]
    fn test_duplicate_id_rejected_by_schema() {
        let conn = Connection::open_in_memory().unwrap();
        TASK_VERSIONED_SCHEMAS[0].create(&conn).unwrap();

        let insert = "INSERT INTO tasks (id, worker_name, start_at, status, options, redo_interval, expire)
             VALUES ('t1', 'vacuum_db', 1700000000, 1, '{}', 0, 0)";
        conn.execute(insert, []).unwrap();
        assert!(conn.execute(insert, []).is_err());
    }
}
