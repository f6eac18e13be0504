//! SQLite schema for the job store.
//!
//! Every table is domain-scoped. Lock rows are the cluster-wide mutual
//! exclusion for jobs: any node opening the same database sees them.

use crate::sqlite_column;
use crate::sqlite_persistence::{SqlType, Table, VersionedSchema};

// =============================================================================
// Version 1 - Locks, definitions, executions, configuration
// =============================================================================

const JOB_LOCKS_TABLE_V1: Table = Table {
    name: "job_locks",
    columns: &[
        sqlite_column!("domain", SqlType::Text, non_null = true),
        sqlite_column!("job_name", SqlType::Text, non_null = true),
        sqlite_column!("owner", SqlType::Text, non_null = true),
        sqlite_column!("acquired_at", SqlType::Text, non_null = true),
    ],
    indices: &[("idx_job_locks_owner", "owner")],
    primary_key: &["domain", "job_name"],
};

/// Task definitions; `body` is the JSON-encoded task.
const TASKS_TABLE_V1: Table = Table {
    name: "tasks",
    columns: &[
        sqlite_column!("domain", SqlType::Text, non_null = true),
        sqlite_column!("key", SqlType::Text, non_null = true),
        sqlite_column!("task_type", SqlType::Text, non_null = true),
        sqlite_column!("body", SqlType::Text, non_null = true),
        sqlite_column!("updated_at", SqlType::Text, non_null = true),
    ],
    indices: &[("idx_tasks_domain_type", "domain, task_type")],
    primary_key: &["domain", "key"],
};

const REPORTS_TABLE_V1: Table = Table {
    name: "reports",
    columns: &[
        sqlite_column!("domain", SqlType::Text, non_null = true),
        sqlite_column!("key", SqlType::Text, non_null = true),
        sqlite_column!("body", SqlType::Text, non_null = true),
    ],
    indices: &[],
    primary_key: &["domain", "key"],
};

const EXECS_TABLE_V1: Table = Table {
    name: "execs",
    columns: &[
        sqlite_column!("key", SqlType::Text, is_primary_key = true),
        sqlite_column!("domain", SqlType::Text, non_null = true),
        sqlite_column!("kind", SqlType::Text, non_null = true),
        sqlite_column!("task", SqlType::Text, non_null = true),
        sqlite_column!("start_at", SqlType::Text, non_null = true),
        sqlite_column!("end_at", SqlType::Text),
        sqlite_column!("status", SqlType::Text, non_null = true),
        sqlite_column!("message", SqlType::Text),
        sqlite_column!("executor", SqlType::Text, non_null = true),
    ],
    indices: &[
        ("idx_execs_domain_task", "domain, task, start_at DESC"),
        ("idx_execs_domain_start", "domain, start_at DESC"),
    ],
    primary_key: &[],
};

const CONF_PARAMS_TABLE_V1: Table = Table {
    name: "conf_params",
    columns: &[
        sqlite_column!("domain", SqlType::Text, non_null = true),
        sqlite_column!("key", SqlType::Text, non_null = true),
        sqlite_column!("value", SqlType::Text, non_null = true),
    ],
    indices: &[],
    primary_key: &["domain", "key"],
};

// =============================================================================
// Version 2 - Audit, notifications, access tokens
// =============================================================================

const AUDIT_LOG_TABLE_V2: Table = Table {
    name: "audit_log",
    columns: &[
        sqlite_column!("id", SqlType::Integer, is_primary_key = true),
        sqlite_column!("domain", SqlType::Text, non_null = true),
        sqlite_column!("event", SqlType::Text, non_null = true),
        sqlite_column!("who", SqlType::Text, non_null = true),
        sqlite_column!("before_json", SqlType::Text),
        sqlite_column!("output_json", SqlType::Text),
        sqlite_column!("input_json", SqlType::Text),
        sqlite_column!("created_at", SqlType::Text, non_null = true),
    ],
    indices: &[("idx_audit_log_domain_created", "domain, created_at DESC")],
    primary_key: &[],
};

const NOTIFICATIONS_TABLE_V2: Table = Table {
    name: "notifications",
    columns: &[
        sqlite_column!("domain", SqlType::Text, non_null = true),
        sqlite_column!("key", SqlType::Text, non_null = true),
        sqlite_column!("body", SqlType::Text, non_null = true),
    ],
    indices: &[],
    primary_key: &["domain", "key"],
};

const NOTIFICATION_TASKS_TABLE_V2: Table = Table {
    name: "notification_tasks",
    columns: &[
        sqlite_column!("id", SqlType::Integer, is_primary_key = true),
        sqlite_column!("domain", SqlType::Text, non_null = true),
        sqlite_column!("notification_key", SqlType::Text, non_null = true),
        sqlite_column!("event", SqlType::Text, non_null = true),
        sqlite_column!("recipients", SqlType::Text, non_null = true),
        sqlite_column!("subject", SqlType::Text, non_null = true),
        sqlite_column!("payload", SqlType::Text),
        sqlite_column!(
            "executed",
            SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("error", SqlType::Text),
        sqlite_column!("created_at", SqlType::Text, non_null = true),
    ],
    indices: &[("idx_notification_tasks_pending", "domain, executed")],
    primary_key: &[],
};

const ACCESS_TOKENS_TABLE_V2: Table = Table {
    name: "access_tokens",
    columns: &[
        sqlite_column!("domain", SqlType::Text, non_null = true),
        sqlite_column!("key", SqlType::Text, non_null = true),
        sqlite_column!("owner", SqlType::Text, non_null = true),
        sqlite_column!("expires_at", SqlType::Text, non_null = true),
    ],
    indices: &[("idx_access_tokens_expiry", "domain, expires_at")],
    primary_key: &["domain", "key"],
};

fn migrate_v1_to_v2(conn: &rusqlite::Connection) -> anyhow::Result<()> {
    AUDIT_LOG_TABLE_V2.create(conn)?;
    NOTIFICATIONS_TABLE_V2.create(conn)?;
    NOTIFICATION_TASKS_TABLE_V2.create(conn)?;
    ACCESS_TOKENS_TABLE_V2.create(conn)?;
    Ok(())
}

// =============================================================================
// Versioned Schema Definition
// =============================================================================

/// Version 1: locks, tasks, reports, execs, conf params
/// Version 2: audit log, notifications, notification tasks, access tokens
pub const JOB_STORE_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 1,
        tables: &[
            JOB_LOCKS_TABLE_V1,
            TASKS_TABLE_V1,
            REPORTS_TABLE_V1,
            EXECS_TABLE_V1,
            CONF_PARAMS_TABLE_V1,
        ],
        migration: None,
    },
    VersionedSchema {
        version: 2,
        tables: &[
            JOB_LOCKS_TABLE_V1,
            TASKS_TABLE_V1,
            REPORTS_TABLE_V1,
            EXECS_TABLE_V1,
            CONF_PARAMS_TABLE_V1,
            AUDIT_LOG_TABLE_V2,
            NOTIFICATIONS_TABLE_V2,
            NOTIFICATION_TASKS_TABLE_V2,
            ACCESS_TOKENS_TABLE_V2,
        ],
        migration: Some(migrate_v1_to_v2),
    },
];
