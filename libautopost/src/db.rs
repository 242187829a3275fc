//! Durable state for AutoPost
//!
//! SQLite holds three things: the scheduler payload (a singleton row), the
//! lifecycle of every content folder ever discovered, and one history record
//! per posting cycle. A record is authoritative once the call that wrote it
//! returns `Ok`.

use sqlx::sqlite::{SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::{DbError, Result};
use crate::scheduler::slots::TimeSlot;
use crate::types::{
    ContentFolder, ErrorClass, FolderState, HistoryEntry, HistoryStats, Outcome, PostRecord,
    PostType, SchedulerState,
};

const FOLDER_COLUMNS: &str =
    "id, name, path, remote_id, post_type, state, discovered_at, completed_at";

const RECORD_COLUMNS: &str = "r.id, r.folder_id, r.attempt, r.recorded_at, r.outcome, \
     r.platform_post_id, r.error_class, r.error_message, r.publish_calls";

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database file and run migrations
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }

        // mode=rwc creates the file when it does not exist yet
        let db_url = format!(
            "sqlite://{}?mode=rwc",
            db_path.display().to_string().replace('\\', "/")
        );

        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(DbError::SqlxError)?;

        Self::migrate(pool).await
    }

    /// Private in-memory database, mostly for tests
    pub async fn in_memory() -> Result<Self> {
        // A single connection, otherwise every pooled connection sees its own empty database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(DbError::SqlxError)?;

        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;
        Ok(Self { pool })
    }

    // ------------------------------------------------------------------
    // Scheduler state
    // ------------------------------------------------------------------

    pub async fn load_state(&self) -> Result<Option<SchedulerState>> {
        let row = sqlx::query(
            r#"
            SELECT version, enabled, slots_json, last_run, next_run, suspended_reason
            FROM scheduler_state WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let slots_json: String = row.get("slots_json");
        let slots: Vec<TimeSlot> =
            serde_json::from_str(&slots_json).map_err(|_| DbError::CorruptValue {
                column: "scheduler_state.slots_json",
                value: slots_json.clone(),
            })?;

        Ok(Some(SchedulerState {
            version: row.get::<i64, _>("version") as u32,
            enabled: row.get::<i64, _>("enabled") != 0,
            slots,
            last_run: row.get("last_run"),
            next_run: row.get("next_run"),
            suspended_reason: row.get("suspended_reason"),
        }))
    }

    pub async fn save_state(&self, state: &SchedulerState) -> Result<()> {
        let slots_json = serde_json::to_string(&state.slots).map_err(|e| DbError::CorruptValue {
            column: "scheduler_state.slots_json",
            value: e.to_string(),
        })?;

        sqlx::query(
            r#"
            INSERT INTO scheduler_state
                (id, version, enabled, slots_json, last_run, next_run, suspended_reason, updated_at)
            VALUES (1, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                version = excluded.version,
                enabled = excluded.enabled,
                slots_json = excluded.slots_json,
                last_run = excluded.last_run,
                next_run = excluded.next_run,
                suspended_reason = excluded.suspended_reason,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(state.version as i64)
        .bind(state.enabled as i64)
        .bind(slots_json)
        .bind(state.last_run)
        .bind(state.next_run)
        .bind(&state.suspended_reason)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Write only the run bookkeeping of the scheduler row
    ///
    /// Slots and the enabled flag belong to whoever edited them last (possibly
    /// another process), so the firing loop never writes them back.
    pub async fn save_run_state(&self, state: &SchedulerState) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE scheduler_state
            SET last_run = ?, next_run = ?, suspended_reason = ?, updated_at = ?
            WHERE id = 1
            "#,
        )
        .bind(state.last_run)
        .bind(state.next_run)
        .bind(&state.suspended_reason)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        if updated.rows_affected() == 0 {
            self.save_state(state).await?;
        }
        Ok(())
    }

    pub async fn clear_state(&self) -> Result<()> {
        sqlx::query("DELETE FROM scheduler_state")
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Folders
    // ------------------------------------------------------------------

    /// Insert a folder unless one with the same path is already known.
    /// Returns the stored row either way.
    ///
    /// A known row without a remote id takes the one given here, so a local
    /// scan racing a remote download cannot drop the download's identity.
    pub async fn register_folder(&self, folder: &ContentFolder) -> Result<ContentFolder> {
        sqlx::query(
            r#"
            INSERT INTO folders (id, name, path, remote_id, post_type, state, discovered_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                remote_id = COALESCE(folders.remote_id, excluded.remote_id)
            "#,
        )
        .bind(&folder.id)
        .bind(&folder.name)
        .bind(path_str(&folder.path))
        .bind(&folder.remote_id)
        .bind(folder.post_type.map(|t| t.as_str()))
        .bind(folder.state.as_str())
        .bind(folder.discovered_at)
        .bind(folder.completed_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        self.get_folder_by_path(&folder.path)
            .await?
            .ok_or_else(|| crate::AutopostError::FolderNotFound(folder.path.display().to_string()))
    }

    pub async fn get_folder(&self, id: &str) -> Result<Option<ContentFolder>> {
        let row = sqlx::query(&format!("SELECT {FOLDER_COLUMNS} FROM folders WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        row.map(|r| folder_from_row(&r)).transpose()
    }

    pub async fn get_folder_by_path(&self, path: &Path) -> Result<Option<ContentFolder>> {
        let row = sqlx::query(&format!("SELECT {FOLDER_COLUMNS} FROM folders WHERE path = ?"))
            .bind(path_str(path))
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        row.map(|r| folder_from_row(&r)).transpose()
    }

    /// Folders in a given state (all folders when `None`), oldest discovery first
    pub async fn list_folders(&self, state: Option<FolderState>) -> Result<Vec<ContentFolder>> {
        let rows = match state {
            Some(state) => sqlx::query(&format!(
                "SELECT {FOLDER_COLUMNS} FROM folders WHERE state = ? ORDER BY discovered_at, name"
            ))
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await,
            None => sqlx::query(&format!(
                "SELECT {FOLDER_COLUMNS} FROM folders ORDER BY discovered_at, name"
            ))
            .fetch_all(&self.pool)
            .await,
        }
        .map_err(DbError::SqlxError)?;

        rows.iter().map(folder_from_row).collect()
    }

    pub async fn known_remote_ids(&self) -> Result<HashSet<String>> {
        let rows = sqlx::query("SELECT remote_id FROM folders WHERE remote_id IS NOT NULL")
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        Ok(rows.iter().map(|r| r.get::<String, _>("remote_id")).collect())
    }

    /// PENDING -> PROCESSING. Returns false when the folder was not pending.
    pub async fn claim_folder(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE folders SET state = 'processing'
            WHERE id = ? AND state = 'pending'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn set_post_type(&self, id: &str, post_type: PostType) -> Result<()> {
        sqlx::query("UPDATE folders SET post_type = ? WHERE id = ?")
            .bind(post_type.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        Ok(())
    }

    pub async fn set_folder_path(&self, id: &str, path: &Path) -> Result<()> {
        sqlx::query("UPDATE folders SET path = ? WHERE id = ?")
            .bind(path_str(path))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        Ok(())
    }

    /// FAILED -> PENDING at a new location. Returns false when the folder was not failed.
    pub async fn reset_failed_folder(&self, id: &str, path: &Path) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE folders SET state = 'pending', completed_at = NULL, path = ?
            WHERE id = ? AND state = 'failed'
            "#,
        )
        .bind(path_str(path))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Write the cycle's record and move the folder to its terminal state in one transaction
    ///
    /// The state change only applies to a folder that is currently PROCESSING.
    pub async fn finish_cycle(&self, record: &PostRecord) -> Result<PostRecord> {
        let terminal = match record.outcome {
            Outcome::Success => FolderState::Posted,
            Outcome::Failure => FolderState::Failed,
        };

        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        let updated = sqlx::query(
            r#"
            UPDATE folders SET state = ?, completed_at = ?
            WHERE id = ? AND state = 'processing'
            "#,
        )
        .bind(terminal.as_str())
        .bind(record.recorded_at)
        .bind(&record.folder_id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        if updated.rows_affected() != 1 {
            return Err(crate::AutopostError::NotClaimable(record.folder_id.clone()));
        }

        let stored = insert_record(&mut *tx, record)
            .await
            .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(stored)
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    /// Append a record without touching folder state
    pub async fn add_to_history(&self, record: &PostRecord) -> Result<PostRecord> {
        let mut conn = self.pool.acquire().await.map_err(DbError::SqlxError)?;
        let stored = insert_record(&mut *conn, record)
            .await
            .map_err(DbError::SqlxError)?;
        Ok(stored)
    }

    /// Most recent records, newest first
    pub async fn get_history(&self, limit: u32) -> Result<Vec<HistoryEntry>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS}, f.name AS folder_name, f.post_type AS post_type
            FROM post_records r JOIN folders f ON f.id = r.folder_id
            ORDER BY r.recorded_at DESC, r.id DESC
            LIMIT ?
            "#
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter()
            .map(|row| {
                Ok(HistoryEntry {
                    folder_name: row.get("folder_name"),
                    post_type: parse_opt(row, "post_type", "folders.post_type")?,
                    record: record_from_row(row)?,
                })
            })
            .collect()
    }

    pub async fn records_for_folder(&self, folder_id: &str) -> Result<Vec<PostRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM post_records r WHERE r.folder_id = ? ORDER BY r.attempt"
        ))
        .bind(folder_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(record_from_row).collect()
    }

    /// Success/failure totals; "today" is the last 24 hours before `now`
    pub async fn history_stats(&self, now: i64) -> Result<HistoryStats> {
        let day_ago = now - 24 * 60 * 60;
        let week_ago = now - 7 * 24 * 60 * 60;

        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN outcome = 'success' THEN 1 ELSE 0 END), 0) AS total_success,
                COALESCE(SUM(CASE WHEN outcome = 'failure' THEN 1 ELSE 0 END), 0) AS total_failure,
                COALESCE(SUM(CASE WHEN outcome = 'success' AND recorded_at >= ? THEN 1 ELSE 0 END), 0) AS posted_today,
                COALESCE(SUM(CASE WHEN outcome = 'success' AND recorded_at >= ? THEN 1 ELSE 0 END), 0) AS posted_week
            FROM post_records
            "#,
        )
        .bind(day_ago)
        .bind(week_ago)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(HistoryStats {
            total_success: row.get("total_success"),
            total_failure: row.get("total_failure"),
            posted_today: row.get("posted_today"),
            posted_last_7_days: row.get("posted_week"),
        })
    }
}

async fn insert_record(
    conn: &mut SqliteConnection,
    record: &PostRecord,
) -> std::result::Result<PostRecord, sqlx::Error> {
    let row = sqlx::query(
        r#"
        INSERT INTO post_records
            (folder_id, attempt, recorded_at, outcome, platform_post_id, error_class, error_message, publish_calls)
        VALUES (
            ?,
            (SELECT COALESCE(MAX(attempt), 0) + 1 FROM post_records WHERE folder_id = ?),
            ?, ?, ?, ?, ?, ?
        )
        RETURNING id, attempt
        "#,
    )
    .bind(&record.folder_id)
    .bind(&record.folder_id)
    .bind(record.recorded_at)
    .bind(record.outcome.as_str())
    .bind(&record.platform_post_id)
    .bind(record.error_class.map(|c| c.as_str()))
    .bind(&record.error_message)
    .bind(record.publish_calls as i64)
    .fetch_one(&mut *conn)
    .await?;

    let mut stored = record.clone();
    stored.id = Some(row.get("id"));
    stored.attempt = row.get("attempt");
    Ok(stored)
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn parse_opt<T: std::str::FromStr>(
    row: &SqliteRow,
    column: &str,
    label: &'static str,
) -> Result<Option<T>> {
    let value: Option<String> = row.get(column);
    value
        .map(|v| {
            v.parse::<T>().map_err(|_| {
                DbError::CorruptValue {
                    column: label,
                    value: v.clone(),
                }
                .into()
            })
        })
        .transpose()
}

fn parse_required<T: std::str::FromStr>(
    row: &SqliteRow,
    column: &str,
    label: &'static str,
) -> Result<T> {
    let value: String = row.get(column);
    value.parse::<T>().map_err(|_| {
        DbError::CorruptValue {
            column: label,
            value,
        }
        .into()
    })
}

fn folder_from_row(row: &SqliteRow) -> Result<ContentFolder> {
    Ok(ContentFolder {
        id: row.get("id"),
        name: row.get("name"),
        path: PathBuf::from(row.get::<String, _>("path")),
        remote_id: row.get("remote_id"),
        post_type: parse_opt(row, "post_type", "folders.post_type")?,
        state: parse_required(row, "state", "folders.state")?,
        discovered_at: row.get("discovered_at"),
        completed_at: row.get("completed_at"),
    })
}

fn record_from_row(row: &SqliteRow) -> Result<PostRecord> {
    let outcome: Outcome = parse_required(row, "outcome", "post_records.outcome")?;
    let error_class: Option<ErrorClass> =
        parse_opt(row, "error_class", "post_records.error_class")?;
    Ok(PostRecord {
        id: Some(row.get("id")),
        folder_id: row.get("folder_id"),
        attempt: row.get("attempt"),
        recorded_at: row.get("recorded_at"),
        outcome,
        platform_post_id: row.get("platform_post_id"),
        error_class,
        error_message: row.get("error_message"),
        publish_calls: row.get::<i64, _>("publish_calls") as u32,
    })
}
