// =============================================================================
// store.rs - THE SHARED RELATIONAL STORE
// =============================================================================
//
// SQLite via sqlx. Holds the case registry, the latest snapshot per case,
// update-delta records for downstream readers, and one log row per batch
// run. The lock table and the concurrency slot live in the same database
// but are only ever touched through lock.rs.
//
// All timestamps are stored as epoch milliseconds.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::SyncError;
use crate::models::{
    CaseSnapshot, CaseUpdateRecord, EncBinding, SyncCandidate, SyncLogEntry, SyncResult,
};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Handle to the shared store. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn parse_enum<T: DeserializeOwned>(raw: &str) -> Result<T, SyncError> {
    Ok(serde_json::from_value(serde_json::Value::String(raw.to_string()))?)
}

fn parse_uuid(raw: &str) -> Result<Uuid, SyncError> {
    raw.parse()
        .map_err(|e: uuid::Error| SyncError::Store(sqlx::Error::Decode(Box::new(e))))
}

impl Store {
    /// Open (creating if needed) the database at `path` and apply migrations.
    pub async fn open(path: &Path) -> Result<Self, SyncError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        MIGRATOR.run(&pool).await?;
        info!(path = %path.display(), "Store opened and migrated");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // =========================================================================
    // CASES
    // =========================================================================

    /// Register a case for syncing, or update its number if it exists.
    pub async fn upsert_case(&self, case_id: &str, case_number: &str) -> Result<(), SyncError> {
        sqlx::query(
            r#"
INSERT INTO cases (case_id, case_number, active, created_at)
VALUES (?, ?, 1, ?)
ON CONFLICT(case_id) DO UPDATE SET case_number = excluded.case_number
            "#,
        )
        .bind(case_id)
        .bind(case_number)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_case_active(&self, case_id: &str, active: bool) -> Result<(), SyncError> {
        sqlx::query("UPDATE cases SET active = ? WHERE case_id = ?")
            .bind(active)
            .bind(case_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Active cases, never-synced first, then oldest sync first. Rows whose
    /// number was rejected and not edited since come last.
    pub async fn list_sync_candidates(&self, limit: usize) -> Result<Vec<SyncCandidate>, SyncError> {
        let rows = sqlx::query(
            r#"
SELECT case_id, case_number, last_synced_at
FROM cases
WHERE active = 1
ORDER BY COALESCE(rejected_number = case_number, 0),
         last_synced_at IS NOT NULL, last_synced_at ASC, case_id ASC
LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<SyncCandidate, SyncError> {
                Ok(SyncCandidate {
                    case_id: row.try_get("case_id")?,
                    case_number: row.try_get("case_number")?,
                    last_synced_at: row
                        .try_get::<Option<i64>, _>("last_synced_at")?
                        .map(from_millis),
                })
            })
            .collect()
    }

    /// Flag a case whose stored number failed to parse. Editing the number
    /// lifts the flag.
    pub async fn mark_number_rejected(&self, case_id: &str, raw: &str) -> Result<(), SyncError> {
        sqlx::query("UPDATE cases SET rejected_number = ? WHERE case_id = ? AND case_number = ?")
            .bind(raw)
            .bind(case_id)
            .bind(raw)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn case_last_synced(&self, case_id: &str) -> Result<Option<DateTime<Utc>>, SyncError> {
        let row = sqlx::query("SELECT last_synced_at FROM cases WHERE case_id = ?")
            .bind(case_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => row.try_get::<Option<i64>, _>("last_synced_at")?.map(from_millis),
            None => None,
        })
    }

    /// Stored encrypted case number and the monitor cookie it belongs to, if
    /// a previous lookup produced both.
    pub async fn case_enc_binding(&self, case_id: &str) -> Result<Option<EncBinding>, SyncError> {
        let row = sqlx::query("SELECT enc_case_no, enc_monitor_id FROM cases WHERE case_id = ?")
            .bind(case_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let enc_case_no: Option<String> = row.try_get("enc_case_no")?;
        let monitor_id: Option<String> = row.try_get("enc_monitor_id")?;
        Ok(enc_case_no.zip(monitor_id).map(|(enc_case_no, monitor_id)| EncBinding { enc_case_no, monitor_id }))
    }

    /// Stamp a sync and replace the stored binding with whatever this lookup
    /// produced.
    pub async fn mark_case_synced(
        &self,
        case_id: &str,
        at: DateTime<Utc>,
        enc: Option<&EncBinding>,
    ) -> Result<(), SyncError> {
        sqlx::query(
            r#"
UPDATE cases
SET last_synced_at = ?, enc_case_no = ?, enc_monitor_id = ?
WHERE case_id = ?
            "#,
        )
        .bind(to_millis(at))
        .bind(enc.map(|b| b.enc_case_no.as_str()))
        .bind(enc.map(|b| b.monitor_id.as_str()))
        .bind(case_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear_case_enc(&self, case_id: &str) -> Result<(), SyncError> {
        sqlx::query("UPDATE cases SET enc_case_no = NULL, enc_monitor_id = NULL WHERE case_id = ?")
            .bind(case_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // =========================================================================
    // SNAPSHOTS & UPDATES
    // =========================================================================

    pub async fn latest_snapshot(&self, case_id: &str) -> Result<Option<CaseSnapshot>, SyncError> {
        let row = sqlx::query("SELECT document FROM case_snapshots WHERE case_id = ?")
            .bind(case_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let document: String = row.try_get("document")?;
                Ok(Some(serde_json::from_str(&document)?))
            }
            None => Ok(None),
        }
    }

    /// Replace the case snapshot and append its update records in one
    /// transaction.
    pub async fn save_snapshot_with_updates(
        &self,
        snapshot: &CaseSnapshot,
        updates: &[CaseUpdateRecord],
    ) -> Result<(), SyncError> {
        let document = serde_json::to_string(snapshot)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
INSERT INTO case_snapshots (case_id, category, document, content_hash, captured_at)
VALUES (?, ?, ?, ?, ?)
ON CONFLICT(case_id) DO UPDATE SET
    category = excluded.category,
    document = excluded.document,
    content_hash = excluded.content_hash,
    captured_at = excluded.captured_at
            "#,
        )
        .bind(&snapshot.case_id)
        .bind(snapshot.category.to_string())
        .bind(&document)
        .bind(&snapshot.content_hash)
        .bind(to_millis(snapshot.captured_at))
        .execute(&mut *tx)
        .await?;

        for update in updates {
            sqlx::query(
                r#"
INSERT INTO case_updates
    (id, case_id, update_type, summary, importance, old_value, new_value, detected_at, read_at)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL)
                "#,
            )
            .bind(update.id.to_string())
            .bind(&update.case_id)
            .bind(update.update_type.as_str())
            .bind(&update.summary)
            .bind(update.importance.as_str())
            .bind(&update.old_value)
            .bind(&update.new_value)
            .bind(to_millis(update.detected_at))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(
            case_id = %snapshot.case_id,
            updates = updates.len(),
            "Snapshot persisted"
        );
        Ok(())
    }

    /// Unread update records for a case, oldest first.
    pub async fn unread_updates(&self, case_id: &str) -> Result<Vec<CaseUpdateRecord>, SyncError> {
        let rows = sqlx::query(
            r#"
SELECT id, case_id, update_type, summary, importance, old_value, new_value, detected_at, read_at
FROM case_updates
WHERE case_id = ? AND read_at IS NULL
ORDER BY detected_at ASC, id ASC
            "#,
        )
        .bind(case_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<CaseUpdateRecord, SyncError> {
                let id: String = row.try_get("id")?;
                let update_type: String = row.try_get("update_type")?;
                let importance: String = row.try_get("importance")?;
                Ok(CaseUpdateRecord {
                    id: parse_uuid(&id)?,
                    case_id: row.try_get("case_id")?,
                    update_type: parse_enum(&update_type)?,
                    summary: row.try_get("summary")?,
                    importance: parse_enum(&importance)?,
                    old_value: row.try_get("old_value")?,
                    new_value: row.try_get("new_value")?,
                    detected_at: from_millis(row.try_get("detected_at")?),
                    read_at: row.try_get::<Option<i64>, _>("read_at")?.map(from_millis),
                })
            })
            .collect()
    }

    /// Stamp every unread update of a case as read. Returns how many changed.
    pub async fn mark_updates_read(&self, case_id: &str, at: DateTime<Utc>) -> Result<u64, SyncError> {
        let result = sqlx::query(
            "UPDATE case_updates SET read_at = ? WHERE case_id = ? AND read_at IS NULL",
        )
        .bind(to_millis(at))
        .bind(case_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // =========================================================================
    // SYNC LOGS
    // =========================================================================

    pub async fn insert_sync_log(&self, entry: &SyncLogEntry) -> Result<(), SyncError> {
        let details = serde_json::json!({
            "totalCases": entry.total_cases,
            "totalUpdates": entry.total_updates,
            "results": entry.results,
        });
        sqlx::query(
            r#"
INSERT INTO sync_logs
    (id, action, status, mode, cases_synced, cases_failed, duration_ms, details, created_at)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.id.to_string())
        .bind(&entry.action)
        .bind(entry.status.as_str())
        .bind(entry.mode.to_string())
        .bind(entry.cases_synced as i64)
        .bind(entry.cases_failed as i64)
        .bind(entry.duration_ms as i64)
        .bind(details.to_string())
        .bind(to_millis(entry.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent batch logs, newest first.
    pub async fn recent_sync_logs(&self, limit: usize) -> Result<Vec<SyncLogEntry>, SyncError> {
        let rows = sqlx::query(
            r#"
SELECT id, action, status, mode, cases_synced, cases_failed, duration_ms, details, created_at
FROM sync_logs
ORDER BY created_at DESC
LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<SyncLogEntry, SyncError> {
                let id: String = row.try_get("id")?;
                let status: String = row.try_get("status")?;
                let mode: String = row.try_get("mode")?;
                let details: String = row.try_get("details")?;
                let details: serde_json::Value = serde_json::from_str(&details)?;
                let results: Vec<SyncResult> =
                    serde_json::from_value(details["results"].clone()).unwrap_or_default();
                Ok(SyncLogEntry {
                    id: parse_uuid(&id)?,
                    action: row.try_get("action")?,
                    status: parse_enum(&status)?,
                    mode: parse_enum(&mode)?,
                    total_cases: details["totalCases"].as_u64().unwrap_or(0) as usize,
                    cases_synced: row.try_get::<i64, _>("cases_synced")? as usize,
                    cases_failed: row.try_get::<i64, _>("cases_failed")? as usize,
                    total_updates: details["totalUpdates"].as_u64().unwrap_or(0) as usize,
                    duration_ms: row.try_get::<i64, _>("duration_ms")? as u64,
                    results,
                    created_at: from_millis(row.try_get("created_at")?),
                })
            })
            .collect()
    }
}
