//! Durable persistence of the reattach record, with validation on load.

use std::sync::Arc;

use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::{info, warn};

use crate::models::reattach::{ReattachRecord, SessionRole};
use crate::session::process::{pid_alive, process_start_ticks};
use crate::{AppError, Result};

/// Store for the durable reattach record.
///
/// At most one record per role is kept. Loading consumes: the rows are
/// deleted before a validated record is returned, so a persisted record
/// permits at most one successful reattachment.
#[derive(Clone)]
pub struct ReattachStore {
    pool: Arc<SqlitePool>,
}

impl ReattachStore {
    /// Create a store over the shared pool.
    #[must_use]
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }

    /// Write the record for its role, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Reattach` if persistence fails — a missed
    /// persist means the next supervisor instance cannot recover the
    /// running process, so this is never swallowed.
    pub async fn persist(&self, record: &ReattachRecord) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO reattach_record
             (role, process_id, process_start_ticks, access_token, host, port, build_id, written_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(role_text(record.role))
        .bind(i64::from(record.process_id))
        .bind(record.process_start_ticks)
        .bind(&record.access_token)
        .bind(&record.host)
        .bind(i64::from(record.port))
        .bind(&record.build_id)
        .bind(Utc::now().to_rfc3339())
        .execute(self.pool.as_ref())
        .await
        .map_err(|err| AppError::Reattach(format!("failed to persist reattach record: {err}")))?;

        info!(
            pid = record.process_id,
            build_id = %record.build_id,
            role = role_text(record.role),
            "reattach record persisted"
        );
        Ok(())
    }

    /// Consume the stored record, validating it against the live system.
    ///
    /// Primary-role records win over secondary ones. A record whose
    /// process no longer exists, or whose recorded start time no longer
    /// matches the live process (pid reuse), is treated as absent —
    /// never as an error — so callers uniformly fall back to a fresh
    /// launch. All rows are cleared regardless of outcome.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` only for storage-level failures.
    pub async fn take(&self) -> Result<Option<ReattachRecord>> {
        let rows = sqlx::query(
            "SELECT role, process_id, process_start_ticks, access_token, host, port, build_id
             FROM reattach_record
             ORDER BY CASE role WHEN 'primary' THEN 0 ELSE 1 END",
        )
        .fetch_all(self.pool.as_ref())
        .await?;

        sqlx::query("DELETE FROM reattach_record")
            .execute(self.pool.as_ref())
            .await?;

        for row in rows {
            let record = record_from_row(&row)?;
            if record_matches_live_process(&record) {
                info!(
                    pid = record.process_id,
                    build_id = %record.build_id,
                    "valid reattach record loaded"
                );
                return Ok(Some(record));
            }
            info!(
                pid = record.process_id,
                build_id = %record.build_id,
                "stale reattach record discarded"
            );
        }

        Ok(None)
    }

    /// Read the stored primary record without validating or consuming it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn peek(&self) -> Result<Option<ReattachRecord>> {
        let row = sqlx::query(
            "SELECT role, process_id, process_start_ticks, access_token, host, port, build_id
             FROM reattach_record
             ORDER BY CASE role WHEN 'primary' THEN 0 ELSE 1 END
             LIMIT 1",
        )
        .fetch_optional(self.pool.as_ref())
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    /// Delete every stored record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM reattach_record")
            .execute(self.pool.as_ref())
            .await?;
        Ok(())
    }
}

/// Whether the record still points at the process it was written for.
fn record_matches_live_process(record: &ReattachRecord) -> bool {
    if !pid_alive(record.process_id) {
        return false;
    }
    // A recorded zero means start ticks were unavailable at persist
    // time; liveness is the best check we have then.
    if record.process_start_ticks == 0 {
        return true;
    }
    match process_start_ticks(record.process_id) {
        Some(ticks) => ticks == record.process_start_ticks,
        None => {
            warn!(
                pid = record.process_id,
                "process start time unavailable, rejecting record"
            );
            false
        }
    }
}

fn role_text(role: SessionRole) -> &'static str {
    match role {
        SessionRole::Primary => "primary",
        SessionRole::Secondary => "secondary",
    }
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ReattachRecord> {
    let role: String = row.try_get("role")?;
    let process_id: i64 = row.try_get("process_id")?;
    let port: i64 = row.try_get("port")?;

    Ok(ReattachRecord {
        process_id: u32::try_from(process_id)
            .map_err(|_| AppError::Db(format!("invalid process_id {process_id}")))?,
        process_start_ticks: row.try_get("process_start_ticks")?,
        access_token: row.try_get("access_token")?,
        host: row.try_get("host")?,
        port: u16::try_from(port).map_err(|_| AppError::Db(format!("invalid port {port}")))?,
        build_id: row.try_get("build_id")?,
        role: if role == "secondary" {
            SessionRole::Secondary
        } else {
            SessionRole::Primary
        },
    })
}
