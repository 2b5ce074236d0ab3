//! libSQL backend for conversation state, the job queue and the message ledger.
//!
//! Supports local file and in-memory databases. Timestamps are written as
//! fixed-width RFC 3339 (microseconds, `Z` suffix) so string comparison in SQL
//! matches chronological order.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::flow::{Context, Stage};
use crate::store::migrations;
use crate::store::traits::{
    ConversationState, ConversationStore, JobQueue, JobStatus, MessageLedger, NackOutcome, NewJob,
    QueueCounts, QueueJob,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Fetch a single job by id, in any status.
    pub async fn get_job(&self, id: &str) -> Result<Option<QueueJob>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM queue_jobs WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_job: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format for every timestamp column.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}

/// `now + delay`, saturating instead of overflowing.
fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `now - age`, saturating instead of overflowing.
fn before(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(age)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn query_err(op: &'static str) -> impl Fn(libsql::Error) -> DatabaseError {
    move |e| DatabaseError::Query(format!("{op}: {e}"))
}

fn to_json_text<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn from_json_text<T: serde::de::DeserializeOwned>(s: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(s).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

const STATE_COLUMNS: &str =
    "contact_phone, current_stage, context, last_message_id, version, created_at, updated_at";

const JOB_COLUMNS: &str = "seq, id, correlation_id, message_type, payload, priority, status, attempts, max_attempts, metadata, enqueued_at, available_at, last_attempt_at, locked_until, last_error, contact_phone";

/// Map a libsql Row to a ConversationState. Column order matches STATE_COLUMNS.
fn row_to_state(row: &libsql::Row) -> Result<ConversationState, DatabaseError> {
    let get_err = query_err("row_to_state");
    let contact_phone: String = row.get(0).map_err(&get_err)?;
    let stage_str: String = row.get(1).map_err(&get_err)?;
    let context_str: String = row.get(2).map_err(&get_err)?;
    let last_message_id: Option<String> = row.get::<String>(3).ok();
    let version: i64 = row.get(4).map_err(&get_err)?;
    let created_str: String = row.get(5).map_err(&get_err)?;
    let updated_str: String = row.get(6).map_err(&get_err)?;

    let context: Context = from_json_text(&context_str)?;

    Ok(ConversationState {
        contact_phone,
        current_stage: Stage::from_db(&stage_str),
        context,
        last_message_id,
        version,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Map a libsql Row to a QueueJob. Column order matches JOB_COLUMNS.
fn row_to_job(row: &libsql::Row) -> Result<QueueJob, DatabaseError> {
    let get_err = query_err("row_to_job");
    let payload_str: String = row.get(4).map_err(&get_err)?;
    let status_str: String = row.get(6).map_err(&get_err)?;
    let metadata_str: String = row.get(9).map_err(&get_err)?;
    let enqueued_str: String = row.get(10).map_err(&get_err)?;
    let available_str: String = row.get(11).map_err(&get_err)?;

    Ok(QueueJob {
        seq: row.get(0).map_err(&get_err)?,
        id: row.get(1).map_err(&get_err)?,
        correlation_id: row.get(2).map_err(&get_err)?,
        message_type: row.get(3).map_err(&get_err)?,
        payload: from_json_text(&payload_str)?,
        priority: row.get(5).map_err(&get_err)?,
        status: JobStatus::from_db(&status_str),
        attempts: row.get(7).map_err(&get_err)?,
        max_attempts: row.get(8).map_err(&get_err)?,
        metadata: from_json_text(&metadata_str)?,
        contact_phone: row.get::<String>(15).ok(),
        enqueued_at: parse_datetime(&enqueued_str),
        available_at: parse_datetime(&available_str),
        last_attempt_at: parse_optional_datetime(row.get::<String>(12).ok()),
        locked_until: parse_optional_datetime(row.get::<String>(13).ok()),
        last_error: row.get::<String>(14).ok(),
    })
}

/// Insert a pending job. Returns `false` when a job with the same id exists.
async fn insert_job(conn: &Connection, job: &NewJob) -> Result<bool, DatabaseError> {
    let now = fmt_ts(Utc::now());
    let count = conn
        .execute(
            "INSERT INTO queue_jobs (id, correlation_id, message_type, payload, priority,
                status, attempts, max_attempts, metadata, contact_phone, enqueued_at, available_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(id) DO NOTHING",
            params![
                job.id.as_str(),
                job.correlation_id.as_str(),
                job.message_type.as_str(),
                to_json_text(&job.payload)?,
                job.priority,
                job.max_attempts,
                to_json_text(&job.metadata)?,
                opt_text(job.contact_phone.as_deref()),
                now,
            ],
        )
        .await
        .map_err(query_err("enqueue"))?;
    Ok(count > 0)
}

async fn collect_jobs(
    mut rows: libsql::Rows,
    op: &'static str,
) -> Result<Vec<QueueJob>, DatabaseError> {
    let mut jobs = Vec::new();
    while let Some(row) = rows.next().await.map_err(query_err(op))? {
        jobs.push(row_to_job(&row)?);
    }
    Ok(jobs)
}

// ── Conversation state ──────────────────────────────────────────────

#[async_trait]
impl ConversationStore for LibSqlBackend {
    async fn get_state(&self, phone: &str) -> Result<Option<ConversationState>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {STATE_COLUMNS} FROM conversation_state WHERE contact_phone = ?1"),
                params![phone],
            )
            .await
            .map_err(query_err("get_state"))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_state(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_state: {e}"))),
        }
    }

    async fn save_state(
        &self,
        state: &ConversationState,
    ) -> Result<ConversationState, DatabaseError> {
        let now = Utc::now();
        let context = to_json_text(&state.context)?;
        let conn = self.conn();

        let affected = if state.is_persisted() {
            conn.execute(
                "UPDATE conversation_state
                 SET current_stage = ?1, context = ?2, last_message_id = ?3,
                     version = version + 1, updated_at = ?4
                 WHERE contact_phone = ?5 AND version = ?6",
                params![
                    state.current_stage.as_str(),
                    context,
                    opt_text(state.last_message_id.as_deref()),
                    fmt_ts(now),
                    state.contact_phone.as_str(),
                    state.version,
                ],
            )
            .await
            .map_err(query_err("save_state"))?
        } else {
            conn.execute(
                "INSERT INTO conversation_state
                    (contact_phone, current_stage, context, last_message_id, version, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6)
                 ON CONFLICT(contact_phone) DO NOTHING",
                params![
                    state.contact_phone.as_str(),
                    state.current_stage.as_str(),
                    context,
                    opt_text(state.last_message_id.as_deref()),
                    fmt_ts(state.created_at),
                    fmt_ts(now),
                ],
            )
            .await
            .map_err(query_err("save_state"))?
        };

        if affected == 0 {
            warn!(
                phone = %state.contact_phone,
                version = state.version,
                "Conversation state changed concurrently"
            );
            return Err(DatabaseError::Conflict {
                entity: "conversation_state".into(),
                id: state.contact_phone.clone(),
                expected: state.is_persisted().then_some(state.version),
            });
        }

        debug!(
            phone = %state.contact_phone,
            stage = %state.current_stage,
            version = state.version + 1,
            "Conversation state saved"
        );

        let mut saved = state.clone();
        saved.version = state.version + 1;
        saved.updated_at = now;
        Ok(saved)
    }

    async fn delete_state(&self, phone: &str) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM conversation_state WHERE contact_phone = ?1",
                params![phone],
            )
            .await
            .map_err(query_err("delete_state"))?;
        Ok(count > 0)
    }

    async fn transfer_to_human(
        &self,
        phone: &str,
        handoff: NewJob,
    ) -> Result<String, DatabaseError> {
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(query_err("transfer_to_human"))?;

        let writes = async {
            let deleted = tx
                .execute(
                    "DELETE FROM conversation_state WHERE contact_phone = ?1",
                    params![phone],
                )
                .await
                .map_err(query_err("transfer_to_human"))?;
            let inserted = insert_job(&tx, &handoff).await?;
            Ok::<_, DatabaseError>((deleted, inserted))
        }
        .await;

        let (deleted, inserted) = match writes {
            Ok(done) => done,
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(phone = %phone, error = %rollback, "Failed to roll back handoff");
                }
                return Err(e);
            }
        };
        tx.commit().await.map_err(query_err("transfer_to_human"))?;

        debug!(
            phone = %phone,
            job_id = %handoff.id,
            state_deleted = deleted > 0,
            handoff_inserted = inserted,
            "Conversation handed off"
        );
        Ok(handoff.id)
    }
}

// ── Queue ───────────────────────────────────────────────────────────

#[async_trait]
impl JobQueue for LibSqlBackend {
    async fn enqueue(&self, job: NewJob) -> Result<String, DatabaseError> {
        if !insert_job(self.conn(), &job).await? {
            debug!(job_id = %job.id, "Job already enqueued");
            return Ok(job.id);
        }

        debug!(
            job_id = %job.id,
            correlation_id = %job.correlation_id,
            message_type = %job.message_type,
            priority = job.priority,
            "Job enqueued"
        );
        Ok(job.id)
    }

    async fn dequeue(
        &self,
        max: usize,
        visibility: Duration,
    ) -> Result<Vec<QueueJob>, DatabaseError> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let now = Utc::now();
        // Claim and lease in one statement so concurrent sweeps never share a job.
        let rows = self
            .conn()
            .query(
                &format!(
                    "UPDATE queue_jobs
                     SET status = 'processing', last_attempt_at = ?1, locked_until = ?2
                     WHERE id IN (
                        SELECT j.id FROM queue_jobs j
                        WHERE ((j.status = 'pending' AND j.available_at <= ?1)
                           OR (j.status = 'processing' AND j.locked_until <= ?1))
                          AND (j.contact_phone IS NULL OR NOT EXISTS (
                              SELECT 1 FROM queue_jobs e
                              WHERE e.contact_phone = j.contact_phone
                                AND e.seq < j.seq
                                AND e.status IN ('pending', 'processing')
                          ))
                        ORDER BY j.priority DESC, j.seq ASC
                        LIMIT ?3
                     )
                     RETURNING {JOB_COLUMNS}"
                ),
                params![fmt_ts(now), fmt_ts(after(now, visibility)), max as i64],
            )
            .await
            .map_err(query_err("dequeue"))?;

        let mut jobs = collect_jobs(rows, "dequeue").await?;
        jobs.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        if !jobs.is_empty() {
            debug!(count = jobs.len(), "Jobs dequeued");
        }
        Ok(jobs)
    }

    async fn ack(&self, id: &str) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE queue_jobs SET status = 'done', locked_until = NULL WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(query_err("ack"))?;

        if count == 0 {
            return Err(DatabaseError::NotFound {
                entity: "queue_job".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn nack(
        &self,
        id: &str,
        error: &str,
        retry_delay: Duration,
    ) -> Result<NackOutcome, DatabaseError> {
        let available_at = after(Utc::now(), retry_delay);
        let mut rows = self
            .conn()
            .query(
                "UPDATE queue_jobs
                 SET attempts = attempts + 1,
                     status = CASE WHEN attempts + 1 >= max_attempts THEN 'failed' ELSE 'pending' END,
                     available_at = ?1,
                     locked_until = NULL,
                     last_error = ?2
                 WHERE id = ?3
                 RETURNING attempts, status",
                params![fmt_ts(available_at), error, id],
            )
            .await
            .map_err(query_err("nack"))?;

        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => {
                return Err(DatabaseError::NotFound {
                    entity: "queue_job".into(),
                    id: id.to_string(),
                });
            }
            Err(e) => return Err(DatabaseError::Query(format!("nack: {e}"))),
        };

        let attempts: i64 = row.get(0).map_err(query_err("nack"))?;
        let status: String = row.get(1).map_err(query_err("nack"))?;
        match JobStatus::from_db(&status) {
            JobStatus::Failed => Ok(NackOutcome::Failed { attempts }),
            _ => Ok(NackOutcome::Requeued { attempts }),
        }
    }

    async fn release(&self, id: &str) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE queue_jobs SET status = 'pending', locked_until = NULL
                 WHERE id = ?1 AND status = 'processing'",
                params![id],
            )
            .await
            .map_err(query_err("release"))?;

        if count == 0 {
            return Err(DatabaseError::NotFound {
                entity: "processing queue_job".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn has_later_job(
        &self,
        phone: &str,
        message_type: &str,
        seq: i64,
    ) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT EXISTS (
                    SELECT 1 FROM queue_jobs
                    WHERE contact_phone = ?1 AND message_type = ?2 AND seq > ?3
                 )",
                params![phone, message_type, seq],
            )
            .await
            .map_err(query_err("has_later_job"))?;

        match rows.next().await.map_err(query_err("has_later_job"))? {
            Some(row) => Ok(row.get::<i64>(0).map_err(query_err("has_later_job"))? != 0),
            None => Ok(false),
        }
    }

    async fn failed_jobs(&self, limit: usize) -> Result<Vec<QueueJob>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM queue_jobs WHERE status = 'failed'
                     ORDER BY last_attempt_at DESC, seq DESC LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(query_err("failed_jobs"))?;
        collect_jobs(rows, "failed_jobs").await
    }

    async fn retry_failed(&self, id: &str) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE queue_jobs
                 SET status = 'pending', attempts = 0, available_at = ?1, locked_until = NULL
                 WHERE id = ?2 AND status = 'failed'",
                params![fmt_ts(Utc::now()), id],
            )
            .await
            .map_err(query_err("retry_failed"))?;

        if count == 0 {
            return Err(DatabaseError::NotFound {
                entity: "failed queue_job".into(),
                id: id.to_string(),
            });
        }
        info!(job_id = %id, "Failed job requeued");
        Ok(())
    }

    async fn queue_counts(&self) -> Result<QueueCounts, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT status, COUNT(*) FROM queue_jobs GROUP BY status",
                (),
            )
            .await
            .map_err(query_err("queue_counts"))?;

        let mut counts = QueueCounts::default();
        while let Some(row) = rows.next().await.map_err(query_err("queue_counts"))? {
            let status: String = row.get(0).map_err(query_err("queue_counts"))?;
            let count = row.get::<i64>(1).unwrap_or(0).max(0) as u64;
            match JobStatus::from_db(&status) {
                JobStatus::Pending => counts.pending += count,
                JobStatus::Processing => counts.processing += count,
                JobStatus::Done => counts.done += count,
                JobStatus::Failed => counts.failed += count,
            }
        }
        Ok(counts)
    }
}

// ── Message ledger ──────────────────────────────────────────────────

#[async_trait]
impl MessageLedger for LibSqlBackend {
    async fn record_message(
        &self,
        message_id: &str,
        phone: &str,
        correlation_id: &str,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "INSERT INTO processed_messages (message_id, contact_phone, correlation_id, recorded_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(message_id) DO NOTHING",
                params![message_id, phone, correlation_id, fmt_ts(Utc::now())],
            )
            .await
            .map_err(query_err("record_message"))?;
        Ok(count > 0)
    }

    async fn forget_message(&self, message_id: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM processed_messages WHERE message_id = ?1",
                params![message_id],
            )
            .await
            .map_err(query_err("forget_message"))?;
        Ok(())
    }

    async fn prune_messages(&self, older_than: Duration) -> Result<usize, DatabaseError> {
        let cutoff = before(Utc::now(), older_than);
        let count = self
            .conn()
            .execute(
                "DELETE FROM processed_messages WHERE recorded_at < ?1",
                params![fmt_ts(cutoff)],
            )
            .await
            .map_err(query_err("prune_messages"))?;

        if count > 0 {
            info!(count, "Pruned message ledger");
        }
        Ok(count as usize)
    }
}
