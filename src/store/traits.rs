//! Persistence interfaces: per-contact conversation state, the durable job
//! queue, and the inbound message ledger.
//!
//! Each concern is its own narrow trait so the router and processor only see
//! what they use. [`LibSqlBackend`](super::LibSqlBackend) implements all three.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::flow::{Context, Stage};

// ── Conversation state ──────────────────────────────────────────────

/// The automation record of one contact.
///
/// `version` is the optimistic-concurrency token: `0` means the record was never
/// persisted, every successful save bumps it by one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    pub contact_phone: String,
    pub current_stage: Stage,
    #[serde(default)]
    pub context: Context,
    /// Id of the last inbound message whose turn was applied.
    #[serde(default)]
    pub last_message_id: Option<String>,
    #[serde(default)]
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationState {
    /// A fresh, unsaved record at [`Stage::Start`].
    pub fn new(contact_phone: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            contact_phone: contact_phone.into(),
            current_stage: Stage::Start,
            context: Context::new(),
            last_message_id: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.version > 0
    }
}

/// Keyed access to [`ConversationState`], one record per canonical phone.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get_state(&self, phone: &str) -> Result<Option<ConversationState>, DatabaseError>;

    /// Insert or update with a compare-and-swap on `state.version`.
    ///
    /// Returns the stored record (with its new version). Fails with
    /// [`DatabaseError::Conflict`] when the row changed since it was read, or
    /// when an unsaved record collides with an existing one.
    async fn save_state(&self, state: &ConversationState)
    -> Result<ConversationState, DatabaseError>;

    /// Remove the record. Returns whether a row existed.
    async fn delete_state(&self, phone: &str) -> Result<bool, DatabaseError>;

    /// Remove the record and enqueue `handoff` as one atomic write.
    ///
    /// Either both happen or neither does. Returns the handoff job id.
    async fn transfer_to_human(&self, phone: &str, handoff: NewJob)
    -> Result<String, DatabaseError>;
}

// ── Queue ───────────────────────────────────────────────────────────

/// Lifecycle of a queue job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "processing" => Self::Processing,
            "done" => Self::Done,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// A persisted unit of work.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueJob {
    /// Insertion order; the FIFO tiebreaker within a priority band.
    pub seq: i64,
    pub id: String,
    pub correlation_id: String,
    pub message_type: String,
    pub payload: serde_json::Value,
    pub priority: i64,
    pub status: JobStatus,
    pub attempts: i64,
    pub max_attempts: i64,
    pub metadata: serde_json::Value,
    /// Contact the job belongs to; jobs of one contact are claimed in order.
    pub contact_phone: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub locked_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// A job to enqueue.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: String,
    pub correlation_id: String,
    pub message_type: String,
    pub payload: serde_json::Value,
    pub priority: i64,
    pub max_attempts: i64,
    pub metadata: serde_json::Value,
    pub contact_phone: Option<String>,
}

impl NewJob {
    pub fn new(
        correlation_id: impl Into<String>,
        message_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            correlation_id: correlation_id.into(),
            message_type: message_type.into(),
            payload,
            priority: 0,
            max_attempts: 3,
            metadata: serde_json::json!({}),
            contact_phone: None,
        }
    }

    /// Use a caller-chosen id. Enqueueing the same id twice keeps the first job.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn for_contact(mut self, phone: impl Into<String>) -> Self {
        self.contact_phone = Some(phone.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i64) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// What `nack` did with a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Back to pending, available again after the backoff delay.
    Requeued { attempts: i64 },
    /// Retries exhausted; the job stays inspectable as failed.
    Failed { attempts: i64 },
}

/// Per-status job totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: u64,
    pub processing: u64,
    pub done: u64,
    pub failed: u64,
}

/// Durable priority queue with visibility leases.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Persist a new pending job. Returns its id.
    ///
    /// A job whose id already exists is not inserted again.
    async fn enqueue(&self, job: NewJob) -> Result<String, DatabaseError>;

    /// Claim up to `max` available jobs, highest priority first then FIFO.
    ///
    /// Claimed jobs are `processing` and invisible until `visibility` elapses,
    /// after which they are delivered again. A job is not claimed while an
    /// earlier job of the same contact is still pending or processing.
    async fn dequeue(
        &self,
        max: usize,
        visibility: Duration,
    ) -> Result<Vec<QueueJob>, DatabaseError>;

    /// Mark a job done.
    async fn ack(&self, id: &str) -> Result<(), DatabaseError>;

    /// Record a failed attempt. Requeues after `retry_delay` or fails the job
    /// once its attempt ceiling is reached.
    async fn nack(
        &self,
        id: &str,
        error: &str,
        retry_delay: Duration,
    ) -> Result<NackOutcome, DatabaseError>;

    /// Give back a claimed job untouched: no attempt is counted and it is
    /// available again immediately.
    async fn release(&self, id: &str) -> Result<(), DatabaseError>;

    /// Whether a job of `message_type` for `phone` was enqueued after the job
    /// with sequence number `seq`.
    async fn has_later_job(
        &self,
        phone: &str,
        message_type: &str,
        seq: i64,
    ) -> Result<bool, DatabaseError>;

    /// Exhausted jobs, most recent first.
    async fn failed_jobs(&self, limit: usize) -> Result<Vec<QueueJob>, DatabaseError>;

    /// Put a failed job back to pending with a fresh attempt budget.
    async fn retry_failed(&self, id: &str) -> Result<(), DatabaseError>;

    async fn queue_counts(&self) -> Result<QueueCounts, DatabaseError>;
}

// ── Message ledger ──────────────────────────────────────────────────

/// Idempotency ledger of inbound `messageId`s.
#[async_trait]
pub trait MessageLedger: Send + Sync {
    /// Record a message id. Returns `false` if it was already recorded.
    async fn record_message(
        &self,
        message_id: &str,
        phone: &str,
        correlation_id: &str,
    ) -> Result<bool, DatabaseError>;

    /// Release a recorded id so a redelivery is processed again.
    async fn forget_message(&self, message_id: &str) -> Result<(), DatabaseError>;

    /// Delete entries older than `older_than`. Returns the number removed.
    async fn prune_messages(&self, older_than: Duration) -> Result<usize, DatabaseError>;
}
