//! Stubs and a wired-up harness for pipeline unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use crate::channels::sender::tests::RecordingTransport;
use crate::channels::{HumanSupport, MessageSender};
use crate::config::QueueConfig;
use crate::error::{ChannelError, DatabaseError};
use crate::pipeline::processor::{ProcessorTrigger, QueueProcessor};
use crate::pipeline::router::MessageRouter;
use crate::pipeline::types::{EventData, InboundEvent, MESSAGE_RECEIVED, TextBody};
use crate::store::{
    ConversationState, ConversationStore, JobQueue, LibSqlBackend, NackOutcome, NewJob,
    QueueCounts, QueueJob,
};

/// Records forwarded events; fails while `down` is set.
#[derive(Default)]
pub(crate) struct RecordingHuman {
    pub events: Mutex<Vec<InboundEvent>>,
    pub down: AtomicBool,
}

impl RecordingHuman {
    pub async fn texts(&self) -> Vec<String> {
        self.events
            .lock()
            .await
            .iter()
            .map(|e| e.text().to_string())
            .collect()
    }
}

#[async_trait]
impl HumanSupport for RecordingHuman {
    async fn forward(&self, event: &InboundEvent) -> Result<(), ChannelError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(ChannelError::SendFailed {
                name: "human_support".into(),
                reason: "console offline".into(),
            });
        }
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

/// Wraps the real store and fails selected operations on demand.
///
/// The `*_failures` counters fail that many upcoming calls, then recover.
pub(crate) struct FlakyStore {
    pub inner: Arc<LibSqlBackend>,
    pub fail_get: AtomicBool,
    pub fail_save: AtomicBool,
    pub save_failures: AtomicUsize,
    pub transfer_failures: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<LibSqlBackend>) -> Self {
        Self {
            inner,
            fail_get: AtomicBool::new(false),
            fail_save: AtomicBool::new(false),
            save_failures: AtomicUsize::new(0),
            transfer_failures: AtomicUsize::new(0),
        }
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl ConversationStore for FlakyStore {
    async fn get_state(&self, phone: &str) -> Result<Option<ConversationState>, DatabaseError> {
        if self.fail_get.load(Ordering::SeqCst) {
            return Err(DatabaseError::Query("get_state: store offline".into()));
        }
        self.inner.get_state(phone).await
    }

    async fn save_state(
        &self,
        state: &ConversationState,
    ) -> Result<ConversationState, DatabaseError> {
        if self.fail_save.load(Ordering::SeqCst) || take_failure(&self.save_failures) {
            return Err(DatabaseError::Query("save_state: store offline".into()));
        }
        self.inner.save_state(state).await
    }

    async fn delete_state(&self, phone: &str) -> Result<bool, DatabaseError> {
        self.inner.delete_state(phone).await
    }

    async fn transfer_to_human(
        &self,
        phone: &str,
        handoff: NewJob,
    ) -> Result<String, DatabaseError> {
        if take_failure(&self.transfer_failures) {
            return Err(DatabaseError::Query("transfer_to_human: disk full".into()));
        }
        self.inner.transfer_to_human(phone, handoff).await
    }
}

/// A queue whose every write fails.
pub(crate) struct BrokenQueue;

#[async_trait]
impl JobQueue for BrokenQueue {
    async fn enqueue(&self, _job: NewJob) -> Result<String, DatabaseError> {
        Err(DatabaseError::Query("enqueue: disk full".into()))
    }

    async fn dequeue(
        &self,
        _max: usize,
        _visibility: Duration,
    ) -> Result<Vec<QueueJob>, DatabaseError> {
        Ok(Vec::new())
    }

    async fn ack(&self, _id: &str) -> Result<(), DatabaseError> {
        Err(DatabaseError::Query("ack: disk full".into()))
    }

    async fn nack(
        &self,
        _id: &str,
        _error: &str,
        _retry_delay: Duration,
    ) -> Result<NackOutcome, DatabaseError> {
        Err(DatabaseError::Query("nack: disk full".into()))
    }

    async fn release(&self, _id: &str) -> Result<(), DatabaseError> {
        Err(DatabaseError::Query("release: disk full".into()))
    }

    async fn has_later_job(
        &self,
        _phone: &str,
        _message_type: &str,
        _seq: i64,
    ) -> Result<bool, DatabaseError> {
        Ok(false)
    }

    async fn failed_jobs(&self, _limit: usize) -> Result<Vec<QueueJob>, DatabaseError> {
        Ok(Vec::new())
    }

    async fn retry_failed(&self, _id: &str) -> Result<(), DatabaseError> {
        Err(DatabaseError::Query("retry_failed: disk full".into()))
    }

    async fn queue_counts(&self) -> Result<QueueCounts, DatabaseError> {
        Ok(QueueCounts::default())
    }
}

/// Retries become available immediately.
pub(crate) fn test_config() -> QueueConfig {
    QueueConfig {
        backoff_base: Duration::ZERO,
        backoff_max: Duration::ZERO,
        ..QueueConfig::default()
    }
}

pub(crate) fn message(phone: &str, message_id: &str, text: &str) -> InboundEvent {
    InboundEvent {
        event: MESSAGE_RECEIVED.to_string(),
        instance_id: "inst-1".to_string(),
        data: EventData {
            message_id: message_id.to_string(),
            from: phone.to_string(),
            to: "551130000000".to_string(),
            text: TextBody {
                message: text.to_string(),
            },
            timestamp: 1_700_000_000,
            from_me: false,
            sender_name: "Cliente".to_string(),
            push_name: "Cliente".to_string(),
        },
    }
}

/// Router and processor sharing one in-memory database.
pub(crate) struct Harness {
    pub db: Arc<LibSqlBackend>,
    pub store: Arc<FlakyStore>,
    pub transport: Arc<RecordingTransport>,
    pub human: Arc<RecordingHuman>,
    pub router: MessageRouter,
    pub processor: QueueProcessor,
    pub nudges: mpsc::Receiver<()>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_transport(RecordingTransport::default()).await
    }

    pub async fn with_transport(transport: RecordingTransport) -> Self {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let store = Arc::new(FlakyStore::new(Arc::clone(&db)));
        let transport = Arc::new(transport);
        let human = Arc::new(RecordingHuman::default());
        let config = test_config();
        let (trigger, nudges) = ProcessorTrigger::channel(config.nudge_capacity);

        let router = MessageRouter::new(
            store.clone(),
            db.clone(),
            db.clone(),
            human.clone(),
            trigger,
            config.clone(),
        );
        let processor = QueueProcessor::new(
            db.clone(),
            store.clone(),
            db.clone(),
            MessageSender::new(transport.clone()),
            human.clone(),
            config,
        );

        Self {
            db,
            store,
            transport,
            human,
            router,
            processor,
            nudges,
        }
    }

    pub async fn state(&self, phone: &str) -> Option<ConversationState> {
        self.db.get_state(phone).await.unwrap()
    }

    pub async fn sent_texts(&self) -> Vec<String> {
        self.transport
            .requests
            .lock()
            .await
            .iter()
            .filter_map(|r| r.body.get("message").and_then(|m| m.as_str()))
            .map(String::from)
            .collect()
    }
}
