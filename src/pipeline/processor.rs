//! Queue processor: claims jobs and runs them against the current
//! conversation state.
//!
//! Jobs in a batch are grouped by contact. Each group runs in queue order;
//! groups run concurrently. A per-contact lock covers overlapping sweeps in
//! this process and the versioned save covers other processes. When a job is
//! requeued, the rest of its group goes back to the queue unattempted.
//!
//! A `chatbot_message` job:
//! 1. Reads the contact's current state. Without one, the snapshot and any
//!    handoff enqueued after the job decide between a fresh start and an
//!    already handed-off contact
//! 2. Runs one engine turn
//! 3. Saves the new state, or deletes it and enqueues a `human_handoff` job
//!    in one atomic write
//! 4. Sends the turn's messages; send failures never revert the state

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};

use crate::channels::{HumanSupport, MessageSender};
use crate::config::QueueConfig;
use crate::error::PipelineError;
use crate::flow::{Context, ConversationEngine, Handoff, TurnOutcome, context_keys, prompts};
use crate::logging::{self, component};
use crate::pipeline::types::{ChatbotPayload, HandoffPayload, InboundEvent, JobKind};
use crate::store::{
    ConversationState, ConversationStore, JobQueue, MessageLedger, NackOutcome, NewJob, QueueJob,
};

/// Upper bound on back-to-back sweeps per wake-up.
const MAX_SWEEPS_PER_WAKE: usize = 50;

// ── Nudge ───────────────────────────────────────────────────────────

/// Fire-and-forget wake-up for the processor loop.
#[derive(Clone)]
pub struct ProcessorTrigger {
    tx: mpsc::Sender<()>,
}

impl ProcessorTrigger {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Request a sweep. Never blocks; returns whether a new wake-up was queued.
    pub fn nudge(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) => {
                debug!("Processor nudge skipped, sweep already pending");
                false
            }
            Err(TrySendError::Closed(())) => {
                debug!("Processor loop not running, nudge dropped");
                false
            }
        }
    }
}

// ── Per-contact locks ───────────────────────────────────────────────

/// One async mutex per contact phone.
#[derive(Clone, Default)]
pub struct ContactLocks {
    inner: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl ContactLocks {
    pub async fn lock(&self, phone: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let mutex = {
            let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            Arc::clone(map.entry(phone.to_string()).or_default())
        };
        mutex.lock_owned().await
    }

    /// Drop locks nobody holds or waits on.
    pub fn release_idle(&self) {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        map.retain(|_, mutex| Arc::strong_count(mutex) > 1);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Processor ───────────────────────────────────────────────────────

/// Totals of one or more sweeps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub claimed: usize,
    pub completed: usize,
    pub requeued: usize,
    pub failed: usize,
    /// Claimed but handed back unattempted behind a requeued job.
    pub released: usize,
}

impl SweepReport {
    fn add(&mut self, other: SweepReport) {
        self.claimed += other.claimed;
        self.completed += other.completed;
        self.requeued += other.requeued;
        self.failed += other.failed;
        self.released += other.released;
    }
}

/// Final disposition of one job in a sweep.
enum JobResult {
    Completed,
    Requeued,
    Failed,
    /// Ack or nack itself failed; the lease will expire and redeliver.
    Unsettled,
    /// Not attempted because an earlier job of the contact did not settle.
    Released,
}

/// Decoded job payload.
enum Work {
    Chatbot(ChatbotPayload),
    Handoff(HandoffPayload),
}

impl Work {
    fn event(&self) -> &InboundEvent {
        match self {
            Self::Chatbot(p) => &p.event,
            Self::Handoff(p) => &p.event,
        }
    }
}

fn decode(job: &QueueJob) -> Result<Work, PipelineError> {
    let payload_err = |reason: String| PipelineError::Payload {
        job_id: job.id.clone(),
        reason,
    };
    match JobKind::parse(&job.message_type) {
        Some(JobKind::ChatbotMessage) => serde_json::from_value(job.payload.clone())
            .map(Work::Chatbot)
            .map_err(|e| payload_err(e.to_string())),
        Some(JobKind::HumanHandoff) => serde_json::from_value(job.payload.clone())
            .map(Work::Handoff)
            .map_err(|e| payload_err(e.to_string())),
        None => Err(payload_err(format!(
            "unknown message type {}",
            job.message_type
        ))),
    }
}

/// Drives queued jobs through the conversation engine.
pub struct QueueProcessor {
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn ConversationStore>,
    ledger: Arc<dyn MessageLedger>,
    sender: MessageSender,
    human: Arc<dyn HumanSupport>,
    engine: ConversationEngine,
    config: QueueConfig,
    locks: ContactLocks,
}

impl QueueProcessor {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn ConversationStore>,
        ledger: Arc<dyn MessageLedger>,
        sender: MessageSender,
        human: Arc<dyn HumanSupport>,
        config: QueueConfig,
    ) -> Self {
        Self {
            queue,
            store,
            ledger,
            sender,
            human,
            engine: ConversationEngine::new(),
            config,
            locks: ContactLocks::default(),
        }
    }

    /// Claim one batch and process it.
    pub async fn run_once(&self) -> SweepReport {
        let jobs = match self
            .queue
            .dequeue(self.config.batch_size, self.config.visibility_timeout)
            .await
        {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "Failed to dequeue jobs");
                return SweepReport::default();
            }
        };

        let mut report = SweepReport {
            claimed: jobs.len(),
            ..Default::default()
        };
        if jobs.is_empty() {
            return report;
        }
        debug!(count = jobs.len(), "Processing job batch");

        let groups = group_by_contact(jobs);
        let results = join_all(
            groups
                .into_iter()
                .map(|(phone, jobs)| self.process_group(phone, jobs)),
        )
        .await;

        for result in results.into_iter().flatten() {
            match result {
                JobResult::Completed => report.completed += 1,
                JobResult::Requeued => report.requeued += 1,
                JobResult::Failed => report.failed += 1,
                JobResult::Released => report.released += 1,
                JobResult::Unsettled => {}
            }
        }
        self.locks.release_idle();

        info!(
            claimed = report.claimed,
            completed = report.completed,
            requeued = report.requeued,
            failed = report.failed,
            released = report.released,
            "Batch processing complete"
        );
        report
    }

    /// Sweep until nothing is available (bounded).
    pub async fn drain(&self) -> SweepReport {
        let mut total = SweepReport::default();
        for _ in 0..MAX_SWEEPS_PER_WAKE {
            let report = self.run_once().await;
            total.add(report);
            if report.claimed == 0 {
                break;
            }
        }
        total
    }

    /// Remove ledger entries past the retention window.
    pub async fn prune_ledger(&self) {
        if let Err(e) = self
            .ledger
            .prune_messages(self.config.ledger_retention)
            .await
        {
            warn!(error = %e, "Failed to prune message ledger");
        }
    }

    async fn process_group(
        &self,
        phone: String,
        jobs: Vec<(QueueJob, Result<Work, PipelineError>)>,
    ) -> Vec<JobResult> {
        let _guard = self.locks.lock(&phone).await;
        let mut results = Vec::with_capacity(jobs.len());
        let mut jobs = jobs.into_iter();
        while let Some((job, work)) = jobs.next() {
            let span =
                logging::pipeline_span(component::PROCESSOR, &job.correlation_id, Some(phone.as_str()));
            let result = self.process_job(job, work).instrument(span).await;
            let halt = matches!(result, JobResult::Requeued | JobResult::Unsettled);
            results.push(result);

            if halt {
                // Later turns of this contact must wait for the retried one.
                for (job, _) in jobs.by_ref() {
                    results.push(self.release_job(&job).await);
                }
                break;
            }
        }
        results
    }

    async fn release_job(&self, job: &QueueJob) -> JobResult {
        match self.queue.release(&job.id).await {
            Ok(()) => {
                debug!(job_id = %job.id, "Job released behind a retried predecessor");
                JobResult::Released
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Failed to release job; it returns when its lease expires");
                JobResult::Unsettled
            }
        }
    }

    async fn process_job(&self, job: QueueJob, work: Result<Work, PipelineError>) -> JobResult {
        let work = match work {
            Ok(work) => work,
            Err(e) => return self.fail_job(&job, e, None).await,
        };
        let outcome = match &work {
            Work::Chatbot(payload) => self.handle_chatbot(&job, payload).await,
            Work::Handoff(payload) => self.handle_handoff(&job, payload).await,
        };

        match outcome {
            Ok(()) => match self.queue.ack(&job.id).await {
                Ok(()) => {
                    debug!(job_id = %job.id, "Job completed");
                    JobResult::Completed
                }
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "Failed to ack job");
                    JobResult::Unsettled
                }
            },
            Err(e) => self.fail_job(&job, e, Some(work)).await,
        }
    }

    async fn fail_job(&self, job: &QueueJob, err: PipelineError, work: Option<Work>) -> JobResult {
        let delay = self.config.backoff_for(job.attempts + 1);
        match self.queue.nack(&job.id, &err.to_string(), delay).await {
            Ok(NackOutcome::Requeued { attempts }) => {
                warn!(
                    job_id = %job.id,
                    attempts,
                    retry_in_secs = delay.as_secs(),
                    error = %err,
                    "Job failed, will retry"
                );
                JobResult::Requeued
            }
            Ok(NackOutcome::Failed { attempts }) => {
                error!(
                    job_id = %job.id,
                    message_type = %job.message_type,
                    attempts,
                    error = %err,
                    "Job exhausted its retries"
                );
                if let Some(Work::Chatbot(payload)) = work {
                    self.escalate(job, &payload.event).await;
                }
                JobResult::Failed
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to nack job");
                JobResult::Unsettled
            }
        }
    }

    async fn handle_chatbot(
        &self,
        job: &QueueJob,
        payload: &ChatbotPayload,
    ) -> Result<(), PipelineError> {
        let event = &payload.event;
        let phone = event.contact_phone();

        let current = self
            .store
            .get_state(phone)
            .await
            .map_err(PipelineError::StateLookup)?;

        let state = match current {
            Some(state) => state,
            None => {
                let handed_off = match &payload.state_snapshot {
                    Some(_) => true,
                    // Routed before an earlier message of the contact was transferred.
                    None => self
                        .queue
                        .has_later_job(phone, JobKind::HumanHandoff.as_str(), job.seq)
                        .await
                        .map_err(PipelineError::StateLookup)?,
                };
                if !handed_off {
                    ConversationState::new(phone)
                } else {
                    info!(
                        job_id = %job.id,
                        "Conversation already handed off, routing message to human support"
                    );
                    let handoff = self.handoff_job(
                        &job.correlation_id,
                        event.clone(),
                        prompts::REASON_ALREADY_TRANSFERRED,
                    )?;
                    self.queue
                        .enqueue(handoff)
                        .await
                        .map_err(PipelineError::Enqueue)?;
                    return Ok(());
                }
            }
        };

        if state.last_message_id.as_deref() == Some(event.message_id()) {
            info!(job_id = %job.id, message_id = %event.message_id(), "Turn already applied");
            return Ok(());
        }

        let span = tracing::Span::current();
        logging::record_stage(&span, state.current_stage);

        let turn = self
            .engine
            .advance(state.current_stage, &state.context, phone, event.text());

        match turn.outcome {
            TurnOutcome::Continue(next_stage) => {
                let from_stage = state.current_stage;
                let next = ConversationState {
                    current_stage: next_stage,
                    context: turn.context,
                    last_message_id: Some(event.message_id().to_string()),
                    ..state
                };
                self.store
                    .save_state(&next)
                    .await
                    .map_err(PipelineError::StatePersist)?;
                info!(
                    job_id = %job.id,
                    from = %from_stage,
                    to = %next_stage,
                    "Conversation advanced"
                );

                let report = self.sender.send_all(&turn.intents).await;
                if !report.all_sent() {
                    warn!(
                        job_id = %job.id,
                        failed = report.failures.len(),
                        "Some replies were not delivered; state kept"
                    );
                }
            }
            TurnOutcome::Transfer(handoff) => {
                let banner = prompts::transfer_banner(&handoff, &turn.context, event.text());
                let handoff_job =
                    self.handoff_job(&job.correlation_id, event.with_text(banner), &handoff.reason)?;
                self.store
                    .transfer_to_human(phone, handoff_job)
                    .await
                    .map_err(PipelineError::StatePersist)?;
                info!(
                    job_id = %job.id,
                    reason = %handoff.reason,
                    department = handoff.department.as_deref().unwrap_or(""),
                    "Conversation transferred to human support"
                );
            }
        }
        Ok(())
    }

    async fn handle_handoff(
        &self,
        job: &QueueJob,
        payload: &HandoffPayload,
    ) -> Result<(), PipelineError> {
        self.human
            .forward(&payload.event)
            .await
            .map_err(PipelineError::HumanForward)?;
        info!(job_id = %job.id, reason = %payload.reason, "Delivered to human support");
        Ok(())
    }

    /// Build the `human_handoff` job for `event`.
    ///
    /// The id is derived from the message id, so handing the same message over
    /// again never reaches human support twice.
    fn handoff_job(
        &self,
        correlation_id: &str,
        event: InboundEvent,
        reason: &str,
    ) -> Result<NewJob, PipelineError> {
        let id = format!("handoff-{}", event.message_id());
        let phone = event.contact_phone().to_string();
        let metadata = json!({
            "phone": phone,
            "messageId": event.message_id(),
            "reason": reason,
        });
        let payload = HandoffPayload {
            event,
            reason: reason.to_string(),
        };
        let payload = serde_json::to_value(&payload).map_err(|e| PipelineError::Payload {
            job_id: String::new(),
            reason: e.to_string(),
        })?;

        Ok(NewJob::new(correlation_id, JobKind::HumanHandoff.as_str(), payload)
            .with_id(id)
            .with_priority(self.config.handoff_priority)
            .with_max_attempts(self.config.max_attempts)
            .with_metadata(metadata)
            .for_contact(phone))
    }

    /// Hand a contact whose automation keeps failing to a person.
    async fn escalate(&self, job: &QueueJob, event: &InboundEvent) {
        let phone = event.contact_phone();
        let mut context = match self.store.get_state(phone).await {
            Ok(Some(state)) => state.context,
            _ => Context::new(),
        };

        let handoff = Handoff::new(prompts::REASON_AUTOMATION_FAILURE);
        context.insert(
            context_keys::TRANSFER_REASON.to_string(),
            json!(handoff.reason),
        );

        let banner = prompts::transfer_banner(&handoff, &context, event.text());
        let handoff_job =
            match self.handoff_job(&job.correlation_id, event.with_text(banner), &handoff.reason) {
                Ok(handoff_job) => handoff_job,
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "Failed to build escalation handoff");
                    return;
                }
            };
        match self.store.transfer_to_human(phone, handoff_job).await {
            Ok(handoff_job) => {
                warn!(job_id = %job.id, handoff_job = %handoff_job, "Contact escalated to human support");
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to escalate contact to human support");
            }
        }
    }
}

/// Group jobs by contact phone, keeping queue order within and across groups.
fn group_by_contact(
    jobs: Vec<QueueJob>,
) -> Vec<(String, Vec<(QueueJob, Result<Work, PipelineError>)>)> {
    let mut groups: Vec<(String, Vec<(QueueJob, Result<Work, PipelineError>)>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for job in jobs {
        let work = decode(&job);
        let phone = match &work {
            Ok(work) => work.event().contact_phone().to_string(),
            // Undecodable jobs touch no contact; keep them apart.
            Err(_) => format!("job:{}", job.id),
        };
        let slot = *index.entry(phone.clone()).or_insert_with(|| {
            groups.push((phone, Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push((job, work));
    }
    groups
}

/// Run the processor on an interval plus router nudges.
///
/// The interval sweep also prunes the message ledger.
pub fn spawn_processor_loop(
    processor: Arc<QueueProcessor>,
    mut nudges: mpsc::Receiver<()>,
) -> JoinHandle<()> {
    let sweep_interval: Duration = processor.config.sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut nudges_open = true;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    processor.drain().await;
                    processor.prune_ledger().await;
                }
                nudge = nudges.recv(), if nudges_open => {
                    match nudge {
                        Some(()) => {
                            processor.drain().await;
                        }
                        None => {
                            debug!("Nudge channel closed, continuing with interval sweeps");
                            nudges_open = false;
                        }
                    }
                }
            }
        }
    })
}
