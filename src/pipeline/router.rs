//! Bot-vs-human routing of validated inbound events.
//!
//! Flow:
//! 1. Discard status events and our own outbound echoes
//! 2. Record the `messageId` in the ledger; a repeat is a duplicate delivery
//! 3. Look up the contact's conversation state
//! 4. Enqueue a `chatbot_message` job and nudge the processor, or forward the
//!    event to human support when the state store is unavailable

use std::sync::Arc;

use serde_json::json;
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

use crate::channels::HumanSupport;
use crate::config::QueueConfig;
use crate::error::PipelineError;
use crate::logging::{self, component};
use crate::pipeline::processor::ProcessorTrigger;
use crate::pipeline::types::{ChatbotPayload, InboundEvent, JobKind, RouteReceipt, RoutingOutcome};
use crate::store::{ConversationStore, JobQueue, MessageLedger, NewJob};

/// Reason given when the state store cannot be read.
pub const REASON_STATE_UNAVAILABLE: &str = "state lookup failed";

/// Routes validated events to the automation queue or to human support.
pub struct MessageRouter {
    store: Arc<dyn ConversationStore>,
    queue: Arc<dyn JobQueue>,
    ledger: Arc<dyn MessageLedger>,
    human: Arc<dyn HumanSupport>,
    trigger: ProcessorTrigger,
    config: QueueConfig,
}

impl MessageRouter {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        queue: Arc<dyn JobQueue>,
        ledger: Arc<dyn MessageLedger>,
        human: Arc<dyn HumanSupport>,
        trigger: ProcessorTrigger,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            queue,
            ledger,
            human,
            trigger,
            config,
        }
    }

    /// Route one event. Ignored and duplicate events are successes.
    pub async fn route(&self, event: InboundEvent) -> Result<RouteReceipt, PipelineError> {
        let correlation_id = Uuid::new_v4().to_string();
        let span = logging::pipeline_span(
            component::ROUTER,
            &correlation_id,
            Some(event.contact_phone()),
        );

        let outcome = self
            .route_inner(&correlation_id, event)
            .instrument(span)
            .await?;

        Ok(RouteReceipt {
            correlation_id,
            outcome,
        })
    }

    async fn route_inner(
        &self,
        correlation_id: &str,
        event: InboundEvent,
    ) -> Result<RoutingOutcome, PipelineError> {
        if !event.is_message_received() {
            debug!(event = %event.event, "Ignoring non-message event");
            return Ok(RoutingOutcome::Ignored {
                reason: format!("event type {}", event.event),
            });
        }
        if event.data.from_me {
            debug!(message_id = %event.message_id(), "Ignoring outbound echo");
            return Ok(RoutingOutcome::Ignored {
                reason: "sent by this account".to_string(),
            });
        }

        let recorded = match self
            .ledger
            .record_message(event.message_id(), event.contact_phone(), correlation_id)
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                info!(message_id = %event.message_id(), "Duplicate delivery ignored");
                return Ok(RoutingOutcome::Duplicate);
            }
            Err(e) => {
                warn!(error = %e, "Message ledger unavailable, routing without deduplication");
                false
            }
        };

        let message_id = event.message_id().to_string();
        let result = self.dispatch(correlation_id, event).await;

        if result.is_err() && recorded {
            // Let the platform's redelivery through.
            if let Err(e) = self.ledger.forget_message(&message_id).await {
                warn!(error = %e, message_id = %message_id, "Failed to release ledger entry");
            }
        }
        result
    }

    async fn dispatch(
        &self,
        correlation_id: &str,
        event: InboundEvent,
    ) -> Result<RoutingOutcome, PipelineError> {
        let phone = event.contact_phone().to_string();
        let message_id = event.message_id().to_string();

        let snapshot = match self.store.get_state(&phone).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let e = PipelineError::StateLookup(e);
                warn!(error = %e, "Routing to human support");
                return self.forward_to_human(&event, REASON_STATE_UNAVAILABLE).await;
            }
        };

        let new_conversation = snapshot.is_none();
        if let Some(state) = &snapshot {
            logging::record_stage(&tracing::Span::current(), state.current_stage);
        }

        let payload = ChatbotPayload {
            event,
            state_snapshot: snapshot,
        };
        let payload = serde_json::to_value(&payload).map_err(|e| PipelineError::Payload {
            job_id: String::new(),
            reason: e.to_string(),
        })?;

        let job = NewJob::new(correlation_id, JobKind::ChatbotMessage.as_str(), payload)
            .with_priority(self.config.default_priority)
            .with_max_attempts(self.config.max_attempts)
            .with_metadata(json!({ "phone": phone, "messageId": message_id }))
            .for_contact(phone.as_str());

        let job_id = self.queue.enqueue(job).await.map_err(|e| {
            error!(error = %e, "Failed to enqueue job");
            PipelineError::Enqueue(e)
        })?;

        self.trigger.nudge();
        info!(
            job_id = %job_id,
            new_conversation,
            "Routed to automation"
        );

        Ok(RoutingOutcome::Automation {
            job_id,
            new_conversation,
        })
    }

    async fn forward_to_human(
        &self,
        event: &InboundEvent,
        reason: &str,
    ) -> Result<RoutingOutcome, PipelineError> {
        self.human.forward(event).await.map_err(|e| {
            error!(error = %e, "Human support forward failed");
            PipelineError::HumanForward(e)
        })?;
        info!(reason, "Routed to human support");
        Ok(RoutingOutcome::Human {
            reason: reason.to_string(),
        })
    }
}
