//! Shared types for the inbound pipeline.

use serde::{Deserialize, Serialize};

use crate::store::ConversationState;

/// The only event type that carries an inbound message to act on.
pub const MESSAGE_RECEIVED: &str = "message-received";

// ── Inbound event ───────────────────────────────────────────────────

/// A validated inbound webhook event. Field names match the wire format.
///
/// Phones in `data.from` / `data.to` are already canonical (digits only).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    pub event: String,
    pub instance_id: String,
    pub data: EventData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventData {
    pub message_id: String,
    pub from: String,
    pub to: String,
    pub text: TextBody,
    pub timestamp: i64,
    pub from_me: bool,
    #[serde(default)]
    pub sender_name: String,
    #[serde(default)]
    pub push_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBody {
    pub message: String,
}

impl InboundEvent {
    pub fn is_message_received(&self) -> bool {
        self.event == MESSAGE_RECEIVED
    }

    /// Canonical phone of the contact who sent the message.
    pub fn contact_phone(&self) -> &str {
        &self.data.from
    }

    pub fn message_id(&self) -> &str {
        &self.data.message_id
    }

    pub fn text(&self) -> &str {
        &self.data.text.message
    }

    /// Copy of this event with a replaced message body, as an inbound message.
    ///
    /// Used to synthesize the transfer event so a handoff shows up in the
    /// human queue like any other message from the contact.
    pub fn with_text(&self, message: impl Into<String>) -> Self {
        let mut event = self.clone();
        event.event = MESSAGE_RECEIVED.to_string();
        event.data.text.message = message.into();
        event.data.from_me = false;
        event
    }
}

// ── Routing outcome ─────────────────────────────────────────────────

/// What the router did with an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum RoutingOutcome {
    /// Not an inbound message from the contact (status event or echo).
    Ignored { reason: String },
    /// This `messageId` was already routed.
    Duplicate,
    /// Enqueued for the automation flow.
    Automation {
        job_id: String,
        new_conversation: bool,
    },
    /// Delivered to human support.
    Human { reason: String },
}

/// Returned to the webhook caller for every routed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteReceipt {
    pub correlation_id: String,
    #[serde(flatten)]
    pub outcome: RoutingOutcome,
}

// ── Job payloads ────────────────────────────────────────────────────

/// Tag of the work a queue job carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// One inbound message for the automation flow.
    ChatbotMessage,
    /// One event to deliver to human support.
    HumanHandoff,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChatbotMessage => "chatbot_message",
            Self::HumanHandoff => "human_handoff",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "chatbot_message" => Some(Self::ChatbotMessage),
            "human_handoff" => Some(Self::HumanHandoff),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a `chatbot_message` job.
///
/// Self-contained: the snapshot is what the router saw at enqueue time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatbotPayload {
    pub event: InboundEvent,
    pub state_snapshot: Option<ConversationState>,
}

/// Payload of a `human_handoff` job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffPayload {
    pub event: InboundEvent,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_event() -> InboundEvent {
        InboundEvent {
            event: MESSAGE_RECEIVED.into(),
            instance_id: "inst-1".into(),
            data: EventData {
                message_id: "msg-1".into(),
                from: "5511999990000".into(),
                to: "551130000000".into(),
                text: TextBody {
                    message: "oi".into(),
                },
                timestamp: 1_700_000_000,
                from_me: false,
                sender_name: "Ana".into(),
                push_name: "Ana S.".into(),
            },
        }
    }

    #[test]
    fn event_serializes_with_wire_field_names() {
        let json = serde_json::to_value(sample_event()).unwrap();
        assert_eq!(json["instanceId"], "inst-1");
        assert_eq!(json["data"]["messageId"], "msg-1");
        assert_eq!(json["data"]["fromMe"], false);
        assert_eq!(json["data"]["text"]["message"], "oi");
        assert_eq!(json["data"]["pushName"], "Ana S.");
    }

    #[test]
    fn with_text_keeps_identity_and_clears_from_me() {
        let mut original = sample_event();
        original.data.from_me = true;
        let synthesized = original.with_text("banner");
        assert_eq!(synthesized.text(), "banner");
        assert!(!synthesized.data.from_me);
        assert_eq!(synthesized.contact_phone(), original.contact_phone());
        assert_eq!(synthesized.message_id(), original.message_id());
    }

    #[test]
    fn receipt_flattens_outcome() {
        let receipt = RouteReceipt {
            correlation_id: "c-1".into(),
            outcome: RoutingOutcome::Automation {
                job_id: "j-1".into(),
                new_conversation: true,
            },
        };
        assert_eq!(
            serde_json::to_value(&receipt).unwrap(),
            json!({
                "correlationId": "c-1",
                "outcome": "automation",
                "jobId": "j-1",
                "newConversation": true
            })
        );
    }

    #[test]
    fn job_kind_roundtrip() {
        for kind in [JobKind::ChatbotMessage, JobKind::HumanHandoff] {
            assert_eq!(JobKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(JobKind::parse("bulk_campaign"), None);
    }
}
