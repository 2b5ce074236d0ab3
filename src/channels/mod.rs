//! Outbound channels: the WhatsApp transport and the human-support console.

pub mod human;
pub mod intent;
pub mod sender;
pub mod whatsapp;

pub use human::{HttpHumanSupport, HumanSupport};
pub use intent::{MessageIntent, MessageType};
pub use sender::{MessageSender, OutboundRequest, SendReport, Transport};
pub use whatsapp::WhatsAppTransport;
