//! Conversational automation flow.
//!
//! A contact's automation state is a [`Stage`] plus a cumulative [`Context`].
//! The [`ConversationEngine`] advances it one inbound message at a time and
//! decides when the conversation is handed to a human.

pub mod engine;
pub mod prompts;
pub mod stage;

pub use engine::{Context, ConversationEngine, Handoff, Turn, TurnOutcome, context_keys};
pub use stage::Stage;
