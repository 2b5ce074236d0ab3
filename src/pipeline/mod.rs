//! Inbound message pipeline.
//!
//! Every webhook event flows through:
//! 1. `validator::validate()`: shape checks and phone canonicalization
//! 2. `MessageRouter::route()`: dedup, state lookup, bot-vs-human decision
//! 3. `QueueProcessor`: one engine turn per queued message, per contact in order
//!
//! Conversations leave automation only through a `human_handoff` job.

pub mod processor;
pub mod router;
pub mod types;
pub mod validator;

#[cfg(test)]
pub(crate) mod test_support;

pub use processor::{ContactLocks, ProcessorTrigger, QueueProcessor, SweepReport, spawn_processor_loop};
pub use router::MessageRouter;
pub use types::{InboundEvent, JobKind, RouteReceipt, RoutingOutcome};
pub use validator::{normalize_phone, validate, validate_body};
