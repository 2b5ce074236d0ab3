//! Persistence layer: libSQL-backed conversation state, job queue and
//! message ledger.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    ConversationState, ConversationStore, JobQueue, JobStatus, MessageLedger, NackOutcome, NewJob,
    QueueCounts, QueueJob,
};
