//! chatroute: inbound WhatsApp routing and conversation automation.

pub mod channels;
pub mod config;
pub mod error;
pub mod flow;
pub mod logging;
pub mod pipeline;
pub mod routes;
pub mod store;
