//! Structured logging setup and correlated pipeline spans.
//!
//! Every inbound event and every queue job runs inside a [`pipeline_span`], so
//! each log line carries the component, correlation id, contact phone and
//! (once known) the conversation stage.

use tracing::{Span, field};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use crate::config::{LogFormat, LoggingConfig};

/// Component names used as the `component` span field.
pub mod component {
    pub const ROUTER: &str = "router";
    pub const PROCESSOR: &str = "processor";
    pub const SENDER: &str = "sender";
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured filter. The returned guard flushes the
/// file writer and must be held for the life of the process.
pub fn init(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let (writer, guard) = match &config.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "chatroute.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(writer);

    let installed = match config.format {
        LogFormat::Json => builder
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .try_init(),
        LogFormat::Pretty => builder.try_init(),
    };
    if let Err(e) = installed {
        eprintln!("Logging already initialized: {e}");
    }

    guard
}

/// Span for one unit of pipeline work.
///
/// `phone` and `stage` start empty; fill them with [`record_phone`] and
/// [`record_stage`] once validation and state lookup have run.
pub fn pipeline_span(component: &'static str, correlation_id: &str, phone: Option<&str>) -> Span {
    let span = tracing::info_span!(
        "pipeline",
        component,
        correlation_id = %correlation_id,
        phone = field::Empty,
        stage = field::Empty,
    );
    if let Some(phone) = phone {
        record_phone(&span, phone);
    }
    span
}

pub fn record_phone(span: &Span, phone: &str) {
    span.record("phone", phone);
}

pub fn record_stage(span: &Span, stage: impl std::fmt::Display) {
    span.record("stage", field::display(stage));
}
