use std::sync::Arc;

use anyhow::Context;
use axum::http::StatusCode;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use chatroute::channels::{HttpHumanSupport, MessageSender, WhatsAppTransport};
use chatroute::config::AppConfig;
use chatroute::logging;
use chatroute::pipeline::{MessageRouter, ProcessorTrigger, QueueProcessor, spawn_processor_loop};
use chatroute::routes::{AppState, app_routes};
use chatroute::store::LibSqlBackend;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("loading configuration")?;
    let _log_guard = logging::init(&config.logging);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %config.server.bind_addr,
        db = %config.store.db_path.display(),
        "Starting chatroute"
    );

    // ── Database ─────────────────────────────────────────────────────────
    let db = Arc::new(
        LibSqlBackend::new_local(&config.store.db_path)
            .await
            .with_context(|| format!("opening database at {}", config.store.db_path.display()))?,
    );

    // ── Outbound channels ────────────────────────────────────────────────
    let transport = WhatsAppTransport::new(&config.transport).context("building WhatsApp client")?;
    let sender = MessageSender::new(Arc::new(transport));
    let human = Arc::new(
        HttpHumanSupport::new(&config.human_support).context("building human support client")?,
    );

    // ── Pipeline ─────────────────────────────────────────────────────────
    let (trigger, nudges) = ProcessorTrigger::channel(config.queue.nudge_capacity);

    let router = Arc::new(MessageRouter::new(
        db.clone(),
        db.clone(),
        db.clone(),
        human.clone(),
        trigger.clone(),
        config.queue.clone(),
    ));
    let processor = Arc::new(QueueProcessor::new(
        db.clone(),
        db.clone(),
        db.clone(),
        sender.clone(),
        human,
        config.queue.clone(),
    ));
    let _processor_handle = spawn_processor_loop(processor, nudges);

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = app_routes(AppState {
        router,
        queue: db,
        sender,
        trigger,
    })
    .layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(TimeoutLayer::with_status_code(
                StatusCode::REQUEST_TIMEOUT,
                config.server.request_timeout,
            )),
    );

    let listener = tokio::net::TcpListener::bind(config.server.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.server.bind_addr))?;
    tracing::info!(addr = %config.server.bind_addr, "HTTP server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown requested");
        })
        .await
        .context("serving HTTP")?;

    Ok(())
}
