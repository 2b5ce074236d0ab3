//! Integration tests for the HTTP surface.
//!
//! Each test spins up the axum router on a random port over an in-memory
//! database and calls it with reqwest. The processor is drained by hand so
//! every assertion sees a settled queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;

use chatroute::channels::{HumanSupport, MessageSender, OutboundRequest, Transport};
use chatroute::config::QueueConfig;
use chatroute::error::ChannelError;
use chatroute::flow::Stage;
use chatroute::pipeline::{InboundEvent, MessageRouter, ProcessorTrigger, QueueProcessor};
use chatroute::routes::{AppState, app_routes};
use chatroute::store::{ConversationStore, JobQueue, LibSqlBackend};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const PHONE: &str = "5511988887777";

#[derive(Default)]
struct StubTransport {
    sent: Mutex<Vec<OutboundRequest>>,
}

#[async_trait]
impl Transport for StubTransport {
    fn name(&self) -> &str {
        "stub"
    }

    async fn deliver(&self, request: &OutboundRequest) -> Result<(), ChannelError> {
        self.sent.lock().await.push(request.clone());
        Ok(())
    }
}

#[derive(Default)]
struct StubHuman {
    forwarded: Mutex<Vec<InboundEvent>>,
}

#[async_trait]
impl HumanSupport for StubHuman {
    async fn forward(&self, event: &InboundEvent) -> Result<(), ChannelError> {
        self.forwarded.lock().await.push(event.clone());
        Ok(())
    }
}

struct App {
    base: String,
    client: reqwest::Client,
    db: Arc<LibSqlBackend>,
    processor: QueueProcessor,
    transport: Arc<StubTransport>,
    human: Arc<StubHuman>,
    _nudges: mpsc::Receiver<()>,
}

async fn app() -> App {
    let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let transport = Arc::new(StubTransport::default());
    let human = Arc::new(StubHuman::default());
    let sender = MessageSender::new(transport.clone());
    let config = QueueConfig::default();
    let (trigger, nudges) = ProcessorTrigger::channel(config.nudge_capacity);

    let router = Arc::new(MessageRouter::new(
        db.clone(),
        db.clone(),
        db.clone(),
        human.clone(),
        trigger.clone(),
        config.clone(),
    ));
    let processor = QueueProcessor::new(
        db.clone(),
        db.clone(),
        db.clone(),
        sender.clone(),
        human.clone(),
        config,
    );

    let routes = app_routes(AppState {
        router,
        queue: db.clone(),
        sender,
        trigger,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, routes).await.unwrap();
    });

    App {
        base: format!("http://127.0.0.1:{port}"),
        client: reqwest::Client::new(),
        db,
        processor,
        transport,
        human,
        _nudges: nudges,
    }
}

fn inbound(message_id: &str, text: &str) -> Value {
    json!({
        "event": "message-received",
        "instanceId": "inst-1",
        "data": {
            "messageId": message_id,
            "from": "+55 (11) 98888-7777",
            "to": "551130000000",
            "text": { "message": text },
            "timestamp": 1_700_000_000,
            "fromMe": false,
            "senderName": "Maria"
        }
    })
}

impl App {
    async fn call(&self, method: Method, path: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = self.client.request(method, format!("{}{path}", self.base));
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.unwrap();
        let status = response.status();
        let bytes = response.bytes().await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }
}

#[tokio::test]
async fn greeting_opens_the_menu() {
    timeout(TEST_TIMEOUT, async {
        let app = app().await;

        let (status, body) = app.call(Method::POST, "/webhook", Some(inbound("wa-1", "oi"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "automation");
        assert_eq!(body["newConversation"], true);
        assert!(body["correlationId"].as_str().is_some_and(|c| !c.is_empty()));

        let report = app.processor.drain().await;
        assert_eq!(report.completed, 1);

        let state = app.db.get_state(PHONE).await.unwrap().unwrap();
        assert_eq!(state.current_stage, Stage::AwaitingOption);
        assert_eq!(state.last_message_id.as_deref(), Some("wa-1"));

        let sent = app.transport.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].endpoint, "send-text");
        assert_eq!(sent[0].body["phone"], PHONE);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn choosing_an_attendant_hands_off() {
    timeout(TEST_TIMEOUT, async {
        let app = app().await;

        app.call(Method::POST, "/webhook", Some(inbound("wa-1", "oi"))).await;
        app.processor.drain().await;
        let (status, body) = app.call(Method::POST, "/webhook", Some(inbound("wa-2", "3"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["newConversation"], false);
        app.processor.drain().await;

        assert!(app.db.get_state(PHONE).await.unwrap().is_none());
        let forwarded = app.human.forwarded.lock().await;
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].contact_phone(), PHONE);

        let counts = app.db.queue_counts().await.unwrap();
        assert_eq!(counts.done, 3);
        assert_eq!(counts.pending + counts.processing + counts.failed, 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn malformed_payload_lists_every_problem() {
    timeout(TEST_TIMEOUT, async {
        let app = app().await;
        let payload = json!({
            "event": "message-received",
            "instanceId": "inst-1",
            "data": { "messageId": "wa-1", "from": "abc", "fromMe": false }
        });

        let (status, body) = app.call(Method::POST, "/webhook", Some(payload)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid payload");
        assert!(body["problems"].as_array().unwrap().len() >= 3);
        assert_eq!(app.db.queue_counts().await.unwrap().pending, 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn non_json_webhook_body_is_a_validation_error() {
    timeout(TEST_TIMEOUT, async {
        let app = app().await;

        let response = app
            .client
            .post(format!("{}/webhook", app.base))
            .header("content-type", "text/plain")
            .body("event=message-received")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"], "invalid payload");
        let problems = body["problems"].as_array().unwrap();
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0]["field"], "$");
        assert_eq!(app.db.queue_counts().await.unwrap().pending, 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn redelivered_webhook_is_acknowledged_once() {
    timeout(TEST_TIMEOUT, async {
        let app = app().await;

        app.call(Method::POST, "/webhook", Some(inbound("wa-1", "oi"))).await;
        let (status, body) = app.call(Method::POST, "/webhook", Some(inbound("wa-1", "oi"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "duplicate");
        assert_eq!(app.db.queue_counts().await.unwrap().pending, 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn status_events_are_ignored() {
    timeout(TEST_TIMEOUT, async {
        let app = app().await;
        let payload = json!({ "event": "message-status", "instanceId": "inst-1", "data": {} });

        let (status, body) = app.call(Method::POST, "/webhook", Some(payload)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "ignored");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn process_trigger_always_succeeds() {
    timeout(TEST_TIMEOUT, async {
        let app = app().await;

        let (status, body) = app
            .call(
                Method::POST,
                "/queue/process",
                Some(json!({ "trigger": "manual" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let (status, _) = app.call(Method::POST, "/queue/process", None).await;
        assert_eq!(status, StatusCode::OK);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn retrying_an_unknown_job_is_not_found() {
    timeout(TEST_TIMEOUT, async {
        let app = app().await;

        let (status, _) = app.call(Method::POST, "/queue/failed/nope/retry", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = app.call(Method::GET, "/queue/failed", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn console_send_validates_the_intent() {
    timeout(TEST_TIMEOUT, async {
        let app = app().await;

        let (status, _) = app
            .call(
                Method::POST,
                "/messages/send",
                Some(json!({ "type": "sticker", "phone": PHONE, "data": {} })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = app
            .call(
                Method::POST,
                "/messages/send",
                Some(json!({ "type": "image", "phone": PHONE, "data": { "image": "https://x/y.png" } })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = app
            .call(
                Method::POST,
                "/messages/send",
                Some(json!({ "type": "text", "phone": "+55 11 98888-7777", "data": { "message": "Olá" } })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let sent = app.transport.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].body, json!({ "phone": PHONE, "message": "Olá" }));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn health_reports_queue_counts() {
    timeout(TEST_TIMEOUT, async {
        let app = app().await;
        app.call(Method::POST, "/webhook", Some(inbound("wa-1", "oi"))).await;

        let (status, body) = app.call(Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "chatroute");
        assert_eq!(body["queue"]["pending"], 1);
    })
    .await
    .expect("test timed out");
}
