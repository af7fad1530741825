//! Integration tests for the task WebSocket + REST surface.
//!
//! WebSocket tests spin up an Axum server on a random port and connect via
//! tokio-tungstenite; REST tests drive the router in-process with
//! `tower::ServiceExt::oneshot`. Both share one service instance per test.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tower::ServiceExt;

use taskpilot::api::task_routes;
use taskpilot::chat::{ChatRouter, WorkflowArbiter};
use taskpilot::config::EngineConfig;
use taskpilot::providers::stub::{
    RecordingSender, ScriptedDecomposer, ScriptedExecutor, ScriptedExtractor,
};
use taskpilot::providers::{
    DecomposeOutcome, Decomposition, DecompositionGoal, MessageDraft, StepOutcome,
};
use taskpilot::store::{Database, LibSqlBackend};
use taskpilot::tasks::service::TaskService;
use taskpilot::tasks::state::TaskStatus;

/// Maximum time any test is allowed to wait before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    service: Arc<TaskService>,
    sender: Arc<RecordingSender>,
    app: Router,
}

async fn harness(executor: ScriptedExecutor, decomposer: ScriptedDecomposer) -> Harness {
    let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let sender = Arc::new(RecordingSender::new());
    let executor = Arc::new(executor);
    let service = TaskService::new(
        EngineConfig {
            tick_interval: Duration::from_millis(20),
            ..Default::default()
        },
        store,
        Arc::clone(&executor) as Arc<dyn taskpilot::providers::StepExecutor>,
        Arc::clone(&sender) as Arc<dyn taskpilot::providers::MessageSender>,
    );
    let chat = Arc::new(ChatRouter::new(
        Arc::new(WorkflowArbiter::new()),
        Arc::new(decomposer),
        Arc::new(ScriptedExtractor::new()),
        executor,
        Arc::clone(&service),
    ));
    let app = task_routes(Arc::clone(&service), chat);
    Harness {
        service,
        sender,
        app,
    }
}

/// Start an Axum server on a random port, return its port.
async fn serve(app: Router) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

fn decomposition() -> Decomposition {
    Decomposition {
        title: "Dinner with Jeff".into(),
        goal: DecompositionGoal::Discrete {
            success_criterion: "event booked".into(),
        },
        steps: vec!["email Jeff".into(), "wait for reply".into()],
    }
}

fn parse_ws_json(msg: &Message) -> Value {
    match msg {
        Message::Text(txt) => serde_json::from_str(txt).expect("invalid JSON from server"),
        other => panic!("expected Text frame, got {other:?}"),
    }
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

// ── WebSocket ───────────────────────────────────────────────────────────

#[tokio::test]
async fn ws_connect_receives_empty_sync() {
    timeout(TEST_TIMEOUT, async {
        let h = harness(ScriptedExecutor::new(), ScriptedDecomposer::new()).await;
        let port = serve(h.app).await;

        let (mut ws, _resp) = connect_async(format!("ws://127.0.0.1:{port}/ws/tasks"))
            .await
            .expect("WS connect failed");

        let msg = ws.next().await.unwrap().unwrap();
        let json = parse_ws_json(&msg);

        assert_eq!(json["type"], "tasks_sync");
        assert!(json["tasks"].as_array().unwrap().is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_receives_task_updates() {
    timeout(TEST_TIMEOUT, async {
        let h = harness(ScriptedExecutor::new(), ScriptedDecomposer::new()).await;
        let service = Arc::clone(&h.service);
        let port = serve(h.app).await;

        let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}/ws/tasks"))
            .await
            .unwrap();
        let sync = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(sync["type"], "tasks_sync");

        let task = service
            .create_task(decomposition(), "set up dinner", None, false)
            .await
            .unwrap();

        let update = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(update["type"], "task_updated");
        assert_eq!(update["task"]["id"], task.id.to_string());
        assert_eq!(update["task"]["title"], "Dinner with Jeff");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_broadcasts_pending_message_added() {
    timeout(TEST_TIMEOUT, async {
        let executor = ScriptedExecutor::with_outcomes(vec![StepOutcome::RequestApproval {
            draft: MessageDraft {
                tool_name: "send_email".into(),
                platform: "email".into(),
                recipient: "jeff@x.com".into(),
                subject: None,
                body: "dinner?".into(),
            },
            memory: BTreeMap::new(),
        }]);
        let h = harness(executor, ScriptedDecomposer::new()).await;
        let service = Arc::clone(&h.service);
        let port = serve(h.app).await;

        let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}/ws/tasks"))
            .await
            .unwrap();
        ws.next().await.unwrap().unwrap(); // sync

        service
            .create_task(decomposition(), "dinner", None, false)
            .await
            .unwrap();

        // Scan the stream until the pending-message event shows up.
        loop {
            let json = parse_ws_json(&ws.next().await.unwrap().unwrap());
            if json["type"] == "pending_message_added" {
                assert_eq!(json["message"]["recipient"], "jeff@x.com");
                break;
            }
        }
    })
    .await
    .expect("test timed out");
}

// ── REST ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn rest_chat_creates_task_and_lists_it() {
    timeout(TEST_TIMEOUT, async {
        let h = harness(
            ScriptedExecutor::new(),
            ScriptedDecomposer::with_outcomes(vec![DecomposeOutcome::Task(decomposition())]),
        )
        .await;

        let response = h
            .app
            .clone()
            .oneshot(post_json(
                "/api/chat",
                serde_json::json!({
                    "conversation_id": "conv1",
                    "message": "set up dinner with Jeff"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["type"], "task_created");
        assert_eq!(json["task"]["original_request"], "set up dinner with Jeff");

        let response = h
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/tasks")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let listed = json_body(response).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn rest_approve_flow_with_edited_body() {
    timeout(TEST_TIMEOUT, async {
        let executor = ScriptedExecutor::with_outcomes(vec![StepOutcome::RequestApproval {
            draft: MessageDraft {
                tool_name: "send_email".into(),
                platform: "email".into(),
                recipient: "jeff@x.com".into(),
                subject: None,
                body: "original".into(),
            },
            memory: BTreeMap::new(),
        }]);
        let h = harness(executor, ScriptedDecomposer::new()).await;

        let task = h
            .service
            .create_task(decomposition(), "dinner", None, false)
            .await
            .unwrap();

        // Wait for the scheduler to run the first step and park the task.
        let parked = loop {
            let t = h.service.get_task(task.id).await.unwrap();
            if t.status == TaskStatus::WaitingApproval {
                break t;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        let mid = parked.pending_messages[0].id;

        let response = h
            .app
            .clone()
            .oneshot(post_json(
                &format!("/api/tasks/{}/messages/{}/approve", task.id, mid),
                serde_json::json!({"body": "edited text"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["status"], "waiting");
        assert!(json["pending_messages"].as_array().unwrap().is_empty());

        assert_eq!(h.sender.sent().await[0].body, "edited text");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn rest_cancel_and_hide() {
    timeout(TEST_TIMEOUT, async {
        let h = harness(ScriptedExecutor::new(), ScriptedDecomposer::new()).await;
        let task = h
            .service
            .create_task(decomposition(), "dinner", None, false)
            .await
            .unwrap();

        let response = h
            .app
            .clone()
            .oneshot(post_json(
                &format!("/api/tasks/{}/cancel", task.id),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        // Cancel can race the first scheduler fire; either the cancel wins or
        // the task is mid-step and cancel waits — both end in cancelled.
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["status"], "cancelled");

        let response = h
            .app
            .clone()
            .oneshot(post_json(
                &format!("/api/tasks/{}/hide", task.id),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = h
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/tasks")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let listed = json_body(response).await;
        assert!(listed.as_array().unwrap().is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn rest_unknown_task_is_404() {
    timeout(TEST_TIMEOUT, async {
        let h = harness(ScriptedExecutor::new(), ScriptedDecomposer::new()).await;
        let response = h
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/tasks/{}", uuid::Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = h
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/tasks/not-a-uuid")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    })
    .await
    .expect("test timed out");
}
