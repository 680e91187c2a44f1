//! HTTP and WebSocket surface tests
//!
//! Requests go through the fully layered router, so request ids, identity
//! and the admin key check are exercised the same way as in production.

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use roundhouse::api::ApiServer;
use roundhouse::games::types::{BettorId, ModeId};
use roundhouse::{EngineBuilder, EngineConfig, GameEngine};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tower::ServiceExt;

const ADMIN_KEY: &str = "let-me-in";

async fn setup(admin_key: Option<&str>) -> (Arc<GameEngine>, Router) {
    let mut config = EngineConfig::testing();
    config.server.admin_key = admin_key.map(str::to_string);
    let server_config = config.server.clone();
    let engine = EngineBuilder::new(config).build().await.expect("engine should build");
    let app = ApiServer::new(server_config, engine.clone()).app();
    (engine, app)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, bettor: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(bettor) = bettor {
        builder = builder.header("x-bettor-id", bettor);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn test_health_and_mode_listing() {
    let (_, app) = setup(None).await;

    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "Running");
    assert_eq!(body["modes"], 2);

    let (status, body) = send(&app, get("/api/modes")).await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = body["modes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["30", "aviator"]);

    let (status, body) = send(&app, get("/api/modes/30/state")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["mode"], "30");
    assert!(body["live"]["period"].is_u64());

    let (status, body) = send(&app, get("/api/modes/nope/state")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let (_, app) = setup(None).await;
    let request = Request::builder()
        .uri("/health")
        .header("x-request-id", "req-42")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.headers()["x-request-id"], "req-42");
}

#[tokio::test]
async fn test_place_wager_over_http() {
    let (engine, app) = setup(None).await;

    let (status, body) = send(
        &app,
        post_json("/api/wagers", Some("alice"), json!({"mode": "30", "bucket": "red", "amount": 100})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["wager"]["bucket"], "Red");
    assert_eq!(body["wager"]["status"], "pending");
    assert_eq!(body["balance"], engine.config().accounts.opening_balance - 100);

    let (status, body) = send(
        &app,
        Request::builder()
            .uri("/api/wagers/mine")
            .header("x-bettor-id", "alice")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["wagers"].as_array().unwrap().len(), 1);

    let stakes = engine.live_stakes(&ModeId::new("30")).await.unwrap();
    assert_eq!(stakes.total_amount(), 100);
}

#[tokio::test]
async fn test_wager_rejections_carry_reason_codes() {
    let (_, app) = setup(None).await;

    let (status, body) = send(
        &app,
        post_json("/api/wagers", None, json!({"mode": "30", "bucket": "Red", "amount": 100})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");
    assert!(body["request_id"].is_string());

    let (status, body) = send(
        &app,
        post_json("/api/wagers", Some("alice"), json!({"mode": "30", "bucket": "purple", "amount": 100})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "INVALID_BUCKET");

    let (status, body) = send(
        &app,
        post_json("/api/wagers", Some("alice"), json!({"mode": "30", "bucket": "Big", "amount": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "BELOW_MINIMUM");

    let (status, body) = send(
        &app,
        post_json("/api/wagers", Some("alice"), json!({"mode": "60", "bucket": "Big", "amount": 100})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_admin_routes_require_key() {
    let (_, app) = setup(Some(ADMIN_KEY)).await;

    let (status, body) = send(&app, get("/api/admin/reconciliation")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");

    let request = Request::builder()
        .uri("/api/admin/reconciliation")
        .header("x-api-key", ADMIN_KEY)
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["failed_rounds"], json!([]));

    // Public routes stay open
    let (status, _) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_admin_override_and_settings() {
    let (engine, app) = setup(None).await;
    let period = engine.state(&ModeId::new("30")).unwrap().live.unwrap().period;

    let request = Request::builder()
        .method("PUT")
        .uri("/api/admin/modes/30/settings")
        .header("content-type", "application/json")
        .body(Body::from(json!({"max_wager": 500}).to_string()))
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["staged"]["max_wager"], 500);

    let request = Request::builder()
        .method("PUT")
        .uri("/api/admin/modes/30/settings")
        .header("content-type", "application/json")
        .body(Body::from("{}"))
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app,
        post_json("/api/admin/modes/30/override", None, json!({"number": 8, "period": period})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["forced"], true);
    assert!(body["next_period"].as_u64().unwrap() > body["period"].as_u64().unwrap());

    // Second force for the same period lost the race
    let (status, body) = send(
        &app,
        post_json("/api/admin/modes/30/override", None, json!({"number": 2, "period": period})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "SUPERSEDED");

    // Staged limit is live from the new round
    let (status, body) = send(
        &app,
        post_json("/api/wagers", Some("alice"), json!({"mode": "30", "bucket": "Big", "amount": 600})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "ABOVE_MAXIMUM");

    let (status, body) = send(
        &app,
        post_json("/api/admin/modes/aviator/override", None, json!({"number": 2})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_metrics_endpoint_renders_text() {
    let (engine, app) = setup(None).await;
    engine
        .place_wager(roundhouse::WagerRequest {
            bettor: BettorId::new("alice"),
            mode: ModeId::new("30"),
            period: None,
            bucket: Some("Small".to_string()),
            amount: 50,
            wager_id: None,
        })
        .await
        .unwrap();

    let response = app.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("roundhouse_wagers_accepted_total"));
}

#[tokio::test]
async fn test_websocket_snapshot_ping_and_events() {
    let (engine, app) = setup(None).await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws?mode=30", addr))
        .await
        .unwrap();

    let first = next_json(&mut socket).await;
    assert_eq!(first["type"], "snapshot");
    assert_eq!(first["snapshot"]["mode"], "30");
    assert_eq!(first["snapshot"]["viewers"], 1);

    socket
        .send(Message::Text(json!({"type": "ping"}).to_string()))
        .await
        .unwrap();
    let pong = next_of_type(&mut socket, "pong").await;
    assert!(pong["timestamp"].is_i64());

    let mode = ModeId::new("30");
    let period = engine.state(&mode).unwrap().live.unwrap().period;
    engine.force_draw(&mode, period, 5).await.unwrap();

    let drawn = next_of_type(&mut socket, "result_drawn").await;
    assert_eq!(drawn["result"]["number"], 5);

    socket
        .send(Message::Text("not json".to_string()))
        .await
        .unwrap();
    let error = next_of_type(&mut socket, "error").await;
    assert_eq!(error["code"], "BAD_MESSAGE");
}

type Socket = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn next_json(socket: &mut Socket) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("timed out waiting for a message")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn next_of_type(socket: &mut Socket, kind: &str) -> Value {
    loop {
        let value = next_json(socket).await;
        if value["type"] == kind {
            return value;
        }
    }
}
