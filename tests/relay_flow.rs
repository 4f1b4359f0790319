//! End-to-end relay scenario against a real server on an ephemeral port.

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::net::TcpListener;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use job_relay::config::settings::{AppConfig, AuthConfig, RateLimitConfig, ServerConfig};
use job_relay::config::{AppSettings, RelayConfig};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    http: String,
    ws: String,
    client: reqwest::Client,
}

fn test_settings() -> AppSettings {
    AppSettings {
        app: AppConfig {
            name: "job-relay-test".to_string(),
            environment: "test".to_string(),
        },
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            cors_origins: vec!["*".to_string()],
        },
        auth: AuthConfig {
            jwt_secret: "integration-test-secret".to_string(),
            token_duration_minutes: 5,
        },
        rate_limit: RateLimitConfig {
            window_ms: 60_000,
            max_requests: 100,
        },
        relay: RelayConfig::default(),
    }
}

async fn spawn_server() -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    let port = listener.local_addr().expect("local addr").port();
    let server = job_relay::server::run(test_settings(), listener).expect("start server");
    actix_rt::spawn(server);

    TestServer {
        http: format!("http://127.0.0.1:{}", port),
        ws: format!("ws://127.0.0.1:{}/ws", port),
        client: reqwest::Client::new(),
    }
}

impl TestServer {
    async fn post(&self, path: &str, body: Value, token: Option<&str>) -> reqwest::Response {
        let mut req = self.client.post(format!("{}{}", self.http, path)).json(&body);
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        req.send().await.expect("request")
    }

    /// Register an account and pair one desktop. Returns (access_token, device_id, device_token).
    async fn account_with_device(&self, email: &str) -> (String, String, String) {
        let reg: Value = self
            .post("/auth/register", json!({"email": email, "password": "testpass123"}), None)
            .await
            .json()
            .await
            .expect("register body");
        let access_token = reg["access_token"].as_str().expect("access_token").to_string();

        let pair: Value = self
            .post("/devices/pair", json!({"device_name": "Test MacBook"}), Some(&access_token))
            .await
            .json()
            .await
            .expect("pair body");

        (
            access_token,
            pair["device_id"].as_str().expect("device_id").to_string(),
            pair["device_token"].as_str().expect("device_token").to_string(),
        )
    }

    async fn connect(&self, query: &str) -> Socket {
        let (socket, _) = connect_async(format!("{}?{}", self.ws, query))
            .await
            .expect("websocket connect");
        socket
    }
}

/// Next text frame as JSON, skipping control frames.
async fn recv_json(socket: &mut Socket) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(3), socket.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        match frame {
            Message::Text(text) => return serde_json::from_str(text.as_str()).expect("json frame"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

/// Next frame must be a close; returns its reason.
async fn recv_close(socket: &mut Socket) -> String {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(3), socket.next())
            .await
            .expect("timed out waiting for close")
            .expect("stream ended")
            .expect("websocket error");
        match frame {
            Message::Close(Some(close)) => return close.reason.as_str().to_string(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected close, got {:?}", other),
        }
    }
}

async fn send_json(socket: &mut Socket, value: Value) {
    socket
        .send(Message::text(value.to_string()))
        .await
        .expect("send frame");
}

#[actix_rt::test]
async fn reference_relay_scenario() {
    let server = spawn_server().await;
    let (access_token, _device_id, device_token) = server.account_with_device("ws-test@example.com").await;

    let mut desktop = server.connect(&format!("device_token={}", device_token)).await;
    let welcome_d = recv_json(&mut desktop).await;
    assert_eq!(welcome_d["type"], "welcome");

    let mut mobile = server.connect(&format!("token={}", access_token)).await;
    let welcome_m = recv_json(&mut mobile).await;
    assert_eq!(welcome_m["type"], "welcome");
    assert!(welcome_m["server_version"].is_string());
    assert_ne!(welcome_d["connection_id"], welcome_m["connection_id"]);

    // list_jobs round trip
    send_json(&mut mobile, json!({"type": "list_jobs", "id": "req-1"})).await;
    let msg = recv_json(&mut desktop).await;
    assert_eq!(msg, json!({"type": "list_jobs", "id": "req-1"}));

    let jobs_list = json!({
        "type": "jobs_list",
        "id": "req-1",
        "jobs": [{"name": "deploy-api", "job_type": "claude", "enabled": true}],
        "statuses": {"deploy-api": {"state": "idle"}}
    });
    send_json(&mut desktop, jobs_list.clone()).await;
    assert_eq!(recv_json(&mut mobile).await, jobs_list);

    // run_job round trip
    send_json(&mut mobile, json!({"type": "run_job", "id": "req-2", "name": "deploy-api"})).await;
    let msg = recv_json(&mut desktop).await;
    assert_eq!(msg["type"], "run_job");
    assert_eq!(msg["name"], "deploy-api");
    send_json(&mut desktop, json!({"type": "run_job_ack", "id": "req-2", "success": true})).await;
    let msg = recv_json(&mut mobile).await;
    assert_eq!(msg["type"], "run_job_ack");
    assert_eq!(msg["success"], true);

    // events arrive in order
    send_json(
        &mut desktop,
        json!({"type": "status_update", "name": "deploy-api", "status": {"state": "running"}}),
    )
    .await;
    send_json(
        &mut desktop,
        json!({"type": "log_chunk", "name": "deploy-api", "content": "Deploying...\n", "timestamp": "2026-01-01T00:00:05Z"}),
    )
    .await;
    let first = recv_json(&mut mobile).await;
    let second = recv_json(&mut mobile).await;
    assert_eq!(first["type"], "status_update");
    assert_eq!(first["status"]["state"], "running");
    assert_eq!(second["type"], "log_chunk");

    // send_input
    send_json(
        &mut mobile,
        json!({"type": "send_input", "id": "req-3", "name": "deploy-api", "text": "yes"}),
    )
    .await;
    let msg = recv_json(&mut desktop).await;
    assert_eq!(msg["text"], "yes");

    // desktop leaves
    desktop.close(None).await.expect("close desktop");
    let msg = recv_json(&mut mobile).await;
    assert_eq!(msg["type"], "desktop_status");
    assert_eq!(msg["online"], false);
    assert_eq!(msg["device_name"], "Test MacBook");

    // command with no desktop
    send_json(&mut mobile, json!({"type": "list_jobs", "id": "req-4"})).await;
    let msg = recv_json(&mut mobile).await;
    assert_eq!(msg["type"], "error");
    assert_eq!(msg["code"], "DESKTOP_OFFLINE");
    assert_eq!(msg["id"], "req-4");
}

#[actix_rt::test]
async fn invalid_frames_keep_connection_open() {
    let server = spawn_server().await;
    let (access_token, _, _) = server.account_with_device("invalid@example.com").await;

    let mut mobile = server.connect(&format!("token={}", access_token)).await;
    recv_json(&mut mobile).await;

    mobile
        .send(Message::text("not json at all"))
        .await
        .expect("send");
    let msg = recv_json(&mut mobile).await;
    assert_eq!(msg["code"], "INVALID_MESSAGE");

    send_json(&mut mobile, json!({"type": "jobs_list", "id": "x"})).await;
    let msg = recv_json(&mut mobile).await;
    assert_eq!(msg["code"], "INVALID_MESSAGE");
    assert_eq!(msg["id"], "x");

    // still usable
    send_json(&mut mobile, json!({"type": "list_jobs", "id": "y"})).await;
    assert_eq!(recv_json(&mut mobile).await["code"], "DESKTOP_OFFLINE");
}

#[actix_rt::test]
async fn handshake_without_valid_credentials_is_refused() {
    let server = spawn_server().await;

    for query in ["", "token=garbage", "device_token=unknown", "token=a&device_token=b"] {
        let result = connect_async(format!("{}?{}", server.ws, query)).await;
        match result {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status().as_u16(), 401, "query {:?}", query);
            }
            Err(other) => panic!("unexpected error for {:?}: {}", query, other),
            Ok(_) => panic!("handshake {:?} should have been refused", query),
        }
    }
}

#[actix_rt::test]
async fn second_desktop_replaces_first_and_unpairing_evicts() {
    let server = spawn_server().await;
    let (access_token, device_id, device_token) = server.account_with_device("replace@example.com").await;

    let mut first = server.connect(&format!("device_token={}", device_token)).await;
    recv_json(&mut first).await;
    let mut mobile = server.connect(&format!("token={}", access_token)).await;
    recv_json(&mut mobile).await;

    let mut second = server.connect(&format!("device_token={}", device_token)).await;
    assert_eq!(recv_json(&mut second).await["type"], "welcome");
    assert_eq!(recv_close(&mut first).await, "replaced by a newer desktop connection");
    let status = recv_json(&mut mobile).await;
    assert_eq!(status["type"], "desktop_status");
    assert_eq!(status["online"], true);

    let devices: Value = server
        .client
        .get(format!("{}/devices", server.http))
        .bearer_auth(&access_token)
        .send()
        .await
        .expect("list devices")
        .json()
        .await
        .expect("devices body");
    assert_eq!(devices[0]["is_online"], true);

    let deleted = server
        .client
        .delete(format!("{}/devices/{}", server.http, device_id))
        .bearer_auth(&access_token)
        .send()
        .await
        .expect("delete device");
    assert_eq!(deleted.status().as_u16(), 200);
    assert_eq!(recv_close(&mut second).await, "device unpaired");

    let status = recv_json(&mut mobile).await;
    assert_eq!(status["online"], false);

    let missing = server
        .client
        .delete(format!("{}/devices/{}", server.http, device_id))
        .bearer_auth(&access_token)
        .send()
        .await
        .expect("delete again");
    assert_eq!(missing.status().as_u16(), 404);
}

#[actix_rt::test]
async fn rest_facade_errors() {
    let server = spawn_server().await;

    let weak = server
        .post("/auth/register", json!({"email": "a@example.com", "password": "short"}), None)
        .await;
    assert_eq!(weak.status().as_u16(), 400);

    let ok = server
        .post("/auth/register", json!({"email": "a@example.com", "password": "testpass123"}), None)
        .await;
    assert_eq!(ok.status().as_u16(), 200);

    let dup = server
        .post("/auth/register", json!({"email": "A@example.com", "password": "testpass123"}), None)
        .await;
    assert_eq!(dup.status().as_u16(), 409);

    let bad_login = server
        .post("/auth/login", json!({"email": "a@example.com", "password": "wrongpass"}), None)
        .await;
    assert_eq!(bad_login.status().as_u16(), 401);

    let unauthenticated = server
        .post("/devices/pair", json!({"device_name": "rig"}), None)
        .await;
    assert_eq!(unauthenticated.status().as_u16(), 401);

    let health: Value = server
        .client
        .get(format!("{}/health", server.http))
        .send()
        .await
        .expect("health")
        .json()
        .await
        .expect("health body");
    assert_eq!(health["status"], "ok");
}

#[actix_rt::test]
async fn refresh_tokens_rotate_and_detect_reuse() {
    let server = spawn_server().await;

    let registered: Value = server
        .post("/auth/register", json!({"email": "refresh@example.com", "password": "testpass123"}), None)
        .await
        .json()
        .await
        .expect("register body");
    let first = registered["refresh_token"].as_str().expect("refresh_token").to_string();

    let refreshed = server
        .post("/auth/refresh", json!({"refresh_token": first}), None)
        .await;
    assert_eq!(refreshed.status().as_u16(), 200);
    let refreshed: Value = refreshed.json().await.expect("refresh body");
    assert_eq!(refreshed["user_id"], registered["user_id"]);
    let second = refreshed["refresh_token"].as_str().expect("rotated token").to_string();
    assert_ne!(second, first);

    let devices = server
        .client
        .get(format!("{}/devices", server.http))
        .bearer_auth(refreshed["access_token"].as_str().expect("access_token"))
        .send()
        .await
        .expect("list devices");
    assert_eq!(devices.status().as_u16(), 200);

    // Replaying a spent token revokes the whole family
    let replay = server
        .post("/auth/refresh", json!({"refresh_token": first}), None)
        .await;
    assert_eq!(replay.status().as_u16(), 401);
    let revoked = server
        .post("/auth/refresh", json!({"refresh_token": second}), None)
        .await;
    assert_eq!(revoked.status().as_u16(), 401);
}
