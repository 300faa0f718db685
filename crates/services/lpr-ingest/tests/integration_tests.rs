//! Integration tests for the LPR push listener
//!
//! These tests bind real sockets on 127.0.0.1 and push detections over HTTP.

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use lpr_ingest::config::Config;
use lpr_ingest::{
    ChannelHandler, FieldOrigin, ListenerError, ListenerState, PlateEventHandler, PlateListener,
    PlateNotification,
};

const TEST_SECRET: &str = "north-gate-secret";

fn base_config() -> Config {
    let mut config = Config::default();
    config.listen.prefixes = vec!["http://127.0.0.1:0/lpr/".to_string()];
    config.listen.require_https = false;
    config.limits.shutdown_timeout_ms = 1000;
    config
}

async fn start_listener(
    config: Config,
) -> (PlateListener, mpsc::Receiver<PlateNotification>, String) {
    let (handler, rx) = ChannelHandler::channel(16);
    let listener = PlateListener::new(config.validate().unwrap(), handler);
    listener.start().await.unwrap();

    let url = format!("http://{}/lpr/", listener.local_addrs()[0]);
    (listener, rx, url)
}

async fn next_notification(rx: &mut mpsc::Receiver<PlateNotification>) -> PlateNotification {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("notification not delivered in time")
        .expect("channel closed")
}

#[tokio::test]
async fn test_json_push_delivers_event() {
    let (listener, mut rx, url) = start_listener(base_config()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}camera/north?cameraName=North%20Gate", url))
        .header("content-type", "application/json")
        .body(
            r#"{"results":[{"plate":"ab-1234","confidence":0.93}],"timestamp":"2024-01-15T10:30:00Z"}"#,
        )
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "OK");

    let notification = next_notification(&mut rx).await;
    let event = &notification.event;
    assert_eq!(event.plate(), "AB1234");
    assert_eq!(event.plate_source(), FieldOrigin::Json);
    assert_eq!(event.confidence(), Some(0.93));
    assert_eq!(event.camera_name(), Some("North Gate"));
    assert_eq!(
        event.timestamp().map(|t| t.to_rfc3339()),
        Some("2024-01-15T10:30:00+00:00".to_string())
    );
    assert_eq!(notification.method, "POST");
    assert!(notification.remote_addr.ip().is_loopback());

    let metrics = listener.metrics();
    assert_eq!(metrics.requests_received, 1);
    assert_eq!(metrics.events_delivered, 1);
    assert!(metrics.connections_accepted >= 1);

    listener.dispose().await;
}

#[tokio::test]
async fn test_body_overrides_query_over_the_wire() {
    let (listener, mut rx, url) = start_listener(base_config()).await;

    let response = reqwest::Client::new()
        .post(format!("{}?plate=AB1234", url))
        .header("content-type", "application/json")
        .body(r#"{"plate":"cd5678"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let notification = next_notification(&mut rx).await;
    assert_eq!(notification.event.plate(), "CD5678");
    assert_eq!(notification.event.plate_source(), FieldOrigin::Json);

    listener.dispose().await;
}

#[tokio::test]
async fn test_free_text_push_uses_pattern_fallback() {
    let (listener, mut rx, url) = start_listener(base_config()).await;

    let response = reqwest::Client::new()
        .post(url)
        .header("content-type", "text/plain")
        .body("entry event XY-1234 detected")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let notification = next_notification(&mut rx).await;
    assert_eq!(notification.event.plate(), "XY1234");
    assert_eq!(notification.event.plate_source(), FieldOrigin::Regex);

    listener.dispose().await;
}

#[tokio::test]
async fn test_oversized_body_rejected() {
    let mut config = base_config();
    config.limits.max_body_bytes = 16;
    let (listener, mut rx, url) = start_listener(config).await;

    let body = format!(r#"{{"plate":"AB1234","image":"{}"}}"#, "A".repeat(64));
    let response = reqwest::Client::new()
        .post(url)
        .header("content-type", "application/json")
        .body(body)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 413);
    assert!(rx.try_recv().is_err());

    listener.dispose().await;
}

#[tokio::test]
async fn test_shared_secret_enforced() {
    let mut config = base_config();
    config.auth.shared_secret = Some(TEST_SECRET.to_string());
    let (listener, mut rx, url) = start_listener(config).await;
    let client = reqwest::Client::new();

    let missing = client
        .post(&url)
        .header("content-type", "application/json")
        .body(r#"{"plate":"AB1234"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 401);

    let wrong = client
        .post(&url)
        .header("content-type", "application/json")
        .body(r#"{"plate":"AB1234","token":"not-it"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), 401);

    let accepted = client
        .post(&url)
        .header("content-type", "application/json")
        .body(format!(r#"{{"plate":"AB1234","token":"{}"}}"#, TEST_SECRET))
        .send()
        .await
        .unwrap();
    assert_eq!(accepted.status(), 200);

    let notification = next_notification(&mut rx).await;
    assert_eq!(notification.event.plate(), "AB1234");
    assert!(rx.try_recv().is_err());
    assert_eq!(listener.metrics().auth_failures, 2);

    listener.dispose().await;
}

#[tokio::test]
async fn test_method_not_allowed() {
    let (listener, _rx, url) = start_listener(base_config()).await;

    let response = reqwest::Client::new().get(url).send().await.unwrap();
    assert_eq!(response.status(), 405);
    assert_eq!(response.headers()["allow"], "POST");

    listener.dispose().await;
}

#[tokio::test]
async fn test_empty_and_plateless_bodies_rejected() {
    let (listener, _rx, url) = start_listener(base_config()).await;
    let client = reqwest::Client::new();

    let empty = client.post(&url).send().await.unwrap();
    assert_eq!(empty.status(), 400);

    let no_plate = client
        .post(&url)
        .header("content-type", "application/json")
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(no_plate.status(), 400);
    assert_eq!(no_plate.text().await.unwrap(), "No license plate found");

    listener.dispose().await;
}

#[tokio::test]
async fn test_path_outside_prefix_is_404() {
    let (listener, _rx, url) = start_listener(base_config()).await;
    let other = url.replace("/lpr/", "/status");

    let response = reqwest::Client::new()
        .post(other)
        .body("plate=AB1234")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    listener.dispose().await;
}

/// Handler that blocks far longer than the shutdown timeout
struct SlowHandler {
    entered: Arc<Notify>,
}

#[async_trait]
impl PlateEventHandler for SlowHandler {
    async fn on_plate(&self, _notification: PlateNotification) -> anyhow::Result<()> {
        self.entered.notify_one();
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }
}

#[tokio::test]
async fn test_stop_with_slow_handler_respects_timeout() {
    let mut config = base_config();
    config.limits.shutdown_timeout_ms = 300;

    let entered = Arc::new(Notify::new());
    let listener = PlateListener::new(
        config.validate().unwrap(),
        SlowHandler {
            entered: entered.clone(),
        },
    );
    listener.start().await.unwrap();
    let url = format!("http://{}/lpr/", listener.local_addrs()[0]);

    let request = tokio::spawn(async move {
        reqwest::Client::new()
            .post(url)
            .body("plate=AB1234&camera=1")
            .send()
            .await
    });

    tokio::time::timeout(Duration::from_secs(5), entered.notified())
        .await
        .expect("handler was never invoked");

    let started = Instant::now();
    listener.stop().await;
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_secs(3), "stop took {:?}", elapsed);
    assert_eq!(listener.state(), ListenerState::Stopped);

    // The abandoned request fails or completes; either way it must not hang
    let _ = tokio::time::timeout(Duration::from_secs(5), request).await;
}

#[tokio::test]
async fn test_start_twice_and_after_dispose() {
    let (handler, _rx) = ChannelHandler::channel(1);
    let listener = PlateListener::new(base_config().validate().unwrap(), handler);

    listener.start().await.unwrap();
    assert!(matches!(
        listener.start().await,
        Err(ListenerError::AlreadyRunning)
    ));

    listener.dispose().await;
    assert!(matches!(
        listener.start().await,
        Err(ListenerError::Disposed)
    ));
}

#[tokio::test]
async fn test_listener_from_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[listen]
prefixes = ["http://127.0.0.1:0/cams/"]
require_https = false

[response]
status = 202
body = "accepted"

[aliases]
plate = ["kennzeichen"]
"#
    )
    .unwrap();

    let config = Config::from_file(file.path()).unwrap();
    let (handler, mut rx) = ChannelHandler::channel(4);
    let listener = PlateListener::new(config.validate().unwrap(), handler);
    listener.start().await.unwrap();

    let url = format!("http://{}/cams/gate", listener.local_addrs()[0]);
    let response = reqwest::Client::new()
        .post(url)
        .header("content-type", "application/x-www-form-urlencoded")
        .body("kennzeichen=B-MW%201234")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 202);
    assert_eq!(response.text().await.unwrap(), "accepted");
    assert_eq!(next_notification(&mut rx).await.event.plate(), "BMW1234");

    listener.dispose().await;
}

/// Holds the push carrying `held_plate` until released; other pushes pass straight through
struct GateHandler {
    held_plate: &'static str,
    entered: Arc<Notify>,
    release: Arc<Notify>,
    tx: mpsc::Sender<PlateNotification>,
}

#[async_trait]
impl PlateEventHandler for GateHandler {
    async fn on_plate(&self, notification: PlateNotification) -> anyhow::Result<()> {
        if notification.event.plate() == self.held_plate {
            self.entered.notify_one();
            self.release.notified().await;
        }
        let _ = self.tx.send(notification).await;
        Ok(())
    }
}

struct Gate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

async fn start_gated(
    config: Config,
    held_plate: &'static str,
) -> (PlateListener, Gate, mpsc::Receiver<PlateNotification>, String) {
    let (tx, rx) = mpsc::channel(8);
    let gate = Gate {
        entered: Arc::new(Notify::new()),
        release: Arc::new(Notify::new()),
    };
    let handler = GateHandler {
        held_plate,
        entered: gate.entered.clone(),
        release: gate.release.clone(),
        tx,
    };

    let listener = PlateListener::new(config.validate().unwrap(), handler);
    listener.start().await.unwrap();
    let url = format!("http://{}/lpr/", listener.local_addrs()[0]);
    (listener, gate, rx, url)
}

/// Push on a fresh connection that is closed after the response
fn spawn_push(
    url: &str,
    body: &'static str,
) -> tokio::task::JoinHandle<reqwest::Result<reqwest::Response>> {
    let url = url.to_string();
    tokio::spawn(async move {
        reqwest::Client::new()
            .post(url)
            .header("connection", "close")
            .body(body)
            .send()
            .await
    })
}

#[tokio::test]
async fn test_slow_handler_does_not_block_other_pushes() {
    let (listener, gate, mut rx, url) = start_gated(base_config(), "AB1234").await;

    let held = spawn_push(&url, "plate=AB1234");
    tokio::time::timeout(Duration::from_secs(5), gate.entered.notified())
        .await
        .expect("handler was never invoked");

    let response = tokio::time::timeout(Duration::from_secs(2), spawn_push(&url, "plate=CD5678"))
        .await
        .expect("second push waited on the held handler")
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(next_notification(&mut rx).await.event.plate(), "CD5678");
    assert!(!held.is_finished());

    gate.release.notify_one();
    let held_response = tokio::time::timeout(Duration::from_secs(5), held)
        .await
        .expect("held push never completed")
        .unwrap()
        .unwrap();
    assert_eq!(held_response.status(), 200);
    assert_eq!(next_notification(&mut rx).await.event.plate(), "AB1234");

    listener.dispose().await;
}

#[tokio::test]
async fn test_connection_cap_defers_second_connection() {
    let mut config = base_config();
    config.limits.max_concurrent_connections = 1;
    let (listener, gate, mut rx, url) = start_gated(config, "AB1234").await;

    let held = spawn_push(&url, "plate=AB1234");
    tokio::time::timeout(Duration::from_secs(5), gate.entered.notified())
        .await
        .expect("handler was never invoked");

    let mut queued = spawn_push(&url, "plate=CD5678");
    assert!(
        tokio::time::timeout(Duration::from_millis(300), &mut queued)
            .await
            .is_err(),
        "second connection served while the first held the only slot"
    );
    assert!(rx.try_recv().is_err());

    gate.release.notify_one();
    let held_response = tokio::time::timeout(Duration::from_secs(5), held)
        .await
        .expect("held push never completed")
        .unwrap()
        .unwrap();
    assert_eq!(held_response.status(), 200);
    assert_eq!(next_notification(&mut rx).await.event.plate(), "AB1234");

    let queued_response = tokio::time::timeout(Duration::from_secs(5), queued)
        .await
        .expect("queued push never served")
        .unwrap()
        .unwrap();
    assert_eq!(queued_response.status(), 200);
    assert_eq!(next_notification(&mut rx).await.event.plate(), "CD5678");
    assert_eq!(listener.metrics().connections_accepted, 2);

    listener.dispose().await;
}

#[tokio::test]
async fn test_https_push_over_tls() {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_pem = certified.cert.pem();

    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::write(&cert_path, &cert_pem).unwrap();
    std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();

    let mut config = base_config();
    config.listen.prefixes = vec!["https://127.0.0.1:0/lpr/".to_string()];
    config.listen.require_https = true;
    config.tls.cert_path = Some(cert_path);
    config.tls.key_path = Some(key_path);

    let (handler, mut rx) = ChannelHandler::channel(4);
    let listener = PlateListener::new(config.validate().unwrap(), handler);
    listener.start().await.unwrap();
    let addr = listener.local_addrs()[0];

    let client = reqwest::Client::builder()
        .add_root_certificate(reqwest::Certificate::from_pem(cert_pem.as_bytes()).unwrap())
        .resolve("localhost", addr)
        .build()
        .unwrap();

    let response = client
        .post(format!("https://localhost:{}/lpr/gate", addr.port()))
        .header("content-type", "application/json")
        .body(r#"{"plate":"tl-5512","cameraId":"gate-2"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let notification = next_notification(&mut rx).await;
    assert_eq!(notification.event.plate(), "TL5512");
    assert_eq!(notification.event.camera_id(), Some("gate-2"));

    // Plain HTTP against the TLS socket never reaches the handler
    let plain = tokio::time::timeout(
        Duration::from_secs(5),
        reqwest::Client::new()
            .post(format!("http://{}/lpr/", addr))
            .body("plate=AB1234")
            .send(),
    )
    .await
    .expect("plain request hung");
    if let Ok(response) = plain {
        assert_ne!(response.status(), 200);
    }
    assert!(rx.try_recv().is_err());

    listener.dispose().await;
}
