use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};

use sfu_publisher::config::Config;
use sfu_publisher::media::synthetic::{SyntheticBackend, SyntheticCapture, TracingPreview};
use sfu_publisher::media::{MediaError, MediaKind, PreviewSinks};
use sfu_publisher::negotiation::{AckPolicy, NegotiationError, NegotiationState};
use sfu_publisher::publisher::{PublisherSession, SessionError};

const STEP: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Behavior {
    /// Answers requests, never confirms connect/produce.
    Silent,
    /// Also answers with producerTransportConnected / produced.
    Confirming,
    /// Confirms with payloads this client does not understand.
    Foreign,
    /// Answers the capability request with invalid JSON.
    Malformed,
    /// Hangs up on the capability request.
    HangUp,
}

#[derive(Clone)]
struct MockSfu {
    behavior: Behavior,
    received: Arc<Mutex<Vec<Value>>>,
}

impl MockSfu {
    fn types(&self) -> Vec<String> {
        self.received
            .lock()
            .iter()
            .map(|message| message["type"].as_str().unwrap_or_default().to_owned())
            .collect()
    }

    fn produced_kinds(&self) -> Vec<String> {
        self.received
            .lock()
            .iter()
            .filter(|message| message["type"] == "produce")
            .map(|message| message["kind"].as_str().unwrap().to_owned())
            .collect()
    }
}

async fn spawn_sfu(behavior: Behavior) -> (MockSfu, String) {
    let sfu = MockSfu {
        behavior,
        received: Arc::new(Mutex::new(Vec::new())),
    };
    let router = Router::new()
        .route("/", get(ws_handler))
        .with_state(sfu.clone());
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    (sfu, format!("ws://{addr}"))
}

async fn ws_handler(ws: WebSocketUpgrade, State(sfu): State<MockSfu>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_publisher(socket, sfu))
}

async fn serve_publisher(mut socket: WebSocket, sfu: MockSfu) {
    while let Some(Ok(message)) = socket.recv().await {
        let WsMessage::Text(text) = message else {
            continue;
        };
        let value: Value = serde_json::from_str(&text).expect("client sent invalid json");
        sfu.received.lock().push(value.clone());

        let kind = value["type"].as_str().unwrap_or_default();
        let reply = match (kind, sfu.behavior) {
            ("getRouterRtpCapabilities", Behavior::HangUp) => {
                let _ = socket.send(WsMessage::Close(None)).await;
                return;
            }
            ("getRouterRtpCapabilities", Behavior::Malformed) => {
                Some(r#"{"type":"routerRtpCapabilities","#.to_string())
            }
            ("getRouterRtpCapabilities", _) => Some(
                json!({
                    "type": "routerRtpCapabilities",
                    "data": {
                        "codecs": [
                            { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 },
                            { "kind": "video", "mimeType": "video/VP8", "clockRate": 90000 }
                        ],
                        "headerExtensions": []
                    }
                })
                .to_string(),
            ),
            ("createProducerTransport", _) => Some(
                json!({
                    "type": "producerTransportCreated",
                    "data": {
                        "id": "transport-1",
                        "iceParameters": { "usernameFragment": "frag", "password": "pw" },
                        "iceCandidates": [],
                        "dtlsParameters": { "role": "auto", "fingerprints": [] }
                    }
                })
                .to_string(),
            ),
            ("connectProducerTransport", Behavior::Confirming) => {
                Some(json!({ "type": "producerTransportConnected" }).to_string())
            }
            ("produce", Behavior::Confirming) => Some(
                json!({
                    "type": "produced",
                    "data": { "id": format!("server-{}", value["kind"].as_str().unwrap()) }
                })
                .to_string(),
            ),
            ("connectProducerTransport", Behavior::Foreign) => {
                Some(json!({ "type": "producerTransportConnected", "data": {} }).to_string())
            }
            ("produce", Behavior::Foreign) => Some(
                json!({ "type": "produced", "data": { "producerId": "abc" } }).to_string(),
            ),
            _ => None,
        };
        if let Some(reply) = reply {
            if socket.send(WsMessage::Text(reply)).await.is_err() {
                break;
            }
        }
    }
}

struct Harness {
    session: PublisherSession,
    local: Arc<TracingPreview>,
    remote: Arc<TracingPreview>,
    capture: Arc<SyntheticCapture>,
}

fn harness(config: Config, capture: SyntheticCapture) -> Harness {
    let backend = SyntheticBackend::with_capture(capture);
    let capture = backend.capture_handle();
    let local = Arc::new(TracingPreview::new("local"));
    let remote = Arc::new(TracingPreview::new("remote"));
    let session = PublisherSession::new(
        config,
        Arc::new(backend),
        PreviewSinks::new(local.clone(), remote.clone()),
    );
    Harness {
        session,
        local,
        remote,
        capture,
    }
}

fn config_for(url: &str, ack_policy: AckPolicy) -> Config {
    Config {
        ack_policy,
        ..Config::default().with_signaling_url(url)
    }
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    timeout(STEP, async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn optimistic_handshake_publishes_audio_then_video() {
    let (sfu, url) = spawn_sfu(Behavior::Silent).await;
    let mut h = harness(
        config_for(&url, AckPolicy::Optimistic),
        SyntheticCapture::new(),
    );
    h.session.start().unwrap();

    wait_until("two producers", || h.session.producers().len() == 2).await;
    wait_until("five messages", || sfu.types().len() == 5).await;

    assert_eq!(
        sfu.types(),
        vec![
            "getRouterRtpCapabilities",
            "createProducerTransport",
            "connectProducerTransport",
            "produce",
            "produce"
        ]
    );
    assert_eq!(sfu.produced_kinds(), vec!["audio", "video"]);

    let producers = h.session.producers();
    assert_eq!(producers[0].kind, MediaKind::Audio);
    assert_eq!(producers[1].kind, MediaKind::Video);
    assert!(
        producers
            .iter()
            .all(|producer| producer.id.as_str().starts_with("local-"))
    );
    assert_eq!(h.session.state(), NegotiationState::Producing);
    assert!(h.local.attached_stream().is_some());

    let received = sfu.received.lock().clone();
    assert!(received[2]["dtlsParameters"]["fingerprints"].is_array());
    assert_eq!(received[3]["rtpParameters"]["codecs"][0]["kind"], "audio");

    h.session.stop();
    assert_eq!(h.session.state(), NegotiationState::Closed);
    assert_eq!(h.capture.released(), 1);
    assert_eq!(h.local.detach_count(), 1);
    assert_eq!(h.remote.detach_count(), 1);
}

#[tokio::test]
async fn optimistic_session_survives_unfamiliar_confirmations() {
    let (sfu, url) = spawn_sfu(Behavior::Foreign).await;
    let mut h = harness(
        config_for(&url, AckPolicy::Optimistic),
        SyntheticCapture::new(),
    );
    h.session.start().unwrap();

    wait_until("two producers", || h.session.producers().len() == 2).await;
    wait_until("five messages", || sfu.types().len() == 5).await;
    assert!(
        timeout(Duration::from_millis(300), h.session.closed())
            .await
            .is_err(),
        "session ended on a confirmation frame"
    );
    assert!(h.session.is_active());
    assert_eq!(h.session.state(), NegotiationState::Producing);
    assert!(
        h.session
            .producers()
            .iter()
            .all(|producer| producer.id.as_str().starts_with("local-"))
    );
    h.session.stop();
}

#[tokio::test]
async fn await_server_policy_uses_server_assigned_ids() {
    let (sfu, url) = spawn_sfu(Behavior::Confirming).await;
    let mut h = harness(
        config_for(&url, AckPolicy::AwaitServer),
        SyntheticCapture::new(),
    );
    h.session.start().unwrap();

    wait_until("two producers", || h.session.producers().len() == 2).await;
    let ids: Vec<String> = h
        .session
        .producers()
        .iter()
        .map(|producer| producer.id.to_string())
        .collect();
    assert_eq!(ids, vec!["server-audio", "server-video"]);
    assert_eq!(sfu.produced_kinds(), vec!["audio", "video"]);
    h.session.stop();
}

#[tokio::test]
async fn await_server_policy_stalls_without_confirmation() {
    let (sfu, url) = spawn_sfu(Behavior::Silent).await;
    let mut h = harness(
        config_for(&url, AckPolicy::AwaitServer),
        SyntheticCapture::new(),
    );
    h.session.start().unwrap();

    wait_until("connect request", || {
        sfu.types().contains(&"connectProducerTransport".to_string())
    })
    .await;
    sleep(Duration::from_millis(200)).await;
    assert!(!sfu.types().contains(&"produce".to_string()));
    assert!(h.session.producers().is_empty());
    assert_eq!(h.session.state(), NegotiationState::TransportCreated);

    h.session.stop();
    assert_eq!(h.session.state(), NegotiationState::Closed);
}

#[tokio::test]
async fn audio_only_capture_produces_one_track() {
    let (sfu, url) = spawn_sfu(Behavior::Silent).await;
    let mut config = config_for(&url, AckPolicy::Optimistic);
    config.capture.video = false;
    let mut h = harness(config, SyntheticCapture::new());
    h.session.start().unwrap();

    wait_until("one producer", || h.session.producers().len() == 1).await;
    wait_until("produce message", || sfu.types().len() == 4).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(sfu.produced_kinds(), vec!["audio"]);
    assert_eq!(
        sfu.types()
            .iter()
            .filter(|kind| *kind == "createProducerTransport")
            .count(),
        1
    );
    h.session.stop();
}

#[tokio::test]
async fn stop_is_idempotent_and_detaches_previews_each_time() {
    let (_sfu, url) = spawn_sfu(Behavior::Silent).await;
    let mut h = harness(
        config_for(&url, AckPolicy::Optimistic),
        SyntheticCapture::new(),
    );
    h.session.start().unwrap();
    wait_until("two producers", || h.session.producers().len() == 2).await;

    h.session.stop();
    h.session.stop();
    assert!(!h.session.is_active());
    assert_eq!(h.session.state(), NegotiationState::Closed);
    assert_eq!(h.local.detach_count(), 2);
    assert_eq!(h.remote.detach_count(), 2);
    assert_eq!(h.local.attached_stream(), None);
    assert_eq!(h.capture.acquired(), 1);
    assert_eq!(h.capture.released(), 1);
    h.session.closed().await.unwrap();
}

#[tokio::test]
async fn stop_without_start_sends_nothing() {
    let (sfu, _url) = spawn_sfu(Behavior::Silent).await;
    let mut h = harness(Config::default(), SyntheticCapture::new());
    h.session.stop();
    assert_eq!(h.local.detach_count(), 1);
    assert_eq!(h.remote.detach_count(), 1);
    assert_eq!(h.capture.acquired(), 0);
    assert!(sfu.types().is_empty());
}

#[tokio::test]
async fn start_twice_is_rejected() {
    let (_sfu, url) = spawn_sfu(Behavior::Silent).await;
    let mut h = harness(
        config_for(&url, AckPolicy::Optimistic),
        SyntheticCapture::new(),
    );
    h.session.start().unwrap();
    assert!(matches!(
        h.session.start(),
        Err(SessionError::AlreadyActive)
    ));
    h.session.stop();

    // A stopped session can be started again.
    h.session.start().unwrap();
    wait_until("two producers", || h.session.producers().len() == 2).await;
    h.session.stop();
}

#[tokio::test]
async fn capture_failure_ends_session() {
    let (_sfu, url) = spawn_sfu(Behavior::Silent).await;
    let mut h = harness(
        config_for(&url, AckPolicy::Optimistic),
        SyntheticCapture::failing("permission denied"),
    );
    h.session.start().unwrap();

    let err = timeout(STEP, h.session.closed())
        .await
        .expect("session did not end")
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::Media(MediaError::Capture(reason)) if reason == "permission denied"
    ));
    assert_eq!(h.session.state(), NegotiationState::Closed);
    assert!(h.local.attached_stream().is_none());
    h.session.stop();
}

#[tokio::test]
async fn server_hang_up_ends_session_with_channel_closed() {
    let (sfu, url) = spawn_sfu(Behavior::HangUp).await;
    let mut h = harness(
        config_for(&url, AckPolicy::Optimistic),
        SyntheticCapture::new(),
    );
    h.session.start().unwrap();

    let err = timeout(STEP, h.session.closed())
        .await
        .expect("session did not end")
        .unwrap_err();
    assert!(matches!(err, SessionError::ChannelClosed));
    assert_eq!(sfu.types(), vec!["getRouterRtpCapabilities"]);

    h.session.stop();
    assert_eq!(h.local.detach_count(), 1);
}

#[tokio::test]
async fn malformed_frame_is_fatal() {
    let (sfu, url) = spawn_sfu(Behavior::Malformed).await;
    let mut h = harness(
        config_for(&url, AckPolicy::Optimistic),
        SyntheticCapture::new(),
    );
    h.session.start().unwrap();

    let err = timeout(STEP, h.session.closed())
        .await
        .expect("session did not end")
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::Negotiation(NegotiationError::Malformed(_))
    ));
    assert_eq!(sfu.types(), vec!["getRouterRtpCapabilities"]);
    h.session.stop();
}

#[tokio::test]
async fn unreachable_server_ends_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let mut h = harness(
        config_for(&url, AckPolicy::Optimistic),
        SyntheticCapture::new(),
    );
    h.session.start().unwrap();
    let err = timeout(STEP, h.session.closed())
        .await
        .expect("session did not end")
        .unwrap_err();
    assert!(matches!(err, SessionError::ChannelClosed));
    h.session.stop();
    assert_eq!(h.session.state(), NegotiationState::Closed);
}
