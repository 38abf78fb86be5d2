use async_trait::async_trait;
use coachlink::core::channel::{
    ChannelConfig, ChannelEvent, ChannelHandle, ChannelState, CoherenceChannel,
};
use coachlink::core::protocol::CoherenceUpdatePayload;
use coachlink::domain::model::Trend;
use coachlink::domain::ports::{Connection, Connector};
use coachlink::utils::error::{PortalError, Result};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{timeout, Instant};

const WAIT: Duration = Duration::from_secs(5);

/// 測試端持有的伺服器端點
struct ServerEnd {
    frames: mpsc::UnboundedReceiver<String>,
    push: mpsc::UnboundedSender<String>,
}

impl ServerEnd {
    async fn next_frame(&mut self) -> Value {
        let text = timeout(WAIT, self.frames.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed");
        serde_json::from_str(&text).unwrap()
    }

    fn send(&self, frame: Value) {
        self.push.send(frame.to_string()).unwrap();
    }

    fn send_raw(&self, text: &str) {
        self.push.send(text.to_string()).unwrap();
    }

    fn pending_frames(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(text) = self.frames.try_recv() {
            frames.push(serde_json::from_str(&text).unwrap());
        }
        frames
    }
}

struct MemoryConnection {
    to_server: mpsc::UnboundedSender<String>,
    from_server: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.to_server
            .send(text)
            .map_err(|_| PortalError::ChannelError {
                message: "server end dropped".to_string(),
            })
    }

    async fn next_text(&mut self) -> Option<Result<String>> {
        self.from_server.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<()> {
        self.from_server.close();
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Mode {
    Accept,
    Refuse,
    Hang,
    /// opens, then the server hangs up before answering the auth frame
    CloseBeforeAuth,
}

struct MemoryConnector {
    mode: Mode,
    attempts: Arc<Mutex<Vec<Instant>>>,
    servers: mpsc::UnboundedSender<ServerEnd>,
    sink: Mutex<Vec<mpsc::UnboundedReceiver<String>>>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, _url: &str) -> Result<Box<dyn Connection>> {
        self.attempts.lock().unwrap().push(Instant::now());

        match self.mode {
            Mode::Refuse => Err(PortalError::ChannelError {
                message: "connection refused".to_string(),
            }),
            Mode::Hang => std::future::pending().await,
            Mode::CloseBeforeAuth => {
                let (to_server, frames) = mpsc::unbounded_channel();
                let (_push, from_server) = mpsc::unbounded_channel();
                self.sink.lock().unwrap().push(frames);
                Ok(Box::new(MemoryConnection {
                    to_server,
                    from_server,
                }))
            }
            Mode::Accept => {
                let (to_server, frames) = mpsc::unbounded_channel();
                let (push, from_server) = mpsc::unbounded_channel();
                self.servers
                    .send(ServerEnd { frames, push })
                    .map_err(|_| PortalError::ChannelError {
                        message: "test dropped the server receiver".to_string(),
                    })?;
                Ok(Box::new(MemoryConnection {
                    to_server,
                    from_server,
                }))
            }
        }
    }
}

struct Harness {
    handle: ChannelHandle,
    events: broadcast::Receiver<ChannelEvent>,
    attempts: Arc<Mutex<Vec<Instant>>>,
    servers: mpsc::UnboundedReceiver<ServerEnd>,
}

impl Harness {
    fn start(mode: Mode) -> Self {
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let (servers_tx, servers) = mpsc::unbounded_channel();
        let connector = MemoryConnector {
            mode,
            attempts: Arc::clone(&attempts),
            servers: servers_tx,
            sink: Mutex::new(Vec::new()),
        };

        let config = ChannelConfig {
            url: "ws://coherence.test/ws".to_string(),
            reconnect_base_delay: Duration::from_millis(100),
            max_reconnect_attempts: 5,
            heartbeat_interval: Duration::from_secs(30),
            event_buffer: 128,
        };

        let handle = CoherenceChannel::spawn(config, Arc::new(connector));
        let events = handle.events();
        Self {
            handle,
            events,
            attempts,
            servers,
        }
    }

    async fn next_server(&mut self) -> ServerEnd {
        timeout(WAIT, self.servers.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped")
    }

    /// 連線並完成認證
    async fn authenticated(&mut self) -> ServerEnd {
        self.handle.connect("coach-token").unwrap();
        let mut server = self.next_server().await;
        assert_eq!(
            server.next_frame().await,
            json!({"type": "auth", "token": "coach-token"})
        );
        server.send(json!({"type": "auth_success"}));
        timeout(WAIT, self.handle.wait_for(ChannelState::Authenticated))
            .await
            .expect("timed out waiting for auth")
            .unwrap();
        server
    }

    async fn next_event<F: Fn(&ChannelEvent) -> bool>(&mut self, matches: F) -> ChannelEvent {
        loop {
            let event = timeout(WAIT, self.events.recv())
                .await
                .expect("timed out waiting for an event")
                .expect("event stream closed");
            if matches(&event) {
                return event;
            }
        }
    }

    fn drain_events(&mut self) -> Vec<ChannelEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }
}

fn update_payload(client_id: &str) -> CoherenceUpdatePayload {
    CoherenceUpdatePayload {
        client_id: client_id.to_string(),
        current: 64.0,
        derivative: 0.01,
        trend: Trend::Stable,
        timestamp: None,
    }
}

#[tokio::test(start_paused = true)]
async fn test_authenticates_and_delivers_updates() {
    let mut h = Harness::start(Mode::Accept);
    let mut server = h.authenticated().await;

    h.next_event(|e| matches!(e, ChannelEvent::Authenticated)).await;

    h.handle.subscribe_client("c-1").unwrap();
    assert_eq!(
        server.next_frame().await,
        json!({"type": "subscribe_client", "clientId": "c-1"})
    );

    h.handle.send_coherence_update(update_payload("c-1")).unwrap();
    assert_eq!(
        server.next_frame().await,
        json!({
            "type": "coherence_update",
            "payload": {"clientId": "c-1", "current": 64.0, "derivative": 0.01, "trend": "stable"}
        })
    );

    server.send(json!({
        "type": "coherence_update",
        "payload": {"clientId": "c-1", "current": 38.0, "derivative": -0.07, "trend": "declining_fast"}
    }));

    match h.next_event(|e| matches!(e, ChannelEvent::CoherenceUpdate(_))).await {
        ChannelEvent::CoherenceUpdate(payload) => {
            assert_eq!(payload.client_id, "c-1");
            assert_eq!(payload.current, 38.0);
            assert_eq!(payload.trend, Trend::DecliningFast);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    server.send(json!({
        "type": "coherence_alert",
        "payload": {"clientId": "c-1", "alertType": "drop", "severity": "critical", "message": "score fell below 40"}
    }));
    match h.next_event(|e| matches!(e, ChannelEvent::CoherenceAlert(_))).await {
        ChannelEvent::CoherenceAlert(alert) => assert_eq!(alert.message, "score fell below 40"),
        other => panic!("unexpected event: {:?}", other),
    }

    h.handle.unsubscribe_client("c-1").unwrap();
    assert_eq!(
        server.next_frame().await,
        json!({"type": "unsubscribe_client", "clientId": "c-1"})
    );
}

#[tokio::test(start_paused = true)]
async fn test_sends_before_authentication_are_dropped() {
    let mut h = Harness::start(Mode::Accept);

    // 尚未連線
    h.handle.subscribe_all_clients().unwrap();

    h.handle.connect("coach-token").unwrap();
    let mut server = h.next_server().await;
    assert_eq!(server.next_frame().await["type"], "auth");
    timeout(WAIT, h.handle.wait_for(ChannelState::Authenticating))
        .await
        .unwrap()
        .unwrap();

    h.handle.subscribe_client("c-1").unwrap();
    h.handle.unsubscribe_client("c-1").unwrap();
    h.handle.subscribe_all_clients().unwrap();
    h.handle.send_coherence_update(update_payload("c-1")).unwrap();
    // commands are processed in order: once this ping arrives the four above were handled
    h.handle.ping().unwrap();

    assert_eq!(server.next_frame().await, json!({"type": "ping"}));
    assert!(server.pending_frames().is_empty());

    server.send(json!({"type": "auth_success"}));
    timeout(WAIT, h.handle.wait_for(ChannelState::Authenticated))
        .await
        .unwrap()
        .unwrap();

    h.handle.subscribe_all_clients().unwrap();
    assert_eq!(
        server.next_frame().await,
        json!({"type": "subscribe_all_clients"})
    );
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_backoff_then_give_up() {
    let mut h = Harness::start(Mode::Refuse);
    h.handle.connect("coach-token").unwrap();

    h.next_event(|e| matches!(e, ChannelEvent::GaveUp { .. })).await;

    let attempts = h.attempts.lock().unwrap().clone();
    assert_eq!(attempts.len(), 6, "initial attempt plus five reconnects");

    let expected = [100u64, 200, 400, 800, 1600];
    for (gap, expected_ms) in attempts.windows(2).map(|w| w[1] - w[0]).zip(expected) {
        assert!(
            gap >= Duration::from_millis(expected_ms)
                && gap < Duration::from_millis(expected_ms + 5),
            "gap {:?}, expected ~{}ms",
            gap,
            expected_ms
        );
    }

    // 放棄後不再重試
    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(h.attempt_count(), 6);
    assert_eq!(h.handle.state(), ChannelState::Disconnected);
    assert!(!h
        .drain_events()
        .iter()
        .any(|e| matches!(e, ChannelEvent::GaveUp { .. } | ChannelEvent::Reconnecting { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_reconnecting_events_report_doubling_delays() {
    let mut h = Harness::start(Mode::Refuse);
    h.handle.connect("coach-token").unwrap();

    let mut reconnects = Vec::new();
    loop {
        match h
            .next_event(|e| {
                matches!(
                    e,
                    ChannelEvent::Reconnecting { .. } | ChannelEvent::GaveUp { .. }
                )
            })
            .await
        {
            ChannelEvent::Reconnecting { attempt, delay } => reconnects.push((attempt, delay)),
            ChannelEvent::GaveUp { attempts } => {
                assert_eq!(attempts, 5);
                break;
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    assert_eq!(
        reconnects,
        vec![
            (1, Duration::from_millis(100)),
            (2, Duration::from_millis(200)),
            (3, Duration::from_millis(400)),
            (4, Duration::from_millis(800)),
            (5, Duration::from_millis(1600)),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_while_connecting_stops_reconnects() {
    let mut h = Harness::start(Mode::Hang);
    h.handle.connect("coach-token").unwrap();

    timeout(WAIT, h.handle.wait_for(ChannelState::Connecting))
        .await
        .unwrap()
        .unwrap();
    h.handle.disconnect().unwrap();
    timeout(WAIT, h.handle.wait_for(ChannelState::Disconnected))
        .await
        .unwrap()
        .unwrap();

    tokio::time::sleep(Duration::from_secs(3600)).await;

    assert_eq!(h.attempt_count(), 1);
    assert!(!h
        .drain_events()
        .iter()
        .any(|e| matches!(e, ChannelEvent::Reconnecting { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_backoff_cancels_reconnect() {
    let mut h = Harness::start(Mode::Refuse);
    h.handle.connect("coach-token").unwrap();

    h.next_event(|e| matches!(e, ChannelEvent::Reconnecting { attempt: 1, .. }))
        .await;
    h.handle.disconnect().unwrap();

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(h.attempt_count(), 1);
    assert_eq!(h.handle.state(), ChannelState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_while_open_and_stops_on_disconnect() {
    let mut h = Harness::start(Mode::Accept);
    h.handle.connect("coach-token").unwrap();
    let mut server = h.next_server().await;
    assert_eq!(server.next_frame().await["type"], "auth");

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(
        server.pending_frames(),
        vec![json!({"type": "ping"}), json!({"type": "ping"})]
    );

    h.handle.disconnect().unwrap();
    timeout(WAIT, h.handle.wait_for(ChannelState::Disconnected))
        .await
        .unwrap()
        .unwrap();

    // connection dropped: the frame stream ends without further pings
    let rest = timeout(WAIT, server.frames.recv()).await.unwrap();
    assert!(rest.is_none());

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(h.attempt_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_auth_error_disconnects_without_retry() {
    let mut h = Harness::start(Mode::Accept);
    h.handle.connect("expired-token").unwrap();
    let mut server = h.next_server().await;
    assert_eq!(server.next_frame().await["type"], "auth");

    server.send(json!({"type": "auth_error", "message": "token expired"}));

    match h.next_event(|e| matches!(e, ChannelEvent::AuthFailed { .. })).await {
        ChannelEvent::AuthFailed { message } => assert_eq!(message, "token expired"),
        other => panic!("unexpected event: {:?}", other),
    }
    timeout(WAIT, h.handle.wait_for(ChannelState::Disconnected))
        .await
        .unwrap()
        .unwrap();

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(h.attempt_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_server_close_reconnects_and_resets_attempts() {
    let mut h = Harness::start(Mode::Accept);
    let server = h.authenticated().await;

    drop(server);
    h.next_event(|e| {
        matches!(
            e,
            ChannelEvent::Reconnecting { attempt: 1, delay } if *delay == Duration::from_millis(100)
        )
    })
    .await;

    let mut second = h.next_server().await;
    assert_eq!(
        second.next_frame().await,
        json!({"type": "auth", "token": "coach-token"})
    );
    second.send(json!({"type": "auth_success"}));
    timeout(WAIT, h.handle.wait_for(ChannelState::Authenticated))
        .await
        .unwrap()
        .unwrap();

    drop(second);
    // authenticating again reset the counter
    h.next_event(|e| matches!(e, ChannelEvent::Reconnecting { attempt: 1, .. }))
        .await;
    let mut third = h.next_server().await;
    assert_eq!(third.next_frame().await["type"], "auth");

    drop(third);
    // third never authenticated: the counter keeps growing
    h.next_event(|e| matches!(e, ChannelEvent::Reconnecting { attempt: 2, .. }))
        .await;
    assert_eq!(h.attempt_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_connections_closed_before_auth_still_give_up() {
    let mut h = Harness::start(Mode::CloseBeforeAuth);
    h.handle.connect("coach-token").unwrap();

    match h.next_event(|e| matches!(e, ChannelEvent::GaveUp { .. })).await {
        ChannelEvent::GaveUp { attempts } => assert_eq!(attempts, 5),
        other => panic!("unexpected event: {:?}", other),
    }
    assert_eq!(h.attempt_count(), 6);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.attempt_count(), 6);
    assert_eq!(h.handle.state(), ChannelState::Disconnected);
    assert!(!h
        .drain_events()
        .iter()
        .any(|e| matches!(e, ChannelEvent::Authenticated | ChannelEvent::GaveUp { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_and_malformed_frames_are_ignored() {
    let mut h = Harness::start(Mode::Accept);
    let server = h.authenticated().await;

    server.send(json!({"type": "server_maintenance", "at": "02:00"}));
    server.send_raw("{not json");
    server.send(json!({"payload": {}}));
    server.send(json!({"type": "client_connected", "clientId": "c-5"}));

    match h.next_event(|e| matches!(e, ChannelEvent::ClientConnected { .. })).await {
        ChannelEvent::ClientConnected { client_id } => assert_eq!(client_id, "c-5"),
        other => panic!("unexpected event: {:?}", other),
    }
    assert_eq!(h.handle.state(), ChannelState::Authenticated);

    server.send(json!({"type": "pong"}));
    h.next_event(|e| matches!(e, ChannelEvent::Pong)).await;
}

#[tokio::test(start_paused = true)]
async fn test_state_changes_are_published_in_order() {
    let mut h = Harness::start(Mode::Accept);
    let _server = h.authenticated().await;

    let states: Vec<ChannelState> = h
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            ChannelEvent::StateChanged(state) => Some(state),
            _ => None,
        })
        .collect();

    assert_eq!(
        states,
        vec![
            ChannelState::Connecting,
            ChannelState::Authenticating,
            ChannelState::Authenticated
        ]
    );
}
