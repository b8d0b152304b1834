//! End-to-end tests over a real worker process.
//!
//! Each test forks the compiled binary in worker mode, drives the stdio
//! protocol the way the host supervisor would, and connects real WebSocket
//! clients to the broker it hosts.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use courier::protocol::{actions, WireFrame};
use courier::transport::{
    spawn_worker_command, SpawnedWorker, TransportEvent, WORKER_ROLE_BROKER, WORKER_ROLE_ENV,
};

const WAIT: Duration = Duration::from_secs(5);

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct WorkerUnderTest {
    link: SpawnedWorker,
    seq: u64,
    parked_callbacks: Vec<WireFrame>,
}

impl WorkerUnderTest {
    fn spawn() -> Self {
        let mut command = Command::new(env!("CARGO_BIN_EXE_agent-courier"));
        command
            .arg("worker")
            .env(WORKER_ROLE_ENV, WORKER_ROLE_BROKER)
            .env("RUST_LOG", "warn");
        let link = spawn_worker_command(command).expect("failed to spawn the worker binary");
        Self {
            link,
            seq: 0,
            parked_callbacks: Vec::new(),
        }
    }

    /// Start the broker on an ephemeral port, optionally pinned to a scope.
    async fn start(&mut self, scope: Option<&str>) -> u16 {
        let mut options = json!({ "port": 0 });
        if let Some(scope) = scope {
            options["sessionScopeId"] = json!(scope);
        }
        let response = self
            .request(actions::START, Some(json!({ "options": options })))
            .await;
        match response {
            WireFrame::Response {
                ok: true,
                result: Some(result),
                ..
            } => result["port"].as_u64().expect("start result lacks a port") as u16,
            other => panic!("start failed: {other:?}"),
        }
    }

    async fn request(&mut self, action: &str, payload: Option<Value>) -> WireFrame {
        self.seq += 1;
        let req_id = format!("t{}-0", self.seq);
        self.link
            .frames
            .send(WireFrame::request(req_id.clone(), action, payload))
            .await
            .expect("worker stdin closed");
        loop {
            let frame = self.next_frame().await;
            if matches!(&frame, WireFrame::Response { req_id: id, .. } if *id == req_id) {
                return frame;
            }
            if matches!(&frame, WireFrame::Callback { .. }) {
                self.parked_callbacks.push(frame);
            }
        }
    }

    async fn next_frame(&mut self) -> WireFrame {
        match timeout(WAIT, self.link.events.recv()).await {
            Ok(Some(TransportEvent::Frame(frame))) => frame,
            Ok(Some(TransportEvent::Error { message })) => panic!("transport error: {message}"),
            Ok(Some(TransportEvent::Exited { code, signal })) => {
                panic!("worker exited early: code {code:?}, signal {signal:?}")
            }
            Ok(None) => panic!("worker event channel closed"),
            Err(_) => panic!("timed out waiting on the worker"),
        }
    }

    /// Next surfaced client message, either one parked while waiting on a
    /// response or the next one off the wire.
    async fn next_callback(&mut self) -> WireFrame {
        if !self.parked_callbacks.is_empty() {
            return self.parked_callbacks.remove(0);
        }
        loop {
            let frame = self.next_frame().await;
            if matches!(&frame, WireFrame::Callback { .. }) {
                return frame;
            }
        }
    }

    /// RPC whose happy path is an `ok` response with a bare result.
    async fn delivery(&mut self, action: &str, payload: Value) -> Value {
        match self.request(action, Some(payload)).await {
            WireFrame::Response {
                ok: true,
                result: Some(result),
                ..
            } => result,
            other => panic!("{action} failed: {other:?}"),
        }
    }

    async fn reply(&mut self, frame: WireFrame) {
        self.link
            .frames
            .send(frame)
            .await
            .expect("worker stdin closed");
    }

    async fn client_count(&mut self) -> usize {
        match self.request(actions::GET_CLIENTS, None).await {
            WireFrame::Response {
                ok: true,
                result: Some(Value::Array(clients)),
                ..
            } => clients.len(),
            other => panic!("getClients failed: {other:?}"),
        }
    }

    async fn wait_for_clients(&mut self, expected: usize) {
        for _ in 0..100 {
            if self.client_count().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("never saw {expected} registered clients");
    }

    async fn shutdown(mut self) {
        let response = self.request(actions::SHUTDOWN, None).await;
        assert!(matches!(response, WireFrame::Response { ok: true, .. }));
        loop {
            match timeout(WAIT, self.link.events.recv()).await {
                Ok(Some(TransportEvent::Exited { .. })) | Ok(None) => return,
                Ok(Some(_)) => {}
                Err(_) => panic!("worker did not exit after shutdown"),
            }
        }
    }
}

async fn connect_client(port: u16, query: &str) -> WsClient {
    let url = format!("ws://127.0.0.1:{port}/ws?{query}");
    let (socket, _) = connect_async(url).await.expect("client failed to connect");
    socket
}

async fn next_delivery(socket: &mut WsClient) -> Value {
    loop {
        let message = timeout(WAIT, socket.next())
            .await
            .expect("timed out waiting for a delivery")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).expect("delivery is not JSON");
        }
    }
}

// ==================== targeted delivery ====================

#[tokio::test]
async fn target_and_pane_delivery_reach_the_right_clients() {
    let mut worker = WorkerUnderTest::spawn();
    let port = worker.start(None).await;
    assert!(port > 0);

    let mut alpha = connect_client(port, "name=alpha&role=worker&pane=1").await;
    let mut beta = connect_client(port, "name=beta&role=reviewer&pane=2").await;
    worker.wait_for_clients(2).await;

    match worker.request(actions::GET_CLIENTS, None).await {
        WireFrame::Response {
            ok: true,
            result: Some(snapshot),
            ..
        } => {
            let names: Vec<&str> = snapshot
                .as_array()
                .expect("snapshot is not a list")
                .iter()
                .map(|client| client["name"].as_str().unwrap_or(""))
                .collect();
            assert_eq!(names, ["alpha", "beta"]);
            assert_eq!(snapshot[0]["role"], "worker");
            assert_eq!(snapshot[1]["paneId"], "2");
        }
        other => panic!("getClients failed: {other:?}"),
    }

    let by_name = worker
        .delivery(
            actions::SEND_TO_TARGET,
            json!({ "target": "alpha", "content": "direct-name" }),
        )
        .await;
    assert_eq!(by_name, json!(true));
    assert_eq!(next_delivery(&mut alpha).await["content"], "direct-name");

    let by_role = worker
        .delivery(
            actions::SEND_TO_TARGET,
            json!({ "target": "reviewer", "content": "direct-role" }),
        )
        .await;
    assert_eq!(by_role, json!(true));
    let frame = next_delivery(&mut beta).await;
    assert_eq!(frame["kind"], "message");
    assert_eq!(frame["content"], "direct-role");

    let miss = worker
        .delivery(
            actions::SEND_TO_TARGET,
            json!({ "target": "role-x", "content": "nobody" }),
        )
        .await;
    assert_eq!(miss, json!(false));

    let pane = worker
        .delivery(
            actions::SEND_TO_PANE,
            json!({ "paneId": "2", "content": "pane-mail", "meta": { "urgent": true } }),
        )
        .await;
    assert_eq!(pane, json!(true));
    let mail = next_delivery(&mut beta).await;
    assert_eq!(mail["content"], "pane-mail");
    assert_eq!(mail["meta"]["urgent"], true);

    // A final broadcast doubles as the proof nothing leaked across: each
    // client's next frame is the sweep, not someone else's delivery.
    let swept = worker
        .delivery(actions::BROADCAST, json!({ "content": "sweep" }))
        .await;
    assert_eq!(swept, json!(2));
    assert_eq!(next_delivery(&mut alpha).await["content"], "sweep");
    assert_eq!(next_delivery(&mut beta).await["content"], "sweep");

    worker.shutdown().await;
}

#[tokio::test]
async fn broadcast_excludes_the_named_target() {
    let mut worker = WorkerUnderTest::spawn();
    let port = worker.start(None).await;

    let mut alpha = connect_client(port, "name=alpha&role=worker&pane=1").await;
    let mut beta = connect_client(port, "name=beta&role=worker&pane=2").await;
    let mut gamma = connect_client(port, "name=gamma&role=worker&pane=3").await;
    worker.wait_for_clients(3).await;

    let fanout = worker
        .delivery(
            actions::BROADCAST,
            json!({ "content": "fanout", "options": { "excludeTarget": "beta" } }),
        )
        .await;
    assert_eq!(fanout, json!(2));
    assert_eq!(next_delivery(&mut alpha).await["content"], "fanout");
    assert_eq!(next_delivery(&mut gamma).await["content"], "fanout");

    let swept = worker
        .delivery(actions::BROADCAST, json!({ "content": "sweep" }))
        .await;
    assert_eq!(swept, json!(3));
    assert_eq!(next_delivery(&mut beta).await["content"], "sweep");

    worker.shutdown().await;
}

// ==================== session scoping ====================

#[tokio::test]
async fn scoped_broker_turns_away_other_sessions() {
    let mut worker = WorkerUnderTest::spawn();
    let port = worker.start(Some("sess-1")).await;

    let stranger =
        connect_async(format!("ws://127.0.0.1:{port}/ws?name=mallory&scope=sess-2")).await;
    match stranger {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 403),
        other => panic!("scope mismatch was not rejected: {other:?}"),
    }

    let missing = connect_async(format!("ws://127.0.0.1:{port}/ws?name=anon")).await;
    assert!(
        missing.is_err(),
        "scope-less client connected to a scoped broker"
    );

    let _member = connect_client(port, "name=alpha&scope=sess-1").await;
    worker.wait_for_clients(1).await;

    worker.shutdown().await;
}

// ==================== client messages ====================

#[tokio::test]
async fn client_message_round_trips_through_the_host() {
    let mut worker = WorkerUnderTest::spawn();
    let port = worker.start(None).await;

    let mut alpha = connect_client(port, "name=alpha&role=worker&pane=1").await;
    worker.wait_for_clients(1).await;

    alpha
        .send(Message::Text(json!({ "text": "hello host" }).to_string()))
        .await
        .expect("client send failed");

    let callback = worker.next_callback().await;
    let WireFrame::Callback {
        req_id,
        action,
        payload,
    } = callback
    else {
        panic!("expected a callback frame");
    };
    assert_eq!(action, actions::ON_MESSAGE);
    assert!(req_id.starts_with("cb1-"), "unexpected callback id {req_id}");
    let payload = payload.expect("callback payload missing");
    assert_eq!(payload["data"]["from"]["name"], "alpha");
    assert_eq!(payload["data"]["message"]["text"], "hello host");

    worker
        .reply(WireFrame::callback_ok(
            req_id.clone(),
            Some(json!({ "ack": true })),
        ))
        .await;

    let verdict = next_delivery(&mut alpha).await;
    assert_eq!(verdict["kind"], "hostResult");
    assert_eq!(verdict["reqId"], req_id);
    assert_eq!(verdict["ok"], true);
    assert_eq!(verdict["result"], json!({ "ack": true }));

    worker.shutdown().await;
}
