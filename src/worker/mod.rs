//! The out-of-process worker: a stdio protocol loop in front of the broker.
//!
//! Frames arrive as JSON lines on stdin and leave on stdout; logs go to
//! stderr so the protocol channel stays clean. The worker is deliberately
//! dumb about lifecycle. All resilience lives host-side, and if this
//! process dies the supervisor replaces it.

pub mod broker;

pub use broker::{Broker, ClientMessage};

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::protocol::{
    actions, codes, BroadcastPayload, SendToPanePayload, SendToTargetPayload, StartPayload,
    WireFrame,
};
use crate::transport::{WORKER_ROLE_BROKER, WORKER_ROLE_ENV};

const DEFAULT_CALLBACK_TIMEOUT_MS: u64 = 10_000;
const CALLBACK_SWEEP_INTERVAL: Duration = Duration::from_millis(250);
const CHANNEL_CAPACITY: usize = 256;

/// A client message waiting on the host's `callback-response`.
struct PendingCallback {
    client_id: Uuid,
    expires_at: Instant,
}

struct WorkerState {
    broker: Option<Broker>,
    callback_timeout: Duration,
    callback_seq: u64,
    pending_callbacks: HashMap<String, PendingCallback>,
}

impl WorkerState {
    fn new() -> Self {
        Self {
            broker: None,
            callback_timeout: Duration::from_millis(DEFAULT_CALLBACK_TIMEOUT_MS),
            callback_seq: 0,
            pending_callbacks: HashMap::new(),
        }
    }
}

/// Run the worker protocol loop over this process's stdio. Returns once the
/// host asks for shutdown or closes stdin.
pub async fn run() -> Result<()> {
    let role = std::env::var(WORKER_ROLE_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    if role.as_deref() != Some(WORKER_ROLE_BROKER) {
        tracing::warn!(
            target = "courier::worker",
            role = role.as_deref().unwrap_or("<unset>"),
            "running without the broker role marker"
        );
    }

    let (out_tx, mut out_rx) = mpsc::channel::<WireFrame>(CHANNEL_CAPACITY);
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Ok(line) = serde_json::to_string(&frame) {
                use std::io::Write;
                let mut stdout = std::io::stdout().lock();
                let _ = stdout.write_all(line.as_bytes());
                let _ = stdout.write_all(b"\n");
                let _ = stdout.flush();
            }
        }
    });

    let (inbound_tx, mut inbound_rx) = mpsc::channel::<ClientMessage>(CHANNEL_CAPACITY);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut sweep = tokio::time::interval(CALLBACK_SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut state = WorkerState::new();
    tracing::info!(target = "courier::worker", pid = std::process::id(), "worker ready");

    let mut running = true;
    while running {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let frame: WireFrame = match serde_json::from_str(line) {
                        Ok(frame) => frame,
                        Err(error) => {
                            tracing::warn!(target = "courier::worker", error = %error, "malformed host frame");
                            if let Some(req_id) = recover_req_id(line) {
                                let reply = WireFrame::error_response(
                                    req_id,
                                    codes::BAD_PAYLOAD,
                                    format!("unparseable frame: {error}"),
                                );
                                let _ = out_tx.send(reply).await;
                            }
                            continue;
                        }
                    };
                    handle_host_frame(&mut state, frame, &out_tx, &inbound_tx, &mut running).await;
                }
                Ok(None) => {
                    tracing::info!(target = "courier::worker", "host closed stdin; exiting");
                    running = false;
                }
                Err(error) => {
                    tracing::error!(target = "courier::worker", error = %error, "stdin read failed; exiting");
                    running = false;
                }
            },
            Some(message) = inbound_rx.recv() => {
                surface_client_message(&mut state, message, &out_tx).await;
            }
            _ = sweep.tick() => {
                expire_callbacks(&mut state).await;
            }
        }
    }

    if let Some(broker) = state.broker.take() {
        broker.shutdown();
    }
    // Close the out channel and wait for the writer to drain, so the final
    // ack is on the wire before the process exits.
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

async fn handle_host_frame(
    state: &mut WorkerState,
    frame: WireFrame,
    out: &mpsc::Sender<WireFrame>,
    inbound: &mpsc::Sender<ClientMessage>,
    running: &mut bool,
) {
    match frame {
        WireFrame::Request {
            req_id,
            action,
            payload,
        } => {
            let reply = dispatch_request(state, &req_id, &action, payload, inbound, running).await;
            if out.send(reply).await.is_err() {
                *running = false;
            }
        }
        WireFrame::CallbackResponse {
            req_id,
            ok,
            result,
            error,
            ..
        } => {
            resolve_callback(state, &req_id, ok, result, error).await;
        }
        other => {
            tracing::debug!(target = "courier::worker", kind = other.kind(), "dropping unexpected frame kind from host");
        }
    }
}

async fn dispatch_request(
    state: &mut WorkerState,
    req_id: &str,
    action: &str,
    payload: Option<Value>,
    inbound: &mpsc::Sender<ClientMessage>,
    running: &mut bool,
) -> WireFrame {
    match action {
        actions::START => handle_start(state, req_id, payload, inbound).await,
        actions::SHUTDOWN => {
            tracing::info!(target = "courier::worker", "shutdown requested by host");
            *running = false;
            WireFrame::ok_response(req_id, Some(json!({ "shutdown": true })))
        }
        actions::SEND_TO_TARGET => match state.broker.as_ref() {
            None => not_started(req_id, action),
            Some(broker) => match parse::<SendToTargetPayload>(payload) {
                Ok(request) => {
                    let delivered = broker
                        .deliver_to_target(&request.target, &request.content, request.meta.as_ref())
                        .await;
                    WireFrame::ok_response(req_id, Some(json!(delivered)))
                }
                Err(error) => bad_payload(req_id, action, error),
            },
        },
        actions::SEND_TO_PANE => match state.broker.as_ref() {
            None => not_started(req_id, action),
            Some(broker) => match parse::<SendToPanePayload>(payload) {
                Ok(request) => {
                    let delivered = broker
                        .deliver_to_pane(&request.pane_id, &request.content, request.meta.as_ref())
                        .await;
                    WireFrame::ok_response(req_id, Some(json!(delivered)))
                }
                Err(error) => bad_payload(req_id, action, error),
            },
        },
        actions::BROADCAST => match state.broker.as_ref() {
            None => not_started(req_id, action),
            Some(broker) => match parse::<BroadcastPayload>(payload) {
                Ok(request) => {
                    let delivered = broker
                        .broadcast(&request.content, request.options.exclude_target.as_deref())
                        .await;
                    WireFrame::ok_response(req_id, Some(json!(delivered)))
                }
                Err(error) => bad_payload(req_id, action, error),
            },
        },
        actions::GET_CLIENTS => match state.broker.as_ref() {
            None => not_started(req_id, action),
            Some(broker) => WireFrame::ok_response(req_id, Some(json!(broker.clients()))),
        },
        other => {
            tracing::warn!(target = "courier::worker", action = %other, "unknown action from host");
            WireFrame::error_response(
                req_id,
                codes::UNKNOWN_ACTION,
                format!("no such action: {other}"),
            )
        }
    }
}

async fn handle_start(
    state: &mut WorkerState,
    req_id: &str,
    payload: Option<Value>,
    inbound: &mpsc::Sender<ClientMessage>,
) -> WireFrame {
    if let Some(broker) = state.broker.as_ref() {
        // A second start reports the port already bound.
        tracing::debug!(target = "courier::worker", port = broker.port(), "start while already started");
        return WireFrame::ok_response(req_id, Some(json!({ "port": broker.port() })));
    }

    let request = match parse::<StartPayload>(Some(payload.unwrap_or_else(|| json!({})))) {
        Ok(request) => request,
        Err(error) => return bad_payload(req_id, actions::START, error),
    };
    let options = request.options;
    state.callback_timeout = Duration::from_millis(
        options
            .callback_timeout_ms
            .unwrap_or(DEFAULT_CALLBACK_TIMEOUT_MS),
    );

    match Broker::start(options.port, options.session_scope_id, inbound.clone()).await {
        Ok(broker) => {
            let port = broker.port();
            state.broker = Some(broker);
            WireFrame::ok_response(req_id, Some(json!({ "port": port })))
        }
        Err(error) => {
            tracing::error!(target = "courier::worker", error = %error, "failed to start broker");
            WireFrame::error_response(req_id, codes::WORKER_ERROR, error.to_string())
        }
    }
}

/// Surface a client frame to the host as an `onMessage` callback and park
/// the sender in the pending table until the host answers or the deadline
/// passes.
async fn surface_client_message(
    state: &mut WorkerState,
    message: ClientMessage,
    out: &mpsc::Sender<WireFrame>,
) {
    state.callback_seq += 1;
    let req_id = format!("cb{}-{}", state.callback_seq, Utc::now().timestamp_millis());
    let payload = json!({
        "data": {
            "from": message.from,
            "message": message.data,
        }
    });
    state.pending_callbacks.insert(
        req_id.clone(),
        PendingCallback {
            client_id: message.client_id,
            expires_at: Instant::now() + state.callback_timeout,
        },
    );
    tracing::debug!(target = "courier::worker", req_id = %req_id, "surfacing client message to host");
    let frame = WireFrame::callback(req_id.clone(), actions::ON_MESSAGE, Some(payload));
    if out.send(frame).await.is_err() {
        state.pending_callbacks.remove(&req_id);
    }
}

async fn resolve_callback(
    state: &mut WorkerState,
    req_id: &str,
    ok: bool,
    result: Option<Value>,
    error: Option<String>,
) {
    let Some(pending) = state.pending_callbacks.remove(req_id) else {
        tracing::debug!(target = "courier::worker", req_id = %req_id, "callback-response matched nothing; probably expired");
        return;
    };
    let Some(broker) = state.broker.as_ref() else {
        return;
    };
    let verdict = if ok {
        json!({
            "kind": "hostResult",
            "reqId": req_id,
            "ok": true,
            "result": result.unwrap_or(Value::Null),
        })
    } else {
        json!({
            "kind": "hostResult",
            "reqId": req_id,
            "ok": false,
            "error": error.unwrap_or_else(|| "host rejected the message".to_string()),
        })
    };
    broker.notify_host_result(pending.client_id, verdict).await;
}

/// Fail pending callbacks whose deadline passed, telling the waiting client.
async fn expire_callbacks(state: &mut WorkerState) {
    if state.pending_callbacks.is_empty() {
        return;
    }
    let now = Instant::now();
    let expired: Vec<String> = state
        .pending_callbacks
        .iter()
        .filter(|(_, pending)| pending.expires_at <= now)
        .map(|(req_id, _)| req_id.clone())
        .collect();
    for req_id in expired {
        let Some(pending) = state.pending_callbacks.remove(&req_id) else {
            continue;
        };
        tracing::warn!(target = "courier::worker", req_id = %req_id, "host callback timed out");
        if let Some(broker) = state.broker.as_ref() {
            let verdict = json!({
                "kind": "hostResult",
                "reqId": req_id,
                "ok": false,
                "error": "host callback timed out",
            });
            broker.notify_host_result(pending.client_id, verdict).await;
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(payload: Option<Value>) -> serde_json::Result<T> {
    serde_json::from_value(payload.unwrap_or(Value::Null))
}

/// Best-effort `reqId` from a line that would not parse as a frame, so the
/// host's caller gets an error instead of a timeout.
fn recover_req_id(line: &str) -> Option<String> {
    let value: Value = serde_json::from_str(line).ok()?;
    value.get("reqId")?.as_str().map(str::to_string)
}

fn not_started(req_id: &str, action: &str) -> WireFrame {
    tracing::warn!(target = "courier::worker", action = %action, "request before start");
    WireFrame::error_response(req_id, codes::NOT_STARTED, "worker not started")
}

fn bad_payload(req_id: &str, action: &str, error: serde_json::Error) -> WireFrame {
    tracing::warn!(target = "courier::worker", action = %action, error = %error, "bad request payload");
    WireFrame::error_response(
        req_id,
        codes::BAD_PAYLOAD,
        format!("bad {action} payload: {error}"),
    )
}
