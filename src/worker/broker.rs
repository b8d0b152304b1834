//! The worker-side message broker: a local WebSocket hub agent CLI panes
//! connect to.
//!
//! Clients identify themselves with query parameters on the upgrade request
//! (`name`, `role`, `pane`, `scope`). Delivery picks recipients by those
//! attributes; anything a client sends upstream is surfaced to the worker
//! loop so the host can decide what to do with it.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{routing, Json, Router};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::protocol::ClientInfo;

const CLIENT_CHANNEL_CAPACITY: usize = 64;

/// A client frame surfaced to the worker loop, tagged with who sent it.
#[derive(Debug)]
pub struct ClientMessage {
    pub client_id: Uuid,
    pub from: ClientInfo,
    pub data: Value,
}

struct ClientEntry {
    name: String,
    role: Option<String>,
    pane_id: Option<String>,
    connected_at: DateTime<Utc>,
    tx: mpsc::Sender<String>,
}

impl ClientEntry {
    fn info(&self, id: Uuid) -> ClientInfo {
        ClientInfo {
            id: id.to_string(),
            name: self.name.clone(),
            role: self.role.clone(),
            pane_id: self.pane_id.clone(),
            connected_at: self.connected_at,
        }
    }
}

struct BrokerShared {
    clients: Mutex<HashMap<Uuid, ClientEntry>>,
    /// Session scope connecting clients must present, when set.
    scope: Option<String>,
    inbound: mpsc::Sender<ClientMessage>,
}

/// The running broker: an axum server plus the client registry.
pub struct Broker {
    shared: Arc<BrokerShared>,
    port: u16,
    server: JoinHandle<()>,
}

impl Broker {
    /// Bind on 127.0.0.1 and start serving. Port 0 picks an ephemeral port;
    /// the chosen one is reported by [`port`](Self::port).
    pub async fn start(
        port: u16,
        scope: Option<String>,
        inbound: mpsc::Sender<ClientMessage>,
    ) -> anyhow::Result<Self> {
        let shared = Arc::new(BrokerShared {
            clients: Mutex::new(HashMap::new()),
            scope,
            inbound,
        });
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .with_context(|| format!("failed to bind broker on port {port}"))?;
        let port = listener
            .local_addr()
            .context("broker listener has no local address")?
            .port();

        let router = broker_router(shared.clone());
        let server = tokio::spawn(async move {
            if let Err(error) = axum::serve(listener, router).await {
                tracing::error!(target = "courier::broker", error = %error, "broker server error");
            }
        });
        tracing::info!(target = "courier::broker", port, "broker listening");
        Ok(Self {
            shared,
            port,
            server,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Connected clients, oldest connection first.
    pub fn clients(&self) -> Vec<ClientInfo> {
        self.shared.client_list()
    }

    pub async fn deliver_to_target(
        &self,
        target: &str,
        content: &Value,
        meta: Option<&Value>,
    ) -> bool {
        self.shared.deliver_to_target(target, content, meta).await
    }

    pub async fn deliver_to_pane(
        &self,
        pane_id: &str,
        content: &Value,
        meta: Option<&Value>,
    ) -> bool {
        self.shared.deliver_to_pane(pane_id, content, meta).await
    }

    pub async fn broadcast(&self, content: &Value, exclude_target: Option<&str>) -> u64 {
        self.shared.broadcast(content, exclude_target).await
    }

    /// Push the host's verdict on a surfaced message back to the client
    /// that sent it. False when that client is already gone.
    pub async fn notify_host_result(&self, client_id: Uuid, frame: Value) -> bool {
        self.shared.notify_host_result(client_id, frame).await
    }

    /// Stop accepting connections and drop the registry.
    pub fn shutdown(&self) {
        self.server.abort();
        self.shared.clients.lock().clear();
        tracing::info!(target = "courier::broker", port = self.port, "broker shut down");
    }
}

impl BrokerShared {
    fn client_list(&self) -> Vec<ClientInfo> {
        let mut list: Vec<ClientInfo> = self
            .clients
            .lock()
            .iter()
            .map(|(id, entry)| entry.info(*id))
            .collect();
        list.sort_by(|a, b| {
            a.connected_at
                .cmp(&b.connected_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        list
    }

    /// Name matches win over role matches; role is only consulted when no
    /// client carries the name.
    async fn deliver_to_target(&self, target: &str, content: &Value, meta: Option<&Value>) -> bool {
        let sinks = {
            let clients = self.clients.lock();
            let by_name: Vec<_> = clients
                .values()
                .filter(|entry| entry.name == target)
                .map(|entry| entry.tx.clone())
                .collect();
            if by_name.is_empty() {
                clients
                    .values()
                    .filter(|entry| entry.role.as_deref() == Some(target))
                    .map(|entry| entry.tx.clone())
                    .collect()
            } else {
                by_name
            }
        };
        if sinks.is_empty() {
            tracing::debug!(target = "courier::broker", recipient = %target, "no client matches target");
        }
        deliver_all(sinks, delivery_text(content, meta)).await > 0
    }

    async fn deliver_to_pane(&self, pane_id: &str, content: &Value, meta: Option<&Value>) -> bool {
        let sinks: Vec<_> = {
            let clients = self.clients.lock();
            clients
                .values()
                .filter(|entry| entry.pane_id.as_deref() == Some(pane_id))
                .map(|entry| entry.tx.clone())
                .collect()
        };
        deliver_all(sinks, delivery_text(content, meta)).await > 0
    }

    async fn broadcast(&self, content: &Value, exclude_target: Option<&str>) -> u64 {
        let sinks: Vec<_> = {
            let clients = self.clients.lock();
            clients
                .values()
                .filter(|entry| match exclude_target {
                    Some(excluded) => {
                        entry.name != excluded && entry.role.as_deref() != Some(excluded)
                    }
                    None => true,
                })
                .map(|entry| entry.tx.clone())
                .collect()
        };
        deliver_all(sinks, delivery_text(content, None)).await
    }

    async fn notify_host_result(&self, client_id: Uuid, frame: Value) -> bool {
        let sink = self
            .clients
            .lock()
            .get(&client_id)
            .map(|entry| entry.tx.clone());
        let Some(sink) = sink else {
            tracing::debug!(target = "courier::broker", client_id = %client_id, "client gone before host result arrived");
            return false;
        };
        sink.send(frame.to_string()).await.is_ok()
    }
}

fn delivery_text(content: &Value, meta: Option<&Value>) -> String {
    let mut frame = json!({ "kind": "message", "content": content });
    if let Some(meta) = meta {
        frame["meta"] = meta.clone();
    }
    frame.to_string()
}

/// Fan `text` out to every sink, counting the ones that accepted it. A
/// client mid-disconnect just drops out of the count.
async fn deliver_all(sinks: Vec<mpsc::Sender<String>>, text: String) -> u64 {
    let mut delivered = 0;
    for sink in sinks {
        if sink.send(text.clone()).await.is_ok() {
            delivered += 1;
        }
    }
    delivered
}

fn broker_router(shared: Arc<BrokerShared>) -> Router {
    Router::new()
        .route("/health", routing::get(broker_health))
        .route("/ws", routing::get(broker_ws))
        .with_state(shared)
}

#[derive(Debug, Deserialize, Default)]
struct ConnectQuery {
    name: Option<String>,
    role: Option<String>,
    pane: Option<String>,
    scope: Option<String>,
}

async fn broker_health(State(shared): State<Arc<BrokerShared>>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "clients": shared.clients.lock().len(),
    }))
}

async fn broker_ws(
    ws: WebSocketUpgrade,
    State(shared): State<Arc<BrokerShared>>,
    Query(query): Query<ConnectQuery>,
) -> Response {
    if let Some(required) = shared.scope.as_deref() {
        let offered = query
            .scope
            .as_deref()
            .map(str::trim)
            .filter(|scope| !scope.is_empty());
        if offered != Some(required) {
            tracing::warn!(
                target = "courier::broker",
                client = query.name.as_deref().unwrap_or("<unnamed>"),
                "rejecting client from another session scope"
            );
            return (StatusCode::FORBIDDEN, "scope mismatch").into_response();
        }
    }
    ws.on_upgrade(move |socket| client_session(socket, shared, query))
        .into_response()
}

async fn client_session(mut socket: WebSocket, shared: Arc<BrokerShared>, query: ConnectQuery) {
    let id = Uuid::new_v4();
    let name = normalize(query.name).unwrap_or_else(|| format!("client-{}", id.simple()));
    let (tx, mut rx) = mpsc::channel::<String>(CLIENT_CHANNEL_CAPACITY);
    let info = {
        let entry = ClientEntry {
            name: name.clone(),
            role: normalize(query.role),
            pane_id: normalize(query.pane),
            connected_at: Utc::now(),
            tx,
        };
        let info = entry.info(id);
        shared.clients.lock().insert(id, entry);
        info
    };
    tracing::info!(target = "courier::broker", client = %name, id = %id, "client connected");

    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(text) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let data = serde_json::from_str::<Value>(&text)
                        .unwrap_or_else(|_| Value::String(text.to_string()));
                    let message = ClientMessage {
                        client_id: id,
                        from: info.clone(),
                        data,
                    };
                    if shared.inbound.send(message).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    tracing::debug!(target = "courier::broker", client = %name, error = %error, "client socket error");
                    break;
                }
            },
        }
    }

    shared.clients.lock().remove(&id);
    tracing::info!(target = "courier::broker", client = %name, "client disconnected");
}

fn normalize(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
