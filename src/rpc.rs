//! Correlated request/response over the worker channel.
//!
//! Callers get a future per request; the frame router resolves it when the
//! matching `response` arrives. A crash rejects every outstanding future at
//! once so nobody hangs across a worker generation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use crate::error::{CourierError, Result};
use crate::protocol::WireFrame;

pub struct RequestChannel {
    /// Outstanding requests keyed by `reqId`. Each entry is resolved or
    /// rejected exactly once.
    pending: Mutex<HashMap<String, oneshot::Sender<Result<Value>>>>,
    /// Monotonic counter; combined with a timestamp to form unique ids.
    seq: AtomicU64,
    /// Frame sink of the current worker generation, if one is live.
    sender: Mutex<Option<mpsc::Sender<WireFrame>>>,
    default_timeout_ms: u64,
}

impl RequestChannel {
    pub fn new(default_timeout_ms: u64) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            sender: Mutex::new(None),
            default_timeout_ms,
        }
    }

    /// Point the channel at a freshly spawned worker.
    pub fn attach(&self, sender: mpsc::Sender<WireFrame>) {
        *self.sender.lock() = Some(sender);
    }

    /// Drop the current worker's sink, but only if it still is `sender`.
    /// The guard keeps a late exit notification from an old worker
    /// generation from clobbering a newer generation's sink. Returns false
    /// when `sender` was already replaced, which tells the caller the exit
    /// it is handling belongs to a superseded worker. In-flight requests
    /// are settled separately via [`reject_all`](Self::reject_all).
    pub fn detach_matching(&self, sender: &mpsc::Sender<WireFrame>) -> bool {
        let mut current = self.sender.lock();
        if current
            .as_ref()
            .is_some_and(|live| live.same_channel(sender))
        {
            *current = None;
            return true;
        }
        false
    }

    pub async fn request(&self, action: &str, payload: Option<Value>) -> Result<Value> {
        self.request_with_timeout(action, payload, self.default_timeout_ms)
            .await
    }

    /// Send one request and wait for its matching response.
    ///
    /// A timeout rejects this caller only; the worker is not told to abandon
    /// the operation and may still complete it.
    pub async fn request_with_timeout(
        &self,
        action: &str,
        payload: Option<Value>,
        timeout_ms: u64,
    ) -> Result<Value> {
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or(CourierError::NotRunning)?;

        let req_id = self.next_req_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(req_id.clone(), tx);

        tracing::debug!(target = "courier::rpc", req_id = %req_id, action = %action, "sending request");
        let frame = WireFrame::request(req_id.clone(), action, payload);
        if sender.send(frame).await.is_err() {
            self.pending.lock().remove(&req_id);
            return Err(CourierError::ChannelClosed);
        }

        match timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(outcome)) => outcome,
            // Entry dropped without a verdict; the table itself went away.
            Ok(Err(_)) => Err(CourierError::ChannelClosed),
            Err(_) => {
                self.pending.lock().remove(&req_id);
                Err(CourierError::RequestTimeout {
                    action: action.to_string(),
                    timeout_ms,
                })
            }
        }
    }

    /// Deliver a `response` frame to whoever is waiting on it. Returns false
    /// when nothing matches, e.g. the caller already timed out.
    pub fn resolve(
        &self,
        req_id: &str,
        ok: bool,
        result: Option<Value>,
        error: Option<String>,
        code: Option<String>,
    ) -> bool {
        let Some(tx) = self.pending.lock().remove(req_id) else {
            return false;
        };
        let outcome = if ok {
            Ok(result.unwrap_or(Value::Null))
        } else {
            Err(CourierError::worker(
                code,
                error.unwrap_or_else(|| "worker reported an error".to_string()),
            ))
        };
        let _ = tx.send(outcome);
        true
    }

    /// Reject every outstanding request with the worker's exit details.
    /// Called once per exit event; returns how many callers were failed.
    pub fn reject_all(&self, code: Option<i32>, signal: Option<i32>) -> usize {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(CourierError::WorkerExited { code, signal }));
        }
        count
    }

    fn next_req_id(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{seq}-{}", Utc::now().timestamp_millis())
    }
}
