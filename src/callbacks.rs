//! Routing for worker-initiated `callback` frames.
//!
//! The worker asks the host to do something (deliver a client message to a
//! pane, say) and waits for a `callback-response`. Handlers are injected by
//! the embedding shell; this module only matches actions to handlers and
//! shapes the reply. It shares nothing with the request/response pending
//! table.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::protocol::{codes, WireFrame};

pub type CallbackFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

type StoredHandler = Arc<dyn Fn(Value) -> CallbackFuture + Send + Sync>;

#[derive(Default)]
pub struct CallbackRouter {
    handlers: Mutex<HashMap<String, StoredHandler>>,
}

impl CallbackRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for one action name, replacing any previous one.
    /// The handler receives the callback payload's `data` field.
    pub fn register<F, Fut>(&self, action: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let stored: StoredHandler = Arc::new(move |data| Box::pin(handler(data)));
        if self.handlers.lock().insert(action.to_string(), stored).is_some() {
            tracing::debug!(target = "courier::callbacks", action = %action, "replacing callback handler");
        }
    }

    /// Run the handler for an inbound callback and build the reply frame.
    ///
    /// An unregistered action is acknowledged with `ok: true, result: null`
    /// so the worker is never left waiting on us.
    pub async fn handle(&self, req_id: &str, action: &str, payload: Option<Value>) -> WireFrame {
        let handler = self.handlers.lock().get(action).cloned();
        let Some(handler) = handler else {
            tracing::debug!(target = "courier::callbacks", action = %action, "no handler registered, acking as no-op");
            return WireFrame::callback_ok(req_id, Some(Value::Null));
        };

        let data = payload
            .as_ref()
            .and_then(|payload| payload.get("data"))
            .cloned()
            .unwrap_or(Value::Null);

        match handler(data).await {
            Ok(result) => WireFrame::callback_ok(req_id, Some(result)),
            Err(error) => {
                tracing::warn!(target = "courier::callbacks", action = %action, error = %error, "callback handler failed");
                WireFrame::callback_error(req_id, codes::HANDLER_ERROR, error.to_string())
            }
        }
    }
}
