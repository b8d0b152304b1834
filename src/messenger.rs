//! The facade the embedding shell calls for message delivery.
//!
//! Everything here degrades instead of erroring: a down worker turns
//! `send_to_*` into `false` and `broadcast` into `0`, while the supervisor
//! recovers in the background. Only `start` and `stop` surface errors,
//! because their callers need to know setup or teardown failed.

use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::callbacks::CallbackRouter;
use crate::config::MessengerConfig;
use crate::error::Result;
use crate::protocol::{
    actions, BroadcastOptions, BroadcastPayload, ClientInfo, SendToPanePayload,
    SendToTargetPayload, StartOptions,
};
use crate::rpc::RequestChannel;
use crate::supervisor::{SharedStatus, Supervisor};
use crate::transport::{ProcessLauncher, WorkerLauncher};

pub struct Messenger {
    supervisor: Supervisor,
    channel: Arc<RequestChannel>,
    callbacks: Arc<CallbackRouter>,
    status: Arc<SharedStatus>,
}

impl Messenger {
    /// Facade over a worker relaunched from this executable.
    pub fn new(config: MessengerConfig) -> Self {
        Self::with_launcher(config, Arc::new(ProcessLauncher))
    }

    /// Facade over a custom launcher. Tests substitute a scripted worker
    /// through this.
    pub fn with_launcher(config: MessengerConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        let channel = Arc::new(RequestChannel::new(config.request_timeout_ms));
        let callbacks = Arc::new(CallbackRouter::new());
        let status = Arc::new(SharedStatus::default());
        let supervisor = Supervisor::spawn(
            config,
            launcher,
            channel.clone(),
            callbacks.clone(),
            status.clone(),
        );
        Self {
            supervisor,
            channel,
            callbacks,
            status,
        }
    }

    /// Bring the worker up and wait for its broker port. Idempotent: a call
    /// while one is already running returns the existing port without a
    /// second spawn.
    pub async fn start(&self, options: StartOptions) -> Result<u16> {
        self.supervisor.start(options).await
    }

    /// Tear the worker down and suppress any scheduled restart. Ok when no
    /// worker is running.
    pub async fn stop(&self) -> Result<()> {
        self.supervisor.stop().await
    }

    /// Last-known connected state. Pure read, never touches the process.
    pub fn is_running(&self) -> bool {
        self.supervisor.is_running()
    }

    /// Broker port from the most recent successful start, if any.
    pub fn get_port(&self) -> Option<u16> {
        self.supervisor.last_port()
    }

    /// Most recent client snapshot. When the worker is up this also kicks
    /// off a background refresh so the next call sees fresher data; the
    /// caller is never blocked on that round-trip and never sees its errors.
    pub fn get_clients(&self) -> Vec<ClientInfo> {
        if self.is_running() {
            let channel = self.channel.clone();
            let status = self.status.clone();
            tokio::spawn(async move {
                match channel.request(actions::GET_CLIENTS, None).await {
                    Ok(value) => match serde_json::from_value::<Vec<ClientInfo>>(value) {
                        Ok(clients) => *status.clients.lock() = clients,
                        Err(error) => {
                            tracing::debug!(target = "courier::messenger", error = %error, "ignoring malformed client snapshot");
                        }
                    },
                    Err(error) => {
                        tracing::debug!(target = "courier::messenger", error = %error, "client snapshot refresh failed");
                    }
                }
            });
        }
        self.status.clients.lock().clone()
    }

    /// Deliver `content` to every client whose name matches `target`, or
    /// to every role match when no name does. A down worker or failed
    /// request comes back as `false`, never as an error.
    pub async fn send_to_target(
        &self,
        target: impl Into<String>,
        content: impl Into<Value>,
        meta: Option<Value>,
    ) -> bool {
        let Some(payload) = encode(SendToTargetPayload {
            target: target.into(),
            content: content.into(),
            meta,
        }) else {
            return false;
        };
        self.deliver(actions::SEND_TO_TARGET, payload).await
    }

    /// Deliver `content` to the client registered for one pane. Same
    /// degrade-to-`false` contract as [`send_to_target`](Self::send_to_target).
    pub async fn send_to_pane(
        &self,
        pane_id: impl Into<String>,
        content: impl Into<Value>,
        meta: Option<Value>,
    ) -> bool {
        let Some(payload) = encode(SendToPanePayload {
            pane_id: pane_id.into(),
            content: content.into(),
            meta,
        }) else {
            return false;
        };
        self.deliver(actions::SEND_TO_PANE, payload).await
    }

    /// Deliver `content` to every connected client, minus an excluded
    /// target. Broadcasting with no worker desired is a valid no-op that
    /// returns 0; failures also come back as 0.
    pub async fn broadcast(
        &self,
        content: impl Into<Value>,
        options: Option<BroadcastOptions>,
    ) -> u64 {
        if !self.is_running() && !self.status.desired.load(Ordering::SeqCst) {
            tracing::debug!(target = "courier::messenger", "broadcast with no worker desired; nobody to deliver to");
            return 0;
        }
        let Some(payload) = encode(BroadcastPayload {
            content: content.into(),
            options: options.unwrap_or_default(),
        }) else {
            return 0;
        };
        if !self.supervisor.ensure_running().await {
            tracing::warn!(target = "courier::messenger", "worker not running; broadcast dropped");
            return 0;
        }
        match self.channel.request(actions::BROADCAST, Some(payload)).await {
            Ok(value) => value.as_u64().unwrap_or(0),
            Err(error) => {
                tracing::warn!(target = "courier::messenger", error = %error, "broadcast failed");
                0
            }
        }
    }

    /// Register the handler for client messages the worker surfaces via the
    /// `onMessage` callback. The handler's return value travels back to the
    /// worker verbatim as the callback result.
    pub fn on_message<F, Fut>(&self, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.callbacks.register(actions::ON_MESSAGE, handler);
    }

    /// Shared send path: make sure a worker is live, run the request, and
    /// degrade every failure to `false`.
    async fn deliver(&self, action: &str, payload: Value) -> bool {
        if !self.supervisor.ensure_running().await {
            tracing::warn!(target = "courier::messenger", action = %action, "worker not running; delivery dropped");
            return false;
        }
        match self.channel.request(action, Some(payload)).await {
            Ok(value) => value.as_bool().unwrap_or(false),
            Err(error) => {
                tracing::warn!(target = "courier::messenger", action = %action, error = %error, "delivery failed");
                false
            }
        }
    }
}

fn encode(payload: impl Serialize) -> Option<Value> {
    match serde_json::to_value(payload) {
        Ok(value) => Some(value),
        Err(error) => {
            tracing::warn!(target = "courier::messenger", error = %error, "failed to encode request payload");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::Messenger;
    use crate::config::MessengerConfig;
    use crate::error::{CourierError, Result};
    use crate::protocol::StartOptions;
    use crate::transport::{SpawnedWorker, WorkerLauncher};

    struct NeverLauncher;

    impl WorkerLauncher for NeverLauncher {
        fn spawn(&self) -> Result<SpawnedWorker> {
            Err(CourierError::Spawn(std::io::Error::other(
                "spawn disabled in this test",
            )))
        }
    }

    #[tokio::test]
    async fn never_started_facade_returns_safe_defaults() {
        let messenger =
            Messenger::with_launcher(MessengerConfig::default(), Arc::new(NeverLauncher));

        assert!(!messenger.is_running());
        assert_eq!(messenger.get_port(), None);
        assert!(messenger.get_clients().is_empty());
        assert!(!messenger.send_to_target("role-x", "hello", None).await);
        assert!(!messenger.send_to_pane("2", "hello", None).await);
        assert_eq!(messenger.broadcast("hello-all", None).await, 0);
    }

    #[tokio::test]
    async fn failed_start_degrades_delivery_instead_of_erroring() {
        let messenger =
            Messenger::with_launcher(MessengerConfig::default(), Arc::new(NeverLauncher));

        assert!(messenger.start(StartOptions::default()).await.is_err());
        assert!(!messenger.is_running());
        assert_eq!(messenger.get_port(), None);

        // The worker stays desired after a failed start, so each delivery
        // retries the spawn once and then degrades.
        assert!(!messenger.send_to_pane("2", "hello", None).await);
        assert_eq!(messenger.broadcast("hello-all", None).await, 0);
    }
}
