//! Worker lifecycle supervision.
//!
//! One actor task owns all lifecycle state and serializes `start`, `stop`,
//! and `ensure_running`, which is what makes concurrent starts coalesce and
//! lets `stop` naturally wait out an in-flight start. Exit notifications and
//! restart timers arrive on an internal channel tagged with tokens so stale
//! events from a replaced worker are ignored.
//!
//! Frame routing deliberately lives outside the actor: a per-worker router
//! task resolves responses and dispatches callbacks even while the actor is
//! busy awaiting its own `start` round-trip.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::callbacks::CallbackRouter;
use crate::config::MessengerConfig;
use crate::error::{CourierError, Result};
use crate::protocol::{actions, ClientInfo, StartOptions, StartPayload, StartResult, WireFrame};
use crate::rpc::RequestChannel;
use crate::transport::{SpawnedWorker, TransportEvent, WorkerKiller, WorkerLauncher};

/// Where the supervisor currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// No worker desired, none running.
    Stopped,
    /// An explicit `start` is in flight.
    Starting,
    /// A worker is up and answered its `start` request.
    Running,
    /// A worker is desired but not live; a timer or recovery attempt will
    /// bring one back.
    Recovering,
}

impl SupervisorState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Recovering => "recovering",
        }
    }
}

/// Backoff for restart attempt `attempt` (1-based): doubles from the base,
/// capped at the max. Deterministic so the timing is predictable in tests
/// and in incident logs.
pub fn restart_delay(base_ms: u64, max_ms: u64, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(20);
    let delay = base_ms.saturating_mul(1u64 << exp).min(max_ms);
    Duration::from_millis(delay)
}

/// Read-mostly snapshot shared between the supervisor, the frame router,
/// and the delivery facade. Never authoritative for delivery decisions;
/// `port` and `clients` are best-effort caches.
#[derive(Default)]
pub struct SharedStatus {
    pub(crate) connected: AtomicBool,
    /// Mirror of the actor's desired-running intent, for cheap facade reads.
    pub(crate) desired: AtomicBool,
    pub(crate) port: Mutex<Option<u16>>,
    pub(crate) clients: Mutex<Vec<ClientInfo>>,
}

enum Command {
    Start {
        options: StartOptions,
        reply: oneshot::Sender<Result<u16>>,
    },
    Stop {
        reply: oneshot::Sender<Result<()>>,
    },
    EnsureRunning {
        reply: oneshot::Sender<bool>,
    },
}

enum Internal {
    WorkerDown {
        generation: u64,
        code: Option<i32>,
        signal: Option<i32>,
    },
    RestartDue {
        token: u64,
    },
}

struct RestartTimer {
    token: u64,
    handle: JoinHandle<()>,
}

/// The one live worker, plus the marker that lets the exit handler tell an
/// intentional kill from a crash. Set immediately before a deliberate kill,
/// read once when the exit event is processed.
struct LiveWorker {
    generation: u64,
    killer: Box<dyn WorkerKiller>,
    pid: Option<u32>,
    intentional_stop: bool,
}

/// Handle to the supervisor actor. Cheap to clone; dropping every handle
/// disposes the actor and terminates any live worker.
#[derive(Clone)]
pub struct Supervisor {
    commands: mpsc::Sender<Command>,
    status: Arc<SharedStatus>,
}

impl Supervisor {
    pub fn spawn(
        config: MessengerConfig,
        launcher: Arc<dyn WorkerLauncher>,
        channel: Arc<RequestChannel>,
        callbacks: Arc<CallbackRouter>,
        status: Arc<SharedStatus>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let (internal_tx, internal_rx) = mpsc::channel(32);

        let actor = Actor {
            config,
            launcher,
            channel,
            callbacks,
            status: status.clone(),
            internal_tx,
            internal_rx,
            commands_rx,
            state: SupervisorState::Stopped,
            desired: false,
            attempt: 0,
            generation: 0,
            timer_seq: 0,
            start_options: StartOptions::default(),
            worker: None,
            restart_timer: None,
        };
        tokio::spawn(actor.run());

        Self {
            commands: commands_tx,
            status,
        }
    }

    /// Bring a worker up, waiting for its broker port. Concurrent calls
    /// coalesce into a single spawn.
    pub async fn start(&self, options: StartOptions) -> Result<u16> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Start { options, reply })
            .await
            .map_err(|_| CourierError::ChannelClosed)?;
        rx.await.map_err(|_| CourierError::ChannelClosed)?
    }

    /// Tear the worker down and suppress any restart.
    pub async fn stop(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Stop { reply })
            .await
            .map_err(|_| CourierError::ChannelClosed)?;
        rx.await.map_err(|_| CourierError::ChannelClosed)?
    }

    /// Make sure a worker is live before sending it work. Returns false when
    /// none is desired or the immediate recovery attempt failed; a failed
    /// attempt still leaves the backoff timer driving further retries.
    pub async fn ensure_running(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::EnsureRunning { reply })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Last-known connected state. Never touches the worker.
    pub fn is_running(&self) -> bool {
        self.status.connected.load(Ordering::SeqCst)
    }

    /// Port reported by the most recent successful `start`, if any.
    pub fn last_port(&self) -> Option<u16> {
        *self.status.port.lock()
    }
}

struct Actor {
    config: MessengerConfig,
    launcher: Arc<dyn WorkerLauncher>,
    channel: Arc<RequestChannel>,
    callbacks: Arc<CallbackRouter>,
    status: Arc<SharedStatus>,
    internal_tx: mpsc::Sender<Internal>,
    internal_rx: mpsc::Receiver<Internal>,
    commands_rx: mpsc::Receiver<Command>,
    state: SupervisorState,
    /// Whether the supervisor should have a live worker. Set by `start`,
    /// cleared by `stop`, consulted before every restart decision.
    desired: bool,
    /// Restart attempt counter; resets to 0 on every successful start.
    attempt: u32,
    /// Bumped on every spawn attempt; exit events carry the generation they
    /// belong to.
    generation: u64,
    timer_seq: u64,
    /// Options from the most recent `start`, reused verbatim by restarts.
    start_options: StartOptions,
    worker: Option<LiveWorker>,
    restart_timer: Option<RestartTimer>,
}

impl Actor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                // Lifecycle events first, so command handling always sees
                // the freshest view of the worker.
                biased;
                Some(event) = self.internal_rx.recv() => self.handle_internal(event).await,
                command = self.commands_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
            }
        }

        // Every handle dropped: dispose. Best effort, no exit wait.
        self.cancel_restart_timer();
        if let Some(live) = self.worker.as_mut() {
            tracing::debug!(target = "courier::supervisor", generation = live.generation, "supervisor disposed; terminating worker");
            live.killer.kill();
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { options, reply } => self.handle_start(options, reply).await,
            Command::Stop { reply } => self.handle_stop(reply).await,
            Command::EnsureRunning { reply } => self.handle_ensure(reply).await,
        }
    }

    async fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::WorkerDown {
                generation,
                code,
                signal,
            } => self.handle_worker_down(generation, code, signal),
            Internal::RestartDue { token } => self.handle_restart_due(token).await,
        }
    }

    async fn handle_start(&mut self, options: StartOptions, reply: oneshot::Sender<Result<u16>>) {
        self.desired = true;
        self.status.desired.store(true, Ordering::SeqCst);
        self.start_options = options.clone();
        self.cancel_restart_timer();
        self.attempt = 0;

        if self.worker_is_live() {
            let port = self.status.port.lock().unwrap_or(0);
            let _ = reply.send(Ok(port));
            return;
        }

        self.state = SupervisorState::Starting;
        let result = self.spawn_and_start(options).await;
        if result.is_err() {
            // Stays desired: ensure_running may recover later.
            self.state = SupervisorState::Recovering;
        }
        let _ = reply.send(result);
    }

    async fn handle_stop(&mut self, reply: oneshot::Sender<Result<()>>) {
        self.desired = false;
        self.status.desired.store(false, Ordering::SeqCst);
        self.cancel_restart_timer();
        self.attempt = 0;

        if let Some(live) = self.worker.as_mut() {
            live.intentional_stop = true;
            let generation = live.generation;

            // Best-effort shutdown request; its response (or rejection when
            // the process dies) settles through the normal pending table.
            let channel = self.channel.clone();
            let window_ms = self.config.kill_timeout_ms;
            tokio::spawn(async move {
                if let Err(error) = channel
                    .request_with_timeout(actions::SHUTDOWN, None, window_ms)
                    .await
                {
                    tracing::debug!(target = "courier::supervisor", error = %error, "shutdown request not acknowledged");
                }
            });

            let window = Duration::from_millis(self.config.kill_timeout_ms);
            if self.wait_worker_down(generation, window).await.is_none() {
                if let Some(live) = self.worker.as_mut() {
                    tracing::warn!(target = "courier::supervisor", generation, pid = ?live.pid, "worker did not exit in time; killing it");
                    live.killer.kill();
                }
                if self.wait_worker_down(generation, window).await.is_none() {
                    tracing::error!(target = "courier::supervisor", generation, "no exit event after kill; abandoning process handle");
                }
            }

            self.worker = None;
            self.status.port.lock().take();
            self.status.clients.lock().clear();
        }

        self.status.connected.store(false, Ordering::SeqCst);
        self.state = SupervisorState::Stopped;
        tracing::info!(target = "courier::supervisor", "worker stopped");
        let _ = reply.send(Ok(()));
    }

    async fn handle_ensure(&mut self, reply: oneshot::Sender<bool>) {
        if self.worker_is_live() {
            let _ = reply.send(true);
            return;
        }
        if !self.desired {
            let _ = reply.send(false);
            return;
        }

        // A delivery call beat the backoff timer; recover right now. The
        // armed timer is left alone on failure so it keeps driving retries.
        tracing::debug!(target = "courier::supervisor", state = self.state.name(), "delivery call triggered immediate recovery");
        let options = self.start_options.clone();
        match self.spawn_and_start(options).await {
            Ok(_) => {
                let _ = reply.send(true);
            }
            Err(error) => {
                tracing::warn!(target = "courier::supervisor", error = %error, "immediate recovery failed");
                self.state = SupervisorState::Recovering;
                self.schedule_restart("immediate recovery failed");
                let _ = reply.send(false);
            }
        }
    }

    fn handle_worker_down(&mut self, generation: u64, code: Option<i32>, signal: Option<i32>) {
        let live = match self.worker.take() {
            Some(live) if live.generation == generation => live,
            other => {
                self.worker = other;
                tracing::debug!(target = "courier::supervisor", generation, "ignoring exit of a replaced worker");
                return;
            }
        };

        self.status.port.lock().take();
        self.status.clients.lock().clear();

        if live.intentional_stop {
            tracing::info!(target = "courier::supervisor", code = ?code, signal = ?signal, "worker exited after intentional termination");
            self.state = if self.desired {
                SupervisorState::Recovering
            } else {
                SupervisorState::Stopped
            };
            return;
        }

        tracing::warn!(target = "courier::supervisor", code = ?code, signal = ?signal, "worker exited unexpectedly");
        if self.desired {
            self.schedule_restart("unexpected exit");
        } else {
            self.state = SupervisorState::Stopped;
        }
    }

    async fn handle_restart_due(&mut self, token: u64) {
        let armed = self
            .restart_timer
            .as_ref()
            .is_some_and(|timer| timer.token == token);
        if !armed {
            tracing::debug!(target = "courier::supervisor", "ignoring stale restart timer");
            return;
        }
        self.restart_timer = None;

        if !self.desired || self.worker_is_live() {
            return;
        }

        let options = self.start_options.clone();
        match self.spawn_and_start(options).await {
            Ok(port) => {
                tracing::info!(target = "courier::supervisor", port, "worker recovered");
            }
            Err(error) => {
                tracing::warn!(target = "courier::supervisor", error = %error, "restart attempt failed");
                self.schedule_restart("restart attempt failed");
            }
        }
    }

    /// Spawn a worker process and drive its `start` request. On success the
    /// supervisor is Running; on failure the fresh process is terminated so
    /// no half-started worker lingers.
    async fn spawn_and_start(&mut self, options: StartOptions) -> Result<u16> {
        self.generation += 1;
        let generation = self.generation;

        let spawned = match self.launcher.spawn() {
            Ok(spawned) => spawned,
            Err(error) => {
                tracing::warn!(target = "courier::supervisor", error = %error, "failed to spawn worker process");
                return Err(error);
            }
        };
        let SpawnedWorker {
            frames,
            events,
            pid,
            killer,
        } = spawned;

        self.channel.attach(frames.clone());
        spawn_frame_router(
            generation,
            events,
            frames,
            self.channel.clone(),
            self.callbacks.clone(),
            self.status.clone(),
            self.internal_tx.clone(),
        );
        self.worker = Some(LiveWorker {
            generation,
            killer,
            pid,
            intentional_stop: false,
        });
        tracing::debug!(target = "courier::supervisor", generation, pid = ?pid, "worker process spawned");

        let payload = serde_json::to_value(StartPayload {
            options: options.clone(),
        })?;
        let started: Result<StartResult> = match self
            .channel
            .request_with_timeout(actions::START, Some(payload), self.config.request_timeout_ms)
            .await
        {
            Ok(value) => serde_json::from_value(value).map_err(CourierError::from),
            Err(error) => Err(error),
        };

        match started {
            Ok(StartResult { port }) => {
                *self.status.port.lock() = Some(port);
                self.status.connected.store(true, Ordering::SeqCst);
                self.cancel_restart_timer();
                self.attempt = 0;
                self.state = SupervisorState::Running;
                tracing::info!(target = "courier::supervisor", port, pid = ?pid, generation, "worker running");
                Ok(port)
            }
            Err(error) => {
                tracing::warn!(target = "courier::supervisor", error = %error, generation, "worker start request failed; terminating process");
                if let Some(live) = self.worker.as_mut() {
                    if live.generation == generation {
                        live.intentional_stop = true;
                        live.killer.kill();
                    }
                }
                Err(error)
            }
        }
    }

    /// Arm the backoff timer. No-op while one is already armed, which is
    /// what keeps a burst of exit events from stacking restarts.
    fn schedule_restart(&mut self, reason: &str) {
        if !self.desired || self.restart_timer.is_some() {
            return;
        }

        self.attempt += 1;
        let delay = restart_delay(
            self.config.restart_base_delay_ms,
            self.config.restart_max_delay_ms,
            self.attempt,
        );
        self.timer_seq += 1;
        let token = self.timer_seq;
        tracing::info!(
            target = "courier::supervisor",
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "scheduling worker restart"
        );

        let internal = self.internal_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = internal.send(Internal::RestartDue { token }).await;
        });
        self.restart_timer = Some(RestartTimer { token, handle });
        self.state = SupervisorState::Recovering;
    }

    fn cancel_restart_timer(&mut self) {
        if let Some(timer) = self.restart_timer.take() {
            timer.handle.abort();
        }
    }

    fn worker_is_live(&self) -> bool {
        self.worker.is_some() && self.status.connected.load(Ordering::SeqCst)
    }

    /// Wait for the exit event of `generation`, consuming stale internal
    /// events along the way. Used by `stop`, which handles the cleanup
    /// itself instead of going through the normal exit path.
    async fn wait_worker_down(
        &mut self,
        generation: u64,
        window: Duration,
    ) -> Option<(Option<i32>, Option<i32>)> {
        let deadline = Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            match timeout(remaining, self.internal_rx.recv()).await {
                Ok(Some(Internal::WorkerDown {
                    generation: seen,
                    code,
                    signal,
                })) if seen == generation => return Some((code, signal)),
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => return None,
            }
        }
    }
}

/// Per-worker routing task: resolves responses, dispatches callbacks, and
/// turns the transport's exit notice into fast pending-rejection plus a
/// lifecycle event for the actor.
fn spawn_frame_router(
    generation: u64,
    mut events: mpsc::Receiver<TransportEvent>,
    frames: mpsc::Sender<WireFrame>,
    channel: Arc<RequestChannel>,
    callbacks: Arc<CallbackRouter>,
    status: Arc<SharedStatus>,
    internal: mpsc::Sender<Internal>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Frame(frame) => {
                    route_frame(frame, &frames, &channel, &callbacks);
                }
                TransportEvent::Error { message } => {
                    tracing::warn!(target = "courier::supervisor", generation, error = %message, "worker channel error");
                }
                TransportEvent::Exited { code, signal } => {
                    // Sweep the channel only while this generation still
                    // owns it. A worker abandoned mid-stop exits late,
                    // after a replacement has attached; rejecting then
                    // would fail the replacement's in-flight requests and
                    // clear `connected` under a healthy worker.
                    if channel.detach_matching(&frames) {
                        let rejected = channel.reject_all(code, signal);
                        if rejected > 0 {
                            tracing::warn!(target = "courier::supervisor", generation, rejected, "rejected pending requests after worker exit");
                        }
                        status.connected.store(false, Ordering::SeqCst);
                    } else {
                        tracing::debug!(target = "courier::supervisor", generation, "late exit of a superseded worker; channel left alone");
                    }
                    let _ = internal
                        .send(Internal::WorkerDown {
                            generation,
                            code,
                            signal,
                        })
                        .await;
                    break;
                }
            }
        }
    });
}

fn route_frame(
    frame: WireFrame,
    frames: &mpsc::Sender<WireFrame>,
    channel: &Arc<RequestChannel>,
    callbacks: &Arc<CallbackRouter>,
) {
    match frame {
        WireFrame::Response {
            req_id,
            ok,
            result,
            error,
            code,
        } => {
            if !channel.resolve(&req_id, ok, result, error, code) {
                tracing::debug!(target = "courier::rpc", req_id = %req_id, "response matched no pending request");
            }
        }
        WireFrame::Callback {
            req_id,
            action,
            payload,
        } => {
            // Handlers run in their own task so a slow one never blocks
            // response routing.
            let callbacks = callbacks.clone();
            let frames = frames.clone();
            tokio::spawn(async move {
                let reply = callbacks.handle(&req_id, &action, payload).await;
                if frames.send(reply).await.is_err() {
                    tracing::debug!(target = "courier::callbacks", req_id = %req_id, "worker gone before callback reply");
                }
            });
        }
        other => {
            tracing::debug!(target = "courier::supervisor", kind = other.kind(), "dropping unexpected frame from worker");
        }
    }
}
