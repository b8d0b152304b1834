//! Supervised out-of-process messaging for agent CLI panes.
//!
//! A host-side [`Messenger`] fronts one worker child process that runs the
//! actual WebSocket broker. The two talk a correlated request/response
//! protocol over the worker's stdio; the worker can also call back into the
//! host when a broker client sends something upstream. If the worker dies
//! unexpectedly the supervisor restarts it with bounded exponential backoff,
//! while delivery calls degrade to `false`/`0` instead of erroring.

pub mod callbacks;
pub mod config;
pub mod error;
pub mod logging;
pub mod messenger;
pub mod protocol;
pub mod rpc;
pub mod supervisor;
pub mod transport;
pub mod worker;

pub use config::MessengerConfig;
pub use error::{CourierError, Result};
pub use logging::init_logging;
pub use messenger::Messenger;
pub use protocol::{BroadcastOptions, ClientInfo, StartOptions};
pub use supervisor::{Supervisor, SupervisorState};
pub use transport::{
    spawn_worker_command, ProcessLauncher, SpawnedWorker, TransportEvent, WorkerKiller,
    WorkerLauncher,
};
