//! Process transport: spawns the worker child and turns its stdio into a
//! framed channel of [`WireFrame`]s plus an exit event.
//!
//! No retry or buffering lives here. The supervisor owns resilience; this
//! layer only moves frames and reports when the process is gone.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

#[cfg(unix)]
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};

use crate::error::{CourierError, Result};
use crate::protocol::WireFrame;

/// Environment marker the worker bootstrap checks for.
pub const WORKER_ROLE_ENV: &str = "COURIER_WORKER_ROLE";
pub const WORKER_ROLE_BROKER: &str = "broker";

/// Grace between SIGTERM and SIGKILL when the process is force-terminated.
const SIGTERM_GRACE: Duration = Duration::from_millis(500);

const CHANNEL_CAPACITY: usize = 256;

/// Everything coming back from a spawned worker.
#[derive(Debug)]
pub enum TransportEvent {
    /// A parsed frame from the worker's stdout.
    Frame(WireFrame),
    /// A read error on the channel; an `Exited` event follows once the
    /// process is reaped.
    Error { message: String },
    /// The process is gone. Emitted exactly once per spawn.
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
}

/// Force-kill control for one spawned worker.
pub trait WorkerKiller: Send {
    /// Ask the transport to terminate the process. Idempotent; the `Exited`
    /// event still arrives on the event channel once the process is gone.
    fn kill(&mut self);
}

/// A live worker as seen by the supervisor: a frame sink, an event source,
/// and a kill switch.
pub struct SpawnedWorker {
    pub frames: mpsc::Sender<WireFrame>,
    pub events: mpsc::Receiver<TransportEvent>,
    pub pid: Option<u32>,
    pub killer: Box<dyn WorkerKiller>,
}

/// Seam between the supervisor and the operating system. Production code
/// spawns a real child process; tests substitute a scripted worker.
pub trait WorkerLauncher: Send + Sync {
    fn spawn(&self) -> Result<SpawnedWorker>;
}

/// Launches `current_exe() worker` with the broker role marker set.
#[derive(Debug, Default, Clone)]
pub struct ProcessLauncher;

impl WorkerLauncher for ProcessLauncher {
    fn spawn(&self) -> Result<SpawnedWorker> {
        let exe = std::env::current_exe().unwrap_or_else(|_| "agent-courier".into());
        let mut cmd = Command::new(exe);
        cmd.arg("worker").env(WORKER_ROLE_ENV, WORKER_ROLE_BROKER);
        spawn_worker_command(cmd)
    }
}

struct ProcessKiller {
    trigger: Option<oneshot::Sender<()>>,
}

impl WorkerKiller for ProcessKiller {
    fn kill(&mut self) {
        if let Some(trigger) = self.trigger.take() {
            let _ = trigger.send(());
        }
    }
}

/// Spawn `cmd` with piped stdio and wire up the reader, writer, and exit
/// monitor tasks. Stderr stays inherited so worker logs land in the host's
/// stderr stream.
pub fn spawn_worker_command(mut cmd: Command) -> Result<SpawnedWorker> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;
    let pid = child.id();
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| CourierError::Spawn(std::io::Error::other("worker stdin not piped")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| CourierError::Spawn(std::io::Error::other("worker stdout not piped")))?;

    let (frames_tx, mut frames_rx) = mpsc::channel::<WireFrame>(CHANNEL_CAPACITY);
    let (events_tx, events_rx) = mpsc::channel::<TransportEvent>(CHANNEL_CAPACITY);

    // Writer: one frame per line on the child's stdin.
    tokio::spawn(async move {
        while let Some(frame) = frames_rx.recv().await {
            let mut line = match serde_json::to_string(&frame) {
                Ok(line) => line,
                Err(error) => {
                    tracing::warn!(target = "courier::transport", error = %error, "dropping unencodable frame");
                    continue;
                }
            };
            line.push('\n');
            if let Err(error) = stdin.write_all(line.as_bytes()).await {
                tracing::debug!(target = "courier::transport", error = %error, "worker stdin closed");
                break;
            }
            let _ = stdin.flush().await;
        }
    });

    // Reader: parse each stdout line into a frame; malformed lines are
    // logged and dropped rather than tearing the channel down.
    let reader_events = events_tx.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<WireFrame>(line) {
                        Ok(frame) => {
                            if reader_events.send(TransportEvent::Frame(frame)).await.is_err() {
                                break;
                            }
                        }
                        Err(error) => {
                            tracing::warn!(target = "courier::transport", error = %error, "dropping malformed worker frame");
                        }
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    let _ = reader_events
                        .send(TransportEvent::Error {
                            message: error.to_string(),
                        })
                        .await;
                    break;
                }
            }
        }
    });

    // Exit monitor: owns the child, waits for it, and reports how it went.
    let (kill_tx, kill_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            kill = kill_rx => {
                if kill.is_ok() {
                    terminate_child(&mut child, SIGTERM_GRACE).await;
                }
                child.wait().await
            }
        };
        let (code, signal) = match status {
            Ok(status) => exit_parts(status),
            Err(_) => (None, None),
        };
        let _ = events_tx.send(TransportEvent::Exited { code, signal }).await;
    });

    Ok(SpawnedWorker {
        frames: frames_tx,
        events: events_rx,
        pid,
        killer: Box::new(ProcessKiller {
            trigger: Some(kill_tx),
        }),
    })
}

async fn terminate_child(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }

    #[cfg(not(unix))]
    {
        let _ = child.kill().await;
    }

    if timeout(grace, child.wait()).await.is_err() {
        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
        }

        #[cfg(not(unix))]
        {
            let _ = child.kill().await;
        }

        let _ = child.wait().await;
    }
}

fn exit_parts(status: std::process::ExitStatus) -> (Option<i32>, Option<i32>) {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        (status.code(), status.signal())
    }

    #[cfg(not(unix))]
    {
        (status.code(), None)
    }
}

#[cfg(test)]
mod tests {
    use tokio::process::Command;

    use super::{spawn_worker_command, TransportEvent};
    use crate::protocol::WireFrame;

    #[tokio::test]
    async fn frames_round_trip_through_a_child_process() {
        // `cat` echoes our request line straight back.
        let mut worker = spawn_worker_command(Command::new("cat")).unwrap();
        let sent = WireFrame::request("1-100", "start", None);
        worker.frames.send(sent.clone()).await.unwrap();

        match worker.events.recv().await {
            Some(TransportEvent::Frame(frame)) => assert_eq!(frame, sent),
            other => panic!("expected echoed frame, got {other:?}"),
        }

        // Closing the frame channel closes stdin; cat exits cleanly.
        drop(worker.frames);
        match worker.events.recv().await {
            Some(TransportEvent::Exited { code, .. }) => assert_eq!(code, Some(0)),
            other => panic!("expected exit event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn exit_event_reports_the_exit_code() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("exit 3");
        let mut worker = spawn_worker_command(cmd).unwrap();

        loop {
            match worker.events.recv().await {
                Some(TransportEvent::Exited { code, signal }) => {
                    assert_eq!(code, Some(3));
                    assert_eq!(signal, None);
                    break;
                }
                Some(_) => continue,
                None => panic!("event channel closed without exit"),
            }
        }
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(r#"echo not-json; echo '{"kind":"response","reqId":"1-1","ok":true}'"#);
        let mut worker = spawn_worker_command(cmd).unwrap();

        match worker.events.recv().await {
            Some(TransportEvent::Frame(WireFrame::Response { req_id, ok, .. })) => {
                assert_eq!(req_id, "1-1");
                assert!(ok);
            }
            other => panic!("expected the valid frame, got {other:?}"),
        }
        loop {
            match worker.events.recv().await {
                Some(TransportEvent::Exited { code, .. }) => {
                    assert_eq!(code, Some(0));
                    break;
                }
                Some(_) => continue,
                None => panic!("event channel closed without exit"),
            }
        }
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn kill_terminates_a_stuck_process() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let mut worker = spawn_worker_command(cmd).unwrap();

        worker.killer.kill();
        loop {
            match worker.events.recv().await {
                Some(TransportEvent::Exited { code, signal }) => {
                    assert_eq!(code, None);
                    assert_eq!(signal, Some(nix::sys::signal::Signal::SIGTERM as i32));
                    break;
                }
                Some(_) => continue,
                None => panic!("event channel closed without exit"),
            }
        }
    }
}
