use std::path::PathBuf;

use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;

use drive_progress_core::config::StatusSettings;
use drive_progress_core::status::ProgressSnapshot;

/// Pacing of the status stream.
///
/// A changed snapshot is sent at most once per `active`; an unchanged one is
/// repeated every `idle` so clients can tell the daemon is alive.
#[derive(Debug, Clone, Copy)]
pub struct Cadence {
    pub active: Duration,
    pub idle: Duration,
}

impl Cadence {
    pub fn from_settings(settings: &StatusSettings) -> Self {
        Self {
            active: Duration::from_millis(settings.active_interval_ms),
            idle: Duration::from_millis(settings.idle_interval_ms),
        }
    }
}

impl Default for Cadence {
    fn default() -> Self {
        Self::from_settings(&StatusSettings::default())
    }
}

pub struct StatusIpcServerHandle {
    socket_path: PathBuf,
    cancel: CancellationToken,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl StatusIpcServerHandle {
    pub async fn shutdown(self) {
        let mut this = self;
        this.cancel.cancel();
        if let Some(task) = this.task.take() {
            let _ = task.await;
        }
        let _ = std::fs::remove_file(&this.socket_path);
    }
}

impl Drop for StatusIpcServerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

/// Binds `socket_path` (replacing a stale socket file) and follows
/// `snapshots` for every client until `cancel` fires or the publisher goes
/// away.
pub fn spawn_status_ipc_server(
    socket_path: PathBuf,
    cadence: Cadence,
    snapshots: watch::Receiver<ProgressSnapshot>,
    cancel: CancellationToken,
) -> std::io::Result<StatusIpcServerHandle> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(&socket_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let listener = UnixListener::bind(&socket_path)?;
    let handle_socket_path = socket_path.clone();
    let server_cancel = cancel.child_token();
    let task_cancel = server_cancel.clone();

    let task = tokio::spawn(async move {
        let mut clients = 0u64;
        loop {
            let accept = tokio::select! {
                _ = task_cancel.cancelled() => break,
                accept = listener.accept() => accept,
            };
            let stream = match accept {
                Ok((stream, _)) => stream,
                Err(e) => {
                    tracing::warn!(
                        event = "status.ipc_accept_failed",
                        error = %e,
                        path = %socket_path.display(),
                        "status.ipc_accept_failed"
                    );
                    sleep(Duration::from_millis(200)).await;
                    continue;
                }
            };

            clients += 1;
            let client = clients;
            let snapshots = snapshots.clone();
            let cancel = task_cancel.clone();
            tokio::spawn(async move {
                match stream_snapshots(stream, cadence, snapshots, cancel).await {
                    Ok(sent) => tracing::debug!(
                        event = "status.ipc_client_closed",
                        client,
                        sent,
                        "status.ipc_client_closed"
                    ),
                    Err(e) => tracing::debug!(
                        event = "status.ipc_client_failed",
                        client,
                        error = %e,
                        "status.ipc_client_failed"
                    ),
                }
            });
        }
    });

    Ok(StatusIpcServerHandle {
        socket_path: handle_socket_path,
        cancel: server_cancel,
        task: Some(task),
    })
}

/// Writes the current snapshot, then one line per observed change. Returns
/// the number of lines sent.
async fn stream_snapshots(
    stream: UnixStream,
    cadence: Cadence,
    mut snapshots: watch::Receiver<ProgressSnapshot>,
    cancel: CancellationToken,
) -> std::io::Result<u64> {
    let mut w = BufWriter::new(stream);
    let heartbeat = cadence.idle.saturating_sub(cadence.active);
    let mut sent = 0;

    loop {
        let mut line = {
            let snapshot = snapshots.borrow_and_update();
            serde_json::to_vec(&*snapshot)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
        };
        line.push(b'\n');

        // A client that went away is not an error.
        if w.write_all(&line).await.is_err() || w.flush().await.is_err() {
            return Ok(sent);
        }
        sent += 1;

        tokio::select! {
            _ = cancel.cancelled() => return Ok(sent),
            _ = sleep(cadence.active) => {}
        }
        tokio::select! {
            _ = cancel.cancelled() => return Ok(sent),
            changed = snapshots.changed() => {
                if changed.is_err() {
                    return Ok(sent);
                }
            }
            _ = sleep(heartbeat) => {}
        }
    }
}
