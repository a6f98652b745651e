use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;

use drive_progress_core::{EmitOutcome, Error, ProgressEmitter};

pub struct WorkerIpcServerHandle {
    socket_path: PathBuf,
    cancel: CancellationToken,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl WorkerIpcServerHandle {
    pub async fn shutdown(self) {
        let mut this = self;
        this.cancel.cancel();
        if let Some(task) = this.task.take() {
            let _ = task.await;
        }
        let _ = std::fs::remove_file(&this.socket_path);
    }
}

impl Drop for WorkerIpcServerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

/// Accepts worker connections on `socket_path`. Every line a worker writes
/// is one JSON message and goes through `emitter` unchanged; lines that are
/// not JSON are logged and skipped.
pub fn spawn_worker_ipc_server(
    socket_path: PathBuf,
    emitter: ProgressEmitter,
    cancel: CancellationToken,
) -> std::io::Result<WorkerIpcServerHandle> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
        }
    }

    match std::fs::remove_file(&socket_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let listener = UnixListener::bind(&socket_path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) =
            std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))
        {
            tracing::error!(
                event = "worker.ipc_permissions_failed",
                error = %e,
                path = %socket_path.display(),
                "worker.ipc_permissions_failed"
            );
            drop(listener);
            let _ = std::fs::remove_file(&socket_path);
            return Err(e);
        }
    }

    let handle_socket_path = socket_path.clone();
    let server_cancel = cancel.child_token();
    let task_cancel = server_cancel.clone();

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = task_cancel.cancelled() => break,
                accept = listener.accept() => {
                    let (stream, _) = match accept {
                        Ok(x) => x,
                        Err(e) => {
                            tracing::warn!(
                                event = "worker.ipc_accept_failed",
                                error = %e,
                                path = %socket_path.display(),
                                "worker.ipc_accept_failed"
                            );
                            sleep(Duration::from_millis(200)).await;
                            continue;
                        }
                    };

                    let emitter = emitter.clone();
                    let cancel = task_cancel.clone();
                    tokio::spawn(async move {
                        match handle_worker_ipc_client(stream, &emitter, &cancel).await {
                            Ok(stats) => tracing::debug!(
                                event = "worker.disconnected",
                                lines = stats.lines,
                                skipped = stats.skipped,
                                dropped = stats.dropped,
                                "worker.disconnected"
                            ),
                            Err(e) => tracing::warn!(
                                event = "worker.ipc_client_failed",
                                error = %e,
                                "worker.ipc_client_failed"
                            ),
                        }
                    });
                }
            }
        }
    });

    Ok(WorkerIpcServerHandle {
        socket_path: handle_socket_path,
        cancel: server_cancel,
        task: Some(task),
    })
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct ClientStats {
    lines: u64,
    skipped: u64,
    dropped: u64,
}

async fn handle_worker_ipc_client(
    stream: UnixStream,
    emitter: &ProgressEmitter,
    cancel: &CancellationToken,
) -> Result<ClientStats, Error> {
    let mut lines = BufReader::new(stream).lines();
    let mut stats = ClientStats::default();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return Ok(stats),
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            return Ok(stats);
        };
        if line.trim().is_empty() {
            continue;
        }
        stats.lines += 1;

        let message: serde_json::Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(
                    event = "worker.invalid_line",
                    error = %e,
                    "worker.invalid_line"
                );
                stats.skipped += 1;
                continue;
            }
        };

        if emitter.emit_message(message).await? == EmitOutcome::Dropped {
            stats.dropped += 1;
        }
    }
}
