use std::path::PathBuf;
use std::sync::Arc;

use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;

use drive_progress_core::config::{self as settings_config, Settings};
use drive_progress_core::status::{
    ProgressSnapshot, StatusWriteOptions, status_ipc_socket_path, status_json_path,
    worker_ipc_socket_path, write_progress_snapshot_json_atomic,
};
use drive_progress_core::store::Store;
use drive_progress_core::{ProgressReceiver, ProgressState, channel, logging};

mod status_ipc;
mod worker_ipc;

/// Latest snapshot, published by the receive loop and read by status clients.
type PublishedSnapshot = Arc<Store<ProgressSnapshot>>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_root = settings_config::resolve_config_dir(None);
    let data_root = settings_config::resolve_data_dir(None);

    let settings = settings_config::load_settings(&config_root)?;
    logging::init_logging(settings.logging.filter.as_deref());

    let _session_log = if settings.logging.session_file {
        match logging::start_session_log("driveprogressd", &data_root) {
            Ok(guard) => Some(guard),
            Err(e) => {
                tracing::warn!(
                    event = "log.session_file_failed",
                    error = %e,
                    "log.session_file_failed"
                );
                None
            }
        }
    } else {
        None
    };

    tracing::info!(
        event = "daemon.start",
        config_dir = %config_root.display(),
        data_dir = %data_root.display(),
        "daemon.start"
    );

    let cancel = CancellationToken::new();
    let (emitter, mut receiver) = channel(&settings.receiver);

    let published: PublishedSnapshot = Arc::new(Store::new(receiver.state().snapshot()));

    let worker_socket_path = worker_ipc_socket_path(&data_root);
    let worker_server =
        worker_ipc::spawn_worker_ipc_server(worker_socket_path.clone(), emitter, cancel.clone())
            .inspect_err(|e| {
                tracing::error!(
                    event = "worker.ipc_bind_failed",
                    error = %e,
                    path = %worker_socket_path.display(),
                    "worker.ipc_bind_failed"
                );
            })?;

    let status_socket_path = status_ipc_socket_path(&data_root);
    let status_server = {
        match status_ipc::spawn_status_ipc_server(
            status_socket_path.clone(),
            status_ipc::Cadence::from_settings(&settings.status),
            published.subscribe(),
            cancel.clone(),
        ) {
            Ok(h) => Some(h),
            Err(e) => {
                tracing::warn!(
                    event = "status.ipc_bind_failed",
                    error = %e,
                    path = %status_socket_path.display(),
                    "status.ipc_bind_failed"
                );
                None
            }
        }
    };

    let status_writer = settings.status.write_status_json.then(|| {
        tokio::spawn(status_writer_loop(
            published.clone(),
            status_json_path(&data_root),
            settings.clone(),
            cancel.clone(),
        ))
    });

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!(event = "daemon.shutdown_requested", "daemon.shutdown_requested");
                cancel.cancel();
            }
        });
    }

    receive_loop(&mut receiver, &published, &cancel).await;

    worker_server.shutdown().await;
    if let Some(server) = status_server {
        server.shutdown().await;
    }
    cancel.cancel();
    if let Some(task) = status_writer {
        let _ = task.await;
    }

    let stats = receiver.state().stats();
    tracing::info!(
        event = "daemon.stop",
        applied = stats.applied,
        discarded = stats.discarded,
        skipped = stats.skipped,
        dropped = stats.dropped,
        evicted = stats.evicted,
        "daemon.stop"
    );
    Ok(())
}

async fn receive_loop(
    receiver: &mut ProgressReceiver,
    published: &PublishedSnapshot,
    cancel: &CancellationToken,
) {
    loop {
        let report = tokio::select! {
            _ = cancel.cancelled() => break,
            report = receiver.recv_and_drain() => report,
        };
        let Some(report) = report else {
            break;
        };

        publish(receiver.state(), published);
        if report.closed {
            break;
        }
    }
}

fn publish(state: &ProgressState, published: &PublishedSnapshot) {
    published.set(state.snapshot());
}

/// Mirrors the published snapshot into `progress.json`, at the status cadence.
async fn status_writer_loop(
    published: PublishedSnapshot,
    status_path: PathBuf,
    settings: Settings,
    cancel: CancellationToken,
) {
    let mut changes = published.subscribe();
    let active = Duration::from_millis(settings.status.active_interval_ms);
    let idle = Duration::from_millis(settings.status.idle_interval_ms);

    loop {
        let snapshot = changes.borrow_and_update().clone();
        let tick = if snapshot.has_active() { active } else { idle };

        // Status snapshots are best-effort; atomic rename is enough.
        let options = StatusWriteOptions {
            fsync_file: false,
            fsync_dir: false,
        };
        let path = status_path.clone();
        let res = tokio::task::spawn_blocking(move || {
            write_progress_snapshot_json_atomic(&path, &snapshot, options)
        })
        .await;
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(
                    event = "status.write_failed",
                    error = %e,
                    path = %status_path.display(),
                    "status.write_failed"
                );
            }
            Err(e) => {
                tracing::warn!(
                    event = "status.write_failed",
                    error = %e,
                    path = %status_path.display(),
                    "status.write_failed"
                );
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(tick) => {}
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = changes.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use drive_progress_core::config::ReceiverSettings;
    use drive_progress_core::protocol::encode;
    use drive_progress_core::status::read_progress_snapshot_json;
    use drive_progress_core::{
        BatchKey, BatchProgressEvent, Event, FileType, TransferEvent, TransferItem, TransferKind,
        TransferPhase,
    };

    use super::*;

    fn started(uuid: &str, size: u64) -> Event {
        TransferEvent::new(
            TransferKind::Upload,
            TransferItem::new(uuid, "photo.jpg", FileType::File),
            TransferPhase::Started { size },
        )
        .into()
    }

    #[tokio::test]
    async fn receive_loop_publishes_and_stops_when_emitters_are_gone() {
        let (emitter, mut receiver) = channel(&ReceiverSettings::default());
        let published: PublishedSnapshot = Arc::new(Store::new(receiver.state().snapshot()));
        let cancel = CancellationToken::new();

        emitter.emit(&started("u1", 100)).await.unwrap();
        emitter
            .emit_message(encode(&Event::Batch(
                BatchProgressEvent::new(
                    BatchKey::PublicLink {
                        uuid: "link".to_string(),
                    },
                    2,
                    5,
                )
                .unwrap(),
            )))
            .await
            .unwrap();
        drop(emitter);

        receive_loop(&mut receiver, &published, &cancel).await;

        let snap = published.get();
        assert_eq!(snap.transfers.len(), 1);
        assert_eq!(snap.active_transfers, 1);
        assert_eq!(snap.batches.len(), 1);
        assert_eq!(snap.batches[0].done, 2);
    }

    #[tokio::test]
    async fn published_snapshot_keeps_only_recent_finished_transfers() {
        let settings = ReceiverSettings {
            retain_terminal: 10,
            ..ReceiverSettings::default()
        };
        let (emitter, mut receiver) = channel(&settings);
        let published: PublishedSnapshot = Arc::new(Store::new(receiver.state().snapshot()));
        let cancel = CancellationToken::new();

        let producer = tokio::spawn(async move {
            for n in 0..2000 {
                let uuid = format!("f{n}");
                emitter.emit(&started(&uuid, 1)).await.unwrap();
                emitter
                    .emit(
                        &TransferEvent::new(
                            TransferKind::Upload,
                            TransferItem::new(uuid.as_str(), "photo.jpg", FileType::File),
                            TransferPhase::Finished { size: 1 },
                        )
                        .into(),
                    )
                    .await
                    .unwrap();
            }
        });
        receive_loop(&mut receiver, &published, &cancel).await;
        producer.await.unwrap();

        let snap = published.get();
        assert_eq!(snap.transfers.len(), 10);
        assert_eq!(snap.active_transfers, 0);
        assert_eq!(receiver.state().transfers().len(), 10);
        assert_eq!(receiver.state().stats().evicted, 1990);
    }

    #[tokio::test]
    async fn receive_loop_honors_cancellation() {
        let (_emitter, mut receiver) = channel(&ReceiverSettings::default());
        let published: PublishedSnapshot = Arc::new(Store::new(receiver.state().snapshot()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        tokio::time::timeout(
            Duration::from_secs(1),
            receive_loop(&mut receiver, &published, &cancel),
        )
        .await
        .expect("loop exits on cancel");
    }

    #[tokio::test]
    async fn status_writer_writes_progress_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = status_json_path(dir.path());

        let mut state = ProgressState::new();
        state.apply(&started("u1", 10));
        let published: PublishedSnapshot = Arc::new(Store::new(state.snapshot()));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(status_writer_loop(
            published.clone(),
            path.clone(),
            Settings::default(),
            cancel.clone(),
        ));

        let mut found = None;
        for _ in 0..50 {
            if let Ok(snap) = read_progress_snapshot_json(&path) {
                found = Some(snap);
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        cancel.cancel();
        task.await.unwrap();

        let snap = found.expect("progress.json written");
        assert_eq!(snap.type_, "progress.snapshot");
        assert_eq!(snap.transfers[0].transfer.uuid, "u1");
    }
}
