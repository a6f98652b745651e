use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::batch::BatchProgress;
use crate::tracker::TrackedTransfer;

pub const SNAPSHOT_TYPE: &str = "progress.snapshot";
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

pub fn now_unix_ms() -> u64 {
    static LAST_UNIX_MS: AtomicU64 = AtomicU64::new(0);

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    let mut prev = LAST_UNIX_MS.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev);
        match LAST_UNIX_MS.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(current) => prev = current,
        }
    }
}

pub fn status_json_path(data_dir: &Path) -> PathBuf {
    data_dir.join("status").join("progress.json")
}

pub fn status_ipc_socket_path(data_dir: &Path) -> PathBuf {
    data_dir.join("ipc").join("status.sock")
}

pub fn worker_ipc_socket_path(data_dir: &Path) -> PathBuf {
    data_dir.join("ipc").join("worker.sock")
}

/// Counters of what the receiver did with incoming messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiverStats {
    pub applied: u64,
    pub stale: u64,
    pub discarded: u64,
    pub dropped: u64,
    pub coalesced: u64,
    pub unhandled: u64,
    /// Events of an item queued behind its own `stopped`.
    #[serde(default)]
    pub skipped: u64,
    /// Finished transfers and completed batches forgotten by retention.
    #[serde(default)]
    pub evicted: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferView {
    #[serde(flatten)]
    pub transfer: TrackedTransfer,
    pub percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    #[serde(rename = "type")]
    pub type_: String, // "progress.snapshot"
    pub schema_version: u32,
    pub generated_at: u64,
    pub active_transfers: usize,
    pub active_batches: usize,
    pub transfers: Vec<TransferView>,
    pub batches: Vec<BatchProgress>,
    pub stats: ReceiverStats,
}

impl ProgressSnapshot {
    pub fn new<'a>(
        transfers: impl Iterator<Item = &'a TrackedTransfer>,
        batches: impl Iterator<Item = &'a BatchProgress>,
        stats: ReceiverStats,
    ) -> Self {
        let transfers: Vec<TransferView> = transfers
            .map(|t| TransferView {
                transfer: t.clone(),
                percent: t.percent(),
            })
            .collect();
        let batches: Vec<BatchProgress> = batches.cloned().collect();

        Self {
            type_: SNAPSHOT_TYPE.to_string(),
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            generated_at: now_unix_ms(),
            active_transfers: transfers
                .iter()
                .filter(|t| !t.transfer.state.is_terminal())
                .count(),
            active_batches: batches.iter().filter(|b| !b.is_complete()).count(),
            transfers,
            batches,
            stats,
        }
    }

    pub fn has_active(&self) -> bool {
        self.active_transfers > 0 || self.active_batches > 0
    }
}

pub fn read_progress_snapshot_json(path: &Path) -> std::io::Result<ProgressSnapshot> {
    let mut f = File::open(path)?;
    let mut buf = Vec::new();
    f.read_to_end(&mut buf)?;
    let snap: ProgressSnapshot = serde_json::from_slice(&buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(snap)
}

#[derive(Debug, Clone, Copy)]
pub struct StatusWriteOptions {
    pub fsync_file: bool,
    pub fsync_dir: bool,
}

impl Default for StatusWriteOptions {
    fn default() -> Self {
        Self {
            fsync_file: true,
            fsync_dir: true,
        }
    }
}

pub fn write_progress_snapshot_json_atomic(
    path: &Path,
    snapshot: &ProgressSnapshot,
    options: StatusWriteOptions,
) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension(format!("json.tmp.{}", std::process::id()));
    let data = serde_json::to_vec(snapshot)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    let mut f = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    f.write_all(&data)?;
    if options.fsync_file {
        f.sync_all()?;
    }
    drop(f);

    std::fs::rename(&tmp, path)?;

    // Best-effort directory sync (ignored on platforms where it isn't supported).
    if options.fsync_dir
        && let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent)
    {
        let _ = dir.sync_all();
    }

    Ok(())
}
