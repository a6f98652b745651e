use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use serde::{Deserialize, Serialize};

use crate::error::OrderingViolation;
use crate::protocol::{FileType, TransferEvent, TransferKind, TransferPhase};

/// Transfers are keyed by kind as well as uuid: the same item may be uploaded
/// and downloaded concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferKey {
    pub kind: TransferKind,
    pub uuid: String,
}

impl TransferKey {
    pub fn new(kind: TransferKind, uuid: impl Into<String>) -> Self {
        Self {
            kind,
            uuid: uuid.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum TransferState {
    Queued,
    Started,
    InProgress,
    Paused,
    Finished { size: u64 },
    Error { message: String, size: u64 },
    Stopped { size: u64 },
}

impl TransferState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Started => "started",
            Self::InProgress => "inProgress",
            Self::Paused => "paused",
            Self::Finished { .. } => "finished",
            Self::Error { .. } => "error",
            Self::Stopped { .. } => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finished { .. } | Self::Error { .. } | Self::Stopped { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedTransfer {
    pub kind: TransferKind,
    pub uuid: String,
    pub name: String,
    pub file_type: FileType,
    #[serde(flatten)]
    pub state: TransferState,
    pub total_bytes: Option<u64>,
    pub transferred_bytes: u64,
    pub directories_created: u64,
}

impl TrackedTransfer {
    fn new(event: &TransferEvent, state: TransferState) -> Self {
        Self {
            kind: event.kind,
            uuid: event.item.uuid.clone(),
            name: event.item.name.clone(),
            file_type: event.item.file_type,
            state,
            total_bytes: None,
            transferred_bytes: 0,
            directories_created: 0,
        }
    }

    /// Completion in `0.0..=100.0`. A finished transfer is always 100.
    pub fn percent(&self) -> f64 {
        if matches!(self.state, TransferState::Finished { .. }) {
            return 100.0;
        }
        match self.total_bytes {
            Some(total) if total > 0 => {
                (self.transferred_bytes as f64 / total as f64 * 100.0).min(100.0)
            }
            _ => 0.0,
        }
    }

    /// Adds a byte delta, clamped to the total announced by `started`.
    /// Returns true when clamping kicked in.
    fn add_bytes(&mut self, delta: u64) -> bool {
        let sum = self.transferred_bytes.saturating_add(delta);
        match self.total_bytes {
            Some(total) if sum > total => {
                self.transferred_bytes = total;
                true
            }
            _ => {
                self.transferred_bytes = sum;
                false
            }
        }
    }
}

/// Per-item lifecycle of every upload and download reported by the worker.
///
/// Events are applied in arrival order. Events that break the lifecycle are
/// rejected with an [`OrderingViolation`] and leave the state untouched.
#[derive(Debug, Default)]
pub struct TransferTracker {
    items: BTreeMap<TransferKey, TrackedTransfer>,
}

impl TransferTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: TransferKind, uuid: &str) -> Option<&TrackedTransfer> {
        self.items.get(&TransferKey::new(kind, uuid))
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackedTransfer> {
        self.items.values()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.items
            .values()
            .filter(|t| !t.state.is_terminal())
            .count()
    }

    pub fn is_terminal(&self, kind: TransferKind, uuid: &str) -> bool {
        self.get(kind, uuid).is_some_and(|t| t.state.is_terminal())
    }

    pub fn remove(&mut self, kind: TransferKind, uuid: &str) -> Option<TrackedTransfer> {
        self.items.remove(&TransferKey::new(kind, uuid))
    }

    /// Forgets every finished, failed or stopped transfer.
    pub fn clear_terminal(&mut self) -> usize {
        let before = self.items.len();
        self.items.retain(|_, t| !t.state.is_terminal());
        before - self.items.len()
    }

    pub fn apply(&mut self, event: &TransferEvent) -> Result<&TrackedTransfer, OrderingViolation> {
        let key = TransferKey::new(event.kind, event.item.uuid.as_str());
        let phase = event.phase.kind();

        let current = match self.items.entry(key) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => {
                let state = match &event.phase {
                    TransferPhase::Queued => TransferState::Queued,
                    TransferPhase::Started { .. } => TransferState::Started,
                    _ => {
                        return Err(OrderingViolation::UnknownItem {
                            kind: event.kind,
                            uuid: event.item.uuid.clone(),
                            phase,
                        });
                    }
                };
                let mut tracked = TrackedTransfer::new(event, state);
                if let TransferPhase::Started { size } = event.phase {
                    tracked.total_bytes = Some(size);
                }
                return Ok(slot.insert(tracked));
            }
        };

        if current.state.is_terminal() {
            return Err(OrderingViolation::AfterTerminal {
                kind: event.kind,
                uuid: event.item.uuid.clone(),
                phase,
                terminal: current.state.name(),
            });
        }

        let from = current.state.name();
        let invalid = || OrderingViolation::InvalidTransition {
            kind: event.kind,
            uuid: event.item.uuid.clone(),
            phase,
            from,
        };

        use TransferState as S;
        match (&current.state, &event.phase) {
            (S::Queued, TransferPhase::Queued) => {}
            (S::Queued, TransferPhase::Started { size }) => {
                current.state = S::Started;
                current.total_bytes = Some(*size);
                current.transferred_bytes = 0;
            }
            (S::Started | S::InProgress, TransferPhase::Progress { bytes }) => {
                current.state = S::InProgress;
                if current.add_bytes(*bytes) {
                    tracing::debug!(
                        event = "transfer.progress_clamped",
                        kind = %event.kind,
                        uuid = %event.item.uuid,
                        total = current.total_bytes,
                        "transfer.progress_clamped"
                    );
                }
            }
            // A chunk that was in flight when the pause landed still counts.
            (S::Paused, TransferPhase::Progress { bytes }) => {
                current.add_bytes(*bytes);
            }
            (S::Started | S::InProgress, TransferPhase::DirectoryProgress { created }) => {
                current.state = S::InProgress;
                current.directories_created = current.directories_created.max(*created);
            }
            (S::Paused, TransferPhase::DirectoryProgress { created }) => {
                current.directories_created = current.directories_created.max(*created);
            }
            (S::Started | S::InProgress, TransferPhase::Paused) => {
                current.state = S::Paused;
            }
            (S::Paused, TransferPhase::Resumed) => {
                current.state = S::InProgress;
            }
            (S::Started | S::InProgress | S::Paused, TransferPhase::Finished { size }) => {
                current.state = S::Finished { size: *size };
                current.total_bytes = Some(*size);
                current.transferred_bytes = *size;
            }
            (
                S::Queued | S::Started | S::InProgress | S::Paused,
                TransferPhase::Error { err, size },
            ) => {
                current.state = S::Error {
                    message: err.message.clone(),
                    size: *size,
                };
            }
            (S::Queued | S::Started | S::InProgress | S::Paused, TransferPhase::Stopped { size }) => {
                current.state = S::Stopped { size: *size };
            }
            _ => return Err(invalid()),
        }

        current.name.clone_from(&event.item.name);
        Ok(current)
    }
}
