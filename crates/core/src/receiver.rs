//! Main-context consumer of the worker channel.
//!
//! All state is keyed by item (transfers) or operation id (batches), never by
//! arrival order. Handling never blocks and never fails across this boundary:
//! malformed messages and lifecycle violations are logged and discarded.

use std::collections::{HashMap, HashSet, VecDeque};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

use crate::batch::{BatchTracker, BatchUpdate};
use crate::config::ReceiverSettings;
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::error::{DecodeError, OrderingViolation};
use crate::protocol::{BatchKey, Event, Message, TransferPhase, decode, decode_str, encode, is_droppable};
use crate::status::{ProgressSnapshot, ReceiverStats};
use crate::tracker::{TransferKey, TransferTracker};
use crate::{Error, Result};

#[derive(Debug)]
pub enum HandleOutcome {
    Applied,
    /// A batch update older than what is already recorded.
    Stale,
    Discarded(OrderingViolation),
    Dropped(DecodeError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Retired {
    Transfer(TransferKey),
    Batch(BatchKey),
}

/// Tracked transfers and batches plus the handlers to notify.
///
/// Without a retention limit every finished item stays tracked. With one,
/// only the most recent `limit` finished transfers and completed batches are
/// kept; a late message for a forgotten item then counts as unknown.
#[derive(Debug, Default)]
pub struct ProgressState {
    transfers: TransferTracker,
    batches: BatchTracker,
    dispatcher: Option<Dispatcher>,
    stats: ReceiverStats,
    retain_terminal: Option<usize>,
    retired: VecDeque<Retired>,
}

impl ProgressState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dispatcher(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher: Some(dispatcher),
            ..Self::default()
        }
    }

    pub fn with_retention(mut self, limit: usize) -> Self {
        self.retain_terminal = Some(limit);
        self.evict();
        self
    }

    pub fn transfers(&self) -> &TransferTracker {
        &self.transfers
    }

    pub fn transfers_mut(&mut self) -> &mut TransferTracker {
        &mut self.transfers
    }

    pub fn batches(&self) -> &BatchTracker {
        &self.batches
    }

    pub fn stats(&self) -> ReceiverStats {
        self.stats
    }

    pub fn has_active(&self) -> bool {
        self.transfers.active_count() > 0 || self.batches.active_count() > 0
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot::new(self.transfers.iter(), self.batches.iter(), self.stats)
    }

    pub fn handle(&mut self, message: &Message) -> HandleOutcome {
        match decode(message) {
            Ok(event) => self.apply(&event),
            Err(e) => self.note_dropped(e),
        }
    }

    /// Same as [`handle`](Self::handle) for one NDJSON line.
    pub fn handle_line(&mut self, line: &str) -> HandleOutcome {
        match decode_str(line) {
            Ok(event) => self.apply(&event),
            Err(e) => self.note_dropped(e),
        }
    }

    pub fn apply(&mut self, event: &Event) -> HandleOutcome {
        let outcome = match event {
            Event::Transfer(t) => match self.transfers.apply(t).map(|v| v.state.is_terminal()) {
                Ok(terminal) => {
                    if terminal {
                        self.retire(Retired::Transfer(TransferKey::new(
                            t.kind,
                            t.item.uuid.as_str(),
                        )));
                    }
                    HandleOutcome::Applied
                }
                Err(violation) => {
                    tracing::warn!(
                        event = "protocol.ordering_violation",
                        kind = %t.kind,
                        uuid = %t.item.uuid,
                        phase = %t.phase.kind(),
                        error = %violation,
                        "protocol.ordering_violation"
                    );
                    self.stats.discarded += 1;
                    return HandleOutcome::Discarded(violation);
                }
            },
            Event::Batch(b) => match self.batches.apply(b) {
                BatchUpdate::Stale => {
                    tracing::debug!(
                        event = "batch.stale_update",
                        id = %b.key.id(),
                        done = b.done,
                        "batch.stale_update"
                    );
                    self.stats.stale += 1;
                    return HandleOutcome::Stale;
                }
                BatchUpdate::Advanced => HandleOutcome::Applied,
                BatchUpdate::Completed => {
                    tracing::info!(
                        event = "batch.completed",
                        id = %b.key.id(),
                        total = b.total,
                        "batch.completed"
                    );
                    self.retire(Retired::Batch(b.key.clone()));
                    HandleOutcome::Applied
                }
            },
        };

        self.stats.applied += 1;
        if let Some(dispatcher) = self.dispatcher.as_mut()
            && matches!(dispatcher.dispatch_event(event), DispatchOutcome::Unhandled(_))
        {
            self.stats.unhandled += 1;
        }
        outcome
    }

    fn retire(&mut self, entry: Retired) {
        if self.retain_terminal.is_none() || self.retired.contains(&entry) {
            return;
        }
        self.retired.push_back(entry);
        self.evict();
    }

    fn evict(&mut self) {
        let Some(limit) = self.retain_terminal else {
            return;
        };
        while self.retired.len() > limit {
            let Some(entry) = self.retired.pop_front() else {
                break;
            };
            // A batch whose total grew after completing is live again.
            let removed = match &entry {
                Retired::Transfer(key) => {
                    self.transfers.is_terminal(key.kind, &key.uuid)
                        && self.transfers.remove(key.kind, &key.uuid).is_some()
                }
                Retired::Batch(key) => {
                    self.batches.get(key).is_some_and(|b| b.is_complete())
                        && self.batches.remove(key).is_some()
                }
            };
            if removed {
                tracing::debug!(event = "receiver.evicted", entry = ?entry, "receiver.evicted");
                self.stats.evicted += 1;
            }
        }
    }

    fn note_dropped(&mut self, e: DecodeError) -> HandleOutcome {
        tracing::warn!(
            event = "protocol.decode_failed",
            error = %e,
            "protocol.decode_failed"
        );
        self.stats.dropped += 1;
        HandleOutcome::Dropped(e)
    }
}

/// Merges consecutive `progress` deltas of one item into a single event.
///
/// Only deltas with no other event of the same item between them are merged,
/// so every item's own stream keeps its order. Returns the merged count.
pub fn coalesce_progress(events: Vec<Event>) -> (Vec<Event>, u64) {
    let mut out: Vec<Event> = Vec::with_capacity(events.len());
    let mut open: HashMap<TransferKey, usize> = HashMap::new();
    let mut merged = 0;

    for event in events {
        if let Event::Transfer(t) = &event {
            let key = TransferKey::new(t.kind, t.item.uuid.as_str());
            if let TransferPhase::Progress { bytes } = t.phase {
                if let Some(&idx) = open.get(&key)
                    && let Event::Transfer(prev) = &mut out[idx]
                    && let TransferPhase::Progress { bytes: acc } = &mut prev.phase
                {
                    *acc = acc.saturating_add(bytes);
                    merged += 1;
                    continue;
                }
                open.insert(key, out.len());
            } else {
                open.remove(&key);
            }
        }
        out.push(event);
    }

    (out, merged)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub received: usize,
    pub applied: usize,
    pub closed: bool,
}

/// Receiving end of the worker channel.
#[derive(Debug)]
pub struct ProgressReceiver {
    rx: mpsc::Receiver<Message>,
    state: ProgressState,
    drain_batch: usize,
    coalesce: bool,
}

impl ProgressReceiver {
    pub fn state(&self) -> &ProgressState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ProgressState {
        &mut self.state
    }

    pub fn into_state(self) -> ProgressState {
        self.state
    }

    /// Applies whatever is queued right now, up to `drain_batch` messages.
    /// Never waits.
    pub fn drain(&mut self) -> DrainReport {
        self.drain_after(None)
    }

    /// `first` (already received) and up to `drain_batch` queued messages
    /// are applied as one batch.
    fn drain_after(&mut self, first: Option<Message>) -> DrainReport {
        let mut report = DrainReport::default();
        let mut pending = Vec::new();

        if let Some(message) = first {
            report.received += 1;
            self.take(message, &mut pending);
        }

        let mut taken = 0;
        while taken < self.drain_batch {
            match self.rx.try_recv() {
                Ok(message) => {
                    taken += 1;
                    report.received += 1;
                    self.take(message, &mut pending);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    report.closed = true;
                    break;
                }
            }
        }

        if self.coalesce {
            let (events, merged) = coalesce_progress(pending);
            self.state.stats.coalesced += merged;
            pending = events;
        }

        report.applied = self.apply_pending(pending);
        report
    }

    fn take(&mut self, message: Message, pending: &mut Vec<Event>) {
        match decode(&message) {
            Ok(event) => pending.push(event),
            Err(e) => {
                self.state.note_dropped(e);
            }
        }
    }

    fn apply_pending(&mut self, pending: Vec<Event>) -> usize {
        let mut applied = 0;
        // Items stopped within this batch: anything queued behind the stop
        // is cancelled work and is skipped without a warning.
        let mut stopped: HashSet<TransferKey> = HashSet::new();

        for event in pending {
            if let Event::Transfer(t) = &event {
                let key = TransferKey::new(t.kind, t.item.uuid.as_str());
                if stopped.contains(&key) {
                    tracing::debug!(
                        event = "transfer.skipped_after_stop",
                        kind = %t.kind,
                        uuid = %t.item.uuid,
                        "transfer.skipped_after_stop"
                    );
                    self.state.stats.skipped += 1;
                    continue;
                }
                if matches!(t.phase, TransferPhase::Stopped { .. }) {
                    stopped.insert(key);
                }
            }
            if matches!(self.state.apply(&event), HandleOutcome::Applied) {
                applied += 1;
            }
        }

        applied
    }

    /// Waits for one message, then drains everything else that is queued.
    /// Returns `None` once every emitter is gone and the queue is empty.
    pub async fn recv_and_drain(&mut self) -> Option<DrainReport> {
        let first = self.rx.recv().await?;
        Some(self.drain_after(Some(first)))
    }

    /// Consumes the channel until every emitter is dropped.
    pub async fn run(&mut self) {
        while let Some(report) = self.recv_and_drain().await {
            if report.closed {
                break;
            }
        }
        tracing::debug!(
            event = "receiver.closed",
            applied = self.state.stats.applied,
            "receiver.closed"
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    Sent,
    /// A `progress` delta dropped because the channel was full.
    Dropped,
}

/// Worker-side handle. Cloneable; the channel closes when every clone is
/// dropped.
#[derive(Debug, Clone)]
pub struct ProgressEmitter {
    tx: mpsc::Sender<Message>,
}

impl ProgressEmitter {
    pub async fn emit(&self, event: &Event) -> Result<EmitOutcome> {
        self.emit_message(encode(event)).await
    }

    /// Sends an already encoded message. Byte deltas are dropped when the
    /// channel is full; every other message waits for capacity.
    pub async fn emit_message(&self, message: Message) -> Result<EmitOutcome> {
        if is_droppable(&message) {
            return match self.tx.try_send(message) {
                Ok(()) => Ok(EmitOutcome::Sent),
                Err(TrySendError::Full(_)) => {
                    tracing::debug!(event = "emitter.progress_dropped", "emitter.progress_dropped");
                    Ok(EmitOutcome::Dropped)
                }
                Err(TrySendError::Closed(_)) => Err(Error::ChannelClosed),
            };
        }

        self.tx
            .send(message)
            .await
            .map_err(|_| Error::ChannelClosed)?;
        Ok(EmitOutcome::Sent)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub fn channel(settings: &ReceiverSettings) -> (ProgressEmitter, ProgressReceiver) {
    channel_with_state(settings, ProgressState::new())
}

pub fn channel_with_state(
    settings: &ReceiverSettings,
    state: ProgressState,
) -> (ProgressEmitter, ProgressReceiver) {
    let (tx, rx) = mpsc::channel(settings.channel_capacity.max(1));
    (
        ProgressEmitter { tx },
        ProgressReceiver {
            rx,
            state: state.with_retention(settings.retain_terminal),
            drain_batch: settings.drain_batch.max(1),
            coalesce: settings.coalesce_progress,
        },
    )
}
