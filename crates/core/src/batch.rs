use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::protocol::{BatchKey, BatchProgressEvent};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    #[serde(flatten)]
    pub key: BatchKey,
    pub done: u64,
    pub total: u64,
}

impl BatchProgress {
    pub fn is_complete(&self) -> bool {
        self.done == self.total
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchUpdate {
    Advanced,
    Completed,
    /// `done` went backwards; the message arrived late and was ignored.
    Stale,
}

/// Aggregate done/total counts of share and public-link operations.
#[derive(Debug, Default)]
pub struct BatchTracker {
    batches: BTreeMap<BatchKey, BatchProgress>,
}

impl BatchTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &BatchKey) -> Option<&BatchProgress> {
        self.batches.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BatchProgress> {
        self.batches.values()
    }

    pub fn active_count(&self) -> usize {
        self.batches.values().filter(|b| !b.is_complete()).count()
    }

    pub fn remove(&mut self, key: &BatchKey) -> Option<BatchProgress> {
        self.batches.remove(key)
    }

    pub fn apply(&mut self, event: &BatchProgressEvent) -> BatchUpdate {
        let entry = self
            .batches
            .entry(event.key.clone())
            .or_insert_with(|| BatchProgress {
                key: event.key.clone(),
                done: 0,
                total: event.total,
            });

        if event.done < entry.done {
            return BatchUpdate::Stale;
        }

        entry.done = event.done;
        entry.total = event.total;
        if entry.is_complete() {
            BatchUpdate::Completed
        } else {
            BatchUpdate::Advanced
        }
    }
}
