// src/pipeline/snapshot.rs
//
// Tracker state fan-out. The analyzer publishes one TrackerSnapshot after
// each complete update step; readers only ever see whole snapshots.

use crate::analysis::hazard_tracker::TrackerSnapshot;
use std::sync::Arc;
use tokio::sync::watch;

pub struct SnapshotPublisher {
    tx: watch::Sender<Arc<TrackerSnapshot>>,
}

#[derive(Clone)]
pub struct SnapshotReader {
    rx: watch::Receiver<Arc<TrackerSnapshot>>,
}

impl SnapshotPublisher {
    /// Starts with an empty snapshot.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(TrackerSnapshot::default()));
        Self { tx }
    }

    pub fn publish(&self, snapshot: TrackerSnapshot) {
        // send_replace never fails, even with no subscribers
        self.tx.send_replace(Arc::new(snapshot));
    }

    pub fn subscribe(&self) -> SnapshotReader {
        SnapshotReader {
            rx: self.tx.subscribe(),
        }
    }

    pub fn latest(&self) -> Arc<TrackerSnapshot> {
        Arc::clone(&self.tx.borrow())
    }
}

impl Default for SnapshotPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotReader {
    pub fn latest(&self) -> Arc<TrackerSnapshot> {
        Arc::clone(&self.rx.borrow())
    }

    /// Wait for the next published snapshot. None once the analyzer is gone.
    pub async fn changed(&mut self) -> Option<Arc<TrackerSnapshot>> {
        self.rx.changed().await.ok()?;
        Some(Arc::clone(&self.rx.borrow_and_update()))
    }
}
