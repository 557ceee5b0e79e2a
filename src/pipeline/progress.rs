// src/pipeline/progress.rs

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

use crate::models::cluster::ClusterStatus;

/// Cooperative cancellation shared between the caller and a running job.
/// Checked between scoring work units and between clusters; work already
/// committed stays committed.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    Loaded { total: usize, already_merged: usize },
    Normalized { normalized: usize, failed: usize },
    BlocksIndexed { blocks: usize, skipped: usize, planned_pairs: usize },
    BlockScored { block_key: String, edges: usize },
    ClustersBuilt { clusters: usize },
    ClusterProcessed { cluster_id: String, status: ClusterStatus },
    Finished { success: bool },
}

/// Optional sink for progress events. Sending never fails the run; a dropped
/// receiver just silences further events.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink(Option<UnboundedSender<ProgressEvent>>);

impl ProgressSink {
    pub fn new(sender: UnboundedSender<ProgressEvent>) -> Self {
        Self(Some(sender))
    }

    pub fn disabled() -> Self {
        Self(None)
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_cancellation_is_shared_between_clones() {
        let flag = CancellationFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_cancelled());
        flag.cancel();
        assert!(clone.is_cancelled());
    }

    #[tokio::test]
    async fn test_sink_tolerates_dropped_receiver() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = ProgressSink::new(tx);
        sink.emit(ProgressEvent::ClustersBuilt { clusters: 3 });
        assert_eq!(rx.recv().await, Some(ProgressEvent::ClustersBuilt { clusters: 3 }));
        drop(rx);
        sink.emit(ProgressEvent::Finished { success: true });
        ProgressSink::disabled().emit(ProgressEvent::Finished { success: true });
    }
}
