//! Snapshot publication for readers on other threads.

use crate::graph::GraphSnapshot;
use parking_lot::RwLock;
use std::sync::Arc;

/// Latest published [`GraphSnapshot`], shared between the SLAM owner and
/// any number of readers.
///
/// The lock guards only the `Arc` swap, so a reader never waits on a solver
/// iteration and never sees a graph mid-mutation.
#[derive(Debug, Clone)]
pub struct SnapshotHandle {
    latest: Arc<RwLock<Arc<GraphSnapshot>>>,
}

impl SnapshotHandle {
    pub(crate) fn new(initial: GraphSnapshot) -> Self {
        SnapshotHandle {
            latest: Arc::new(RwLock::new(Arc::new(initial))),
        }
    }

    /// Most recently published snapshot.
    pub fn latest(&self) -> Arc<GraphSnapshot> {
        Arc::clone(&self.latest.read())
    }

    /// Version of the most recently published snapshot.
    pub fn version(&self) -> u64 {
        self.latest.read().version()
    }

    pub(crate) fn publish(&self, snapshot: GraphSnapshot) {
        let mut latest = self.latest.write();
        // Versions only move forward
        if snapshot.version() >= latest.version() {
            *latest = Arc::new(snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::PoseGraph;
    use crate::manifold::SE2;
    use std::thread;

    #[test]
    fn test_readers_see_published_versions() {
        let mut graph = PoseGraph::new();
        let handle = SnapshotHandle::new(graph.snapshot());
        assert_eq!(handle.version(), 0);

        graph.add_pose_node(SE2::from_xy_angle(0.0, 0.0, 0.0));
        handle.publish(graph.snapshot());

        let reader = handle.clone();
        let seen = thread::spawn(move || reader.latest().nodes().len()).join();
        assert_eq!(seen.ok(), Some(1));
    }

    #[test]
    fn test_stale_snapshot_is_ignored() {
        let mut graph = PoseGraph::new();
        let stale = graph.snapshot();
        graph.add_pose_node(SE2::from_xy_angle(1.0, 0.0, 0.0));
        let handle = SnapshotHandle::new(graph.snapshot());

        handle.publish(stale);
        assert_eq!(handle.latest().nodes().len(), 1);
    }
}
