//! Scratch storage for undoing a rejected proposal.

use crate::graph::{Graph, NodeId, NodeValue};

/// Holds copies of node values taken before a speculative move.
///
/// The buffer is reused across steps so a sweep does not allocate once it
/// has warmed up.
#[derive(Debug, Default)]
pub struct ValueStore {
    saved: Vec<(NodeId, NodeValue)>,
}

impl ValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot with the current values of `nodes`.
    pub fn save(&mut self, graph: &Graph, nodes: &[NodeId]) {
        self.saved.clear();
        self.push(graph, nodes);
    }

    /// Add `nodes` to the current snapshot.
    pub fn push(&mut self, graph: &Graph, nodes: &[NodeId]) {
        self.saved
            .extend(nodes.iter().map(|&id| (id, graph.node(id).value.clone())));
    }

    /// Write every saved value back. The snapshot is kept, so restoring twice
    /// is harmless.
    pub fn restore(&self, graph: &mut Graph) {
        for (id, value) in &self.saved {
            graph.node_mut(*id).value = value.clone();
        }
    }
}
