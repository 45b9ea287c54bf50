//! Ordered collection of probe results

use crate::proxy::models::ProbeResult;
use std::collections::HashMap;

/// Collects results in completion order and hands them out in submission
/// order
///
/// A result is only drained once every node submitted before it has been
/// drained, so a table fed from [`ResultSink::drain_ready`] lists nodes in
/// the order of the source file. A name listed more than once gets one
/// result per listing, filled in the order they arrive.
#[derive(Debug, Clone, Default)]
pub struct ResultSink {
    order: Vec<String>,
    positions: HashMap<String, Vec<usize>>,
    results: Vec<Option<ProbeResult>>,
    received: usize,
    drained: usize,
}

impl ResultSink {
    /// Create a sink expecting one result per node, in this order
    pub fn new(nodes: Vec<String>) -> Self {
        let mut positions: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, node) in nodes.iter().enumerate() {
            positions.entry(node.clone()).or_default().push(index);
        }
        let results = vec![None; nodes.len()];

        Self {
            order: nodes,
            positions,
            results,
            received: 0,
            drained: 0,
        }
    }

    /// Record a result in the first open slot of its node. Unknown nodes,
    /// and nodes whose slots are all filled, are ignored and `false` is
    /// returned.
    pub fn push(&mut self, result: ProbeResult) -> bool {
        let Some(indices) = self.positions.get(&result.node) else {
            return false;
        };
        let drained = self.drained;
        let results = &self.results;
        let Some(index) = indices
            .iter()
            .copied()
            .find(|&index| index >= drained && results[index].is_none())
        else {
            return false;
        };

        self.results[index] = Some(result);
        self.received += 1;
        true
    }

    /// Results that are next in submission order and have arrived
    pub fn drain_ready(&mut self) -> Vec<ProbeResult> {
        let mut ready = Vec::new();
        while let Some(slot) = self.results.get_mut(self.drained) {
            match slot.take() {
                Some(result) => {
                    ready.push(result);
                    self.drained += 1;
                }
                None => break,
            }
        }
        ready
    }

    pub fn total(&self) -> usize {
        self.order.len()
    }

    /// Results received so far, drained or not
    pub fn received(&self) -> usize {
        self.received
    }

    pub fn drained(&self) -> usize {
        self.drained
    }

    /// Nodes that have not been drained yet, in submission order
    pub fn pending(&self) -> &[String] {
        &self.order[self.drained..]
    }

    pub fn is_complete(&self) -> bool {
        self.drained == self.order.len()
    }
}
