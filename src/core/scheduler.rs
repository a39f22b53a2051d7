//! Weighted round-robin queue selection with per-queue credits.
//!
//! Each queue starts a cycle with credits equal to its weight. Queues are
//! scanned in configuration order and the first one with credit and a ready
//! task is served, spending one credit. When every non-empty queue is out of
//! credit, all credits reset to the weights. Throughput is proportional to
//! weight and no non-empty queue waits longer than one full cycle.

use crate::config::QueueSpec;

/// Credit state for a fixed, ordered set of queues.
#[derive(Debug, Clone)]
pub struct WeightedScheduler {
    names: Vec<String>,
    weights: Vec<u32>,
    credits: Vec<u32>,
}

impl WeightedScheduler {
    /// Build from queue specs; weights are clamped to at least 1.
    pub fn new(queues: &[QueueSpec]) -> Self {
        let names = queues.iter().map(|q| q.name.clone()).collect();
        let weights: Vec<u32> = queues.iter().map(|q| q.weight.max(1)).collect();
        Self {
            names,
            credits: weights.clone(),
            weights,
        }
    }

    /// Queue names in scan order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Name of the queue at `index`.
    pub fn name(&self, index: usize) -> &str {
        &self.names[index]
    }

    /// Remaining credits, in scan order.
    pub fn credits(&self) -> &[u32] {
        &self.credits
    }

    /// Spend one credit on the first queue not yet in `tried` that still
    /// has credit, and return its index.
    ///
    /// When every untried queue is out of credit a new cycle starts first.
    /// Returns `None` once every queue has been tried. The credit is taken
    /// before the queue is polled, so concurrent callers holding the same
    /// scheduler lock never spend the same credit twice.
    pub fn claim(&mut self, tried: &[bool]) -> Option<usize> {
        let untried = |i: &usize| !tried.get(*i).copied().unwrap_or(false);
        let index = match (0..self.names.len()).filter(untried).find(|&i| self.credits[i] > 0) {
            Some(index) => index,
            None => {
                (0..self.names.len()).find(untried)?;
                self.reset();
                (0..self.names.len()).filter(untried).find(|&i| self.credits[i] > 0)?
            }
        };
        self.credits[index] -= 1;
        Some(index)
    }

    /// Give back a credit claimed on a queue that turned out empty.
    pub fn refund(&mut self, index: usize) {
        self.credits[index] = (self.credits[index] + 1).min(self.weights[index]);
    }

    /// Restore every queue's credit to its weight.
    pub fn reset(&mut self) {
        self.credits.copy_from_slice(&self.weights);
    }

    /// Pick the next queue given a readiness check, spending its credit.
    pub fn next<F>(&mut self, mut has_ready: F) -> Option<usize>
    where
        F: FnMut(&str) -> bool,
    {
        let mut tried = vec![false; self.names.len()];
        loop {
            let index = self.claim(&tried)?;
            if has_ready(&self.names[index]) {
                return Some(index);
            }
            self.refund(index);
            tried[index] = true;
        }
    }
}
