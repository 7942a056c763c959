//! Module that contains the request-number table every process keeps.

use crate::process::ProcessId;
use serde::{Deserialize, Serialize};

/// Highest request sequence number observed for every process (`RN`).
///
/// Cells only ever grow. Callers are expected to pass member ids; the engine checks
/// ids coming from the network before they reach this table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceTable(Vec<u64>);

impl SequenceTable {
    pub fn new(cluster_size: usize) -> Self {
        Self(vec![0; cluster_size])
    }

    /// Function that starts a new request of `id` and returns its sequence number.
    pub fn bump_self(&mut self, id: ProcessId) -> u64 {
        let cell = &mut self.0[id.index()];
        *cell += 1;
        *cell
    }

    /// Function that records a request of `id` with number `seq`. Stale and repeated
    /// observations leave the table untouched.
    pub fn observe(&mut self, id: ProcessId, seq: u64) {
        let cell = &mut self.0[id.index()];
        *cell = (*cell).max(seq);
    }

    pub fn get(&self, id: ProcessId) -> u64 {
        self.0[id.index()]
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ProcessId, u64)> + '_ {
        self.0
            .iter()
            .enumerate()
            .map(|(i, seq)| (ProcessId(i + 1), *seq))
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.0
    }
}
