//! Module with the identifiers and per-process state owned by a protocol engine.

use crate::{sequence::SequenceTable, token::Token};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a participant. Valid ids are `1..=N` for a cluster of `N` processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(pub usize);

impl ProcessId {
    /// Function that returns every id of a cluster with `n` processes, in ascending order.
    pub fn all(n: usize) -> impl Iterator<Item = ProcessId> {
        (1..=n).map(ProcessId)
    }

    /// Function that tells if the id names a member of a cluster with `n` processes.
    pub fn is_member(self, n: usize) -> bool {
        (1..=n).contains(&self.0)
    }

    /// Zero-based slot of the id in per-process tables.
    pub(crate) fn index(self) -> usize {
        self.0 - 1
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Local protocol phase of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Not interested in the critical section. May or may not hold the token.
    Idle,
    /// Broadcast a request and waiting for the token.
    Requesting,
    /// Holding the token and executing the critical section.
    InCS,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Requesting => write!(f, "requesting"),
            Self::InCS => write!(f, "in critical section"),
        }
    }
}

/// State owned by exactly one engine.
///
/// Whether the process holds the token is derived from `token`, so the two can never
/// disagree.
#[derive(Debug, Clone)]
pub struct ProcessState {
    pub rn: SequenceTable,
    pub token: Option<Token>,
    pub phase: Phase,
}

impl ProcessState {
    pub fn new(cluster_size: usize) -> Self {
        Self {
            rn: SequenceTable::new(cluster_size),
            token: None,
            phase: Phase::Idle,
        }
    }

    pub fn holds_token(&self) -> bool {
        self.token.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_is_one_based() {
        assert!(!ProcessId(0).is_member(3));
        assert!(ProcessId(1).is_member(3));
        assert!(ProcessId(3).is_member(3));
        assert!(!ProcessId(4).is_member(3));
        assert_eq!(
            ProcessId::all(3).collect::<Vec<_>>(),
            vec![ProcessId(1), ProcessId(2), ProcessId(3)]
        );
    }

    #[test]
    fn fresh_state_is_idle_without_token() {
        let state = ProcessState::new(4);
        assert_eq!(state.phase, Phase::Idle);
        assert!(!state.holds_token());
        assert_eq!(state.rn.len(), 4);
    }
}
