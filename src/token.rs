//! Module that contains the token that circulates between processes to ensure mutual exclusion.

use crate::{error::Violation, process::ProcessId};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// FIFO of processes waiting for the token. An id is never queued twice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenQueue(VecDeque<ProcessId>);

impl TokenQueue {
    pub fn new() -> Self {
        Self(VecDeque::new())
    }

    /// Function that appends `id` unless it is already waiting. Returns whether it was added.
    pub fn enqueue_if_absent(&mut self, id: ProcessId) -> bool {
        if self.contains(id) {
            return false;
        }
        self.0.push_back(id);
        true
    }

    pub fn dequeue(&mut self) -> Option<ProcessId> {
        self.0.pop_front()
    }

    /// Function that puts an id the transport couldn't reach back at the tail, so the
    /// processes behind it are tried first.
    pub(crate) fn requeue_back(&mut self, id: ProcessId) {
        self.enqueue_if_absent(id);
    }

    pub fn contains(&self, id: ProcessId) -> bool {
        self.0.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ProcessId> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<ProcessId> for TokenQueue {
    fn from_iter<I: IntoIterator<Item = ProcessId>>(iter: I) -> Self {
        let mut queue = Self::new();
        for id in iter {
            queue.enqueue_if_absent(id);
        }
        queue
    }
}

/// The single permission object. Whoever owns it may enter the critical section.
///
/// `Token` is deliberately not `Copy`: handing it to a peer moves it out of the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// Sequence number of the last satisfied request of every process (`LN`).
    pub last_granted: Vec<u64>,
    pub queue: TokenQueue,
}

impl Token {
    /// Function that creates the token of a fresh cluster: nothing granted, nobody waiting.
    pub fn new(cluster_size: usize) -> Self {
        Self {
            last_granted: vec![0; cluster_size],
            queue: TokenQueue::new(),
        }
    }

    pub fn last_granted(&self, id: ProcessId) -> u64 {
        self.last_granted[id.index()]
    }

    pub fn grant(&mut self, id: ProcessId, seq: u64) {
        self.last_granted[id.index()] = seq;
    }

    /// Freshness check: `id` has exactly one outstanding request that was not granted yet.
    pub fn is_outstanding(&self, id: ProcessId, observed: u64) -> bool {
        observed == self.last_granted(id) + 1
    }

    /// Function that checks a token received from the network against the cluster shape.
    pub fn validate(&self, cluster_size: usize) -> Result<(), Violation> {
        if self.last_granted.len() != cluster_size {
            return Err(Violation::MalformedToken(format!(
                "last granted table has {} entries, expected {}",
                self.last_granted.len(),
                cluster_size
            )));
        }

        let mut seen = Vec::with_capacity(self.queue.len());
        for id in self.queue.iter() {
            if !id.is_member(cluster_size) {
                return Err(Violation::MalformedToken(format!(
                    "queue names unknown process {id}"
                )));
            }
            if seen.contains(&id) {
                return Err(Violation::MalformedToken(format!(
                    "queue lists {id} more than once"
                )));
            }
            seen.push(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_is_idempotent() {
        let mut queue = TokenQueue::new();
        assert!(queue.enqueue_if_absent(ProcessId(2)));
        assert!(!queue.enqueue_if_absent(ProcessId(2)));
        assert!(queue.enqueue_if_absent(ProcessId(3)));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn dequeue_is_fifo() {
        let mut queue: TokenQueue = [ProcessId(3), ProcessId(1), ProcessId(2)]
            .into_iter()
            .collect();
        assert_eq!(queue.dequeue(), Some(ProcessId(3)));
        assert_eq!(queue.dequeue(), Some(ProcessId(1)));
        assert_eq!(queue.dequeue(), Some(ProcessId(2)));
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn unreachable_head_moves_to_tail() {
        let mut queue: TokenQueue = [ProcessId(2), ProcessId(3)].into_iter().collect();
        let head = queue.dequeue().unwrap();
        queue.requeue_back(head);
        assert_eq!(queue.iter().collect::<Vec<_>>(), vec![ProcessId(3), ProcessId(2)]);
    }

    #[test]
    fn freshness_admits_only_next_request() {
        let mut token = Token::new(3);
        token.grant(ProcessId(2), 1);
        assert!(!token.is_outstanding(ProcessId(2), 1));
        assert!(token.is_outstanding(ProcessId(2), 2));
        assert!(!token.is_outstanding(ProcessId(2), 3));
    }

    #[test]
    fn validate_rejects_wrong_shape() {
        assert!(Token::new(3).validate(3).is_ok());
        assert!(matches!(
            Token::new(2).validate(3),
            Err(Violation::MalformedToken(_))
        ));

        let duplicated = Token {
            last_granted: vec![0; 3],
            queue: TokenQueue(VecDeque::from([ProcessId(2), ProcessId(2)])),
        };
        assert!(duplicated.validate(3).is_err());

        let unknown = Token {
            last_granted: vec![0; 3],
            queue: TokenQueue(VecDeque::from([ProcessId(7)])),
        };
        assert!(unknown.validate(3).is_err());
    }

    #[test]
    fn token_serializes_as_table_and_list() {
        let mut token = Token::new(3);
        token.grant(ProcessId(2), 1);
        token.queue.enqueue_if_absent(ProcessId(3));

        let json = serde_json::to_string(&token).unwrap();
        assert_eq!(json, r#"{"last_granted":[0,1,0],"queue":[3]}"#);
    }
}
