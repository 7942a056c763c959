//! Module with the messaging capability injected into every protocol engine.

use crate::{message::Message, process::ProcessId};
use std::{fmt, sync::Arc};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Receiving end of a process's inbound messages.
pub type Inbox = UnboundedReceiver<Message>;

/// A message the channel refused to accept. The message is handed back so a refused
/// token is never lost.
#[derive(Debug)]
pub struct SendError {
    pub to: ProcessId,
    pub message: Message,
    pub reason: String,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "couldn't send to {}: {}", self.to, self.reason)
    }
}

impl std::error::Error for SendError {}

/// Unicast and broadcast primitive between the members of a fixed cluster.
///
/// `send` only has to accept the message for delivery; it must not block. Implementations
/// may reorder or duplicate requests, but must neither duplicate nor drop a token once it
/// has been accepted.
pub trait MessageChannel {
    /// Number of processes in the cluster, which is also the highest valid id.
    fn cluster_size(&self) -> usize;

    fn send(&self, to: ProcessId, message: Message) -> Result<(), SendError>;

    /// Function that sends `message` to every member except `exclude`, returning the
    /// refusals.
    fn broadcast(&self, message: Message, exclude: ProcessId) -> Vec<SendError> {
        ProcessId::all(self.cluster_size())
            .filter(|to| *to != exclude)
            .filter_map(|to| self.send(to, message.clone()).err())
            .collect()
    }
}

/// In-process network of unbounded mailboxes, one per member.
pub struct LocalNetwork {
    mailboxes: Arc<Vec<UnboundedSender<Message>>>,
    inboxes: Vec<Option<Inbox>>,
}

impl LocalNetwork {
    pub fn new(cluster_size: usize) -> Self {
        let (mailboxes, inboxes): (Vec<_>, Vec<_>) = (0..cluster_size)
            .map(|_| {
                let (tx, rx) = mpsc::unbounded_channel();
                (tx, Some(rx))
            })
            .unzip();

        Self {
            mailboxes: Arc::new(mailboxes),
            inboxes,
        }
    }

    pub fn cluster_size(&self) -> usize {
        self.mailboxes.len()
    }

    /// Function that returns a channel able to reach every member of the network.
    pub fn channel(&self) -> LocalChannel {
        LocalChannel {
            mailboxes: Arc::clone(&self.mailboxes),
        }
    }

    /// Function that hands out the inbox of `id`. Each inbox can be taken once.
    pub fn take_inbox(&mut self, id: ProcessId) -> Option<Inbox> {
        if !id.is_member(self.cluster_size()) {
            return None;
        }
        self.inboxes[id.index()].take()
    }
}

#[derive(Clone)]
pub struct LocalChannel {
    mailboxes: Arc<Vec<UnboundedSender<Message>>>,
}

impl MessageChannel for LocalChannel {
    fn cluster_size(&self) -> usize {
        self.mailboxes.len()
    }

    fn send(&self, to: ProcessId, message: Message) -> Result<(), SendError> {
        if !to.is_member(self.cluster_size()) {
            return Err(SendError {
                to,
                message,
                reason: "unknown process".to_string(),
            });
        }

        self.mailboxes[to.index()]
            .send(message)
            .map_err(|e| SendError {
                to,
                message: e.0,
                reason: "mailbox closed".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_skips_sender() {
        let mut network = LocalNetwork::new(3);
        let channel = network.channel();
        let message = Message::Request {
            from: ProcessId(2),
            seq: 1,
        };

        assert!(channel.broadcast(message.clone(), ProcessId(2)).is_empty());

        let mut one = network.take_inbox(ProcessId(1)).unwrap();
        let mut two = network.take_inbox(ProcessId(2)).unwrap();
        let mut three = network.take_inbox(ProcessId(3)).unwrap();

        assert_eq!(one.recv().await, Some(message.clone()));
        assert_eq!(three.recv().await, Some(message));
        assert!(two.try_recv().is_err());
    }

    #[test]
    fn refused_message_is_handed_back() {
        let mut network = LocalNetwork::new(2);
        let channel = network.channel();
        drop(network.take_inbox(ProcessId(2)));

        let token = Message::Token(crate::token::Token::new(2));
        let err = channel.send(ProcessId(2), token.clone()).unwrap_err();
        assert_eq!(err.message, token);

        let err = channel.send(ProcessId(9), token.clone()).unwrap_err();
        assert_eq!(err.to, ProcessId(9));
        assert_eq!(err.message, token);
    }

    #[test]
    fn inbox_is_taken_once() {
        let mut network = LocalNetwork::new(1);
        assert!(network.take_inbox(ProcessId(1)).is_some());
        assert!(network.take_inbox(ProcessId(1)).is_none());
        assert!(network.take_inbox(ProcessId(0)).is_none());
    }
}
