//! Module with the errors raised by the protocol engine and its transports.

use crate::process::{Phase, ProcessId};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Breaches of the protocol that invalidate the mutual exclusion guarantee.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("{receiver} received a token while {phase}")]
    UnexpectedToken { receiver: ProcessId, phase: Phase },

    #[error("{receiver} received a second token while already holding one")]
    DuplicateToken { receiver: ProcessId },

    #[error("malformed token: {0}")]
    MalformedToken(String),

    #[error("{0} is in the critical section without holding the token")]
    InCsWithoutToken(ProcessId),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("{process} cannot {operation} while {phase}")]
    InvalidState {
        process: ProcessId,
        operation: &'static str,
        phase: Phase,
    },

    #[error("{0} was not bootstrapped")]
    NotBootstrapped(ProcessId),

    #[error("{0} was already bootstrapped")]
    AlreadyBootstrapped(ProcessId),

    #[error("message names unknown process {0}")]
    UnknownProcess(ProcessId),

    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] Violation),

    #[error("transport failure towards {to}: {reason}")]
    Transport { to: ProcessId, reason: String },

    #[error("peer {0} has stopped")]
    PeerStopped(ProcessId),
}

impl Error {
    /// Function that tells if the error must stop the process instead of being reported.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ProtocolViolation(_))
    }
}
