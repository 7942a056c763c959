//! Token-based distributed mutual exclusion after Suzuki and Kasami.
//!
//! A fixed cluster of `N` processes shares a single token. A process that wants the
//! critical section broadcasts a numbered request; whoever holds the token queues it and
//! hands the token over when leaving. Each entry costs at most `N - 1` requests and one
//! token message.

pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod log;
pub mod message;
pub mod peer;
pub mod poisson;
pub mod process;
pub mod sequence;
pub mod sim;
pub mod token;
pub mod transport;

pub use channel::{LocalChannel, LocalNetwork, MessageChannel};
pub use engine::{EngineStats, ProtocolEngine, Snapshot};
pub use error::{Error, Violation};
pub use message::Message;
pub use peer::{Peer, PeerHandle};
pub use process::{Phase, ProcessId};
pub use token::{Token, TokenQueue};

/// Default mean number of critical section requests per second of a CLI peer.
pub const RATE: f64 = 1.;
