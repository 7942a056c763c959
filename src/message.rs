//! Module that contains all the different message types sent in the network.

use crate::{process::ProcessId, token::Token};
use serde::{Deserialize, Serialize};
use std::error::Error;

/// Struct that represents the first line a peer writes on a new connection, naming itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake(pub ProcessId);

/// Enum that represents the protocol messages exchanged between processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// `from` asks for the critical section for the `seq`-th time.
    Request { from: ProcessId, seq: u64 },
    /// Hands the token over. The sender no longer owns it.
    Token(Token),
}

impl Message {
    pub fn is_token(&self) -> bool {
        matches!(self, Self::Token(_))
    }

    /// Function that returns the message as a JSON formatted `String`.
    pub fn to_json_string(&self) -> Result<String, Box<dyn Error + Send + Sync>> {
        Ok(serde_json::to_string(self)?)
    }

    /// Function that parses the message from a JSON formatted `String`.
    pub fn from_json_string(line: &str) -> Result<Self, Box<dyn Error + Send + Sync>> {
        Ok(serde_json::from_str::<Self>(line)?)
    }
}

impl Handshake {
    /// Function that returns the handshake as a JSON formatted `String`.
    pub fn to_json_string(&self) -> Result<String, Box<dyn Error + Send + Sync>> {
        Ok(serde_json::to_string(self)?)
    }

    /// Function that parses the handshake from a JSON formatted `String`.
    pub fn from_json_string(line: &str) -> Result<Self, Box<dyn Error + Send + Sync>> {
        Ok(serde_json::from_str::<Self>(line)?)
    }
}
