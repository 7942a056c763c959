//! The per-process Suzuki-Kasami state machine.
//!
//! A [`ProtocolEngine`] owns the request numbers of one process and, at most, the token.
//! It is driven by three kinds of events: the local application asking for or leaving
//! the critical section, a `REQUEST` arriving from a peer, and the token arriving. Every
//! outbound message goes through the injected [`MessageChannel`].
//!
//! The engine is not thread safe on purpose. Whoever drives it must serialize calls,
//! which [`crate::peer::Peer`] does by owning it inside a single task.
//!
//! Losing a `TOKEN` message, or a crash of the process holding the token, stops every
//! process from ever entering the critical section again. The engine does not try to
//! regenerate the token, since a wrong guess would break mutual exclusion.

use crate::{
    channel::{MessageChannel, SendError},
    error::{Error, Result, Violation},
    log,
    message::Message,
    process::{Phase, ProcessId, ProcessState},
    sequence::SequenceTable,
    token::Token,
};
use color_print::cformat;
use serde::{Deserialize, Serialize};

/// Continuation fired once the process enters the critical section.
pub type EntryCallback = Box<dyn FnOnce(ProcessId) + Send>;

/// Counters of the messages and entries produced by one engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub requests_sent: u64,
    pub tokens_sent: u64,
    pub tokens_received: u64,
    pub cs_entries: u64,
    /// Entries made without any message because the process already held the token.
    pub self_grants: u64,
}

/// Read-only copy of an engine's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: ProcessId,
    pub phase: Phase,
    pub holds_token: bool,
    pub rn: SequenceTable,
    pub token: Option<Token>,
    pub stats: EngineStats,
}

pub struct ProtocolEngine<C> {
    id: ProcessId,
    state: ProcessState,
    channel: C,
    bootstrapped: bool,
    on_entry: Option<EntryCallback>,
    stats: EngineStats,
}

impl<C: MessageChannel> ProtocolEngine<C> {
    pub fn new(id: ProcessId, channel: C) -> Result<Self> {
        let cluster_size = channel.cluster_size();
        if !id.is_member(cluster_size) {
            return Err(Error::UnknownProcess(id));
        }

        Ok(Self {
            id,
            state: ProcessState::new(cluster_size),
            channel,
            bootstrapped: false,
            on_entry: None,
            stats: EngineStats::default(),
        })
    }

    /// Function that makes the engine ready. Exactly one process of the cluster must be
    /// bootstrapped with `initial_holder` set; it starts with a fresh token.
    pub fn bootstrap(&mut self, initial_holder: bool) -> Result<()> {
        if self.bootstrapped {
            return Err(Error::AlreadyBootstrapped(self.id));
        }
        if initial_holder {
            self.state.token = Some(Token::new(self.cluster_size()));
            log::debug(&cformat!(
                "{} starts with the <yellow, bold>token</yellow, bold>.",
                self.id
            ));
        }
        self.bootstrapped = true;
        Ok(())
    }

    /// Function that asks for the critical section. `on_entry` runs as soon as the process
    /// enters it, which is right away when it already holds an idle token.
    pub fn request_cs<F>(&mut self, on_entry: F) -> Result<()>
    where
        F: FnOnce(ProcessId) + Send + 'static,
    {
        self.ensure_bootstrapped()?;
        if self.state.phase != Phase::Idle {
            return Err(self.invalid_state("request the critical section"));
        }

        // a dispatch refused by the transport left someone waiting on an idle token
        if self
            .state
            .token
            .as_ref()
            .is_some_and(|token| !token.queue.is_empty())
        {
            if let Err(e) = self.dispatch() {
                log::warn(&format!("{} keeps the token for now: {e}", self.id));
            }
        }

        let seq = self.state.rn.bump_self(self.id);
        self.on_entry = Some(Box::new(on_entry));

        if self.state.holds_token() {
            self.stats.self_grants += 1;
            self.enter();
            return Ok(());
        }

        self.state.phase = Phase::Requesting;
        log::debug(&cformat!(
            "{} broadcasts request <bold>#{}</bold>.",
            self.id,
            seq
        ));

        let refused = self
            .channel
            .broadcast(Message::Request { from: self.id, seq }, self.id);
        self.stats.requests_sent += (self.cluster_size() - 1 - refused.len()) as u64;
        for SendError { to, reason, .. } in refused {
            log::warn(&format!(
                "{} couldn't send request #{seq} to {to}: {reason}",
                self.id
            ));
        }
        Ok(())
    }

    /// Function that leaves the critical section and hands the token to the next waiting
    /// process, if any.
    pub fn release_cs(&mut self) -> Result<()> {
        if self.state.phase != Phase::InCS {
            return Err(self.invalid_state("release the critical section"));
        }

        let state = &mut self.state;
        let token = state
            .token
            .as_mut()
            .ok_or(Violation::InCsWithoutToken(self.id))?;

        token.grant(self.id, state.rn.get(self.id));
        for k in ProcessId::all(state.rn.len()).filter(|k| *k != self.id) {
            if !token.queue.contains(k) && token.is_outstanding(k, state.rn.get(k)) {
                token.queue.enqueue_if_absent(k);
            }
        }

        state.phase = Phase::Idle;
        log::debug(&cformat!("{} leaves the critical section.", self.id));
        self.dispatch()
    }

    pub fn on_receive_request(&mut self, from: ProcessId, seq: u64) -> Result<()> {
        self.ensure_bootstrapped()?;
        self.ensure_member(from)?;
        if from == self.id {
            log::warn(&format!("{} ignored a request claiming to be its own.", self.id));
            return Ok(());
        }

        self.state.rn.observe(from, seq);

        // the holder admits waiting processes itself when it leaves
        if self.state.phase == Phase::InCS {
            return Ok(());
        }

        let state = &mut self.state;
        let Some(token) = state.token.as_mut() else {
            return Ok(());
        };

        if token.is_outstanding(from, state.rn.get(from)) {
            token.queue.enqueue_if_absent(from);
        }
        self.dispatch()
    }

    pub fn on_receive_token(&mut self, token: Token) -> Result<()> {
        self.ensure_bootstrapped()?;
        if self.state.holds_token() {
            return Err(Violation::DuplicateToken { receiver: self.id }.into());
        }
        if self.state.phase != Phase::Requesting {
            return Err(Violation::UnexpectedToken {
                receiver: self.id,
                phase: self.state.phase,
            }
            .into());
        }
        token.validate(self.cluster_size())?;

        // a grant can outrun the granted process's request broadcast
        for (k, granted) in token.last_granted.iter().enumerate() {
            self.state.rn.observe(ProcessId(k + 1), *granted);
        }

        self.stats.tokens_received += 1;
        self.state.token = Some(token);
        self.enter();
        Ok(())
    }

    /// Function that routes an inbound message to its handler.
    pub fn handle(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Request { from, seq } => self.on_receive_request(from, seq),
            Message::Token(token) => self.on_receive_token(token),
        }
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn cluster_size(&self) -> usize {
        self.state.rn.len()
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn holds_token(&self) -> bool {
        self.state.holds_token()
    }

    pub fn token(&self) -> Option<&Token> {
        self.state.token.as_ref()
    }

    pub fn rn(&self) -> &SequenceTable {
        &self.state.rn
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            id: self.id,
            phase: self.state.phase,
            holds_token: self.state.holds_token(),
            rn: self.state.rn.clone(),
            token: self.state.token.clone(),
            stats: self.stats,
        }
    }

    /// Function that sends the token to the head of its queue. An idle holder with nobody
    /// waiting keeps it.
    ///
    /// A process the channel refuses is moved to the tail and the next one is tried. The
    /// token stays here only when every waiting process was refused.
    fn dispatch(&mut self) -> Result<()> {
        let Some(mut token) = self.state.token.take() else {
            return Ok(());
        };

        let mut refused = None;
        for _ in 0..token.queue.len() {
            let Some(next) = token.queue.dequeue() else {
                break;
            };

            match self.channel.send(next, Message::Token(token)) {
                Ok(()) => {
                    self.stats.tokens_sent += 1;
                    log::debug(&cformat!(
                        "{} hands the <yellow, bold>token</yellow, bold> to {}.",
                        self.id,
                        next
                    ));
                    return Ok(());
                }
                Err(SendError {
                    message: Message::Token(returned),
                    reason,
                    ..
                }) => {
                    log::warn(&format!(
                        "{} couldn't hand the token to {next}: {reason}",
                        self.id
                    ));
                    token = returned;
                    token.queue.requeue_back(next);
                    refused = Some(Error::Transport { to: next, reason });
                }
                Err(SendError { reason, .. }) => {
                    log::error(&format!(
                        "{} lost the token while handing it to {next}; no process can enter the critical section anymore.",
                        self.id
                    ));
                    return Err(Error::Transport { to: next, reason });
                }
            }
        }

        self.state.token = Some(token);
        refused.map_or(Ok(()), Err)
    }

    fn enter(&mut self) {
        self.state.phase = Phase::InCS;
        self.stats.cs_entries += 1;
        log::debug(&cformat!(
            "{} enters the <bold>critical section</bold>.",
            self.id
        ));
        if let Some(on_entry) = self.on_entry.take() {
            on_entry(self.id);
        }
    }

    fn ensure_bootstrapped(&self) -> Result<()> {
        if self.bootstrapped {
            Ok(())
        } else {
            Err(Error::NotBootstrapped(self.id))
        }
    }

    fn ensure_member(&self, id: ProcessId) -> Result<()> {
        if id.is_member(self.cluster_size()) {
            Ok(())
        } else {
            Err(Error::UnknownProcess(id))
        }
    }

    fn invalid_state(&self, operation: &'static str) -> Error {
        Error::InvalidState {
            process: self.id,
            operation,
            phase: self.state.phase,
        }
    }
}
