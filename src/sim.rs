//! Deterministic, single-threaded simulation of a whole cluster.
//!
//! Every engine talks through a shared pool of in-flight messages. At each step a seeded
//! [`SmallRng`] picks one pending action: deliver any in-flight message (so delivery order
//! is arbitrary), let an idle process request the critical section, or let the process in
//! the critical section leave it. Requests can be delivered more than once; tokens never
//! are. After every step the run is checked for mutual exclusion, a single token, unique
//! queue entries, `LN <= RN` on the holder, and bounded waiting once admitted.

use crate::{
    channel::{MessageChannel, SendError},
    engine::{ProtocolEngine, Snapshot},
    error::Error,
    message::Message,
    process::{Phase, ProcessId},
    token::Token,
};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::{
    cell::RefCell,
    rc::Rc,
    sync::{Arc, Mutex, PoisonError},
};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct SimConfig {
    pub peers: usize,
    /// Critical section entries every process performs.
    pub rounds: u32,
    pub seed: u64,
    /// Probability that a delivered request stays in flight to be delivered again.
    pub duplicate_rate: f64,
    pub max_steps: usize,
    pub initial_holder: ProcessId,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            peers: 3,
            rounds: 5,
            seed: 0,
            duplicate_rate: 0.0,
            max_steps: 200_000,
            initial_holder: ProcessId(1),
        }
    }
}

#[derive(Debug, Error)]
pub enum SimError {
    #[error("invalid simulation: {0}")]
    Config(String),

    #[error("step {step}: {reason}")]
    Invariant { step: usize, reason: String },

    #[error("no progress after {steps} steps, {waiting} processes still waiting")]
    Stalled { steps: usize, waiting: usize },

    #[error("step {step}: {source}")]
    Engine { step: usize, source: Error },
}

#[derive(Debug, Clone)]
pub struct SimReport {
    pub steps: usize,
    /// Processes in the order they entered the critical section.
    pub entries: Vec<ProcessId>,
    pub requests_sent: u64,
    pub tokens_sent: u64,
    pub duplicates_delivered: usize,
    /// Most grants any process saw between joining the token queue and entering.
    pub max_grants_waited: usize,
    pub snapshots: Vec<Snapshot>,
}

#[derive(Debug, Clone)]
struct Envelope {
    to: ProcessId,
    message: Message,
}

type InFlight = Rc<RefCell<Vec<Envelope>>>;

#[derive(Clone)]
struct SimChannel {
    size: usize,
    in_flight: InFlight,
}

impl MessageChannel for SimChannel {
    fn cluster_size(&self) -> usize {
        self.size
    }

    fn send(&self, to: ProcessId, message: Message) -> Result<(), SendError> {
        if !to.is_member(self.size) {
            return Err(SendError {
                to,
                message,
                reason: "unknown process".to_string(),
            });
        }
        self.in_flight.borrow_mut().push(Envelope { to, message });
        Ok(())
    }
}

enum Action {
    Deliver(usize),
    Request(usize),
    Release(usize),
}

pub struct Simulation {
    config: SimConfig,
    engines: Vec<ProtocolEngine<SimChannel>>,
    in_flight: InFlight,
    entries: Arc<Mutex<Vec<ProcessId>>>,
    remaining: Vec<u32>,
    admitted: Vec<Option<usize>>,
    checked_entries: usize,
    max_grants_waited: usize,
    duplicates_delivered: usize,
    rng: SmallRng,
    steps: usize,
}

impl Simulation {
    pub fn new(config: SimConfig) -> Result<Self, SimError> {
        if config.peers == 0 {
            return Err(SimError::Config("a cluster needs at least one process".into()));
        }
        if !(0.0..1.0).contains(&config.duplicate_rate) {
            return Err(SimError::Config(format!(
                "duplicate rate must be in [0, 1), got {}",
                config.duplicate_rate
            )));
        }
        if !config.initial_holder.is_member(config.peers) {
            return Err(SimError::Config(format!(
                "initial holder {} is not a member",
                config.initial_holder
            )));
        }

        let in_flight = InFlight::default();
        let engines = ProcessId::all(config.peers)
            .map(|id| -> Result<_, Error> {
                let channel = SimChannel {
                    size: config.peers,
                    in_flight: Rc::clone(&in_flight),
                };
                let mut engine = ProtocolEngine::new(id, channel)?;
                engine.bootstrap(id == config.initial_holder)?;
                Ok(engine)
            })
            .collect::<Result<Vec<_>, Error>>()
            .map_err(|source| SimError::Engine { step: 0, source })?;

        Ok(Self {
            remaining: vec![config.rounds; config.peers],
            admitted: vec![None; config.peers],
            rng: SmallRng::seed_from_u64(config.seed),
            config,
            engines,
            in_flight,
            entries: Arc::default(),
            checked_entries: 0,
            max_grants_waited: 0,
            duplicates_delivered: 0,
            steps: 0,
        })
    }

    /// Function that runs the cluster until every process used up its rounds.
    pub fn run(mut self) -> Result<SimReport, SimError> {
        while self.step()? {
            if self.steps >= self.config.max_steps {
                return Err(self.stalled());
            }
        }

        let waiting = self
            .engines
            .iter()
            .filter(|e| e.phase() != Phase::Idle)
            .count();
        if waiting > 0 || self.remaining.iter().any(|r| *r > 0) {
            return Err(self.stalled());
        }

        let stats = self.engines.iter().map(|e| e.stats());
        Ok(SimReport {
            steps: self.steps,
            entries: self.entries(),
            requests_sent: stats.clone().map(|s| s.requests_sent).sum(),
            tokens_sent: stats.map(|s| s.tokens_sent).sum(),
            duplicates_delivered: self.duplicates_delivered,
            max_grants_waited: self.max_grants_waited,
            snapshots: self.snapshots(),
        })
    }

    /// Function that performs one random action. Returns `false` once nothing is left to do.
    pub fn step(&mut self) -> Result<bool, SimError> {
        let actions = self.actions();
        if actions.is_empty() {
            return Ok(false);
        }
        self.steps += 1;

        let action = self.rng.random_range(0..actions.len());
        let result = match actions[action] {
            Action::Deliver(i) => self.deliver(i),
            Action::Request(i) => {
                self.remaining[i] -= 1;
                let entries = Arc::clone(&self.entries);
                self.engines[i].request_cs(move |id| {
                    entries
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(id);
                })
            }
            Action::Release(i) => self.engines[i].release_cs(),
        };
        result.map_err(|source| SimError::Engine {
            step: self.steps,
            source,
        })?;

        self.check_invariants()?;
        Ok(true)
    }

    pub fn snapshots(&self) -> Vec<Snapshot> {
        self.engines.iter().map(|e| e.snapshot()).collect()
    }

    fn actions(&self) -> Vec<Action> {
        let mut actions: Vec<Action> = (0..self.in_flight.borrow().len())
            .map(Action::Deliver)
            .collect();

        for (i, engine) in self.engines.iter().enumerate() {
            match engine.phase() {
                Phase::Idle if self.remaining[i] > 0 => actions.push(Action::Request(i)),
                Phase::InCS => actions.push(Action::Release(i)),
                _ => {}
            }
        }
        actions
    }

    fn deliver(&mut self, index: usize) -> Result<(), Error> {
        let envelope = {
            let mut in_flight = self.in_flight.borrow_mut();
            let duplicate = !in_flight[index].message.is_token()
                && self.rng.random_bool(self.config.duplicate_rate);
            if duplicate {
                self.duplicates_delivered += 1;
                in_flight[index].clone()
            } else {
                in_flight.swap_remove(index)
            }
        };

        self.engines[envelope.to.index()].handle(envelope.message)
    }

    fn check_invariants(&mut self) -> Result<(), SimError> {
        let size = self.config.peers;
        let in_flight = self.in_flight.borrow();

        let in_cs: Vec<_> = self
            .engines
            .iter()
            .filter(|e| e.phase() == Phase::InCS)
            .collect();
        if in_cs.len() > 1 {
            return Err(self.violation(format!(
                "{} processes are in the critical section at once",
                in_cs.len()
            )));
        }
        if let Some(engine) = in_cs.first().filter(|e| !e.holds_token()) {
            return Err(self.violation(format!(
                "{} is in the critical section without the token",
                engine.id()
            )));
        }

        let held: Vec<(ProcessId, &Token)> = self
            .engines
            .iter()
            .filter_map(|e| e.token().map(|token| (e.id(), token)))
            .collect();
        let travelling: Vec<(ProcessId, &Token)> = in_flight
            .iter()
            .filter_map(|envelope| match &envelope.message {
                Message::Token(token) => Some((envelope.to, token)),
                Message::Request { .. } => None,
            })
            .collect();
        if held.len() + travelling.len() != 1 {
            return Err(self.violation(format!(
                "{} tokens exist ({} held, {} in flight)",
                held.len() + travelling.len(),
                held.len(),
                travelling.len()
            )));
        }

        for (owner, token) in held.iter().chain(travelling.iter()) {
            token
                .validate(size)
                .map_err(|e| self.violation(format!("token bound to {owner}: {e}")))?;
        }
        for (holder, token) in &held {
            let rn = self.engines[holder.index()].rn();
            if let Some(k) = ProcessId::all(size).find(|k| token.last_granted(*k) > rn.get(*k)) {
                return Err(self.violation(format!(
                    "{holder} holds a token that granted {k} a request it never saw"
                )));
            }
        }

        // processes that joined a queue, or that the token is travelling to
        let admitted_now: Vec<ProcessId> = held
            .iter()
            .chain(travelling.iter())
            .flat_map(|(_, token)| token.queue.iter())
            .chain(travelling.iter().map(|(to, _)| *to))
            .collect();
        drop(in_flight);

        let entries = self.entries();
        for (position, id) in entries.iter().enumerate().skip(self.checked_entries) {
            if let Some(admitted_at) = self.admitted[id.index()].take() {
                let waited = position - admitted_at;
                self.max_grants_waited = self.max_grants_waited.max(waited);
                if waited > size - 1 {
                    return Err(self.violation(format!(
                        "{id} waited for {waited} grants after joining the queue"
                    )));
                }
            }
        }
        self.checked_entries = entries.len();

        for id in admitted_now {
            let slot = &mut self.admitted[id.index()];
            if slot.is_none() {
                *slot = Some(entries.len());
            }
        }
        Ok(())
    }

    fn entries(&self) -> Vec<ProcessId> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn violation(&self, reason: String) -> SimError {
        SimError::Invariant {
            step: self.steps,
            reason,
        }
    }

    fn stalled(&self) -> SimError {
        SimError::Stalled {
            steps: self.steps,
            waiting: self
                .engines
                .iter()
                .filter(|e| e.phase() == Phase::Requesting)
                .count(),
        }
    }
}
