//! Module that runs a protocol engine as an actor: one task owns the engine and serializes
//! inbound messages and application commands.

use crate::{
    channel::{Inbox, MessageChannel},
    config::WorkloadConfig,
    engine::{ProtocolEngine, Snapshot},
    error::{Error, Result},
    log,
    poisson::Poisson,
    process::ProcessId,
};
use color_print::cformat;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::sleep,
};

const COMMAND_BUFFER: usize = 64;

enum Command {
    RequestCs {
        ack: oneshot::Sender<Result<()>>,
        entered: oneshot::Sender<ProcessId>,
    },
    ReleaseCs(oneshot::Sender<Result<()>>),
    Snapshot(oneshot::Sender<Snapshot>),
    Shutdown,
}

pub struct Peer<C> {
    engine: ProtocolEngine<C>,
    inbox: Inbox,
    commands: mpsc::Receiver<Command>,
}

impl<C> Peer<C>
where
    C: MessageChannel + Send + 'static,
{
    /// Function that starts the actor of an already bootstrapped engine.
    ///
    /// The returned task ends with `Ok` on shutdown and with the error on a protocol
    /// violation, after which the process must not take part in the protocol anymore.
    pub fn spawn(engine: ProtocolEngine<C>, inbox: Inbox) -> (PeerHandle, JoinHandle<Result<()>>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let handle = PeerHandle {
            id: engine.id(),
            commands: tx,
        };
        let peer = Self {
            engine,
            inbox,
            commands: rx,
        };

        (handle, tokio::spawn(peer.run()))
    }

    async fn run(mut self) -> Result<()> {
        let mut inbox_open = true;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => {
                        log::debug(&format!("{} stops.", self.engine.id()));
                        return Ok(());
                    }
                    Some(command) => self.execute(command),
                },
                message = self.inbox.recv(), if inbox_open => match message {
                    Some(message) => {
                        if let Err(e) = self.engine.handle(message) {
                            if e.is_fatal() {
                                log::error(&cformat!(
                                    "{} <red, bold>stops</red, bold>: {}",
                                    self.engine.id(),
                                    e
                                ));
                                return Err(e);
                            }
                            log::warn(&format!("{}: {e}", self.engine.id()));
                        }
                    }
                    None => inbox_open = false,
                },
            }
        }
    }

    fn execute(&mut self, command: Command) {
        match command {
            Command::RequestCs { ack, entered } => {
                let result = self.engine.request_cs(move |id| {
                    let _ = entered.send(id);
                });
                let _ = ack.send(result);
            }
            Command::ReleaseCs(ack) => {
                let _ = ack.send(self.engine.release_cs());
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.engine.snapshot());
            }
            Command::Shutdown => {}
        }
    }
}

/// Cloneable handle the application uses to talk to its peer.
#[derive(Clone)]
pub struct PeerHandle {
    id: ProcessId,
    commands: mpsc::Sender<Command>,
}

/// Pending entry into the critical section.
pub struct Entry {
    id: ProcessId,
    entered: oneshot::Receiver<ProcessId>,
}

impl Entry {
    /// Function that waits until the process is inside the critical section.
    pub async fn wait(self) -> Result<()> {
        self.entered
            .await
            .map(|_| ())
            .map_err(|_| Error::PeerStopped(self.id))
    }
}

impl PeerHandle {
    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// Function that asks for the critical section. It returns once the request was
    /// accepted; the returned [`Entry`] completes when the section is entered.
    pub async fn request_cs(&self) -> Result<Entry> {
        let (ack, ack_rx) = oneshot::channel();
        let (entered, entered_rx) = oneshot::channel();
        self.send(Command::RequestCs { ack, entered }).await?;
        self.reply(ack_rx).await??;

        Ok(Entry {
            id: self.id,
            entered: entered_rx,
        })
    }

    /// Function that asks for the critical section and waits until it is entered.
    pub async fn enter(&self) -> Result<()> {
        self.request_cs().await?.wait().await
    }

    pub async fn release_cs(&self) -> Result<()> {
        let (ack, ack_rx) = oneshot::channel();
        self.send(Command::ReleaseCs(ack)).await?;
        self.reply(ack_rx).await?
    }

    pub async fn snapshot(&self) -> Result<Snapshot> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(Command::Snapshot(reply)).await?;
        self.reply(reply_rx).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown).await
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::PeerStopped(self.id))
    }

    async fn reply<T>(&self, rx: oneshot::Receiver<T>) -> Result<T> {
        rx.await.map_err(|_| Error::PeerStopped(self.id))
    }
}

/// Function that uses the critical section `workload.rounds` times, with Poisson
/// distributed pauses between requests.
pub async fn run_workload(handle: &PeerHandle, workload: &WorkloadConfig) -> Result<()> {
    let mut arrivals = Poisson::new(workload.rate, workload.seed);

    for round in 1..=workload.rounds {
        sleep(arrivals.next_delay()).await;

        log::info(&cformat!(
            "{} asks for the <bold>critical section</bold> ({}/{}).",
            handle.id(),
            round,
            workload.rounds
        ));
        handle.enter().await?;

        log::info(&cformat!(
            "{} is holding the <yellow, bold>token</yellow, bold> and working.",
            handle.id()
        ));
        sleep(workload.hold()).await;

        // an unreachable peer leaves the token here, still usable by the next round
        if let Err(e) = handle.release_cs().await {
            if e.is_fatal() || matches!(e, Error::PeerStopped(_)) {
                return Err(e);
            }
            log::warn(&format!("{}: {e}", handle.id()));
        }
    }
    Ok(())
}
