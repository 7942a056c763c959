//! Module that carries protocol messages between peers over TCP, one JSON line per message.

use crate::{
    channel::{Inbox, MessageChannel, SendError},
    config::ClusterConfig,
    log,
    message::{Handshake, Message},
    process::ProcessId,
};
use color_print::cformat;
use futures::{SinkExt, StreamExt};
use std::{error::Error, sync::Arc, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
    time::sleep,
};
use tokio_util::codec::{Framed, LinesCodec};

/// Outbound side of the TCP transport: one writer task per remote peer.
#[derive(Clone)]
pub struct TcpChannel {
    links: Arc<Vec<Option<UnboundedSender<Message>>>>,
}

impl TcpChannel {
    /// Function that starts a writer towards every other peer of the cluster. Connections
    /// are opened in the background; messages queue up until they are.
    pub fn connect(own_id: ProcessId, config: &ClusterConfig) -> Self {
        let links = ProcessId::all(config.cluster_size())
            .map(|to| {
                if to == own_id {
                    return None;
                }
                let address = config.address_of(to)?.to_string();
                let (tx, rx) = mpsc::unbounded_channel();
                let retry = config.connect_retry();
                let attempts = config.connect_attempts;

                tokio::spawn(Self::write_link(own_id, to, address, retry, attempts, rx));
                Some(tx)
            })
            .collect();

        Self {
            links: Arc::new(links),
        }
    }

    /// Function that owns the connection towards `to`. It connects once there is something
    /// to send and reconnects after a failed write, for as long as the channel lives.
    async fn write_link(
        own_id: ProcessId,
        to: ProcessId,
        address: String,
        retry: Duration,
        attempts: u32,
        mut outbound: UnboundedReceiver<Message>,
    ) {
        while let Some(mut message) = outbound.recv().await {
            let mut lines = loop {
                match open_link(own_id, &address, retry, attempts).await {
                    Ok(lines) => break lines,
                    Err(e) if message.is_token() => log::error(&cformat!(
                        "The <yellow, bold>token</yellow, bold> is stuck on the way to {}, no process can enter the critical section until it is reachable: {}",
                        to,
                        e
                    )),
                    Err(e) => log::warn(&format!("{own_id} still can't reach {to}: {e}")),
                }
                sleep(retry).await;
            };
            log::debug(&cformat!("{} connected to <bold>{}</bold>.", own_id, to));

            loop {
                if let Err(e) = write_message(&mut lines, &message).await {
                    if message.is_token() {
                        log::error(&cformat!(
                            "The <yellow, bold>token</yellow, bold> was lost on the way to {}; no process can enter the critical section anymore.",
                            to
                        ));
                    } else {
                        log::warn(&format!("{own_id} dropped a message to {to}: {e}"));
                    }
                    break;
                }
                match outbound.recv().await {
                    Some(next) => message = next,
                    None => return,
                }
            }
        }
    }
}

impl MessageChannel for TcpChannel {
    fn cluster_size(&self) -> usize {
        self.links.len()
    }

    fn send(&self, to: ProcessId, message: Message) -> Result<(), SendError> {
        let link = to
            .is_member(self.cluster_size())
            .then(|| self.links[to.index()].as_ref())
            .flatten();

        match link {
            Some(link) => link.send(message).map_err(|e| SendError {
                to,
                message: e.0,
                reason: "link closed".to_string(),
            }),
            None => Err(SendError {
                to,
                message,
                reason: "no link to this process".to_string(),
            }),
        }
    }
}

async fn connect_with_retry(
    address: &str,
    retry: Duration,
    attempts: u32,
) -> Result<TcpStream, Box<dyn Error + Send + Sync>> {
    let mut attempt = 1;
    loop {
        match TcpStream::connect(address).await {
            Ok(stream) => return Ok(stream),
            Err(e) if attempt >= attempts => {
                return Err(format!("couldn't connect to {address} after {attempts} attempts: {e}").into())
            }
            Err(_) => {
                attempt += 1;
                sleep(retry).await;
            }
        }
    }
}

async fn open_link(
    own_id: ProcessId,
    address: &str,
    retry: Duration,
    attempts: u32,
) -> Result<Framed<TcpStream, LinesCodec>, Box<dyn Error + Send + Sync>> {
    let stream = connect_with_retry(address, retry, attempts).await?;
    let mut lines = Framed::new(stream, LinesCodec::new());
    lines.send(Handshake(own_id).to_json_string()?).await?;
    Ok(lines)
}

async fn write_message(
    lines: &mut Framed<TcpStream, LinesCodec>,
    message: &Message,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    lines.send(message.to_json_string()?).await?;
    Ok(())
}

/// Function that binds the listener of `own_id` and starts accepting its peers.
///
/// Returns the channel to reach the other peers, the inbox of decoded messages and the
/// accept task.
pub async fn bind(
    own_id: ProcessId,
    config: &ClusterConfig,
) -> Result<(TcpChannel, Inbox, JoinHandle<()>), Box<dyn Error + Send + Sync>> {
    let address = config
        .address_of(own_id)
        .ok_or_else(|| format!("{own_id} is not part of the cluster"))?;
    let listener = TcpListener::bind(address).await?;
    log::info(&cformat!("{} listening on <bold>{}</bold>.", own_id, address));

    let (inbound, inbox) = mpsc::unbounded_channel();
    let cluster_size = config.cluster_size();
    let accept = tokio::spawn(async move {
        if let Err(e) = listen(listener, cluster_size, inbound).await {
            log::error(&format!("{own_id} stopped accepting peers: {e}"));
        }
    });

    Ok((TcpChannel::connect(own_id, config), inbox, accept))
}

/// Function that accepts connections forever, forwarding the messages of every peer
/// into `inbound`.
pub async fn listen(
    listener: TcpListener,
    cluster_size: usize,
    inbound: UnboundedSender<Message>,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    loop {
        let (stream, address) = listener.accept().await?;
        log::debug(&cformat!("Accepted a <bold>connection</bold> from {}.", address));

        let inbound = inbound.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_incoming(stream, cluster_size, inbound).await {
                log::warn(&format!("Connection from {address} closed: {e}"));
            }
        });
    }
}

async fn handle_incoming(
    stream: TcpStream,
    cluster_size: usize,
    inbound: UnboundedSender<Message>,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let mut lines = Framed::new(stream, LinesCodec::new());

    let from = match lines.next().await {
        Some(Ok(line)) => Handshake::from_json_string(&line)?.0,
        Some(Err(e)) => return Err(e.into()),
        None => return Err("connection closed before the handshake".into()),
    };
    if !from.is_member(cluster_size) {
        return Err(format!("handshake names unknown process {from}").into());
    }

    while let Some(line) = lines.next().await {
        let line = line?;
        match Message::from_json_string(&line) {
            Ok(Message::Request { from: claimed, .. }) if claimed != from => {
                log::warn(&format!(
                    "Dropping a request claiming to be from {claimed} on the link of {from}."
                ));
            }
            Ok(message) => {
                if inbound.send(message).is_err() {
                    // the local peer is gone
                    return Ok(());
                }
            }
            Err(e) => log::warn(&format!("Skipping a malformed line from {from}: {e}")),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_cross_the_wire() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let (inbound, mut inbox) = mpsc::unbounded_channel();
        tokio::spawn(listen(listener, 2, inbound));

        let config = ClusterConfig::from_addresses(["127.0.0.1:1".to_string(), address]);
        let channel = TcpChannel::connect(ProcessId(1), &config);

        let request = Message::Request {
            from: ProcessId(1),
            seq: 3,
        };
        channel.send(ProcessId(2), request.clone()).unwrap();
        assert_eq!(inbox.recv().await, Some(request));
    }

    #[tokio::test]
    async fn sending_to_self_is_refused() {
        let config = ClusterConfig::from_addresses(["127.0.0.1:1", "127.0.0.1:2"]);
        let channel = TcpChannel::connect(ProcessId(1), &config);
        let token = Message::Token(crate::token::Token::new(2));

        let err = channel.send(ProcessId(1), token.clone()).unwrap_err();
        assert_eq!(err.message, token);
        assert!(channel.send(ProcessId(3), token).is_err());
    }

    #[tokio::test]
    async fn writer_waits_for_a_late_peer() {
        let address = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .to_string();
        let mut config = ClusterConfig::from_addresses(["127.0.0.1:1".to_string(), address.clone()]);
        config.connect_retry_ms = 5;
        config.connect_attempts = 2;
        let channel = TcpChannel::connect(ProcessId(1), &config);

        let request = Message::Request {
            from: ProcessId(1),
            seq: 1,
        };
        channel.send(ProcessId(2), request.clone()).unwrap();

        // several connect rounds fail before the peer shows up
        sleep(Duration::from_millis(100)).await;
        let listener = TcpListener::bind(&address).await.unwrap();
        let (inbound, mut inbox) = mpsc::unbounded_channel();
        tokio::spawn(listen(listener, 2, inbound));

        let received = tokio::time::timeout(Duration::from_secs(5), inbox.recv())
            .await
            .unwrap();
        assert_eq!(received, Some(request));
    }

    #[tokio::test]
    async fn requests_must_match_the_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (inbound, mut inbox) = mpsc::unbounded_channel();
        tokio::spawn(listen(listener, 3, inbound));

        let stream = TcpStream::connect(address).await.unwrap();
        let mut lines = Framed::new(stream, LinesCodec::new());
        lines
            .send(Handshake(ProcessId(1)).to_json_string().unwrap())
            .await
            .unwrap();

        let forged = Message::Request {
            from: ProcessId(2),
            seq: 4,
        };
        let genuine = Message::Request {
            from: ProcessId(1),
            seq: 1,
        };
        lines.send(forged.to_json_string().unwrap()).await.unwrap();
        lines.send(genuine.to_json_string().unwrap()).await.unwrap();

        assert_eq!(inbox.recv().await, Some(genuine));
    }
}
