use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use suzuki_kasami::{
    channel::Inbox, LocalChannel, LocalNetwork, Message, Phase, ProcessId, ProtocolEngine, Token,
};

const A: ProcessId = ProcessId(1);
const B: ProcessId = ProcessId(2);
const C: ProcessId = ProcessId(3);

struct Node {
    engine: ProtocolEngine<LocalChannel>,
    inbox: Inbox,
}

impl Node {
    /// Hands every message waiting in the inbox to the engine.
    fn deliver_all(&mut self) {
        while let Ok(message) = self.inbox.try_recv() {
            self.engine.handle(message).unwrap();
        }
    }

    fn pending(&mut self) -> Vec<Message> {
        std::iter::from_fn(|| self.inbox.try_recv().ok()).collect()
    }
}

fn cluster(size: usize, holder: ProcessId) -> Vec<Node> {
    let mut network = LocalNetwork::new(size);
    ProcessId::all(size)
        .map(|id| {
            let mut engine = ProtocolEngine::new(id, network.channel()).unwrap();
            engine.bootstrap(id == holder).unwrap();
            Node {
                engine,
                inbox: network.take_inbox(id).unwrap(),
            }
        })
        .collect()
}

fn flag() -> (Arc<AtomicBool>, impl FnOnce(ProcessId) + Send + 'static) {
    let entered = Arc::new(AtomicBool::new(false));
    let inner = Arc::clone(&entered);
    (entered, move |_| inner.store(true, Ordering::SeqCst))
}

fn in_cs(nodes: &[Node]) -> Vec<ProcessId> {
    nodes
        .iter()
        .filter(|n| n.engine.phase() == Phase::InCS)
        .map(|n| n.engine.id())
        .collect()
}

#[test]
fn three_process_round_trip() {
    let mut nodes = cluster(3, A);
    let (b_entered, on_b_entry) = flag();
    let (c_entered, on_c_entry) = flag();

    // 1. B asks and broadcasts REQUEST(B, 1)
    nodes[1].engine.request_cs(on_b_entry).unwrap();
    assert_eq!(nodes[1].engine.phase(), Phase::Requesting);

    // 2. A is an idle holder: it forwards the token straight away
    nodes[0].deliver_all();
    assert!(!nodes[0].engine.holds_token());
    nodes[2].deliver_all();
    assert_eq!(nodes[2].engine.rn().get(B), 1);

    // 3. B enters
    let to_b = nodes[1].pending();
    assert_eq!(to_b, vec![Message::Token(Token::new(3))]);
    for message in to_b {
        nodes[1].engine.handle(message).unwrap();
    }
    assert!(b_entered.load(Ordering::SeqCst));
    assert_eq!(in_cs(&nodes), vec![B]);

    // 4. C asks while B is inside; B only records it
    nodes[2].engine.request_cs(on_c_entry).unwrap();
    nodes[1].deliver_all();
    nodes[0].deliver_all();
    assert_eq!(nodes[1].engine.rn().get(C), 1);
    assert!(nodes[1].engine.token().unwrap().queue.is_empty());
    assert!(nodes[2].inbox.is_empty());

    // 5. B leaves and hands the token to C
    nodes[1].engine.release_cs().unwrap();
    assert!(!nodes[1].engine.holds_token());

    // 6. C enters
    nodes[2].deliver_all();
    assert!(c_entered.load(Ordering::SeqCst));
    assert_eq!(in_cs(&nodes), vec![C]);

    let token = nodes[2].engine.token().unwrap();
    assert!(token.queue.is_empty());
    assert_eq!(token.last_granted, vec![0, 1, 0]);
    assert_eq!(
        nodes
            .iter()
            .filter(|n| n.engine.holds_token())
            .map(|n| n.engine.id())
            .collect::<Vec<_>>(),
        vec![C]
    );
}

#[test]
fn duplicate_request_to_idle_holder() {
    let mut nodes = cluster(3, A);

    nodes[0].engine.on_receive_request(B, 1).unwrap();
    nodes[0].engine.on_receive_request(B, 1).unwrap();

    assert_eq!(nodes[0].engine.rn().get(B), 1);
    // exactly one token went out, with nobody else queued
    assert_eq!(nodes[1].pending(), vec![Message::Token(Token::new(3))]);
    assert_eq!(nodes[0].engine.stats().tokens_sent, 1);
}

#[test]
fn duplicate_request_to_busy_holder() {
    let mut nodes = cluster(3, A);
    nodes[0].engine.request_cs(|_| {}).unwrap();

    nodes[0].engine.on_receive_request(B, 1).unwrap();
    nodes[0].engine.on_receive_request(B, 1).unwrap();
    assert_eq!(nodes[0].engine.rn().get(B), 1);
    assert!(nodes[0].engine.token().unwrap().queue.is_empty());

    nodes[0].engine.release_cs().unwrap();
    let sent = nodes[1].pending();
    assert_eq!(sent.len(), 1);
    let Message::Token(token) = &sent[0] else {
        panic!("expected the token");
    };
    assert!(!token.queue.contains(B));
    assert_eq!(token.last_granted, vec![1, 0, 0]);
}

#[test]
fn late_duplicate_after_grant_is_ignored() {
    let mut nodes = cluster(2, A);
    nodes[1].engine.request_cs(|_| {}).unwrap();
    nodes[0].deliver_all();
    nodes[1].deliver_all();
    nodes[1].engine.release_cs().unwrap();

    // B keeps the token idle and a retransmitted REQUEST(B, 1) reaching A changes nothing
    assert!(nodes[1].engine.holds_token());
    nodes[0].engine.on_receive_request(B, 1).unwrap();
    assert!(!nodes[0].engine.holds_token());
    assert!(nodes[1].inbox.is_empty());

    // and a stale copy at the holder itself is not admitted either
    nodes[1].engine.on_receive_request(A, 0).unwrap();
    assert!(nodes[1].engine.holds_token());
}

#[test]
fn waiting_processes_are_served_in_order() {
    let mut nodes = cluster(4, A);
    nodes[0].engine.request_cs(|_| {}).unwrap();
    for i in [3, 1, 2] {
        nodes[i].engine.request_cs(|_| {}).unwrap();
    }
    // every request reaches everyone before the token moves
    for node in nodes.iter_mut() {
        node.deliver_all();
    }

    let mut order = Vec::new();
    nodes[0].engine.release_cs().unwrap();
    for _ in 0..3 {
        let holder = nodes
            .iter_mut()
            .find(|n| !n.inbox.is_empty())
            .expect("the token is in flight");
        holder.deliver_all();
        order.push(holder.engine.id());
        holder.engine.release_cs().unwrap();
    }

    assert_eq!(order, vec![B, C, ProcessId(4)]);
}
