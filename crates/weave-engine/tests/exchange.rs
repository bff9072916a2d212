//! End-to-end exchange between two engines over an in-memory transport.
//!
//! Two `GraphExchange` instances are wired back to back: every message one
//! side's queue hands to its sender is framed, re-decoded, and fed into the
//! other side, the same round trip a real stream transport performs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::timeout;

use weave_core::{LoadError, Message, Node, PeerId};
use weave_engine::testutil::{random_blocks, selector_spec, MemoryBlockStore, StubBridge};
use weave_engine::{
    Config, GraphExchange, MessageNetwork, MessageSender, NetworkError, RequestError,
};

const TICK: Duration = Duration::from_secs(5);

struct LoopbackNetwork {
    from: PeerId,
    max_message_size: usize,
    target: Mutex<Option<Arc<GraphExchange>>>,
}

impl LoopbackNetwork {
    fn new(from: PeerId, config: &Config) -> Arc<Self> {
        Arc::new(LoopbackNetwork {
            from,
            max_message_size: config.max_message_size,
            target: Mutex::new(None),
        })
    }

    fn attach(&self, target: Arc<GraphExchange>) {
        *self.target.lock() = Some(target);
    }
}

#[async_trait]
impl MessageNetwork for LoopbackNetwork {
    async fn connect_to(&self, _peer: PeerId) -> Result<(), NetworkError> {
        Ok(())
    }

    async fn new_message_sender(
        &self,
        _peer: PeerId,
    ) -> Result<Box<dyn MessageSender>, NetworkError> {
        let target = self
            .target
            .lock()
            .clone()
            .ok_or_else(|| NetworkError::Connect("no peer attached".to_string()))?;
        Ok(Box::new(LoopbackSender {
            from: self.from,
            max_message_size: self.max_message_size,
            target,
        }))
    }
}

struct LoopbackSender {
    from: PeerId,
    max_message_size: usize,
    target: Arc<GraphExchange>,
}

#[async_trait]
impl MessageSender for LoopbackSender {
    async fn send(&mut self, message: Message) -> Result<(), NetworkError> {
        let frame = message
            .to_frame(self.max_message_size)
            .map_err(|e| NetworkError::Send(e.to_string()))?;
        let decoded =
            Message::from_bytes(&frame[4..]).map_err(|e| NetworkError::Send(e.to_string()))?;
        self.target.receive_message(self.from, decoded).await;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), NetworkError> {
        Ok(())
    }

    fn reset(&mut self) {}
}

struct Pair {
    requester: Arc<GraphExchange>,
    responder_peer: PeerId,
    _responder: Arc<GraphExchange>,
}

/// Two engines: the responder holds `blocks`, the requester holds nothing.
fn wire_pair(blocks: &[weave_core::Block]) -> Pair {
    let config = Config::default();
    let requester_peer = PeerId::new([0xaa; 32]);
    let responder_peer = PeerId::new([0xbb; 32]);

    let requester_net = LoopbackNetwork::new(requester_peer, &config);
    let responder_net = LoopbackNetwork::new(responder_peer, &config);

    let requester = Arc::new(GraphExchange::new(
        config.clone(),
        requester_net.clone(),
        Arc::new(StubBridge::new()),
        Arc::new(MemoryBlockStore::new()),
    ));
    let responder = Arc::new(GraphExchange::new(
        config,
        responder_net.clone(),
        Arc::new(StubBridge::new()),
        Arc::new(MemoryBlockStore::with_blocks(blocks)),
    ));

    requester_net.attach(responder.clone());
    responder_net.attach(requester.clone());

    Pair {
        requester,
        responder_peer,
        _responder: responder,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn fetches_a_remote_graph() {
    let blocks = random_blocks(4, 256);
    let links: Vec<_> = blocks.iter().map(|b| *b.link()).collect();
    let pair = wire_pair(&blocks);

    let (mut progress, mut errors) = pair
        .requester
        .request(pair.responder_peer, selector_spec(&links))
        .await;

    for block in &blocks {
        let step = timeout(TICK, progress.recv())
            .await
            .expect("timed out awaiting progress")
            .expect("progress stream ended early");
        assert_eq!(step.last_link, Some(*block.link()));
        assert_eq!(step.node, Node::Bytes(block.data().to_vec()));
    }

    // Terminal success: both streams close, nothing on the error stream.
    assert!(timeout(TICK, progress.recv()).await.unwrap().is_none());
    assert!(timeout(TICK, errors.recv()).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_remote_block_is_an_error_not_a_hang() {
    let blocks = random_blocks(4, 128);
    let links: Vec<_> = blocks.iter().map(|b| *b.link()).collect();
    // The responder never had the third block.
    let held: Vec<_> = blocks
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != 2)
        .map(|(_, b)| b.clone())
        .collect();
    let pair = wire_pair(&held);

    let (mut progress, mut errors) = pair
        .requester
        .request(pair.responder_peer, selector_spec(&links))
        .await;

    let mut seen = Vec::new();
    while let Some(step) = timeout(TICK, progress.recv()).await.expect("hung mid-request") {
        seen.push(step.last_link.unwrap());
    }
    let want: Vec<_> = held.iter().map(|b| *b.link()).collect();
    assert_eq!(seen, want);

    let mut failures = Vec::new();
    while let Some(error) = timeout(TICK, errors.recv()).await.expect("hung on errors") {
        failures.push(error);
    }
    assert_eq!(failures, vec![RequestError::Load(LoadError::ContentMissing)]);
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_spec_fails_without_touching_the_wire() {
    let pair = wire_pair(&[]);

    let (mut progress, mut errors) = pair
        .requester
        .request(pair.responder_peer, Node::Int(17))
        .await;

    assert!(timeout(TICK, progress.recv()).await.unwrap().is_none());
    assert_eq!(
        timeout(TICK, errors.recv()).await.unwrap(),
        Some(RequestError::InvalidSelectorSpec)
    );
    assert!(timeout(TICK, errors.recv()).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_terminates_open_requests() {
    let blocks = random_blocks(2, 64);
    let links: Vec<_> = blocks.iter().map(|b| *b.link()).collect();
    let config = Config::default();

    // No peer ever attached: the request frame never reaches a responder,
    // so the request stays open until local shutdown.
    let requester_peer = PeerId::new([0xaa; 32]);
    let network = LoopbackNetwork::new(requester_peer, &config);
    let requester = Arc::new(GraphExchange::new(
        config,
        network,
        Arc::new(StubBridge::new()),
        Arc::new(MemoryBlockStore::new()),
    ));

    let (mut progress, _errors) = requester
        .request(PeerId::new([0xbb; 32]), selector_spec(&links))
        .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    requester.shutdown();

    assert!(timeout(TICK, progress.recv()).await.unwrap().is_none());
}
