//! Test doubles shared by the engine's own tests and by downstream crates
//! exercising the engine without a real selector implementation, block
//! store, or transport.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use tokio::sync::{mpsc, Semaphore};

use weave_core::{
    Block, BlockLoader, BlockStore, BridgeError, GraphBridge, Link, LinkContext, LoadError,
    Message, Node, Path, PeerId, Prefix, Selector, TraversalProgress, TraversalVisitor,
};

use crate::network::{MessageNetwork, MessageSender, NetworkError};

// ── Fixtures ──────────────────────────────────────────────────────────────────

pub fn random_peer() -> PeerId {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    PeerId::new(bytes)
}

pub fn random_bytes(len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    Bytes::from(data)
}

pub fn random_blocks(count: usize, size: usize) -> Vec<Block> {
    (0..count)
        .map(|_| Block::new(Prefix::raw(), random_bytes(size)).expect("raw prefix is supported"))
        .collect()
}

// ── In-memory block store ─────────────────────────────────────────────────────

/// A concurrent-read map of blocks, the local store stand-in.
#[derive(Default)]
pub struct MemoryBlockStore {
    blocks: RwLock<HashMap<Link, Bytes>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        MemoryBlockStore::default()
    }

    pub fn with_blocks<'a>(blocks: impl IntoIterator<Item = &'a Block>) -> Self {
        let store = MemoryBlockStore::new();
        for block in blocks {
            store.put_block(block);
        }
        store
    }

    pub fn put_block(&self, block: &Block) {
        self.blocks
            .write()
            .insert(*block.link(), block.data().clone());
    }
}

impl BlockStore for MemoryBlockStore {
    fn load(&self, link: &Link) -> Result<Bytes, LoadError> {
        self.blocks
            .read()
            .get(link)
            .cloned()
            .ok_or(LoadError::ContentMissing)
    }
}

// ── Stub bridge ───────────────────────────────────────────────────────────────

/// Build the selector-spec node the [`StubBridge`] understands: an explicit
/// enumeration of the links to visit, in order.
pub fn selector_spec(links: &[Link]) -> Node {
    let mut map = BTreeMap::new();
    map.insert(
        "cids".to_string(),
        Node::List(links.iter().map(|l| Node::Link(*l)).collect()),
    );
    Node::Map(map)
}

/// A minimal [`GraphBridge`]: selectors are flat link enumerations, nodes
/// encode with the wire codec, traversal visits each link in order.
#[derive(Default)]
pub struct StubBridge;

impl StubBridge {
    pub fn new() -> Self {
        StubBridge
    }

    fn spec_links(spec: &Node) -> Option<Vec<Link>> {
        let Node::Map(map) = spec else {
            return None;
        };
        let Node::List(items) = map.get("cids")? else {
            return None;
        };
        let mut links = Vec::with_capacity(items.len());
        for item in items {
            let Node::Link(link) = item else {
                return None;
            };
            links.push(*link);
        }
        Some(links)
    }
}

#[async_trait]
impl GraphBridge for StubBridge {
    fn validate_selector_spec(&self, spec: &Node) -> Vec<BridgeError> {
        if Self::spec_links(spec).is_some() {
            Vec::new()
        } else {
            vec![BridgeError::InvalidSelectorSpec(
                "expected a map with a \"cids\" link list".to_string(),
            )]
        }
    }

    fn encode_node(&self, node: &Node) -> Result<Vec<u8>, BridgeError> {
        bincode::serialize(node).map_err(|e| BridgeError::Encode(e.to_string()))
    }

    fn decode_node(&self, bytes: &[u8]) -> Result<Node, BridgeError> {
        bincode::deserialize(bytes).map_err(|e| BridgeError::Decode(e.to_string()))
    }

    fn decode_selector_spec(&self, spec: &Node) -> Result<(Node, Selector), BridgeError> {
        let links = Self::spec_links(spec).ok_or_else(|| {
            BridgeError::InvalidSelectorSpec("expected a map with a \"cids\" link list".to_string())
        })?;
        Ok((
            spec.clone(),
            Selector(Node::List(links.into_iter().map(Node::Link).collect())),
        ))
    }

    async fn traverse(
        &self,
        loader: &dyn BlockLoader,
        _root: &Node,
        selector: &Selector,
        visitor: &mut dyn TraversalVisitor,
    ) -> Result<(), BridgeError> {
        let Node::List(items) = &selector.0 else {
            return Err(BridgeError::Traversal("selector is not a link list".to_string()));
        };
        for (index, item) in items.iter().enumerate() {
            let Node::Link(link) = item else {
                continue;
            };
            let ctx = LinkContext {
                path: Path::new(vec![index.to_string()]),
            };
            match loader.load_link(link, &ctx).await {
                Ok(data) => {
                    let progress = TraversalProgress {
                        path: ctx.path,
                        last_link: Some(*link),
                    };
                    visitor.visit(&progress, &Node::Bytes(data.to_vec())).await;
                }
                Err(LoadError::DoNotFollow) => continue,
                Err(e) => return Err(BridgeError::Traversal(e.to_string())),
            }
        }
        Ok(())
    }
}

// ── Recording network ─────────────────────────────────────────────────────────

struct NetShared {
    sent: mpsc::UnboundedSender<Message>,
    send_started: mpsc::UnboundedSender<()>,
    closed: mpsc::UnboundedSender<()>,
    resets: mpsc::UnboundedSender<()>,
    connect_failures: AtomicU32,
    send_failures: AtomicU32,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

/// Streams of observed transport activity for assertions.
pub struct TestNetworkEvents {
    pub sent: mpsc::UnboundedReceiver<Message>,
    pub send_started: mpsc::UnboundedReceiver<()>,
    pub closed: mpsc::UnboundedReceiver<()>,
    pub resets: mpsc::UnboundedReceiver<()>,
}

/// A [`MessageNetwork`] that records everything and never touches a socket.
/// Failure injection: a budget of failing connects or sends, and an optional
/// gate that parks `send` until the test grants a permit.
#[derive(Clone)]
pub struct TestNetwork {
    shared: Arc<NetShared>,
}

impl TestNetwork {
    pub fn new() -> (Self, TestNetworkEvents) {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (started_tx, started_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let (resets_tx, resets_rx) = mpsc::unbounded_channel();
        (
            TestNetwork {
                shared: Arc::new(NetShared {
                    sent: sent_tx,
                    send_started: started_tx,
                    closed: closed_tx,
                    resets: resets_tx,
                    connect_failures: AtomicU32::new(0),
                    send_failures: AtomicU32::new(0),
                    gate: Mutex::new(None),
                }),
            },
            TestNetworkEvents {
                sent: sent_rx,
                send_started: started_rx,
                closed: closed_rx,
                resets: resets_rx,
            },
        )
    }

    /// Fail the next `count` connect attempts.
    pub fn fail_connects(&self, count: u32) {
        self.shared.connect_failures.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` sends (after recording `send_started`).
    pub fn fail_sends(&self, count: u32) {
        self.shared.send_failures.store(count, Ordering::SeqCst);
    }

    /// Park every send on a semaphore the test feeds permits into.
    pub fn gate_sends(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.shared.gate.lock() = Some(gate.clone());
        gate
    }
}

fn consume_budget(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl MessageNetwork for TestNetwork {
    async fn connect_to(&self, _peer: PeerId) -> Result<(), NetworkError> {
        if consume_budget(&self.shared.connect_failures) {
            return Err(NetworkError::Connect("injected connect failure".to_string()));
        }
        Ok(())
    }

    async fn new_message_sender(
        &self,
        _peer: PeerId,
    ) -> Result<Box<dyn MessageSender>, NetworkError> {
        Ok(Box::new(TestSender {
            shared: self.shared.clone(),
        }))
    }
}

struct TestSender {
    shared: Arc<NetShared>,
}

#[async_trait]
impl MessageSender for TestSender {
    async fn send(&mut self, message: Message) -> Result<(), NetworkError> {
        let _ = self.shared.send_started.send(());
        let gate = self.shared.gate.lock().clone();
        if let Some(gate) = gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| NetworkError::Send("gate closed".to_string()))?;
            permit.forget();
        }
        if consume_budget(&self.shared.send_failures) {
            return Err(NetworkError::Send("injected send failure".to_string()));
        }
        let _ = self.shared.sent.send(message);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), NetworkError> {
        let _ = self.shared.closed.send(());
        Ok(())
    }

    fn reset(&mut self) {
        let _ = self.shared.resets.send(());
    }
}
