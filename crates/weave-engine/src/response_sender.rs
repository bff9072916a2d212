//! Per-peer response sender.
//!
//! Query workers feed blocks and per-link metadata in here; a single worker
//! batches them into bounded frames. A frame goes out when the pending
//! buffer grows past the flush watermark or when input quiesces briefly.
//! Every flush travels through the peer's outbound message queue and waits
//! for its processing signal, so a slow wire stalls the responder instead
//! of ballooning the buffer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};

use weave_core::{metadata, Block, Link, MetadataItem, PeerId, RequestId, Response, ResponseStatus};

use crate::config::Config;
use crate::message_queue::MessageQueue;
use crate::peer_manager::{PeerManager, PeerProcess};
use crate::response_manager::PeerResponseSender;

/// Rough per-metadata-entry wire cost used for watermark accounting.
const ENTRY_OVERHEAD: usize = 64;

#[derive(Default)]
struct PendingRequest {
    items: Vec<MetadataItem>,
    terminal: Option<ResponseStatus>,
}

#[derive(Default)]
struct PendingState {
    requests: HashMap<RequestId, PendingRequest>,
    blocks: HashMap<Link, Block>,
    size: usize,
    /// Requests that ever declared a block absent; decides full vs partial
    /// completion. Survives flushes, cleared on terminal status.
    absent_seen: HashSet<RequestId>,
}

impl PendingState {
    fn has_pending(&self) -> bool {
        !self.requests.is_empty() || !self.blocks.is_empty()
    }
}

struct Inner {
    peer: PeerId,
    outbound: Arc<PeerManager<MessageQueue>>,
    flush_watermark: usize,
    quiesce: Duration,
    state: Mutex<PendingState>,
    work: Notify,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<watch::Receiver<bool>>>,
}

/// Handle to one peer's response sender. Cheap to clone.
#[derive(Clone)]
pub struct ResponseSender {
    inner: Arc<Inner>,
}

impl ResponseSender {
    pub fn new(peer: PeerId, outbound: Arc<PeerManager<MessageQueue>>, config: &Config) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        ResponseSender {
            inner: Arc::new(Inner {
                peer,
                outbound,
                flush_watermark: config.flush_watermark,
                quiesce: config.quiesce_interval,
                state: Mutex::new(PendingState::default()),
                work: Notify::new(),
                shutdown,
                worker: Mutex::new(Some(shutdown_rx)),
            }),
        }
    }

    /// Spawn the flush worker. Idempotent.
    pub fn startup(&self) {
        if let Some(shutdown_rx) = self.inner.worker.lock().take() {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                if let Err(e) = run(inner, shutdown_rx).await {
                    tracing::warn!(error = %e, "response sender worker failed");
                }
            });
        }
    }

    /// Ask the worker to flush what is pending and stop.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
    }
}

impl PeerProcess for ResponseSender {
    fn startup(&self) {
        ResponseSender::startup(self);
    }

    fn shutdown(&self) {
        ResponseSender::shutdown(self);
    }
}

#[async_trait]
impl PeerResponseSender for ResponseSender {
    async fn send_response(&self, id: RequestId, link: Link, data: Bytes) {
        let size = data.len() + ENTRY_OVERHEAD;
        let block = match Block::with_link(link, data) {
            Ok(block) => block,
            Err(e) => {
                // A block that does not hash to its claimed link never goes
                // on the wire.
                tracing::warn!(request = %id, link = %link, error = %e, "dropping invalid block");
                return;
            }
        };
        {
            let mut state = self.inner.state.lock();
            state.blocks.insert(link, block);
            state.requests.entry(id).or_default().items.push(MetadataItem {
                link,
                block_present: true,
            });
            state.size += size;
        }
        self.inner.work.notify_one();
    }

    async fn send_block_absent(&self, id: RequestId, link: Link) {
        {
            let mut state = self.inner.state.lock();
            state.requests.entry(id).or_default().items.push(MetadataItem {
                link,
                block_present: false,
            });
            state.absent_seen.insert(id);
            state.size += ENTRY_OVERHEAD;
        }
        self.inner.work.notify_one();
    }

    async fn finish_request(&self, id: RequestId) {
        {
            let mut state = self.inner.state.lock();
            let status = if state.absent_seen.remove(&id) {
                ResponseStatus::REQUEST_COMPLETED_PARTIAL
            } else {
                ResponseStatus::REQUEST_COMPLETED_FULL
            };
            state.requests.entry(id).or_default().terminal = Some(status);
        }
        self.inner.work.notify_one();
    }

    async fn finish_with_error(&self, id: RequestId, status: ResponseStatus) {
        {
            let mut state = self.inner.state.lock();
            state.absent_seen.remove(&id);
            state.requests.entry(id).or_default().terminal = Some(status);
        }
        self.inner.work.notify_one();
    }
}

async fn run(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    loop {
        // Wait for pending records or shutdown.
        loop {
            if inner.state.lock().has_pending() {
                break;
            }
            if *shutdown.borrow() {
                return Ok(());
            }
            tokio::select! {
                _ = inner.work.notified() => {}
                _ = shutdown.changed() => {}
            }
        }

        // Absorb input until it quiesces or the watermark is reached.
        loop {
            if inner.state.lock().size >= inner.flush_watermark || *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = inner.work.notified() => {}
                _ = tokio::time::sleep(inner.quiesce) => break,
                _ = shutdown.changed() => {}
            }
        }

        flush(&inner).await;
    }
}

async fn flush(inner: &Inner) {
    let (pending_requests, pending_blocks) = {
        let mut state = inner.state.lock();
        let requests = std::mem::take(&mut state.requests);
        let blocks = std::mem::take(&mut state.blocks);
        state.size = 0;
        (requests, blocks)
    };
    if pending_requests.is_empty() && pending_blocks.is_empty() {
        return;
    }

    let mut responses = Vec::with_capacity(pending_requests.len());
    for (id, pending) in pending_requests {
        let status = pending.terminal.unwrap_or(ResponseStatus::PARTIAL_RESPONSE);
        let extra = match metadata::encode(&pending.items) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                tracing::warn!(request = %id, error = %e, "metadata encoding failed");
                continue;
            }
        };
        responses.push(Response::new(id, status, extra));
    }
    let blocks: Vec<Block> = pending_blocks.into_values().collect();

    let queue = inner.outbound.get_process(inner.peer);
    let signal = queue.add_responses(responses, blocks);
    match signal.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::warn!(peer = %inner.peer.short(), error = %e, "response frame dropped")
        }
        Err(_) => tracing::debug!(peer = %inner.peer.short(), "outbound queue went away"),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    use weave_core::Message;

    use crate::testutil::{random_blocks, random_peer, TestNetwork, TestNetworkEvents};

    const TICK: Duration = Duration::from_secs(1);

    fn harness(config: Config) -> (ResponseSender, TestNetworkEvents) {
        let (network, events) = TestNetwork::new();
        let network = Arc::new(network);
        let queue_config = config.clone();
        let outbound = Arc::new(PeerManager::new(move |peer| {
            Arc::new(MessageQueue::new(peer, network.clone(), &queue_config))
        }));
        let sender = ResponseSender::new(random_peer(), outbound, &config);
        sender.startup();
        (sender, events)
    }

    fn metadata_of(message: &Message, id: RequestId) -> Vec<MetadataItem> {
        let response = message
            .responses()
            .into_iter()
            .find(|r| r.request_id() == id)
            .expect("response for request");
        metadata::decode(response.extra()).unwrap()
    }

    #[tokio::test]
    async fn responses_batch_into_one_frame() {
        let (sender, mut events) = harness(Config {
            quiesce_interval: Duration::from_millis(20),
            ..Config::default()
        });
        let id = RequestId(1);
        let blocks = random_blocks(3, 64);
        for block in &blocks {
            sender.send_response(id, *block.link(), block.data().clone()).await;
        }

        let message = timeout(TICK, events.sent.recv()).await.unwrap().unwrap();
        assert_eq!(message.blocks().len(), 3);
        let responses = message.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].status(), ResponseStatus::PARTIAL_RESPONSE);

        let items = metadata_of(&message, id);
        let want: Vec<MetadataItem> = blocks
            .iter()
            .map(|b| MetadataItem {
                link: *b.link(),
                block_present: true,
            })
            .collect();
        assert_eq!(items, want);
        assert!(events.sent.try_recv().is_err(), "expected a single frame");
    }

    #[tokio::test]
    async fn finished_request_completes_full() {
        let (sender, mut events) = harness(Config::default());
        let id = RequestId(4);
        let block = random_blocks(1, 64).remove(0);
        sender.send_response(id, *block.link(), block.data().clone()).await;
        sender.finish_request(id).await;

        let message = timeout(TICK, events.sent.recv()).await.unwrap().unwrap();
        let responses = message.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].status(), ResponseStatus::REQUEST_COMPLETED_FULL);
    }

    #[tokio::test]
    async fn absent_links_complete_partial() {
        let (sender, mut events) = harness(Config::default());
        let id = RequestId(5);
        let blocks = random_blocks(2, 64);
        sender.send_response(id, *blocks[0].link(), blocks[0].data().clone()).await;
        sender.send_block_absent(id, *blocks[1].link()).await;
        sender.finish_request(id).await;

        let message = timeout(TICK, events.sent.recv()).await.unwrap().unwrap();
        let responses = message.responses();
        assert_eq!(responses[0].status(), ResponseStatus::REQUEST_COMPLETED_PARTIAL);
        let items = metadata_of(&message, id);
        assert_eq!(items.len(), 2);
        assert!(items[0].block_present);
        assert!(!items[1].block_present);
    }

    #[tokio::test]
    async fn terminal_failure_is_forwarded() {
        let (sender, mut events) = harness(Config::default());
        let id = RequestId(6);
        sender
            .finish_with_error(id, ResponseStatus::REQUEST_FAILED_UNKNOWN)
            .await;

        let message = timeout(TICK, events.sent.recv()).await.unwrap().unwrap();
        let responses = message.responses();
        assert_eq!(responses[0].status(), ResponseStatus::REQUEST_FAILED_UNKNOWN);
        assert_eq!(metadata_of(&message, id), Vec::new());
    }

    #[tokio::test]
    async fn watermark_forces_flush_before_quiesce() {
        let (sender, mut events) = harness(Config {
            flush_watermark: 100,
            quiesce_interval: Duration::from_secs(30),
            ..Config::default()
        });
        let id = RequestId(7);
        let block = random_blocks(1, 256).remove(0);
        sender.send_response(id, *block.link(), block.data().clone()).await;

        // Flushed by size, not the (far away) quiesce tick.
        let message = timeout(TICK, events.sent.recv()).await.unwrap().unwrap();
        assert_eq!(message.blocks().len(), 1);
    }

    #[tokio::test]
    async fn invalid_block_is_dropped() {
        let (sender, mut events) = harness(Config::default());
        let id = RequestId(8);
        let blocks = random_blocks(2, 64);
        // Claimed link does not match the data.
        sender.send_response(id, *blocks[0].link(), blocks[1].data().clone()).await;
        sender.finish_request(id).await;

        let message = timeout(TICK, events.sent.recv()).await.unwrap().unwrap();
        assert!(message.blocks().is_empty());
        assert_eq!(metadata_of(&message, id), Vec::new());
    }
}
