//! Request manager — outgoing-request state machine.
//!
//! A single event loop owns all request state: it assigns ids, sends
//! request frames through the outbound peer handler, starts one traversal
//! worker per request, correlates incoming responses back to their
//! requests, and tears everything down on terminal status, cancellation,
//! or shutdown. External callers only post events; they never touch the
//! maps.

mod collector;
mod loader;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};

use weave_core::{
    metadata, Block, BridgeError, GraphBridge, Link, LoadError, MetadataItem, Node, Path, PeerId,
    Priority, Request, RequestId, Response, ResponseStatus, TraversalProgress, TraversalVisitor,
};

use crate::config::Config;

/// Result of one async link load.
pub type LoadResult = Result<Bytes, LoadError>;

/// Per-request channel depth between the traversal worker and the caller's
/// response collector.
const STREAM_CAPACITY: usize = 16;

/// Loads links asynchronously, resolving them as response frames arrive.
pub trait AsyncLoader: Send + Sync + 'static {
    fn start_request(&self, id: RequestId);

    fn process_response(
        &self,
        metadata: HashMap<RequestId, Vec<MetadataItem>>,
        blocks: Vec<Block>,
    );

    fn async_load(&self, id: RequestId, link: &Link) -> oneshot::Receiver<LoadResult>;

    fn complete_responses_for(&self, id: RequestId);

    fn cleanup_request(&self, id: RequestId);
}

/// Sends request frames toward a peer.
pub trait RequestSender: Send + Sync + 'static {
    fn send_request(&self, peer: PeerId, request: Request);
}

/// One step of a remote traversal, delivered to the caller in visit order.
#[derive(Debug, Clone)]
pub struct ResponseProgress {
    pub node: Node,
    pub path: Path,
    pub last_link: Option<Link>,
}

/// Errors delivered on a request's error stream.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RequestError {
    #[error("Invalid Selector Spec")]
    InvalidSelectorSpec,

    #[error("Request Failed - Peer Is Busy")]
    PeerBusy,

    #[error("Request Failed - Content Not Found")]
    ContentNotFound,

    #[error("Request Failed - For Legal Reasons")]
    Legal,

    #[error("Request Failed - Unknown Reason")]
    Unknown,

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("block load failed: {0}")]
    Load(LoadError),
}

impl RequestError {
    fn from_status(status: ResponseStatus) -> RequestError {
        match status {
            ResponseStatus::REQUEST_FAILED_BUSY => RequestError::PeerBusy,
            ResponseStatus::REQUEST_FAILED_CONTENT_NOT_FOUND => RequestError::ContentNotFound,
            ResponseStatus::REQUEST_FAILED_LEGAL => RequestError::Legal,
            _ => RequestError::Unknown,
        }
    }
}

// ── Events ────────────────────────────────────────────────────────────────────

pub(crate) enum RequestEvent {
    New {
        peer: PeerId,
        spec: Node,
        reply: oneshot::Sender<InProgressRequest>,
    },
    Cancel {
        id: RequestId,
    },
    ProcessResponses {
        peer: PeerId,
        responses: Vec<Response>,
        blocks: Vec<Block>,
    },
    Terminate {
        id: RequestId,
    },
}

pub(crate) struct InProgressRequest {
    pub id: RequestId,
    pub progress: mpsc::Receiver<ResponseProgress>,
    pub errors: mpsc::Receiver<RequestError>,
}

struct InProgressStatus {
    peer: PeerId,
    cancel: watch::Sender<bool>,
    network_error: Option<oneshot::Sender<RequestError>>,
}

// ── Manager ───────────────────────────────────────────────────────────────────

pub struct RequestManager {
    bridge: Arc<dyn GraphBridge>,
    events: mpsc::Sender<RequestEvent>,
    shutdown: watch::Sender<bool>,
    parts: Mutex<Option<Parts>>,
}

struct Parts {
    events_rx: mpsc::Receiver<RequestEvent>,
    shutdown_rx: watch::Receiver<bool>,
    state: RequestLoop,
}

impl RequestManager {
    pub fn new(
        loader: Arc<dyn AsyncLoader>,
        bridge: Arc<dyn GraphBridge>,
        peers: Arc<dyn RequestSender>,
        config: &Config,
    ) -> Self {
        let (events, events_rx) = mpsc::channel(config.mailbox_capacity);
        let (shutdown, shutdown_rx) = watch::channel(false);
        RequestManager {
            bridge: bridge.clone(),
            events: events.clone(),
            shutdown,
            parts: Mutex::new(Some(Parts {
                events_rx,
                shutdown_rx,
                state: RequestLoop {
                    next_id: RequestId(0),
                    in_progress: HashMap::new(),
                    loader,
                    bridge,
                    peers,
                    events,
                },
            })),
        }
    }

    /// Spawn the event loop. Idempotent.
    pub fn startup(&self) {
        if let Some(parts) = self.parts.lock().take() {
            tokio::spawn(parts.state.run(parts.events_rx, parts.shutdown_rx));
        }
    }

    /// Stop the loop, cancelling every in-progress request.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Start a request toward `peer` for the graph described by the rooted
    /// selector `spec`. Progress arrives in visit order on the first stream;
    /// errors (including the terminal failure, if any) on the second. Both
    /// streams close when the request reaches any terminal state. Dropping
    /// the progress stream cancels the request.
    pub async fn send_request(
        &self,
        peer: PeerId,
        spec: Node,
    ) -> (
        mpsc::Receiver<ResponseProgress>,
        mpsc::Receiver<RequestError>,
    ) {
        let problems = self.bridge.validate_selector_spec(&spec);
        if !problems.is_empty() {
            tracing::debug!(peer = %peer.short(), ?problems, "rejecting selector spec");
            return single_error(RequestError::InvalidSelectorSpec);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .events
            .send(RequestEvent::New {
                peer,
                spec,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return closed_streams();
        }
        let Ok(in_progress) = reply_rx.await else {
            return closed_streams();
        };
        collector::collect_responses(in_progress, Some(self.events.clone()))
    }

    /// Ingest responses and blocks that arrived from `peer`.
    pub async fn process_responses(
        &self,
        peer: PeerId,
        responses: Vec<Response>,
        blocks: Vec<Block>,
    ) {
        let _ = self
            .events
            .send(RequestEvent::ProcessResponses {
                peer,
                responses,
                blocks,
            })
            .await;
    }
}

fn closed_streams() -> (
    mpsc::Receiver<ResponseProgress>,
    mpsc::Receiver<RequestError>,
) {
    let (_, progress) = mpsc::channel(1);
    let (_, errors) = mpsc::channel(1);
    (progress, errors)
}

fn single_error(
    error: RequestError,
) -> (
    mpsc::Receiver<ResponseProgress>,
    mpsc::Receiver<RequestError>,
) {
    let (_, progress) = mpsc::channel(1);
    let (error_tx, errors) = mpsc::channel(1);
    let _ = error_tx.try_send(error);
    (progress, errors)
}

/// Resolves when the cancel handle fires. If the handle's authority is
/// dropped without firing, never resolves.
pub(crate) async fn cancelled(mut cancel: watch::Receiver<bool>) {
    if cancel.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

// ── Event loop ────────────────────────────────────────────────────────────────

struct RequestLoop {
    next_id: RequestId,
    in_progress: HashMap<RequestId, InProgressStatus>,
    loader: Arc<dyn AsyncLoader>,
    bridge: Arc<dyn GraphBridge>,
    peers: Arc<dyn RequestSender>,
    events: mpsc::Sender<RequestEvent>,
}

impl RequestLoop {
    async fn run(
        mut self,
        mut events: mpsc::Receiver<RequestEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                }
            }
        }
        for (_, status) in self.in_progress.drain() {
            let _ = status.cancel.send(true);
        }
    }

    fn handle(&mut self, event: RequestEvent) {
        match event {
            RequestEvent::New { peer, spec, reply } => {
                let id = self.next_id;
                self.next_id = id.next();
                let (progress, errors) = self.setup_request(id, peer, spec);
                let _ = reply.send(InProgressRequest {
                    id,
                    progress,
                    errors,
                });
            }
            RequestEvent::Cancel { id } => {
                // The cancel frame goes out before the entry disappears.
                if let Some(peer) = self.in_progress.get(&id).map(|status| status.peer) {
                    self.peers.send_request(peer, Request::cancel(id));
                    if let Some(status) = self.in_progress.remove(&id) {
                        let _ = status.cancel.send(true);
                    }
                }
            }
            RequestEvent::ProcessResponses {
                peer,
                responses,
                blocks,
            } => self.process_responses(peer, responses, blocks),
            RequestEvent::Terminate { id } => {
                self.in_progress.remove(&id);
                self.loader.cleanup_request(id);
            }
        }
    }

    fn setup_request(
        &mut self,
        id: RequestId,
        peer: PeerId,
        spec: Node,
    ) -> (
        mpsc::Receiver<ResponseProgress>,
        mpsc::Receiver<RequestError>,
    ) {
        let selector_bytes = match self.bridge.encode_node(&spec) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => return single_error(e.into()),
        };
        let (root, selector) = match self.bridge.decode_selector_spec(&spec) {
            Ok(parts) => parts,
            Err(e) => return single_error(e.into()),
        };

        let (cancel, cancel_rx) = watch::channel(false);
        let (network_error_tx, network_error_rx) = oneshot::channel();
        self.in_progress.insert(
            id,
            InProgressStatus {
                peer,
                cancel,
                network_error: Some(network_error_tx),
            },
        );
        self.loader.start_request(id);
        self.peers
            .send_request(peer, Request::new(id, selector_bytes, Priority::MAX));

        let (progress_tx, progress_rx) = mpsc::channel(STREAM_CAPACITY);
        let (error_tx, error_rx) = mpsc::channel(STREAM_CAPACITY);
        let block_loader = loader::WrappedAsyncLoader::new(
            self.loader.clone(),
            id,
            error_tx.clone(),
            cancel_rx.clone(),
        );
        let mut visitor = ChannelVisitor {
            progress: progress_tx,
            cancel: cancel_rx,
        };
        let bridge = self.bridge.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            if let Err(e) = bridge
                .traverse(&block_loader, &root, &selector, &mut visitor)
                .await
            {
                tracing::debug!(request = %id, error = %e, "traversal stopped");
            }
            let mut network_error_rx = network_error_rx;
            if let Ok(network_error) = network_error_rx.try_recv() {
                let _ = error_tx.send(network_error).await;
            }
            let _ = events.send(RequestEvent::Terminate { id }).await;
            // Dropping the channel ends here closes both caller streams.
        });
        (progress_rx, error_rx)
    }

    fn process_responses(&mut self, peer: PeerId, responses: Vec<Response>, blocks: Vec<Block>) {
        // Only responses matching an in-progress request from this same peer
        // count; anything else is a forged or stale id.
        let filtered: Vec<Response> = responses
            .into_iter()
            .filter(|r| {
                self.in_progress
                    .get(&r.request_id())
                    .map(|status| status.peer == peer)
                    .unwrap_or(false)
            })
            .collect();

        let mut by_request: HashMap<RequestId, Vec<MetadataItem>> = HashMap::new();
        for response in &filtered {
            match metadata::decode(response.extra()) {
                Ok(items) => {
                    by_request.entry(response.request_id()).or_default().extend(items);
                }
                Err(e) => {
                    tracing::warn!(request = %response.request_id(), error = %e, "bad metadata");
                }
            }
        }
        // The loader must observe metadata and blocks before any termination
        // releases the id; do not reorder.
        self.loader.process_response(by_request, blocks);

        for response in filtered {
            let status = response.status();
            if !status.is_terminal() {
                continue;
            }
            let id = response.request_id();
            if status.is_terminal_failure() {
                if let Some(in_progress) = self.in_progress.get_mut(&id) {
                    if let Some(network_error) = in_progress.network_error.take() {
                        let _ = network_error.send(RequestError::from_status(status));
                    }
                    let _ = in_progress.cancel.send(true);
                }
            }
            self.loader.complete_responses_for(id);
            self.in_progress.remove(&id);
        }
    }
}

struct ChannelVisitor {
    progress: mpsc::Sender<ResponseProgress>,
    cancel: watch::Receiver<bool>,
}

#[async_trait]
impl TraversalVisitor for ChannelVisitor {
    async fn visit(&mut self, progress: &TraversalProgress, node: &Node) {
        let item = ResponseProgress {
            node: node.clone(),
            path: progress.path.clone(),
            last_link: progress.last_link,
        };
        tokio::select! {
            _ = self.progress.send(item) => {}
            _ = cancelled(self.cancel.clone()) => {}
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    use crate::async_loader::AsyncBlockLoader;
    use crate::testutil::{random_blocks, random_peer, selector_spec, StubBridge};

    const TICK: Duration = Duration::from_secs(1);

    struct RecordingPeers {
        requests: mpsc::UnboundedSender<(PeerId, Request)>,
    }

    impl RequestSender for RecordingPeers {
        fn send_request(&self, peer: PeerId, request: Request) {
            let _ = self.requests.send((peer, request));
        }
    }

    fn manager() -> (Arc<RequestManager>, mpsc::UnboundedReceiver<(PeerId, Request)>) {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(RequestManager::new(
            Arc::new(AsyncBlockLoader::new()),
            Arc::new(StubBridge::new()),
            Arc::new(RecordingPeers {
                requests: requests_tx,
            }),
            &Config::default(),
        ));
        manager.startup();
        (manager, requests_rx)
    }

    fn metadata_all_present(blocks: &[Block]) -> Bytes {
        let items: Vec<MetadataItem> = blocks
            .iter()
            .map(|b| MetadataItem {
                link: *b.link(),
                block_present: true,
            })
            .collect();
        Bytes::from(metadata::encode(&items).unwrap())
    }

    async fn drain(
        mut progress: mpsc::Receiver<ResponseProgress>,
        mut errors: mpsc::Receiver<RequestError>,
    ) -> (Vec<ResponseProgress>, Vec<RequestError>) {
        let mut seen = Vec::new();
        while let Some(item) = progress.recv().await {
            seen.push(item);
        }
        let mut failures = Vec::new();
        while let Some(error) = errors.recv().await {
            failures.push(error);
        }
        (seen, failures)
    }

    #[tokio::test]
    async fn successful_request_streams_blocks_in_order() {
        let (manager, mut outgoing) = manager();
        let peer = random_peer();
        let blocks = random_blocks(3, 64);
        let links: Vec<_> = blocks.iter().map(|b| *b.link()).collect();

        let (progress, errors) = manager.send_request(peer, selector_spec(&links)).await;

        let (to, request) = timeout(TICK, outgoing.recv()).await.unwrap().unwrap();
        assert_eq!(to, peer);
        assert_eq!(request.id(), RequestId(0));
        assert!(!request.is_cancel());
        assert_eq!(request.priority(), Priority::MAX);

        manager
            .process_responses(
                peer,
                vec![Response::new(
                    request.id(),
                    ResponseStatus::REQUEST_COMPLETED_FULL,
                    metadata_all_present(&blocks),
                )],
                blocks.clone(),
            )
            .await;

        let (seen, failures) = timeout(TICK, drain(progress, errors)).await.unwrap();
        assert!(failures.is_empty(), "unexpected errors: {failures:?}");
        assert_eq!(seen.len(), blocks.len());
        for (item, block) in seen.iter().zip(&blocks) {
            assert_eq!(item.last_link, Some(*block.link()));
            assert_eq!(item.node, Node::Bytes(block.data().to_vec()));
        }
    }

    #[tokio::test]
    async fn request_ids_increase_monotonically() {
        let (manager, mut outgoing) = manager();
        let peer = random_peer();
        let blocks = random_blocks(1, 16);
        let links: Vec<_> = blocks.iter().map(|b| *b.link()).collect();

        let _first = manager.send_request(peer, selector_spec(&links)).await;
        let _second = manager.send_request(peer, selector_spec(&links)).await;

        let (_, request) = timeout(TICK, outgoing.recv()).await.unwrap().unwrap();
        assert_eq!(request.id(), RequestId(0));
        let (_, request) = timeout(TICK, outgoing.recv()).await.unwrap().unwrap();
        assert_eq!(request.id(), RequestId(1));
    }

    #[tokio::test]
    async fn invalid_selector_yields_one_error() {
        let (manager, _outgoing) = manager();
        let (progress, errors) = manager
            .send_request(random_peer(), Node::String("not a spec".to_string()))
            .await;
        let (seen, failures) = timeout(TICK, drain(progress, errors)).await.unwrap();
        assert!(seen.is_empty());
        assert_eq!(failures, vec![RequestError::InvalidSelectorSpec]);
    }

    #[tokio::test]
    async fn terminal_failure_reaches_the_error_stream() {
        let (manager, mut outgoing) = manager();
        let peer = random_peer();
        let blocks = random_blocks(1, 16);
        let links: Vec<_> = blocks.iter().map(|b| *b.link()).collect();

        let (progress, errors) = manager.send_request(peer, selector_spec(&links)).await;
        let (_, request) = timeout(TICK, outgoing.recv()).await.unwrap().unwrap();

        manager
            .process_responses(
                peer,
                vec![Response::new(
                    request.id(),
                    ResponseStatus::REQUEST_FAILED_CONTENT_NOT_FOUND,
                    Bytes::new(),
                )],
                vec![],
            )
            .await;

        let (seen, failures) = timeout(TICK, drain(progress, errors)).await.unwrap();
        assert!(seen.is_empty());
        assert!(
            failures.contains(&RequestError::ContentNotFound),
            "missing mapped failure: {failures:?}"
        );
    }

    #[tokio::test]
    async fn responses_from_the_wrong_peer_are_ignored() {
        let (manager, mut outgoing) = manager();
        let peer = random_peer();
        let imposter = random_peer();
        let blocks = random_blocks(1, 16);
        let links: Vec<_> = blocks.iter().map(|b| *b.link()).collect();

        let (progress, errors) = manager.send_request(peer, selector_spec(&links)).await;
        let (_, request) = timeout(TICK, outgoing.recv()).await.unwrap().unwrap();

        // A forged terminal failure from another peer must not touch the
        // request.
        manager
            .process_responses(
                imposter,
                vec![Response::new(
                    request.id(),
                    ResponseStatus::REQUEST_FAILED_LEGAL,
                    Bytes::new(),
                )],
                vec![],
            )
            .await;

        manager
            .process_responses(
                peer,
                vec![Response::new(
                    request.id(),
                    ResponseStatus::REQUEST_COMPLETED_FULL,
                    metadata_all_present(&blocks),
                )],
                blocks.clone(),
            )
            .await;

        let (seen, failures) = timeout(TICK, drain(progress, errors)).await.unwrap();
        assert_eq!(seen.len(), 1);
        assert!(failures.is_empty(), "forged failure leaked: {failures:?}");
    }

    #[tokio::test]
    async fn dropping_the_streams_sends_a_cancel_frame() {
        let (manager, mut outgoing) = manager();
        let peer = random_peer();
        let blocks = random_blocks(2, 16);
        let links: Vec<_> = blocks.iter().map(|b| *b.link()).collect();

        let streams = manager.send_request(peer, selector_spec(&links)).await;
        let (_, request) = timeout(TICK, outgoing.recv()).await.unwrap().unwrap();
        assert!(!request.is_cancel());

        drop(streams);

        let (to, cancel) = timeout(TICK, outgoing.recv()).await.unwrap().unwrap();
        assert_eq!(to, peer);
        assert_eq!(cancel.id(), request.id());
        assert!(cancel.is_cancel());
    }

    #[tokio::test]
    async fn shutdown_closes_open_requests() {
        let (manager, mut outgoing) = manager();
        let peer = random_peer();
        let blocks = random_blocks(1, 16);
        let links: Vec<_> = blocks.iter().map(|b| *b.link()).collect();

        let (progress, errors) = manager.send_request(peer, selector_spec(&links)).await;
        let _ = timeout(TICK, outgoing.recv()).await.unwrap().unwrap();

        manager.shutdown();
        let (seen, _failures) = timeout(TICK, drain(progress, errors)).await.unwrap();
        assert!(seen.is_empty());
    }
}
