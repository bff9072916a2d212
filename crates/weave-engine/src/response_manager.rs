//! Response manager — dispatches incoming requests.
//!
//! A single event loop owns the in-progress table, keyed by (peer, id):
//! new requests decode their selector spec and enter the peer task queue;
//! cancels fire the request's cancel handle and withdraw the queued task.
//! A fixed pool of query workers pops admitted tasks, fetches the task data
//! through the loop (so a request cancelled before it starts is skipped
//! outright), and runs the traversal against the local store, streaming
//! every loaded block through the peer's response sender.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};

use weave_core::{
    BlockLoader, BlockStore, GraphBridge, Link, LinkContext, LoadError, Node, PeerId, Request,
    RequestId, ResponseStatus, Selector, TraversalProgress, TraversalVisitor,
};

use crate::config::Config;
use crate::task_queue::{Task, TaskQueue};

/// Streams one peer's response traffic back toward the wire.
#[async_trait]
pub trait PeerResponseSender: Send + Sync + 'static {
    /// Record a block the traversal visited, plus its presence metadata.
    async fn send_response(&self, id: RequestId, link: Link, data: Bytes);

    /// Record that a visited link's block is not held locally.
    async fn send_block_absent(&self, id: RequestId, link: Link);

    /// Mark the request complete with terminal success.
    async fn finish_request(&self, id: RequestId);

    /// Mark the request complete with a terminal failure code.
    async fn finish_with_error(&self, id: RequestId, status: ResponseStatus);
}

/// Hands out the response sender serving a peer.
pub trait ResponseSenderManager: Send + Sync + 'static {
    fn sender_for(&self, peer: PeerId) -> Arc<dyn PeerResponseSender>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ResponseKey {
    peer: PeerId,
    id: RequestId,
}

struct TaskData {
    root: Node,
    selector: Selector,
    cancel: watch::Receiver<bool>,
}

struct InProgressResponse {
    cancel: watch::Sender<bool>,
    task: Option<(Node, Selector)>,
}

enum ResponseEvent {
    ProcessRequests {
        peer: PeerId,
        requests: Vec<Request>,
    },
    StartTask {
        key: ResponseKey,
        reply: oneshot::Sender<Option<TaskData>>,
    },
    FinishTask {
        key: ResponseKey,
    },
    Synchronize {
        reply: oneshot::Sender<()>,
    },
}

// ── Manager ───────────────────────────────────────────────────────────────────

pub struct ResponseManager {
    events: mpsc::Sender<ResponseEvent>,
    shutdown: watch::Sender<bool>,
    parts: Mutex<Option<Parts>>,
}

struct Parts {
    events_rx: mpsc::Receiver<ResponseEvent>,
    shutdown_rx: watch::Receiver<bool>,
    state: ResponseLoop,
    env: WorkerEnv,
    workers: usize,
}

#[derive(Clone)]
struct WorkerEnv {
    store: Arc<dyn BlockStore>,
    bridge: Arc<dyn GraphBridge>,
    senders: Arc<dyn ResponseSenderManager>,
    queue: Arc<dyn TaskQueue>,
    events: mpsc::Sender<ResponseEvent>,
}

impl ResponseManager {
    pub fn new(
        store: Arc<dyn BlockStore>,
        bridge: Arc<dyn GraphBridge>,
        senders: Arc<dyn ResponseSenderManager>,
        queue: Arc<dyn TaskQueue>,
        config: &Config,
    ) -> Self {
        let (events, events_rx) = mpsc::channel(config.mailbox_capacity);
        let (shutdown, shutdown_rx) = watch::channel(false);
        ResponseManager {
            events: events.clone(),
            shutdown,
            parts: Mutex::new(Some(Parts {
                events_rx,
                shutdown_rx,
                state: ResponseLoop {
                    bridge: bridge.clone(),
                    senders: senders.clone(),
                    queue: queue.clone(),
                    in_progress: HashMap::new(),
                },
                env: WorkerEnv {
                    store,
                    bridge,
                    senders,
                    queue,
                    events,
                },
                workers: config.query_workers,
            })),
        }
    }

    /// Spawn the event loop and the query worker pool. Idempotent.
    pub fn startup(&self) {
        if let Some(parts) = self.parts.lock().take() {
            for _ in 0..parts.workers {
                tokio::spawn(query_worker(parts.env.clone(), parts.shutdown_rx.clone()));
            }
            tokio::spawn(parts.state.run(parts.events_rx, parts.shutdown_rx));
        }
    }

    /// Stop the loop and workers, cancelling every in-progress response.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Ingest requests (new and cancels) that arrived from `peer`.
    pub async fn process_requests(&self, peer: PeerId, requests: Vec<Request>) {
        let _ = self
            .events
            .send(ResponseEvent::ProcessRequests { peer, requests })
            .await;
    }

    /// Wait until every event posted before this call has been handled.
    /// Test hook.
    pub async fn synchronize(&self) {
        let (reply, done) = oneshot::channel();
        if self
            .events
            .send(ResponseEvent::Synchronize { reply })
            .await
            .is_ok()
        {
            let _ = done.await;
        }
    }
}

// ── Event loop ────────────────────────────────────────────────────────────────

struct ResponseLoop {
    bridge: Arc<dyn GraphBridge>,
    senders: Arc<dyn ResponseSenderManager>,
    queue: Arc<dyn TaskQueue>,
    in_progress: HashMap<ResponseKey, InProgressResponse>,
}

impl ResponseLoop {
    async fn run(
        mut self,
        mut events: mpsc::Receiver<ResponseEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                }
            }
        }
        for (_, in_progress) in self.in_progress.drain() {
            let _ = in_progress.cancel.send(true);
        }
    }

    async fn handle(&mut self, event: ResponseEvent) {
        match event {
            ResponseEvent::ProcessRequests { peer, requests } => {
                for request in requests {
                    self.process_request(peer, request).await;
                }
                self.queue.thaw_round();
            }
            ResponseEvent::StartTask { key, reply } => {
                let data = self.in_progress.get_mut(&key).and_then(|entry| {
                    entry.task.take().map(|(root, selector)| TaskData {
                        root,
                        selector,
                        cancel: entry.cancel.subscribe(),
                    })
                });
                let _ = reply.send(data);
            }
            ResponseEvent::FinishTask { key } => {
                self.in_progress.remove(&key);
            }
            ResponseEvent::Synchronize { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn process_request(&mut self, peer: PeerId, request: Request) {
        let key = ResponseKey {
            peer,
            id: request.id(),
        };
        if request.is_cancel() {
            if let Some(entry) = self.in_progress.remove(&key) {
                let _ = entry.cancel.send(true);
                self.queue.remove(key.id, key.peer);
            }
            return;
        }

        let decoded = self
            .bridge
            .decode_node(request.selector())
            .and_then(|spec| self.bridge.decode_selector_spec(&spec));
        let (root, selector) = match decoded {
            Ok(parts) => parts,
            Err(e) => {
                tracing::warn!(
                    peer = %peer.short(),
                    request = %request.id(),
                    error = %e,
                    "rejecting undecodable request"
                );
                self.senders
                    .sender_for(peer)
                    .finish_with_error(request.id(), ResponseStatus::REQUEST_FAILED_UNKNOWN)
                    .await;
                return;
            }
        };

        // A replacement for a live id supersedes the old run.
        if let Some(previous) = self.in_progress.remove(&key) {
            let _ = previous.cancel.send(true);
            self.queue.remove(key.id, key.peer);
        }
        let (cancel, _) = watch::channel(false);
        self.in_progress.insert(
            key,
            InProgressResponse {
                cancel,
                task: Some((root, selector)),
            },
        );
        self.queue.push(Task {
            peer,
            request_id: request.id(),
            priority: request.priority(),
        });
    }
}

// ── Query workers ─────────────────────────────────────────────────────────────

async fn query_worker(env: WorkerEnv, mut shutdown: watch::Receiver<bool>) {
    loop {
        let task = tokio::select! {
            _ = shutdown.changed() => return,
            task = env.queue.pop() => task,
        };
        let key = ResponseKey {
            peer: task.peer,
            id: task.request_id,
        };
        let (reply, fetched) = oneshot::channel();
        if env
            .events
            .send(ResponseEvent::StartTask { key, reply })
            .await
            .is_err()
        {
            return;
        }
        let Ok(data) = fetched.await else {
            return;
        };
        let Some(data) = data else {
            // Cancelled (or finished) before a worker picked it up.
            continue;
        };

        let sender = env.senders.sender_for(task.peer);
        let loader = StoreLoader {
            store: env.store.clone(),
            sender: sender.clone(),
            id: task.request_id,
            cancel: data.cancel,
        };
        let mut visitor = DiscardVisitor;
        match env
            .bridge
            .traverse(&loader, &data.root, &data.selector, &mut visitor)
            .await
        {
            Ok(()) => sender.finish_request(task.request_id).await,
            Err(e) => {
                tracing::debug!(request = %task.request_id, error = %e, "query traversal failed");
                sender
                    .finish_with_error(task.request_id, ResponseStatus::REQUEST_FAILED_UNKNOWN)
                    .await;
            }
        }
        let _ = env.events.send(ResponseEvent::FinishTask { key }).await;
    }
}

/// Loads from the local store, streaming each hit through the response
/// sender and recording misses as absent. Checks the cancel handle between
/// loads and aborts cooperatively with `DoNotFollow`.
struct StoreLoader {
    store: Arc<dyn BlockStore>,
    sender: Arc<dyn PeerResponseSender>,
    id: RequestId,
    cancel: watch::Receiver<bool>,
}

#[async_trait]
impl BlockLoader for StoreLoader {
    async fn load_link(&self, link: &Link, _ctx: &LinkContext) -> Result<Bytes, LoadError> {
        if *self.cancel.borrow() {
            return Err(LoadError::DoNotFollow);
        }
        match self.store.load(link) {
            Ok(data) => {
                self.sender.send_response(self.id, *link, data.clone()).await;
                Ok(data)
            }
            Err(e) => {
                tracing::trace!(request = %self.id, link = %link, error = %e, "block not held");
                self.sender.send_block_absent(self.id, *link).await;
                Err(LoadError::DoNotFollow)
            }
        }
    }
}

/// The responding side only cares about loads; visits carry no extra work.
struct DiscardVisitor;

#[async_trait]
impl TraversalVisitor for DiscardVisitor {
    async fn visit(&mut self, _progress: &TraversalProgress, _node: &Node) {}
}

// ── Tests ─────────────────────────────────────────────────────────────────────
