//! weave-engine — the engine that runs the weave block-graph sync
//! protocol: per-peer outbound queues, the request and response managers,
//! the async loader, and the wiring that binds them to a transport, a
//! block store, and a selector bridge.
//!
//! The stateful components are actors: each owns a worker task and a
//! private mailbox, and external callers only post events. The peer pools
//! are the one shared structure, guarded by a reader/writer lock.

pub mod async_loader;
pub mod config;
pub mod message_queue;
pub mod network;
pub mod peer_manager;
pub mod request_manager;
pub mod response_manager;
pub mod response_sender;
pub mod task_queue;
pub mod testutil;

use std::sync::Arc;

use tokio::sync::mpsc;

use weave_core::{GraphBridge, Message, Node, PeerId, Request};
use weave_core::BlockStore;

pub use async_loader::AsyncBlockLoader;
pub use config::Config;
pub use message_queue::MessageQueue;
pub use network::{MessageNetwork, MessageSender, NetworkError};
pub use peer_manager::{PeerManager, PeerProcess};
pub use request_manager::{
    AsyncLoader, RequestError, RequestManager, RequestSender, ResponseProgress,
};
pub use response_manager::{PeerResponseSender, ResponseManager, ResponseSenderManager};
pub use response_sender::ResponseSender;
pub use task_queue::{RoundRobinTaskQueue, Task, TaskQueue};

impl RequestSender for PeerManager<MessageQueue> {
    fn send_request(&self, peer: PeerId, request: Request) {
        self.get_process(peer).add_request(request);
    }
}

impl ResponseSenderManager for PeerManager<ResponseSender> {
    fn sender_for(&self, peer: PeerId) -> Arc<dyn PeerResponseSender> {
        self.get_process(peer)
    }
}

/// The assembled protocol engine for one local peer.
///
/// Construction wires the request manager, response manager, async loader,
/// and both per-peer pools to the given transport, bridge, and store, and
/// starts the event loops. Must be created inside a tokio runtime.
pub struct GraphExchange {
    request_manager: Arc<RequestManager>,
    response_manager: Arc<ResponseManager>,
    outbound: Arc<PeerManager<MessageQueue>>,
    inbound: Arc<PeerManager<ResponseSender>>,
}

impl GraphExchange {
    pub fn new(
        config: Config,
        network: Arc<dyn MessageNetwork>,
        bridge: Arc<dyn GraphBridge>,
        store: Arc<dyn BlockStore>,
    ) -> Self {
        let queue_config = config.clone();
        let queue_network = network.clone();
        let outbound = Arc::new(PeerManager::new(move |peer| {
            Arc::new(MessageQueue::new(peer, queue_network.clone(), &queue_config))
        }));

        let sender_config = config.clone();
        let sender_outbound = outbound.clone();
        let inbound = Arc::new(PeerManager::new(move |peer| {
            Arc::new(ResponseSender::new(
                peer,
                sender_outbound.clone(),
                &sender_config,
            ))
        }));

        let loader = Arc::new(AsyncBlockLoader::new());
        let request_manager = Arc::new(RequestManager::new(
            loader,
            bridge.clone(),
            outbound.clone(),
            &config,
        ));
        let response_manager = Arc::new(ResponseManager::new(
            store,
            bridge,
            inbound.clone(),
            Arc::new(RoundRobinTaskQueue::new()),
            &config,
        ));
        request_manager.startup();
        response_manager.startup();

        GraphExchange {
            request_manager,
            response_manager,
            outbound,
            inbound,
        }
    }

    /// Ask `peer` for the graph described by the rooted selector `spec`.
    /// See [`RequestManager::send_request`] for stream semantics.
    pub async fn request(
        &self,
        peer: PeerId,
        spec: Node,
    ) -> (
        mpsc::Receiver<ResponseProgress>,
        mpsc::Receiver<RequestError>,
    ) {
        self.request_manager.send_request(peer, spec).await
    }

    /// Feed one decoded wire message that arrived from `peer`.
    pub async fn receive_message(&self, peer: PeerId, message: Message) {
        tracing::trace!(peer = %peer.short(), message = %message.summary(), "received");
        let requests = message.requests();
        let responses = message.responses();
        let blocks = message.blocks();
        if !requests.is_empty() {
            self.response_manager.process_requests(peer, requests).await;
        }
        if !responses.is_empty() || !blocks.is_empty() {
            self.request_manager
                .process_responses(peer, responses, blocks)
                .await;
        }
    }

    /// Track a new connection to `peer`.
    pub fn connected(&self, peer: PeerId) {
        self.outbound.connected(peer);
        self.inbound.connected(peer);
    }

    /// Track a dropped connection to `peer`.
    pub fn disconnected(&self, peer: PeerId) {
        self.outbound.disconnected(peer);
        self.inbound.disconnected(peer);
    }

    /// Stop everything: cancels in-progress requests and responses and
    /// shuts down every per-peer worker.
    pub fn shutdown(&self) {
        self.request_manager.shutdown();
        self.response_manager.shutdown();
        self.inbound.shutdown_all();
        self.outbound.shutdown_all();
    }
}
