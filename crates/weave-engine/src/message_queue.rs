//! Per-peer outbound message queue.
//!
//! Requests and response batches accumulate into one pending message;
//! repeated requests with the same id collapse to the last writer, since a
//! re-issued request or a superseding cancel can land before the previous
//! buffer drains. A single worker extracts the pending message, lazily
//! acquires a sender from the network, and delivers with bounded retries.
//! On shutdown the worker drains the current buffer and fully closes the
//! sender rather than resetting it.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch, Notify};

use weave_core::{Block, Message, PeerId, Request, Response};

use crate::config::Config;
use crate::network::{MessageNetwork, MessageSender, NetworkError};
use crate::peer_manager::PeerProcess;

/// One-shot signal resolved when a response batch is handed to the wire,
/// or with the error that kept it from getting there.
pub type ProcessingSignal = oneshot::Receiver<Result<(), NetworkError>>;

#[derive(Default)]
struct NextMessage {
    message: Message,
    signals: Vec<oneshot::Sender<Result<(), NetworkError>>>,
}

struct Inner {
    peer: PeerId,
    network: Arc<dyn MessageNetwork>,
    connect_attempts: u32,
    send_attempts: u32,
    reconnect_backoff: Duration,
    next: Mutex<NextMessage>,
    work: Notify,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<watch::Receiver<bool>>>,
}

/// Handle to one peer's outbound queue. Cheap to clone.
#[derive(Clone)]
pub struct MessageQueue {
    inner: Arc<Inner>,
}

impl MessageQueue {
    pub fn new(peer: PeerId, network: Arc<dyn MessageNetwork>, config: &Config) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        MessageQueue {
            inner: Arc::new(Inner {
                peer,
                network,
                connect_attempts: config.connect_attempts,
                send_attempts: config.send_attempts,
                reconnect_backoff: config.reconnect_backoff,
                next: Mutex::new(NextMessage::default()),
                work: Notify::new(),
                shutdown,
                worker: Mutex::new(Some(shutdown_rx)),
            }),
        }
    }

    /// Buffer an outgoing request. A request with the same id already in
    /// the buffer is replaced.
    pub fn add_request(&self, request: Request) {
        self.inner.next.lock().message.add_request(request);
        self.inner.work.notify_one();
    }

    /// Buffer a response batch. The returned signal resolves once the batch
    /// is handed to the wire, or with the delivery error.
    pub fn add_responses(&self, responses: Vec<Response>, blocks: Vec<Block>) -> ProcessingSignal {
        let (tx, rx) = oneshot::channel();
        {
            let mut next = self.inner.next.lock();
            for response in responses {
                next.message.add_response(response);
            }
            for block in blocks {
                next.message.add_block(block);
            }
            next.signals.push(tx);
        }
        self.inner.work.notify_one();
        rx
    }

    /// Spawn the delivery worker. Idempotent.
    pub fn startup(&self) {
        if let Some(shutdown_rx) = self.inner.worker.lock().take() {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                if let Err(e) = run(inner, shutdown_rx).await {
                    tracing::warn!(error = %e, "message queue worker failed");
                }
            });
        }
    }

    /// Ask the worker to drain and close. Returns immediately.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
    }
}

impl PeerProcess for MessageQueue {
    fn startup(&self) {
        MessageQueue::startup(self);
    }

    fn shutdown(&self) {
        MessageQueue::shutdown(self);
    }
}

async fn run(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let mut sender: Option<Box<dyn MessageSender>> = None;
    loop {
        // Wait for a pending buffer or shutdown.
        loop {
            if !inner.next.lock().message.is_empty() {
                break;
            }
            if *shutdown.borrow() {
                if let Some(mut s) = sender.take() {
                    if let Err(e) = s.close().await {
                        tracing::debug!(peer = %inner.peer.short(), error = %e, "sender close failed");
                    }
                }
                return Ok(());
            }
            tokio::select! {
                _ = inner.work.notified() => {}
                _ = shutdown.changed() => {}
            }
        }

        let (message, signals) = {
            let mut next = inner.next.lock();
            let taken = std::mem::take(&mut *next);
            (taken.message, taken.signals)
        };
        if message.is_empty() {
            continue;
        }
        tracing::trace!(peer = %inner.peer.short(), message = %message.summary(), "delivering");
        deliver(&inner, &mut sender, message, signals).await;
    }
}

/// Deliver one extracted message, acquiring a sender as needed. Attempts
/// are bounded; between failed sends the sender is reset and reopened.
async fn deliver(
    inner: &Inner,
    sender: &mut Option<Box<dyn MessageSender>>,
    message: Message,
    signals: Vec<oneshot::Sender<Result<(), NetworkError>>>,
) {
    for attempt in 1..=inner.send_attempts {
        if sender.is_none() {
            match open_sender(inner).await {
                Ok(s) => *sender = Some(s),
                Err(e) => {
                    tracing::warn!(peer = %inner.peer.short(), error = %e, "no sender, dropping message");
                    resolve(signals, Err(e));
                    return;
                }
            }
        }
        let active = sender.as_mut().expect("sender acquired above");
        match active.send(message.clone()).await {
            Ok(()) => {
                resolve(signals, Ok(()));
                return;
            }
            Err(e) => {
                tracing::warn!(
                    peer = %inner.peer.short(),
                    attempt,
                    error = %e,
                    "send failed, resetting sender"
                );
                active.reset();
                *sender = None;
            }
        }
    }
    tracing::warn!(peer = %inner.peer.short(), "send attempts exhausted, discarding message");
    resolve(signals, Err(NetworkError::Dropped));
}

async fn open_sender(inner: &Inner) -> Result<Box<dyn MessageSender>, NetworkError> {
    let mut last_error = NetworkError::Dropped;
    for attempt in 1..=inner.connect_attempts {
        let opened = async {
            inner.network.connect_to(inner.peer).await?;
            inner.network.new_message_sender(inner.peer).await
        }
        .await;
        match opened {
            Ok(sender) => return Ok(sender),
            Err(e) => {
                tracing::debug!(peer = %inner.peer.short(), attempt, error = %e, "connect failed");
                last_error = e;
                tokio::time::sleep(inner.reconnect_backoff).await;
            }
        }
    }
    Err(last_error)
}

fn resolve(
    signals: Vec<oneshot::Sender<Result<(), NetworkError>>>,
    outcome: Result<(), NetworkError>,
) {
    for signal in signals {
        let _ = signal.send(outcome.clone());
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
