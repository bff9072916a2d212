//! Async loader — per-request link→block futures fed by arriving response
//! frames.
//!
//! Each live request keeps a cache of block bytes and an absent set, both
//! populated from incoming metadata, plus the loads still waiting for a
//! verdict. A load that arrives before its block suspends; a block that
//! arrives before its load satisfies immediately from the cache. The cache
//! lives until `cleanup_request` — long selectors mean memory growth, and
//! bounding that belongs to a caching layer above this one.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::oneshot;

use weave_core::{Block, Link, LoadError, MetadataItem, RequestId};

use crate::request_manager::{AsyncLoader, LoadResult};

#[derive(Default)]
struct RequestBlocks {
    cache: HashMap<Link, Bytes>,
    absent: HashSet<Link>,
    pending: HashMap<Link, Vec<oneshot::Sender<LoadResult>>>,
    complete: bool,
}

impl RequestBlocks {
    /// The verdict for `link`, if one is known yet.
    fn verdict(&self, link: &Link) -> Option<LoadResult> {
        if let Some(data) = self.cache.get(link) {
            Some(Ok(data.clone()))
        } else if self.absent.contains(link) {
            Some(Err(LoadError::ContentMissing))
        } else {
            None
        }
    }

    fn wake(&mut self, link: &Link) {
        let Some(result) = self.verdict(link) else {
            return;
        };
        if let Some(waiters) = self.pending.remove(link) {
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        }
    }

    fn fail_pending(&mut self, error: LoadError) {
        for (_, waiters) in self.pending.drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(error.clone()));
            }
        }
    }
}

/// The concrete [`AsyncLoader`] backed by incoming response frames.
#[derive(Default)]
pub struct AsyncBlockLoader {
    requests: DashMap<RequestId, RequestBlocks>,
}

impl AsyncBlockLoader {
    pub fn new() -> Self {
        AsyncBlockLoader::default()
    }
}

impl AsyncLoader for AsyncBlockLoader {
    fn start_request(&self, id: RequestId) {
        self.requests.insert(id, RequestBlocks::default());
    }

    fn process_response(&self, metadata: HashMap<RequestId, Vec<MetadataItem>>, blocks: Vec<Block>) {
        let arrived: HashMap<Link, Bytes> = blocks
            .into_iter()
            .map(|b| (*b.link(), b.into_data()))
            .collect();

        for (id, items) in metadata {
            let Some(mut state) = self.requests.get_mut(&id) else {
                continue;
            };
            // Record every metadata entry, then store covered blocks, then
            // wake the waiters the new entries decide.
            for item in &items {
                if item.block_present {
                    if let Some(data) = arrived.get(&item.link) {
                        state.cache.insert(item.link, data.clone());
                    }
                } else {
                    state.absent.insert(item.link);
                }
            }
            for item in &items {
                state.wake(&item.link);
            }
        }
    }

    fn async_load(&self, id: RequestId, link: &Link) -> oneshot::Receiver<LoadResult> {
        let (tx, rx) = oneshot::channel();
        match self.requests.get_mut(&id) {
            None => {
                let _ = tx.send(Err(LoadError::RequestCleanedUp));
            }
            Some(mut state) => {
                if let Some(result) = state.verdict(link) {
                    let _ = tx.send(result);
                } else if state.complete {
                    let _ = tx.send(Err(LoadError::ResponsesExhausted));
                } else {
                    state.pending.entry(*link).or_default().push(tx);
                }
            }
        }
        rx
    }

    fn complete_responses_for(&self, id: RequestId) {
        if let Some(mut state) = self.requests.get_mut(&id) {
            state.complete = true;
            state.fail_pending(LoadError::ResponsesExhausted);
        }
    }

    fn cleanup_request(&self, id: RequestId) {
        if let Some((_, mut state)) = self.requests.remove(&id) {
            state.fail_pending(LoadError::RequestCleanedUp);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
