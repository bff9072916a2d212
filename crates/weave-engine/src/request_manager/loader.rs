//! Link loader handed to outgoing-request traversals.
//!
//! Wraps the async loader for one request id. Real load failures are
//! side-channeled onto the request's error stream and reported to the
//! traversal as `DoNotFollow`, so one missing block skips a subtree instead
//! of killing the walk. Cancellation surfaces as a hard error at the next
//! suspension.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use weave_core::{BlockLoader, Link, LinkContext, LoadError, RequestId};

use super::{cancelled, AsyncLoader, RequestError};

pub(crate) struct WrappedAsyncLoader {
    loader: Arc<dyn AsyncLoader>,
    id: RequestId,
    errors: mpsc::Sender<RequestError>,
    cancel: watch::Receiver<bool>,
}

impl WrappedAsyncLoader {
    pub(crate) fn new(
        loader: Arc<dyn AsyncLoader>,
        id: RequestId,
        errors: mpsc::Sender<RequestError>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        WrappedAsyncLoader {
            loader,
            id,
            errors,
            cancel,
        }
    }

    async fn side_channel(&self, error: LoadError) -> Result<Bytes, LoadError> {
        let _ = self.errors.send(RequestError::Load(error)).await;
        Err(LoadError::DoNotFollow)
    }
}

#[async_trait]
impl BlockLoader for WrappedAsyncLoader {
    async fn load_link(&self, link: &Link, _ctx: &LinkContext) -> Result<Bytes, LoadError> {
        if *self.cancel.borrow() {
            return Err(LoadError::Cancelled);
        }
        let pending = self.loader.async_load(self.id, link);
        tokio::select! {
            result = pending => match result {
                Ok(Ok(data)) => Ok(data),
                Ok(Err(error)) => self.side_channel(error).await,
                Err(_) => self.side_channel(LoadError::RequestCleanedUp).await,
            },
            _ = cancelled(self.cancel.clone()) => Err(LoadError::Cancelled),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
