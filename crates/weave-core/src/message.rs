//! Wire message — the unit of exchange between peers.
//!
//! A message carries any mix of requests, responses, and raw blocks.
//! Within one message each set collapses by its natural key: request id,
//! request id, and content address respectively. On the wire a message is
//! a single length-delimited bincode record; block payloads travel with
//! their prefix bytes so the receiver can recompute every link.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::link::{Block, Link, LinkError, Prefix};

/// Default ceiling on an encoded message, matching the transport's frame cap.
pub const MESSAGE_SIZE_MAX: usize = 4 * 1024 * 1024;

// ── Identifiers ───────────────────────────────────────────────────────────────

/// Request identifier, unique within the peer that assigned it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct RequestId(pub i32);

impl RequestId {
    /// The id the next request after this one receives.
    pub fn next(self) -> RequestId {
        RequestId(self.0.wrapping_add(1))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Request priority; higher is more urgent.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Priority(pub i32);

impl Priority {
    pub const MAX: Priority = Priority(i32::MAX);
}

// ── Status codes ──────────────────────────────────────────────────────────────

/// Response status code.
///
/// Codes 10–19 are informational, 20–21 terminal success, 30–34 terminal
/// failure. The type is an open newtype rather than a closed enum so that
/// unknown codes survive decoding; they are treated as non-terminal and map
/// to the unknown-reason failure where an error is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResponseStatus(pub i32);

impl ResponseStatus {
    /// The request was received and is being worked on.
    pub const REQUEST_ACKNOWLEDGED: ResponseStatus = ResponseStatus(10);
    /// Additional peers that may satisfy the request are listed in extra.
    pub const ADDITIONAL_PEERS: ResponseStatus = ResponseStatus(11);
    /// Fulfilling the request requires payment.
    pub const NOT_ENOUGH_GAS: ResponseStatus = ResponseStatus(12);
    /// Extra carries a response belonging to a different protocol.
    pub const OTHER_PROTOCOL: ResponseStatus = ResponseStatus(13);
    /// Blocks and metadata for an in-progress response.
    pub const PARTIAL_RESPONSE: ResponseStatus = ResponseStatus(14);

    /// The entire request was fulfilled.
    pub const REQUEST_COMPLETED_FULL: ResponseStatus = ResponseStatus(20);
    /// The response is complete but covers only part of the request.
    pub const REQUEST_COMPLETED_PARTIAL: ResponseStatus = ResponseStatus(21);

    /// The remote declined the request.
    pub const REQUEST_REJECTED: ResponseStatus = ResponseStatus(30);
    /// The remote is too busy; try again later.
    pub const REQUEST_FAILED_BUSY: ResponseStatus = ResponseStatus(31);
    /// The request failed for an unspecified reason.
    pub const REQUEST_FAILED_UNKNOWN: ResponseStatus = ResponseStatus(32);
    /// The request failed for legal reasons.
    pub const REQUEST_FAILED_LEGAL: ResponseStatus = ResponseStatus(33);
    /// The remote does not have the requested content.
    pub const REQUEST_FAILED_CONTENT_NOT_FOUND: ResponseStatus = ResponseStatus(34);

    pub fn is_terminal_success(self) -> bool {
        matches!(
            self,
            ResponseStatus::REQUEST_COMPLETED_FULL | ResponseStatus::REQUEST_COMPLETED_PARTIAL
        )
    }

    pub fn is_terminal_failure(self) -> bool {
        matches!(
            self,
            ResponseStatus::REQUEST_REJECTED
                | ResponseStatus::REQUEST_FAILED_BUSY
                | ResponseStatus::REQUEST_FAILED_UNKNOWN
                | ResponseStatus::REQUEST_FAILED_LEGAL
                | ResponseStatus::REQUEST_FAILED_CONTENT_NOT_FOUND
        )
    }

    /// True if this code is the last wire event for its request.
    pub fn is_terminal(self) -> bool {
        self.is_terminal_success() || self.is_terminal_failure()
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ── Requests and responses ────────────────────────────────────────────────────

/// One request inside a message. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    id: RequestId,
    selector: Bytes,
    priority: Priority,
    cancel: bool,
}

impl Request {
    /// A new request carrying an encoded rooted selector.
    pub fn new(id: RequestId, selector: Bytes, priority: Priority) -> Self {
        Request {
            id,
            selector,
            priority,
            cancel: false,
        }
    }

    /// A cancellation for an in-progress request.
    pub fn cancel(id: RequestId) -> Self {
        Request {
            id,
            selector: Bytes::new(),
            priority: Priority(0),
            cancel: true,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn selector(&self) -> &Bytes {
        &self.selector
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn is_cancel(&self) -> bool {
        self.cancel
    }
}

/// One response record inside a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    request_id: RequestId,
    status: ResponseStatus,
    extra: Bytes,
}

impl Response {
    pub fn new(request_id: RequestId, status: ResponseStatus, extra: Bytes) -> Self {
        Response {
            request_id,
            status,
            extra,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn status(&self) -> ResponseStatus {
        self.status
    }

    pub fn extra(&self) -> &Bytes {
        &self.extra
    }
}

// ── Message ───────────────────────────────────────────────────────────────────

/// Errors that can arise encoding or decoding a wire message.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("encoded message is {size} bytes, maximum is {max}")]
    TooLarge { size: usize, max: usize },

    #[error("message encoding failed: {0}")]
    Encode(String),

    #[error("message decoding failed: {0}")]
    Decode(String),

    #[error("block failed link validation: {0}")]
    Block(#[from] LinkError),
}

/// In-memory message builder.
#[derive(Debug, Clone, Default)]
pub struct Message {
    requests: HashMap<RequestId, Request>,
    responses: HashMap<RequestId, Response>,
    blocks: HashMap<Link, Block>,
}

impl Message {
    pub fn new() -> Self {
        Message::default()
    }

    /// Add a request. A request with the same id replaces the previous one.
    pub fn add_request(&mut self, request: Request) {
        self.requests.insert(request.id(), request);
    }

    /// Add a response. A response for the same request id replaces the
    /// previous one.
    pub fn add_response(&mut self, response: Response) {
        self.responses.insert(response.request_id(), response);
    }

    /// Add a block, collapsing duplicates by content address.
    pub fn add_block(&mut self, block: Block) {
        self.blocks.insert(*block.link(), block);
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.responses.is_empty() && self.blocks.is_empty()
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.values().cloned().collect()
    }

    pub fn responses(&self) -> Vec<Response> {
        self.responses.values().cloned().collect()
    }

    pub fn blocks(&self) -> Vec<Block> {
        self.blocks.values().cloned().collect()
    }

    /// Compact description for log fields.
    pub fn summary(&self) -> String {
        let mut request_ids: Vec<i32> = self.requests.keys().map(|id| id.0).collect();
        let mut response_ids: Vec<i32> = self.responses.keys().map(|id| id.0).collect();
        request_ids.sort_unstable();
        response_ids.sort_unstable();
        format!(
            "requests={request_ids:?} responses={response_ids:?} blocks={}",
            self.blocks.len()
        )
    }

    /// Encode to the bincode body (no length prefix).
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        let wire = WireMessage {
            requests: self
                .requests
                .values()
                .map(|r| WireRequest {
                    id: r.id.0,
                    selector: r.selector.to_vec(),
                    priority: r.priority.0,
                    cancel: r.cancel,
                })
                .collect(),
            responses: self
                .responses
                .values()
                .map(|r| WireResponse {
                    id: r.request_id.0,
                    status: r.status.0,
                    extra: r.extra.to_vec(),
                })
                .collect(),
            blocks: self
                .blocks
                .values()
                .map(|b| WireBlock {
                    prefix: b.link().prefix().to_bytes(),
                    data: b.data().to_vec(),
                })
                .collect(),
        };
        bincode::serialize(&wire).map_err(|e| WireError::Encode(e.to_string()))
    }

    /// Decode a bincode body, recomputing and validating every block link.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        let wire: WireMessage =
            bincode::deserialize(bytes).map_err(|e| WireError::Decode(e.to_string()))?;
        let mut message = Message::new();
        for r in wire.requests {
            let request = if r.cancel {
                Request::cancel(RequestId(r.id))
            } else {
                Request::new(RequestId(r.id), Bytes::from(r.selector), Priority(r.priority))
            };
            message.add_request(request);
        }
        for r in wire.responses {
            message.add_response(Response::new(
                RequestId(r.id),
                ResponseStatus(r.status),
                Bytes::from(r.extra),
            ));
        }
        for b in wire.blocks {
            let prefix = Prefix::from_bytes(&b.prefix)?;
            let block = Block::new(prefix, Bytes::from(b.data))?;
            message.add_block(block);
        }
        Ok(message)
    }

    /// Encode as one stream frame: `[u32-le length][bincode body]`.
    pub fn to_frame(&self, max_size: usize) -> Result<Vec<u8>, WireError> {
        let body = self.to_bytes()?;
        if body.len() > max_size {
            return Err(WireError::TooLarge {
                size: body.len(),
                max: max_size,
            });
        }
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Read the body length out of a frame header.
    pub fn read_frame_len(header: &[u8; 4]) -> usize {
        u32::from_le_bytes(*header) as usize
    }
}

#[derive(Serialize, Deserialize)]
struct WireMessage {
    requests: Vec<WireRequest>,
    responses: Vec<WireResponse>,
    blocks: Vec<WireBlock>,
}

#[derive(Serialize, Deserialize)]
struct WireRequest {
    id: i32,
    selector: Vec<u8>,
    priority: i32,
    cancel: bool,
}

#[derive(Serialize, Deserialize)]
struct WireResponse {
    id: i32,
    status: i32,
    extra: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct WireBlock {
    prefix: Vec<u8>,
    data: Vec<u8>,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
