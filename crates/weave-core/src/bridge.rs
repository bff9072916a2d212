//! The graph bridge — the seam between the sync engine and the selector
//! machinery it drives.
//!
//! The engine never interprets selectors itself. It hands encoded selector
//! specs to a [`GraphBridge`] implementation and drives traversals through
//! it, supplying a [`BlockLoader`] that resolves links (from the local store
//! on the responding side, from arriving response frames on the requesting
//! side) and a [`TraversalVisitor`] that observes each visited node.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::link::Link;

// ── Data model ────────────────────────────────────────────────────────────────

/// A structured node value, the common currency of the bridge surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Null,
    Bool(bool),
    Int(i64),
    String(String),
    Bytes(Vec<u8>),
    Link(Link),
    List(Vec<Node>),
    Map(BTreeMap<String, Node>),
}

/// Path from the traversal root to a visited node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Path(Vec<String>);

impl Path {
    pub fn root() -> Self {
        Path(Vec::new())
    }

    pub fn new(segments: Vec<String>) -> Self {
        Path(segments)
    }

    pub fn push(&mut self, segment: impl Into<String>) {
        self.0.push(segment.into());
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

/// A compiled selector. Opaque to the engine; only the bridge that produced
/// it knows how to interpret it.
#[derive(Debug, Clone, PartialEq)]
pub struct Selector(pub Node);

/// Context handed to a loader alongside the link being resolved.
#[derive(Debug, Clone, Default)]
pub struct LinkContext {
    pub path: Path,
}

/// Where a traversal currently stands.
#[derive(Debug, Clone, Default)]
pub struct TraversalProgress {
    pub path: Path,
    pub last_link: Option<Link>,
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Why a link load produced no bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    /// Sentinel: skip this link without failing the traversal.
    #[error("do not follow")]
    DoNotFollow,

    /// The holder declared it does not have this block.
    #[error("content missing")]
    ContentMissing,

    /// The request terminated with this load still unsatisfied.
    #[error("no further responses for this request")]
    ResponsesExhausted,

    /// Request state was released before the load resolved.
    #[error("request state released")]
    RequestCleanedUp,

    /// The request was cancelled while the load was pending.
    #[error("request cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("invalid selector spec: {0}")]
    InvalidSelectorSpec(String),

    #[error("node encoding failed: {0}")]
    Encode(String),

    #[error("node decoding failed: {0}")]
    Decode(String),

    #[error("traversal failed: {0}")]
    Traversal(String),
}

// ── Collaborator traits ───────────────────────────────────────────────────────

/// Resolves links during a traversal.
#[async_trait]
pub trait BlockLoader: Send + Sync {
    /// Load the bytes behind `link`. `Err(LoadError::DoNotFollow)` skips the
    /// link; any other error aborts the traversal.
    async fn load_link(&self, link: &Link, ctx: &LinkContext) -> Result<Bytes, LoadError>;
}

/// Observes each node a traversal visits.
#[async_trait]
pub trait TraversalVisitor: Send {
    async fn visit(&mut self, progress: &TraversalProgress, node: &Node);
}

/// Read-only access to locally held blocks. Must be safe under concurrent
/// reads; a miss is `Err(LoadError::ContentMissing)`.
pub trait BlockStore: Send + Sync + 'static {
    fn load(&self, link: &Link) -> Result<Bytes, LoadError>;
}

/// The selector machinery the engine drives. Implemented outside the engine.
#[async_trait]
pub trait GraphBridge: Send + Sync + 'static {
    /// Check whether `spec` is a well-formed rooted selector spec.
    /// Empty means valid.
    fn validate_selector_spec(&self, spec: &Node) -> Vec<BridgeError>;

    /// Encode a node for network transfer.
    fn encode_node(&self, node: &Node) -> Result<Vec<u8>, BridgeError>;

    /// Decode a node that crossed the network.
    fn decode_node(&self, bytes: &[u8]) -> Result<Node, BridgeError>;

    /// Split a rooted selector spec into its root node and compiled selector.
    fn decode_selector_spec(&self, spec: &Node) -> Result<(Node, Selector), BridgeError>;

    /// Walk the graph from `root` as directed by `selector`, resolving links
    /// through `loader` and reporting each visited node to `visitor`.
    async fn traverse(
        &self,
        loader: &dyn BlockLoader,
        root: &Node,
        selector: &Selector,
        visitor: &mut dyn TraversalVisitor,
    ) -> Result<(), BridgeError>;
}
