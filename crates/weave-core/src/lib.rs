//! weave-core — shared protocol types for the weave block-graph sync
//! protocol. All other weave crates depend on this one.

pub mod bridge;
pub mod link;
pub mod message;
pub mod metadata;
pub mod peer;

pub use bridge::{
    BlockLoader, BlockStore, BridgeError, GraphBridge, LinkContext, LoadError, Node, Path,
    Selector, TraversalProgress, TraversalVisitor,
};
pub use link::{Block, Link, LinkError, Prefix};
pub use message::{
    Message, Priority, Request, RequestId, Response, ResponseStatus, WireError, MESSAGE_SIZE_MAX,
};
pub use metadata::MetadataItem;
pub use peer::PeerId;
