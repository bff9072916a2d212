//! Per-link presence metadata carried in a response's `extra` bytes.
//!
//! The responder records, for every link its traversal touched since the
//! previous frame, whether the block is present. The requester uses this to
//! distinguish "block absent" from "block delayed".

use serde::{Deserialize, Serialize};

use crate::link::Link;

/// One visited link and whether the responder holds its block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataItem {
    pub link: Link,
    pub block_present: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetadataError {
    #[error("metadata decoding failed: {0}")]
    Decode(String),

    #[error("metadata encoding failed: {0}")]
    Encode(String),
}

/// Encode an ordered metadata list.
pub fn encode(items: &[MetadataItem]) -> Result<Vec<u8>, MetadataError> {
    bincode::serialize(items).map_err(|e| MetadataError::Encode(e.to_string()))
}

/// Decode a metadata list. Empty input is an empty list, not an error.
pub fn decode(bytes: &[u8]) -> Result<Vec<MetadataItem>, MetadataError> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    bincode::deserialize(bytes).map_err(|e| MetadataError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_order() {
        let items = vec![
            MetadataItem {
                link: Link::of(b"first"),
                block_present: true,
            },
            MetadataItem {
                link: Link::of(b"second"),
                block_present: false,
            },
            MetadataItem {
                link: Link::of(b"third"),
                block_present: true,
            },
        ];
        let encoded = encode(&items).unwrap();
        assert_eq!(decode(&encoded).unwrap(), items);
    }

    #[test]
    fn empty_bytes_decode_to_empty_list() {
        assert_eq!(decode(&[]).unwrap(), Vec::new());
    }

    #[test]
    fn empty_list_round_trips() {
        let encoded = encode(&[]).unwrap();
        assert_eq!(decode(&encoded).unwrap(), Vec::new());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(decode(&[0xff; 3]).is_err());
    }
}
