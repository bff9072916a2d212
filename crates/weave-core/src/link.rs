//! Content addressing — self-describing prefixes and the links derived
//! from them.
//!
//! A link is a prefix (version, codec, hash kind, digest length) plus the
//! digest of the block bytes. The prefix travels with every block on the
//! wire so the receiver can recompute the link from raw data alone.

use std::fmt;

use bytes::Bytes;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Current link format version.
pub const LINK_VERSION: u64 = 1;

/// Codec for raw, uninterpreted block bytes.
pub const CODEC_RAW: u64 = 0x55;

/// Codec for structured node payloads.
pub const CODEC_NODE: u64 = 0x71;

/// Multihash code for BLAKE3 — the digest this implementation computes.
pub const HASH_BLAKE3: u64 = 0x1e;

/// Digest width in bytes. All supported hash kinds produce 32 bytes.
pub const DIGEST_LEN: usize = 32;

/// Errors that can arise when interpreting link-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("truncated or malformed prefix bytes")]
    InvalidPrefix,

    #[error("unsupported hash kind: 0x{0:02x}")]
    UnsupportedHash(u64),

    #[error("declared digest length {0} does not match hash kind")]
    BadDigestLength(u64),

    #[error("digest does not match block contents")]
    DigestMismatch,
}

// ── Prefix ────────────────────────────────────────────────────────────────────

/// The self-describing head of a link: everything except the digest itself.
///
/// Byte form is four unsigned varints: version, codec, hash kind, digest
/// length. `sum` turns a prefix plus block bytes into a full [`Link`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Prefix {
    pub version: u64,
    pub codec: u64,
    pub hash: u64,
    pub digest_len: u8,
}

impl Prefix {
    /// A prefix for raw block bytes hashed with BLAKE3.
    pub fn raw() -> Self {
        Prefix {
            version: LINK_VERSION,
            codec: CODEC_RAW,
            hash: HASH_BLAKE3,
            digest_len: DIGEST_LEN as u8,
        }
    }

    /// A prefix for structured node payloads hashed with BLAKE3.
    pub fn node() -> Self {
        Prefix {
            codec: CODEC_NODE,
            ..Prefix::raw()
        }
    }

    /// Compute the link this prefix assigns to `data`.
    pub fn sum(&self, data: &[u8]) -> Result<Link, LinkError> {
        if self.hash != HASH_BLAKE3 {
            return Err(LinkError::UnsupportedHash(self.hash));
        }
        if self.digest_len as usize != DIGEST_LEN {
            return Err(LinkError::BadDigestLength(self.digest_len as u64));
        }
        Ok(Link {
            prefix: *self,
            digest: *blake3::hash(data).as_bytes(),
        })
    }

    /// Serialize to the varint byte form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8);
        put_uvarint(&mut buf, self.version);
        put_uvarint(&mut buf, self.codec);
        put_uvarint(&mut buf, self.hash);
        put_uvarint(&mut buf, self.digest_len as u64);
        buf
    }

    /// Parse the varint byte form. The entire input must be consumed.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LinkError> {
        let (prefix, rest) = Self::take(bytes)?;
        if !rest.is_empty() {
            return Err(LinkError::InvalidPrefix);
        }
        Ok(prefix)
    }

    /// Parse a prefix off the front of `bytes`, returning the remainder.
    fn take(bytes: &[u8]) -> Result<(Self, &[u8]), LinkError> {
        let (version, rest) = get_uvarint(bytes)?;
        let (codec, rest) = get_uvarint(rest)?;
        let (hash, rest) = get_uvarint(rest)?;
        let (digest_len, rest) = get_uvarint(rest)?;
        if digest_len > u8::MAX as u64 {
            return Err(LinkError::BadDigestLength(digest_len));
        }
        Ok((
            Prefix {
                version,
                codec,
                hash,
                digest_len: digest_len as u8,
            },
            rest,
        ))
    }
}

// ── Link ──────────────────────────────────────────────────────────────────────

/// A content address: prefix plus digest. Derivable from prefix + data,
/// never constructed from unverified parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Link {
    prefix: Prefix,
    digest: [u8; DIGEST_LEN],
}

impl Link {
    /// Compute the link for raw bytes under the default prefix.
    pub fn of(data: &[u8]) -> Self {
        // Prefix::raw() always hashes with a supported kind.
        Prefix::raw().sum(data).expect("raw prefix is supported")
    }

    pub fn prefix(&self) -> Prefix {
        self.prefix
    }

    pub fn digest(&self) -> &[u8; DIGEST_LEN] {
        &self.digest
    }

    /// Binary form: prefix varints followed by the digest.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = self.prefix.to_bytes();
        buf.extend_from_slice(&self.digest);
        buf
    }

    /// Parse the binary form produced by [`Link::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LinkError> {
        let (prefix, rest) = Prefix::take(bytes)?;
        if prefix.hash != HASH_BLAKE3 {
            return Err(LinkError::UnsupportedHash(prefix.hash));
        }
        if prefix.digest_len as usize != DIGEST_LEN || rest.len() != DIGEST_LEN {
            return Err(LinkError::BadDigestLength(rest.len() as u64));
        }
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(rest);
        Ok(Link { prefix, digest })
    }

    /// Verify that `data` hashes to this link.
    pub fn verify(&self, data: &[u8]) -> Result<(), LinkError> {
        let computed = self.prefix.sum(data)?;
        if computed == *self {
            Ok(())
        } else {
            Err(LinkError::DigestMismatch)
        }
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.to_bytes()))
    }
}

impl Serialize for Link {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> Deserialize<'de> for Link {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = <Vec<u8>>::deserialize(deserializer)?;
        Link::from_bytes(&bytes).map_err(de::Error::custom)
    }
}

// ── Block ─────────────────────────────────────────────────────────────────────

/// A content-addressed payload: the bytes plus the link they hash to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    link: Link,
    data: Bytes,
}

impl Block {
    /// Build a block by hashing `data` under `prefix`.
    pub fn new(prefix: Prefix, data: Bytes) -> Result<Self, LinkError> {
        let link = prefix.sum(&data)?;
        Ok(Block { link, data })
    }

    /// Build a block for a claimed link, verifying the claim.
    pub fn with_link(link: Link, data: Bytes) -> Result<Self, LinkError> {
        link.verify(&data)?;
        Ok(Block { link, data })
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }
}

// ── Varint helpers ────────────────────────────────────────────────────────────

fn put_uvarint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

fn get_uvarint(bytes: &[u8]) -> Result<(u64, &[u8]), LinkError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, &b) in bytes.iter().enumerate() {
        if shift >= 63 && b > 1 {
            return Err(LinkError::InvalidPrefix);
        }
        value |= u64::from(b & 0x7f) << shift;
        if b < 0x80 {
            return Ok((value, &bytes[i + 1..]));
        }
        shift += 7;
    }
    Err(LinkError::InvalidPrefix)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
