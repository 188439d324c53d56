//! Content-addressed storage for response bodies.
//!
//! The entity store never knows about cache keys, headers, or freshness; it
//! only maps a digest to the bytes that hash to it. That separation is what
//! lets two distinct cache keys (say, `Accept-Encoding: gzip` and `identity`
//! variants of the same resource) share one copy of an identical body.

use std::{collections::HashMap, fmt, sync::Arc};

use bytes::Bytes;
use dashmap::DashMap;

use crate::error::Result;

/// A content digest, computed with `blake3` and rendered as lowercase hex.
///
/// This is the join key between a [`crate::meta_store::StoredEntry`] and the
/// bytes held in an [`EntityStore`].
#[derive(Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Digest(String);

impl Digest {
    /// Hash `body` and return its digest, without storing anything.
    pub fn of(body: &[u8]) -> Self {
        Self::from_hash(blake3::hash(body))
    }

    pub(crate) fn from_hash(hash: blake3::Hash) -> Self {
        Self(hash.to_hex().to_string())
    }

    /// The digest rendered as lowercase hex, suitable for the
    /// `X-Content-Digest` response header.
    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Digest {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The content-addressed body store.
///
/// Bodies are written once and read many times; a digest that nothing
/// references anymore is simply unreachable, since nothing here tracks
/// refcounts or performs eviction. That is left to whatever backs a
/// production deployment (an LRU, a TTL sweep, a disk quota) and is out of
/// scope for the in-memory reference implementation in this crate.
#[async_trait::async_trait]
pub trait EntityStore: Send + Sync {
    /// Write `body`, returning the digest it can be read back under.
    ///
    /// Writing the same bytes twice is safe and idempotent: the digest is
    /// deterministic, so a second write of identical content is a no-op.
    async fn write(&self, body: Bytes) -> Result<Digest>;

    /// Read the bytes stored under `digest`, or `None` if nothing is stored
    /// there (a purge already ran, or the digest was never written).
    async fn read(&self, digest: &Digest) -> Result<Option<Bytes>>;

    /// Remove the bytes stored under `digest`, if any.
    async fn purge(&self, digest: &Digest) -> Result<()>;
}

/// An in-memory [`EntityStore`], keyed by digest, backed by a [`DashMap`] so
/// that concurrent writers for distinct digests never contend with one
/// another.
#[derive(Default, Clone)]
pub struct InMemoryEntityStore {
    bodies: Arc<DashMap<Digest, Bytes>>,
}

impl InMemoryEntityStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct bodies currently held.
    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    /// Whether the store holds no bodies.
    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }

    /// Snapshot of every digest currently stored, for diagnostics and tests.
    pub fn digests(&self) -> HashMap<Digest, usize> {
        self.bodies
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().len()))
            .collect()
    }
}

#[async_trait::async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn write(&self, body: Bytes) -> Result<Digest> {
        let digest = Digest::of(&body);
        self.bodies.entry(digest.clone()).or_insert(body);
        Ok(digest)
    }

    async fn read(&self, digest: &Digest) -> Result<Option<Bytes>> {
        Ok(self.bodies.get(digest).map(|entry| entry.value().clone()))
    }

    async fn purge(&self, digest: &Digest) -> Result<()> {
        self.bodies.remove(digest);
        Ok(())
    }
}
