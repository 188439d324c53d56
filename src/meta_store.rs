//! Storage for cache metadata: one cache key maps to an ordered list of
//! stored request/response header pairs, the classic "secondary keys" model
//! used to support `Vary` without duplicating bodies.

use std::sync::Arc;

use dashmap::DashMap;
use http::{Method, Uri};
use http_cache_semantics::CachePolicy;

use crate::entity_store::Digest;
use crate::error::Result;

/// A single header-only record kept in the meta store: everything needed to
/// decide freshness and Vary-matching for one prior response to this cache
/// key, plus the digest of the body that response stored.
///
/// Multiple `StoredEntry` values can share a cache key when the origin
/// varies its response on a header (`Accept-Encoding`, `Accept-Language`,
/// ...); the gateway walks them newest-first and serves the first one whose
/// stored request matches the incoming one.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
pub struct StoredEntry {
    /// The RFC 7234 policy captured at store time: request/response parts
    /// plus enough bookkeeping to recompute freshness and rebuild a
    /// response with a correct `Age` header at any later instant.
    pub policy: CachePolicy,
    /// Digest of the body this entry's response carried.
    pub digest: Digest,
    /// The `Date` header of the response as originally stored (or, if the
    /// origin omitted one, the time it was received), rendered in IMF-fixdate
    /// form. A hit or a 304-refreshed delivery restores this value verbatim
    /// rather than trusting whatever `CachePolicy` happens to compute, so
    /// that `Date` on a served-from-cache response always matches the
    /// response that put the entry there (or, after a refresh, the 304 that
    /// refreshed it).
    pub date: String,
    /// The status line of the response this entry was stored from. Needed
    /// to rebuild a complete response when serving a stale entry after an
    /// origin failure, since `CachePolicy` alone only reconstructs headers
    /// for a request it considers `Fresh`.
    #[serde(with = "http_serde::status_code")]
    pub status: http::StatusCode,
    /// The response headers as originally stored. Restored verbatim when
    /// serving a stale entry on origin failure, since there is no `Fresh`
    /// request to hand `CachePolicy::before_request` in that path.
    #[serde(with = "http_serde::header_map")]
    pub response_headers: http::HeaderMap,
}

/// Build the primary cache key for a request: method and request URI.
///
/// Query strings participate (two URIs differing only in query string are
/// distinct cache keys). Callers that front more than one virtual host
/// should make sure the `Uri` they pass in is in absolute form, or fold the
/// `Host` header into it themselves; a gateway with a single origin
/// typically never needs to.
pub fn cache_key(method: &Method, uri: &Uri) -> String {
    format!("{method} {uri}")
}

/// Storage for [`StoredEntry`] lists, keyed by [`cache_key`].
#[async_trait::async_trait]
pub trait MetaStore: Send + Sync {
    /// All entries stored under `key`, newest first.
    async fn lookup(&self, key: &str) -> Result<Vec<StoredEntry>>;

    /// Prepend `entry` to the list stored under `key`.
    async fn store(&self, key: &str, entry: StoredEntry) -> Result<()>;

    /// Drop every entry stored under `key`.
    async fn purge(&self, key: &str) -> Result<()>;

    /// Drop a single entry under `key`, identified by its digest, leaving
    /// any other Vary-variants untouched. Used when an entry's body fails a
    /// digest check and must be evicted without nuking its siblings.
    async fn purge_entry(&self, key: &str, digest: &Digest) -> Result<()>;

    /// A diagnostic snapshot of every entry currently held, keyed by cache
    /// key. Not on the hot path; intended for test assertions and for an
    /// operator inspecting a running gateway, not for anything the
    /// request-handling code itself should consult.
    async fn to_hash(&self) -> Result<std::collections::HashMap<String, Vec<StoredEntry>>>;
}

/// An in-memory [`MetaStore`] backed by a [`DashMap`], so lookups and
/// stores for different cache keys never block one another. Per-key
/// mutation (the append-or-replace on `store`) is still serialized, since
/// `DashMap::entry` holds the shard lock for the duration of the closure.
#[derive(Default, Clone)]
pub struct InMemoryMetaStore {
    entries: Arc<DashMap<String, Vec<StoredEntry>>>,
}

impl InMemoryMetaStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct cache keys currently holding at least one entry.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no keys at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait::async_trait]
impl MetaStore for InMemoryMetaStore {
    async fn lookup(&self, key: &str) -> Result<Vec<StoredEntry>> {
        Ok(self.entries.get(key).map(|v| v.clone()).unwrap_or_default())
    }

    async fn store(&self, key: &str, entry: StoredEntry) -> Result<()> {
        let mut list = self.entries.entry(key.to_string()).or_default();
        // A later store for an entry whose digest we already hold (a
        // revalidation that confirmed the same body) replaces it in place
        // rather than growing the list with a duplicate.
        list.retain(|existing| existing.digest != entry.digest);
        list.insert(0, entry);
        Ok(())
    }

    async fn purge(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn purge_entry(&self, key: &str, digest: &Digest) -> Result<()> {
        if let Some(mut list) = self.entries.get_mut(key) {
            list.retain(|entry| &entry.digest != digest);
        }
        Ok(())
    }

    async fn to_hash(&self) -> Result<std::collections::HashMap<String, Vec<StoredEntry>>> {
        Ok(self.entries.iter().map(|e| (e.key().clone(), e.value().clone())).collect())
    }
}
