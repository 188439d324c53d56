//! Freshness and cacheability rules layered on top of [`CachePolicy`].
//!
//! [`http_cache_semantics::CachePolicy`] already implements RFC 7234's
//! freshness calculations, validator bookkeeping and conditional-request
//! construction; this module adds the one thing it intentionally leaves to
//! the caller: which status codes a cache is *willing* to store at all.

use http::{Method, StatusCode};
use http_cache_semantics::CachePolicy;

use crate::entity_store::Digest;
use crate::meta_store::StoredEntry;

/// Status codes this gateway will store a response under.
///
/// `http_cache_semantics` understands a broader RFC 7231 status set (it also
/// accepts 204, 206, 303, 307, 308, 405, 414, 501 as "understood"), but a
/// gateway sitting in front of a single origin application only needs to
/// cache the responses that are worth caching: full, final representations
/// and the small set of redirects and client errors callers commonly treat
/// as cacheable. Anything else is always forwarded to the origin.
const CACHEABLE_STATUSES: &[u16] =
    &[200, 203, 300, 301, 302, 404, 410];

/// Whether `status` is one this gateway is willing to store a response
/// under, independent of any `Cache-Control` directives.
pub fn is_cacheable_status(status: StatusCode) -> bool {
    CACHEABLE_STATUSES.contains(&status.as_u16())
}

/// Whether `method` is one a response to which this gateway will store.
/// Only `GET` and `HEAD` are eligible; everything else (including `POST`,
/// even with an explicit expiration) always passes through.
pub fn is_cacheable_method(method: &Method) -> bool {
    *method == Method::GET || *method == Method::HEAD
}

/// Final storability decision: combines the method/status allowlists above
/// with everything [`CachePolicy::is_storable`] already checks (request/
/// response `no-store`, `private` on a shared cache, `Authorization`, and
/// the presence of an explicit or default freshness lifetime).
pub fn is_cacheable(
    method: &Method,
    status: StatusCode,
    policy: &CachePolicy,
) -> bool {
    is_cacheable_method(method)
        && is_cacheable_status(status)
        && policy.is_storable()
}

/// A stored entry paired with the digest of the body it describes; the unit
/// the gateway reasons about once a [`StoredEntry`] has been pulled out of
/// the meta store.
#[derive(Clone)]
pub struct CacheEntry {
    policy: CachePolicy,
    digest: Digest,
    date: String,
    status: StatusCode,
    response_headers: http::HeaderMap,
}

impl CacheEntry {
    /// Wrap a policy, digest, stored `Date`, and original response
    /// status/headers freshly computed for a response about to be stored.
    pub fn new(
        policy: CachePolicy,
        digest: Digest,
        date: String,
        status: StatusCode,
        response_headers: http::HeaderMap,
    ) -> Self {
        Self { policy, digest, date, status, response_headers }
    }

    /// The RFC 7234 policy backing this entry.
    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// The digest of the body this entry's response carries.
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// The `Date` header of the response as originally stored.
    pub fn date(&self) -> &str {
        &self.date
    }

    /// The status of the response as originally stored.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The headers of the response as originally stored.
    pub fn response_headers(&self) -> &http::HeaderMap {
        &self.response_headers
    }
}

impl From<StoredEntry> for CacheEntry {
    fn from(entry: StoredEntry) -> Self {
        Self {
            policy: entry.policy,
            digest: entry.digest,
            date: entry.date,
            status: entry.status,
            response_headers: entry.response_headers,
        }
    }
}

impl From<CacheEntry> for StoredEntry {
    fn from(entry: CacheEntry) -> Self {
        StoredEntry {
            policy: entry.policy,
            digest: entry.digest,
            date: entry.date,
            status: entry.status,
            response_headers: entry.response_headers,
        }
    }
}
