//! The gateway's decision algorithm: lookup, freshness, conditional
//! revalidation, and storage, wired together around [`http_cache_semantics::CachePolicy`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderName, HeaderValue};
use http::{Request, Response, StatusCode};
use http_cache_semantics::{AfterResponse, BeforeRequest, CacheOptions, CachePolicy, Privacy};

use crate::cache_entry::{is_cacheable, is_cacheable_method};
use crate::entity_store::{Digest, EntityStore};
use crate::error::{GateError, Result};
use crate::logger::{LogArg, Logger};
use crate::meta_store::{cache_key, MetaStore, StoredEntry};
use crate::origin::Origin;

const CONTENT_DIGEST_HEADER: &str = "x-content-digest";

/// One of the named transitions a call through [`Context`] can fire.
///
/// A single call fires several of these in sequence (a revalidated hit
/// fires `Lookup`, `Validate`, and `Deliver`, for instance); [`Context::performed`]
/// reports whether a given transition fired at all during the most recent
/// call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// The request bypassed caching entirely (not a `GET`/`HEAD`).
    Pass,
    /// The meta store was consulted for this cache key.
    Lookup,
    /// A fresh, matching stored entry was found and served without
    /// contacting the origin.
    Hit,
    /// No usable stored entry was found.
    Miss,
    /// The origin was contacted for a fresh representation.
    Fetch,
    /// A stale stored entry was revalidated against the origin.
    Validate,
    /// A response was written to the meta/entity stores.
    Store,
    /// A response was handed back to the caller.
    Deliver,
    /// The call ended in an error.
    Error,
}

/// Tunables for a [`Context`]; the defaults match what a shared, RFC 7234
/// compliant gateway cache should do with no configuration at all.
#[derive(Debug, Clone)]
pub struct ContextOptions {
    /// Whether this cache is shared (a gateway serving many clients) or
    /// private (dedicated to one). Affects `private`/`s-maxage` handling.
    /// A gateway is shared by construction, so this defaults to `true`.
    pub shared: bool,
    /// When the origin fails while revalidating a stale entry, serve that
    /// stale entry (with a `Warning: 111` header) instead of propagating
    /// the error. Defaults to `false`: surface the error, since silently
    /// serving stale content on origin failure is a policy decision a
    /// deployment should opt into explicitly, not a default a library
    /// should assume for it.
    pub serve_stale_on_origin_error: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self { shared: true, serve_stale_on_origin_error: false }
    }
}

impl ContextOptions {
    fn cache_options(&self) -> CacheOptions {
        let privacy = if self.shared { Privacy::Shared } else { Privacy::Private };
        CacheOptions::default().privacy(privacy)
    }
}

/// Coordinates one request/response exchange through a [`MetaStore`] and
/// [`EntityStore`], deciding whether to serve from cache, revalidate, or
/// fetch fresh, and recording which [`Event`]s fired along the way.
///
/// A `Context` is built fresh for each request; the stores it wraps are
/// shared (via `Arc`) across every `Context` a gateway creates.
pub struct Context<M: MetaStore, E: EntityStore> {
    meta: Arc<M>,
    entity: Arc<E>,
    logger: Logger,
    options: ContextOptions,
    events: HashSet<Event>,
}

impl<M: MetaStore, E: EntityStore> Context<M, E> {
    /// Build a `Context` over shared stores.
    pub fn new(meta: Arc<M>, entity: Arc<E>, logger: Logger, options: ContextOptions) -> Self {
        Self { meta, entity, logger, options, events: HashSet::new() }
    }

    /// Whether `event` fired during the most recent call to
    /// [`Context::call`]. Primarily a test/diagnostic hook.
    pub fn performed(&self, event: Event) -> bool {
        self.events.contains(&event)
    }

    fn record(&mut self, event: Event) {
        self.events.insert(event);
    }

    /// Handle one request against `origin`, the single public entry point.
    pub async fn call<O: Origin>(
        &mut self,
        request: Request<bytes::Bytes>,
        origin: &O,
    ) -> Result<Response<bytes::Bytes>> {
        self.events.clear();

        let (req_parts, req_body) = request.into_parts();

        if !is_cacheable_method(&req_parts.method) || carries_private_credentials(&req_parts.headers) {
            self.record(Event::Pass);
            self.logger.debug("passing %s %p", &[
                LogArg::Str(&req_parts.method),
                LogArg::Debug(&req_parts.uri),
            ]);
            let response = origin
                .fetch(Request::from_parts(req_parts, req_body))
                .await
                .map_err(|e| self.fail(e))?;
            self.record(Event::Deliver);
            return Ok(response);
        }

        self.record(Event::Lookup);
        let key = cache_key(&req_parts.method, &req_parts.uri);
        let candidates = self.meta.lookup(&key).await?;

        let mut stale_match: Option<StoredEntry> = None;
        for candidate in candidates {
            let now = std::time::SystemTime::now();
            match candidate.policy.before_request(&req_parts, now) {
                BeforeRequest::Fresh(response_parts) => {
                    match self.read_verified(&key, &candidate.digest).await? {
                        Some(body) => {
                            self.record(Event::Hit);
                            self.logger.info("hit for %s", &[LogArg::Debug(&key)]);
                            let age = candidate.policy.age(now);
                            let response = build_response(
                                response_parts,
                                body,
                                &candidate.digest,
                                &candidate.date,
                                age,
                            )?;
                            self.record(Event::Deliver);
                            return Ok(response);
                        }
                        None => continue,
                    }
                }
                BeforeRequest::Stale { matches, .. } if matches => {
                    stale_match = Some(candidate);
                    break;
                }
                BeforeRequest::Stale { .. } => continue,
            }
        }

        if let Some(candidate) = stale_match {
            return self.validate(req_parts, req_body, candidate, origin).await;
        }

        self.record(Event::Miss);
        self.fetch_and_maybe_store(req_parts, req_body, origin).await
    }

    async fn validate<O: Origin>(
        &mut self,
        req_parts: http::request::Parts,
        req_body: bytes::Bytes,
        stale: StoredEntry,
        origin: &O,
    ) -> Result<Response<bytes::Bytes>> {
        self.record(Event::Validate);
        let now = std::time::SystemTime::now();
        let revalidation = match stale.policy.before_request(&req_parts, now) {
            BeforeRequest::Stale { request, .. } => request,
            BeforeRequest::Fresh(_) => unreachable!(
                "validate is only reached for a Stale{{matches: true}} candidate"
            ),
        };
        let key = cache_key(&req_parts.method, &req_parts.uri);

        let origin_result = origin
            .fetch(Request::from_parts(revalidation.clone(), req_body.clone()))
            .await;

        match origin_result {
            Err(e) => {
                if self.options.serve_stale_on_origin_error {
                    self.logger.warn(
                        "origin failed revalidating %s, serving stale: %s",
                        &[LogArg::Debug(&key), LogArg::Str(&e)],
                    );
                    let body = self.entity.read(&stale.digest).await?.ok_or_else(|| {
                        GateError::General(anyhow::anyhow!(
                            "stale entry for {key} lost its body"
                        ))
                    })?;
                    let response_parts = stale_response_parts(&stale);
                    let age = stale.policy.age(now);
                    let mut response =
                        build_response(response_parts, body, &stale.digest, &stale.date, age)?;
                    add_warning_111(response.headers_mut());
                    self.record(Event::Deliver);
                    Ok(response)
                } else {
                    self.record(Event::Error);
                    Err(self.fail(e))
                }
            }
            Ok(origin_response) => {
                let (res_parts, res_body) = origin_response.into_parts();
                if res_parts.status == StatusCode::NOT_MODIFIED {
                    let after = stale.policy.after_response(&req_parts, &res_parts, now);
                    let (new_policy, response_parts) = match after {
                        AfterResponse::Modified(p, parts) | AfterResponse::NotModified(p, parts) => {
                            (p, parts)
                        }
                    };
                    let refreshed_date = captured_date(&res_parts.headers, now);
                    self.record(Event::Store);
                    self.meta
                        .store(
                            &key,
                            StoredEntry {
                                policy: new_policy.clone(),
                                digest: stale.digest.clone(),
                                date: refreshed_date.clone(),
                                status: response_parts.status,
                                response_headers: response_parts.headers.clone(),
                            },
                        )
                        .await?;
                    let age = new_policy.age(now);
                    let body = self.read_verified(&key, &stale.digest).await?.unwrap_or_default();
                    let response =
                        build_response(response_parts, body, &stale.digest, &refreshed_date, age)?;
                    self.record(Event::Deliver);
                    Ok(response)
                } else {
                    self.record(Event::Fetch);
                    self.store_if_cacheable(req_parts, res_parts, res_body, &key).await
                }
            }
        }
    }

    async fn fetch_and_maybe_store<O: Origin>(
        &mut self,
        req_parts: http::request::Parts,
        req_body: bytes::Bytes,
        origin: &O,
    ) -> Result<Response<bytes::Bytes>> {
        self.record(Event::Fetch);
        let key = cache_key(&req_parts.method, &req_parts.uri);
        let mut outbound_parts = req_parts.clone();
        strip_conditional_headers(&mut outbound_parts.headers);
        let response = origin
            .fetch(Request::from_parts(outbound_parts, req_body))
            .await
            .map_err(|e| {
                self.record(Event::Error);
                self.fail(e)
            })?;
        let (res_parts, res_body) = response.into_parts();
        self.store_if_cacheable(req_parts, res_parts, res_body, &key).await
    }

    async fn store_if_cacheable(
        &mut self,
        req_parts: http::request::Parts,
        res_parts: http::response::Parts,
        res_body: bytes::Bytes,
        key: &str,
    ) -> Result<Response<bytes::Bytes>> {
        let now = std::time::SystemTime::now();
        let policy = CachePolicy::new_options(
            &req_parts,
            &res_parts,
            now,
            self.options.cache_options(),
        );

        if is_cacheable(&req_parts.method, res_parts.status, &policy) {
            self.record(Event::Store);
            let digest = self.entity.write(res_body.clone()).await?;
            let date = captured_date(&res_parts.headers, now);
            let status = res_parts.status;
            let response_headers = res_parts.headers.clone();
            self.meta
                .store(key, StoredEntry { policy, digest, date, status, response_headers })
                .await?;
            self.logger.info("stored %s", &[LogArg::Debug(&key.to_string())]);
            // A response fresh off the origin is delivered exactly as the
            // origin sent it: `Age` and `X-Content-Digest` are properties of
            // a response *served from the store*, not of the one that
            // populated it. The entry just written carries everything a
            // later hit or revalidation needs to add them then.
            self.record(Event::Deliver);
            Ok(Response::from_parts(res_parts, res_body))
        } else {
            self.record(Event::Deliver);
            Ok(Response::from_parts(res_parts, res_body))
        }
    }

    fn fail(&mut self, e: impl std::fmt::Display) -> GateError {
        self.record(Event::Error);
        GateError::Origin(e.to_string())
    }

    /// Read a stored body by digest and verify it still hashes to that
    /// digest before handing it back.
    ///
    /// A missing body (the entity store lost it, or never had it) and a
    /// body whose bytes no longer hash to the digest the meta store
    /// recorded (corruption, a tampered backend) are both treated the
    /// same way: the entry is purged and the caller sees `None`, which
    /// falls through to the next Vary candidate or, failing that, a
    /// `fetch`.
    async fn read_verified(&mut self, key: &str, digest: &Digest) -> Result<Option<bytes::Bytes>> {
        match self.entity.read(digest).await? {
            Some(body) if &Digest::of(&body) == digest => Ok(Some(body)),
            Some(_) => {
                self.logger.warn(
                    "content digest mismatch for %s, purging entry",
                    &[LogArg::Debug(&key.to_string())],
                );
                self.meta.purge_entry(key, digest).await?;
                Ok(None)
            }
            None => {
                self.logger.warn(
                    "stored entry for %s references missing body, purging",
                    &[LogArg::Debug(&key.to_string())],
                );
                self.meta.purge_entry(key, digest).await?;
                Ok(None)
            }
        }
    }
}

/// Whether `headers` carries `Authorization` or `Cookie`: a request this
/// shared gateway always treats as private and passes straight through,
/// without ever consulting either store. `CachePolicy::is_storable` would
/// already keep the *response* from being written under `Authorization`,
/// but that is not enough on its own — without this check a request that
/// happens to match an existing public entry would still be served a
/// `hit`, which is the one thing a shared cache must never do with
/// credentials on the request.
fn carries_private_credentials(headers: &http::HeaderMap) -> bool {
    headers.contains_key(http::header::AUTHORIZATION) || headers.contains_key(http::header::COOKIE)
}

/// Rebuild the response parts for a stale entry served after an origin
/// failure, directly from what was stored. There is no `Fresh`
/// `before_request` match to hand headers back here (the entry is stale by
/// construction), so the original status and headers recorded on the
/// [`StoredEntry`] are the only source of truth.
fn stale_response_parts(stale: &StoredEntry) -> http::response::Parts {
    let mut parts = Response::new(()).into_parts().0;
    parts.status = stale.status;
    parts.headers = stale.response_headers.clone();
    parts
}

/// Headers a conditional GET carries that must not be forwarded on a
/// miss-to-fetch: if the client's own request happens to be conditional
/// against a URL this gateway hasn't cached yet, relaying it unmodified
/// risks a bare `304` from the origin with no body to store.
fn strip_conditional_headers(headers: &mut http::HeaderMap) {
    headers.remove(http::header::IF_MODIFIED_SINCE);
    headers.remove(http::header::IF_NONE_MATCH);
    headers.remove(http::header::PRAGMA);
}

/// Build a response delivered from the store (a hit, or a 304-refreshed
/// entry): stamps `X-Content-Digest`, restores the originally stored
/// `Date`, and sets `Age` to `age` computed at delivery time.
fn build_response(
    mut parts: http::response::Parts,
    body: bytes::Bytes,
    digest: &Digest,
    date: &str,
    age: Duration,
) -> Result<Response<bytes::Bytes>> {
    parts.headers.insert(
        HeaderName::from_static(CONTENT_DIGEST_HEADER),
        HeaderValue::from_str(digest.as_hex())?,
    );
    parts.headers.insert(http::header::DATE, HeaderValue::from_str(date)?);
    parts.headers.insert(
        http::header::AGE,
        HeaderValue::from_str(&age.as_secs().to_string())?,
    );
    Ok(Response::from_parts(parts, body))
}

/// The `Date` a response is stored under: its own `Date` header if present
/// and parseable, otherwise `now` — the time the gateway received it.
fn captured_date(headers: &http::HeaderMap, now: std::time::SystemTime) -> String {
    headers
        .get(http::header::DATE)
        .and_then(|v| v.to_str().ok())
        .filter(|s| httpdate::parse_http_date(s).is_ok())
        .map(str::to_string)
        .unwrap_or_else(|| httpdate::fmt_http_date(now))
}

fn add_warning_111(headers: &mut http::HeaderMap) {
    headers.append(
        http::header::WARNING,
        HeaderValue::from_static(r#"111 - "Revalidation failed""#),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::{Duration as StdDuration, SystemTime};

    use http::Method;

    use crate::entity_store::InMemoryEntityStore;
    use crate::logger::Logger;
    use crate::meta_store::InMemoryMetaStore;

    /// An [`Origin`] whose responses are scripted in advance: each call to
    /// `fetch` pops the next queued outcome, or panics if the queue runs
    /// dry (a test asking the origin for one more call than it scripted).
    struct ScriptedOrigin {
        outcomes: StdMutex<VecDeque<std::result::Result<Response<bytes::Bytes>, String>>>,
        calls: AtomicUsize,
    }

    impl ScriptedOrigin {
        fn new(responses: Vec<Response<bytes::Bytes>>) -> Self {
            Self {
                outcomes: StdMutex::new(responses.into_iter().map(Ok).collect()),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing_then(responses: Vec<Response<bytes::Bytes>>) -> Self {
            let mut outcomes: VecDeque<std::result::Result<Response<bytes::Bytes>, String>> =
                VecDeque::new();
            outcomes.push_back(Err("connection reset".to_string()));
            outcomes.extend(responses.into_iter().map(Ok));
            Self { outcomes: StdMutex::new(outcomes), calls: AtomicUsize::new(0) }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Origin for ScriptedOrigin {
        async fn fetch(&self, _request: Request<bytes::Bytes>) -> Result<Response<bytes::Bytes>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.outcomes.lock().unwrap().pop_front() {
                Some(Ok(response)) => Ok(response),
                Some(Err(message)) => Err(GateError::Origin(message)),
                None => panic!("ScriptedOrigin ran out of queued responses"),
            }
        }
    }

    fn new_context() -> (Context<InMemoryMetaStore, InMemoryEntityStore>, Arc<InMemoryMetaStore>) {
        let meta = Arc::new(InMemoryMetaStore::new());
        let entity = Arc::new(InMemoryEntityStore::new());
        let ctx =
            Context::new(meta.clone(), entity, Logger::stderr(false), ContextOptions::default());
        (ctx, meta)
    }

    fn get(uri: &str) -> Request<bytes::Bytes> {
        Request::builder().method(Method::GET).uri(uri).body(bytes::Bytes::new()).unwrap()
    }

    fn get_with_header(uri: &str, name: &str, value: &str) -> Request<bytes::Bytes> {
        Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header(name, value)
            .body(bytes::Bytes::new())
            .unwrap()
    }

    fn post(uri: &str) -> Request<bytes::Bytes> {
        Request::builder().method(Method::POST).uri(uri).body(bytes::Bytes::new()).unwrap()
    }

    fn http_date(offset: StdDuration, in_the_past: bool) -> String {
        let now = SystemTime::now();
        let when = if in_the_past { now - offset } else { now + offset };
        httpdate::fmt_http_date(when)
    }

    fn origin_response(status: u16, cache_control: Option<&str>, body: &'static str) -> Response<bytes::Bytes> {
        let mut builder = Response::builder().status(status);
        if let Some(cc) = cache_control {
            builder = builder.header(http::header::CACHE_CONTROL, cc);
        }
        builder.body(bytes::Bytes::from_static(body.as_bytes())).unwrap()
    }

    #[tokio::test]
    async fn s1_non_get_request_always_passes() {
        let (mut ctx, _meta) = new_context();
        let origin = ScriptedOrigin::new(vec![origin_response(
            200,
            Some(&format!("max-age=5, expires at {}", http_date(StdDuration::from_secs(5), false))),
            "created",
        )]);

        let response = ctx.call(post("https://example.test/widgets"), &origin).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(ctx.performed(Event::Pass));
        assert!(!ctx.performed(Event::Store));
        assert!(response.headers().get(http::header::AGE).is_none());
        assert_eq!(origin.call_count(), 1);
    }

    #[tokio::test]
    async fn s2_authorization_header_always_passes() {
        let (mut ctx, _meta) = new_context();
        let origin = ScriptedOrigin::new(vec![origin_response(200, Some("max-age=60"), "secret")]);

        let request = get_with_header("https://example.test/me", "authorization", "basic foobarbaz");
        let response = ctx.call(request, &origin).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(ctx.performed(Event::Pass));
        assert!(!ctx.performed(Event::Store));
        assert!(response.headers().get(http::header::AGE).is_none());
    }

    #[tokio::test]
    async fn cookie_header_also_always_passes() {
        let (mut ctx, _meta) = new_context();
        let origin = ScriptedOrigin::new(vec![origin_response(200, Some("max-age=60"), "secret")]);

        let request = get_with_header("https://example.test/me", "cookie", "session=abc");
        let response = ctx.call(request, &origin).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(ctx.performed(Event::Pass));
        assert!(!ctx.performed(Event::Store));
    }

    #[tokio::test]
    async fn s3_303_is_never_stored() {
        let (mut ctx, meta) = new_context();
        let origin = ScriptedOrigin::new(vec![origin_response(303, Some("max-age=5"), "")]);

        let response = ctx.call(get("https://example.test/redirect"), &origin).await.unwrap();

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert!(!ctx.performed(Event::Store));
        assert!(response.headers().get(http::header::AGE).is_none());
        assert!(meta.is_empty());
    }

    #[tokio::test]
    async fn s4_no_store_is_never_stored() {
        let (mut ctx, meta) = new_context();
        let origin = ScriptedOrigin::new(vec![origin_response(200, Some("no-store"), "secret")]);

        ctx.call(get("https://example.test/widgets/1"), &origin).await.unwrap();

        assert!(!ctx.performed(Event::Store));
        assert!(meta.is_empty());
    }

    #[tokio::test]
    async fn s5_no_cache_is_stored_but_never_served_as_a_bare_hit() {
        let (mut ctx, meta) = new_context();
        let origin = ScriptedOrigin::new(vec![
            origin_response(200, Some("no-cache"), "v1"),
            origin_response(200, Some("no-cache"), "v1"),
        ]);

        ctx.call(get("https://example.test/widgets/1"), &origin).await.unwrap();
        assert!(ctx.performed(Event::Store));
        assert_eq!(meta.len(), 1);

        ctx.call(get("https://example.test/widgets/1"), &origin).await.unwrap();
        assert!(!ctx.performed(Event::Hit));
        assert_eq!(origin.call_count(), 2, "a no-cache entry must be revalidated, not served bare");
    }

    #[tokio::test]
    async fn s6_second_request_for_the_same_key_is_a_hit() {
        let (mut ctx, _meta) = new_context();
        let date = http_date(StdDuration::from_secs(5), true);
        let cache_control = format!("max-age=60");
        let mut first = origin_response(200, Some(&cache_control), "v1");
        first.headers_mut().insert(http::header::DATE, HeaderValue::from_str(&date).unwrap());
        let origin = ScriptedOrigin::new(vec![first]);

        let uri = "https://example.test/widgets/1";
        let first_response = ctx.call(get(uri), &origin).await.unwrap();
        assert!(ctx.performed(Event::Miss));
        assert!(ctx.performed(Event::Store));
        assert!(first_response.headers().get(http::header::AGE).is_none());
        assert!(first_response.headers().get("x-content-digest").is_none());

        let second_response = ctx.call(get(uri), &origin).await.unwrap();
        assert!(ctx.performed(Event::Hit));
        assert!(!ctx.performed(Event::Fetch));
        assert_eq!(origin.call_count(), 1, "a hit must not contact the origin");

        let age: u64 = second_response
            .headers()
            .get(http::header::AGE)
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(age > 0);
        assert!(second_response.headers().get("x-content-digest").is_some());
        assert_eq!(second_response.headers().get(http::header::DATE).unwrap(), &date);
    }

    #[tokio::test]
    async fn s7_a_forced_stale_entry_is_revalidated_by_a_fresh_fetch() {
        let (mut ctx, meta) = new_context();
        let uri = "https://example.test/widgets/1";
        let key = cache_key(&Method::GET, &uri.parse().unwrap());

        let first = origin_response(200, Some("max-age=60"), "v1");
        let origin = ScriptedOrigin::new(vec![first, origin_response(200, Some("max-age=60"), "v2")]);

        let first_response = ctx.call(get(uri), &origin).await.unwrap();
        assert!(ctx.performed(Event::Store));
        assert_eq!(first_response.body(), &bytes::Bytes::from_static(b"v1"));

        // Force staleness the way the store would reflect an expired entry:
        // re-derive a policy from an already-expired response and overwrite
        // the stored entry in place, keeping the same digest.
        let stored = meta.lookup(&key).await.unwrap();
        let existing = stored.into_iter().next().unwrap();
        let expired_req = get(uri).into_parts().0;
        let expired_res = Response::builder()
            .status(200)
            .header(http::header::CACHE_CONTROL, "max-age=0")
            .body(())
            .unwrap()
            .into_parts()
            .0;
        let expired_policy = CachePolicy::new(&expired_req, &expired_res);
        meta.store(
            &key,
            StoredEntry {
                policy: expired_policy,
                digest: existing.digest,
                date: existing.date,
                status: existing.status,
                response_headers: existing.response_headers,
            },
        )
        .await
        .unwrap();

        let second_response = ctx.call(get(uri), &origin).await.unwrap();

        assert!(ctx.performed(Event::Fetch));
        assert!(ctx.performed(Event::Store));
        assert!(!ctx.performed(Event::Hit));
        assert!(!ctx.performed(Event::Miss));
        assert_eq!(second_response.body(), &bytes::Bytes::from_static(b"v2"));
        assert_eq!(origin.call_count(), 2);
    }

    #[tokio::test]
    async fn origin_error_surfaces_by_default_on_revalidation() {
        let (mut ctx, meta) = new_context();
        let uri = "https://example.test/widgets/1";
        let key = cache_key(&Method::GET, &uri.parse().unwrap());

        let origin = ScriptedOrigin::failing_then(vec![]);
        // Seed a stale entry directly: policy already expired, arbitrary digest.
        let expired_req = get(uri).into_parts().0;
        let expired_res = Response::builder()
            .status(200)
            .header(http::header::CACHE_CONTROL, "max-age=0")
            .body(())
            .unwrap()
            .into_parts()
            .0;
        let policy = CachePolicy::new(&expired_req, &expired_res);
        let digest = Digest::of(b"v1");
        meta.store(
            &key,
            StoredEntry {
                policy,
                digest,
                date: http_date(StdDuration::ZERO, true),
                status: StatusCode::OK,
                response_headers: http::HeaderMap::new(),
            },
        )
        .await
        .unwrap();

        let result = ctx.call(get(uri), &origin).await;

        assert!(result.is_err());
        assert!(ctx.performed(Event::Error));
    }

    #[tokio::test]
    async fn stale_entry_is_served_with_its_original_headers_on_origin_error() {
        let meta = Arc::new(InMemoryMetaStore::new());
        let entity = Arc::new(InMemoryEntityStore::new());
        let options =
            ContextOptions { shared: true, serve_stale_on_origin_error: true };
        let mut ctx =
            Context::new(meta.clone(), entity.clone(), Logger::stderr(false), options);
        let uri = "https://example.test/widgets/1";
        let key = cache_key(&Method::GET, &uri.parse().unwrap());

        let origin = ScriptedOrigin::failing_then(vec![]);
        let expired_req = get(uri).into_parts().0;
        let expired_res = Response::builder()
            .status(200)
            .header(http::header::CACHE_CONTROL, "max-age=0")
            .header(http::header::CONTENT_TYPE, "application/json")
            .header(http::header::ETAG, "\"v1\"")
            .body(())
            .unwrap()
            .into_parts()
            .0;
        let policy = CachePolicy::new(&expired_req, &expired_res);
        let digest = entity.write(bytes::Bytes::from_static(b"v1")).await.unwrap();
        meta.store(
            &key,
            StoredEntry {
                policy,
                digest,
                date: http_date(StdDuration::ZERO, true),
                status: expired_res.status,
                response_headers: expired_res.headers.clone(),
            },
        )
        .await
        .unwrap();

        let response = ctx.call(get(uri), &origin).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(http::header::CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(response.headers().get(http::header::ETAG).unwrap(), "\"v1\"");
        assert!(response.headers().get(http::header::WARNING).is_some());
        assert_eq!(response.body(), &bytes::Bytes::from_static(b"v1"));
    }

    #[tokio::test]
    async fn conditional_headers_are_stripped_before_a_miss_is_forwarded_to_origin() {
        let (mut ctx, _meta) = new_context();
        let origin = ScriptedOrigin::new(vec![origin_response(200, Some("max-age=60"), "v1")]);

        let request = Request::builder()
            .method(Method::GET)
            .uri("https://example.test/widgets/1")
            .header(http::header::IF_NONE_MATCH, "\"stale-etag\"")
            .header(http::header::IF_MODIFIED_SINCE, http_date(StdDuration::from_secs(60), true))
            .header(http::header::PRAGMA, "no-cache")
            .body(bytes::Bytes::new())
            .unwrap();

        let response = ctx.call(request, &origin).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(ctx.performed(Event::Store), "a 200 must be cacheable on the first lookup");
    }

    #[tokio::test]
    async fn digest_mismatch_on_hit_is_treated_as_a_miss_and_purges_the_entry() {
        let (mut ctx, meta) = new_context();
        let entity = Arc::new(InMemoryEntityStore::new());
        let mut ctx = Context::new(meta.clone(), entity.clone(), Logger::stderr(false), ContextOptions::default());
        let uri = "https://example.test/widgets/1";
        let key = cache_key(&Method::GET, &uri.parse().unwrap());

        let req = get(uri).into_parts().0;
        let res = Response::builder()
            .status(200)
            .header(http::header::CACHE_CONTROL, "max-age=60")
            .body(())
            .unwrap()
            .into_parts()
            .0;
        let policy = CachePolicy::new(&req, &res);
        // Entity store never received this digest: any lookup will miss it
        // the same way a corrupted read would.
        let digest = Digest::of(b"never written");
        meta.store(
            &key,
            StoredEntry {
                policy,
                digest,
                date: http_date(StdDuration::ZERO, true),
                status: StatusCode::OK,
                response_headers: http::HeaderMap::new(),
            },
        )
        .await
        .unwrap();

        let origin = ScriptedOrigin::new(vec![origin_response(200, Some("max-age=60"), "fresh")]);
        let response = ctx.call(get(uri), &origin).await.unwrap();

        assert!(!ctx.performed(Event::Hit));
        assert!(ctx.performed(Event::Fetch));
        assert_eq!(response.body(), &bytes::Bytes::from_static(b"fresh"));
        assert!(meta.lookup(&key).await.unwrap().is_empty() || meta.lookup(&key).await.unwrap()[0].digest != Digest::of(b"never written"));
    }
}
