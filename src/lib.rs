#![forbid(unsafe_code, future_incompatible)]
#![deny(
    missing_docs,
    nonstandard_style,
    unused_qualifications,
    unused_import_braces,
    unused_extern_crates,
    trivial_casts,
    trivial_numeric_casts
)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! A caching gateway that sits between HTTP clients and an origin
//! application and serves responses from a local store whenever RFC 7234
//! says it's allowed to, delegating to the origin otherwise.
//!
//! This crate implements the decision algorithm — lookup, freshness,
//! conditional revalidation, storage — and nothing else. It does not parse
//! HTTP off a socket, does not ship a storage backend beyond the in-memory
//! reference ones, and does not load configuration; it consumes a
//! normalized [`http::Request`]/[`http::Response`] pair and an [`Origin`]
//! collaborator, and hands back a normalized response.
//!
//! ```
//! use std::sync::Arc;
//!
//! use http::{Request, Response};
//! use rack_gate::{
//!     async_trait, Context, ContextOptions, InMemoryEntityStore,
//!     InMemoryMetaStore, Logger, Origin, OriginRequest, OriginResponse, Result,
//! };
//!
//! struct StaticOrigin;
//!
//! #[async_trait]
//! impl Origin for StaticOrigin {
//!     async fn fetch(&self, _request: OriginRequest) -> Result<OriginResponse> {
//!         Ok(Response::builder()
//!             .status(200)
//!             .header("cache-control", "max-age=60")
//!             .body(bytes::Bytes::from_static(b"hello"))
//!             .unwrap())
//!     }
//! }
//!
//! # async fn run() -> Result<()> {
//! let meta = Arc::new(InMemoryMetaStore::new());
//! let entity = Arc::new(InMemoryEntityStore::new());
//! let mut ctx = Context::new(meta, entity, Logger::stderr(false), ContextOptions::default());
//!
//! let request = Request::builder()
//!     .method("GET")
//!     .uri("https://example.test/widgets/1")
//!     .body(bytes::Bytes::new())
//!     .unwrap();
//! let response = ctx.call(request, &StaticOrigin).await?;
//! assert_eq!(response.status(), 200);
//! # Ok(())
//! # }
//! ```
//!
//! ## Module map
//!
//! - [`context`] — the state machine: [`Context`] runs a request through
//!   pass/lookup/fetch/validate/store/deliver.
//! - [`meta_store`] — [`MetaStore`], the cache-key → stored-headers index.
//! - [`entity_store`] — [`EntityStore`], the content-addressed body store.
//! - [`cache_entry`] — cacheability rules layered on
//!   [`http_cache_semantics::CachePolicy`].
//! - [`origin`] — the [`Origin`] collaborator trait the gateway forwards to.
//! - [`logger`] — the gateway's own structured logger.
//! - [`error`] — the crate's error type.
//! - [`body`] (behind the `streaming` feature) — a single-pass body tee for
//!   storing a response while it streams to the caller.

#[cfg(feature = "streaming")]
#[cfg_attr(docsrs, doc(cfg(feature = "streaming")))]
pub mod body;
pub mod cache_entry;
pub mod context;
pub mod entity_store;
pub mod error;
pub mod logger;
pub mod meta_store;
pub mod origin;

pub use async_trait::async_trait;

#[cfg(feature = "streaming")]
#[cfg_attr(docsrs, doc(cfg(feature = "streaming")))]
pub use body::TeeBody;
pub use cache_entry::{is_cacheable, is_cacheable_method, is_cacheable_status, CacheEntry};
pub use context::{Context, ContextOptions, Event};
pub use entity_store::{Digest, EntityStore, InMemoryEntityStore};
pub use error::{GateError, Result};
pub use logger::{LogArg, Logger, MemorySink, Severity};
pub use meta_store::{cache_key, InMemoryMetaStore, MetaStore, StoredEntry};
pub use origin::{Origin, OriginRequest, OriginResponse};
