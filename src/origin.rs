//! The external collaborator: whatever application sits behind this
//! gateway.
//!
//! This mirrors the `Middleware` seam the gateway's ancestor used for the
//! HTTP client it wrapped, except the traffic runs the other way: instead
//! of forwarding a client's request out to the internet, `Origin::fetch`
//! forwards it to the single application this gateway fronts.

use http::{Request, Response};

use crate::error::Result;

/// A request/response pair not yet attached to a body type the gateway
/// cares about; origins receive and return bodies as raw bytes so the
/// gateway can digest them without caring how the origin produces them.
pub type OriginRequest = Request<bytes::Bytes>;
/// See [`OriginRequest`].
pub type OriginResponse = Response<bytes::Bytes>;

/// The origin application a [`crate::context::Context`] sits in front of.
///
/// Implementations typically wrap an HTTP client pointed at a fixed
/// upstream, an in-process application (for embedding the gateway as a
/// library), or, in tests, a scripted sequence of canned responses.
#[async_trait::async_trait]
pub trait Origin: Send + Sync {
    /// Forward `request` to the origin and return its response.
    ///
    /// An `Err` here is surfaced to the gateway's caller as-is: by default
    /// this crate does not serve a stale cached entry in place of an origin
    /// failure (see [`crate::context::ContextOptions::serve_stale_on_origin_error`]).
    async fn fetch(&self, request: OriginRequest) -> Result<OriginResponse>;
}
