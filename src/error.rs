//! The crate's unified error type, covering both the failures this gateway
//! recovers from internally (a corrupt entity, a malformed stored entry) and
//! the ones it surfaces to its caller (an unreachable origin, a malformed
//! request).

use miette::Diagnostic;
use thiserror::Error;

/// A `Result` typedef to use with the [`GateError`] type
pub type Result<T> = std::result::Result<T, GateError>;

/// A generic "error" for the caching gateway
#[derive(Error, Diagnostic, Debug)]
pub enum GateError {
    /// A general error used as a catch all for other errors via anyhow
    #[error(transparent)]
    #[diagnostic(code(rack_gate::general))]
    General(#[from] anyhow::Error),
    /// Error from http
    #[error(transparent)]
    #[diagnostic(code(rack_gate::http))]
    Http(#[from] http::Error),
    /// There was an error parsing the HTTP status code
    #[error(transparent)]
    #[diagnostic(code(rack_gate::invalid_status_code))]
    InvalidStatusCode(#[from] http::status::InvalidStatusCode),
    /// There was an error converting the header to a string
    #[error(transparent)]
    #[diagnostic(code(rack_gate::header_to_str))]
    HeaderToStr(#[from] http::header::ToStrError),
    /// There was an error parsing the HTTP method
    #[error(transparent)]
    #[diagnostic(code(rack_gate::invalid_method))]
    InvalidMethod(#[from] http::method::InvalidMethod),
    /// There was an error parsing the URI
    #[error(transparent)]
    #[diagnostic(code(rack_gate::invalid_uri))]
    InvalidUri(#[from] http::uri::InvalidUri),
    /// There was an error parsing an HTTP header value
    #[error(transparent)]
    #[diagnostic(code(rack_gate::invalid_header_value))]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),
    /// There was an error parsing an HTTP header name
    #[error(transparent)]
    #[diagnostic(code(rack_gate::invalid_header_name))]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),
    /// There was an error (de)serializing a stored entry
    #[error(transparent)]
    #[diagnostic(code(rack_gate::serde))]
    Serde(#[from] serde_json::Error),
    /// A stored entry's body digest did not match the bytes read back from
    /// the entity store. The entry is treated as a miss and purged.
    #[error("content digest mismatch for key `{0}`: entity store is corrupt or was tampered with")]
    #[diagnostic(code(rack_gate::digest_mismatch))]
    DigestMismatch(String),
    /// A record in the meta store could not be decoded into a stored entry.
    /// Treated the same way as a miss for the purposes of lookup.
    #[error("malformed stored headers for key `{0}`")]
    #[diagnostic(code(rack_gate::malformed_entry))]
    MalformedEntry(String),
    /// The origin collaborator failed. The gateway surfaces this rather than
    /// silently serving a stale entry; see the `serve_stale_on_origin_error`
    /// option if a deployment wants the opposite default.
    #[error("origin fetch failed: {0}")]
    #[diagnostic(code(rack_gate::origin))]
    Origin(String),
}
