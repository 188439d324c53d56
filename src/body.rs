//! A single-pass streaming body that tees origin response bytes to a
//! caller-supplied completion hook while still handing them to the caller
//! frame-by-frame.
//!
//! This lets the gateway cache a response body without buffering the whole
//! thing up front: [`TeeBody`] forwards every frame it sees unchanged, and
//! only once the upstream body reports end-of-stream does it hand the
//! accumulated bytes and their digest to `on_complete`. A body that is
//! dropped mid-stream (client disconnect, error) never calls `on_complete`,
//! so a half-received response is never written to the entity store.

use std::{
    fmt,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use http_body::{Body, Frame};
use pin_project_lite::pin_project;

use crate::entity_store::Digest;

type CompleteFn = Box<dyn FnOnce(Digest, Bytes) + Send>;

pin_project! {
    /// Wraps an upstream [`Body`], mirroring every frame to the caller while
    /// accumulating a `blake3` digest of the body on the side.
    pub struct TeeBody<B> {
        #[pin]
        inner: B,
        hasher: blake3::Hasher,
        buffer: BytesMut,
        on_complete: Option<CompleteFn>,
    }
}

impl<B> TeeBody<B> {
    /// Wrap `inner`, invoking `on_complete` with the digest and full body
    /// once `inner` reports end-of-stream without error.
    pub fn new(
        inner: B,
        on_complete: impl FnOnce(Digest, Bytes) + Send + 'static,
    ) -> Self {
        Self {
            inner,
            hasher: blake3::Hasher::new(),
            buffer: BytesMut::new(),
            on_complete: Some(Box::new(on_complete)),
        }
    }
}

impl<B> Body for TeeBody<B>
where
    B: Body<Data = Bytes> + Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        match this.inner.poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.hasher.update(data);
                    this.buffer.extend_from_slice(data);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                // Upstream failed partway through; drop the completion hook
                // so a truncated body never reaches the entity store.
                this.on_complete.take();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                if let Some(on_complete) = this.on_complete.take() {
                    let digest = Digest::from_hash(this.hasher.finalize());
                    let body = this.buffer.split().freeze();
                    on_complete(digest, body);
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}

impl<B: fmt::Debug> fmt::Debug for TeeBody<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeeBody")
            .field("inner", &self.inner)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}
