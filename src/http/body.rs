//! Response body streamed from an upstream back to the caller.
//!
//! # Responsibilities
//! - Relay upstream body frames in order, without buffering
//! - Return the connection to the pool once the body is fully read
//! - Close the connection on error, timeout, or early drop
//!
//! # Design Decisions
//! - The body owns the connection lease; the exchange is over only when
//!   the last frame has been handed to the caller
//! - The exchange deadline keeps running while the body streams; hitting it
//!   mid-body ends the response with an error so the server aborts it

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Bytes;
use http_body::{Body, Frame, SizeHint};
use hyper::body::Incoming;
use tokio::time::{Instant, Sleep};

use crate::error::{BoxError, ProxyError};
use crate::upstream::Lease;

pub struct ExchangeBody {
    inner: Incoming,
    lease: Option<Lease>,
    keep_alive: bool,
    deadline: Pin<Box<Sleep>>,
    started: Instant,
    upstream: String,
}

impl ExchangeBody {
    pub fn new(
        inner: Incoming,
        lease: Lease,
        keep_alive: bool,
        started: Instant,
        deadline: Instant,
        upstream: String,
    ) -> Self {
        let mut body = Self {
            inner,
            lease: Some(lease),
            keep_alive,
            deadline: Box::pin(tokio::time::sleep_until(deadline)),
            started,
            upstream,
        };
        // Bodyless responses (204, 304, HEAD) are complete already.
        if body.inner.is_end_stream() {
            body.finish();
        }
        body
    }

    fn finish(&mut self) {
        if let Some(lease) = self.lease.take() {
            if self.keep_alive {
                lease.release();
            } else {
                lease.invalidate();
            }
        }
    }

    fn fail(&mut self) {
        if let Some(lease) = self.lease.take() {
            lease.invalidate();
        }
    }
}

impl Body for ExchangeBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        if this.lease.is_some() && this.deadline.as_mut().poll(cx).is_ready() {
            this.fail();
            tracing::warn!(upstream = %this.upstream, "Exchange deadline hit while streaming response body");
            return Poll::Ready(Some(Err(Box::new(ProxyError::UpstreamTimeout {
                upstream: this.upstream.clone(),
                elapsed_ms: this.started.elapsed().as_millis() as u64,
            }))));
        }

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if this.inner.is_end_stream() {
                    this.finish();
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.fail();
                tracing::warn!(upstream = %this.upstream, error = %e, "Upstream response body failed");
                Poll::Ready(Some(Err(Box::new(e))))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for ExchangeBody {
    fn drop(&mut self) {
        // Dropped mid-stream (caller went away): the connection still has unread bytes.
        if self.inner.is_end_stream() {
            self.finish();
        } else {
            self.fail();
        }
    }
}
