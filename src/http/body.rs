//! Response bodies produced by the proxy.
//!
//! [`RelayBody`] streams the origin body to the client and mirrors each data
//! chunk into an optional capture sink. It owns everything the exchange
//! holds open, so dropping it (client gone, or body finished) releases the
//! origin connection and marks the request done.

use bytes::Bytes;
use http::{Response, StatusCode};
use http_body::{Body, Frame, SizeHint};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::capture::CaptureSink;
use crate::http::forward::{PhaseTracker, RequestPhase};
use crate::http::upstream::UpstreamGuard;

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn full(text: impl Into<Bytes>) -> ProxyBody {
    Full::new(text.into()).map_err(|never| match never {}).boxed()
}

/// Plain-text response generated by the proxy itself.
pub fn error_response(status: StatusCode, message: impl std::fmt::Display) -> Response<ProxyBody> {
    let mut response = Response::new(full(format!("{}\n", message)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

pub struct RelayBody {
    inner: Incoming,
    tap: Option<CaptureSink>,
    phase: PhaseTracker,
    _upstream: UpstreamGuard,
}

impl RelayBody {
    pub fn new(inner: Incoming, tap: Option<CaptureSink>, mut phase: PhaseTracker, upstream: UpstreamGuard) -> Self {
        // Empty bodies may never be polled.
        let tap = if inner.is_end_stream() {
            phase.advance(RequestPhase::Completed);
            None
        } else {
            tap
        };
        Self {
            inner,
            tap,
            phase,
            _upstream: upstream,
        }
    }

    fn tee(&mut self, chunk: &Bytes) {
        if let Some(tap) = &self.tap {
            if !tap.offer(chunk) {
                self.tap = None;
            }
        }
    }
}

impl Body for RelayBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.tee(data);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                tracing::debug!(error = %e, "Origin body failed mid-stream");
                this.tap = None;
                this.phase.advance(RequestPhase::Aborted);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                // Closing the channel lets the writer finish.
                this.tap = None;
                this.phase.advance(RequestPhase::Completed);
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
