//! Forwarding pipeline shared by the plain and secure proxies.
//!
//! # Data Flow
//! ```text
//! Request (target already resolved by plain.rs / secure.rs)
//!     → header transform (peer = client)
//!     → connect to origin (upstream.rs)
//!     → send origin-form request
//!     → header transform (peer = origin)
//!     → TrafficMonitor::observe
//!     → RelayBody back to the client
//! ```
//!
//! # Request phases
//! ```text
//! Received → HeadersTransformed → OutboundSent → Relaying → Completed
//!                                      ↘ OutboundError → ErrorResponseSent
//! any non-terminal phase → Aborted (dropped)
//! ```

use http::header::HOST;
use http::{HeaderValue, Request, Response, StatusCode, Uri, Version};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use url::Url;

use crate::capture::{CaptureSink, ObservedEvent, TrafficMonitor};
use crate::http::body::{error_response, ProxyBody, RelayBody};
use crate::http::headers::{HeaderList, HeaderTransform};
use crate::http::upstream::{UpstreamConnector, UpstreamError, UpstreamGuard};
use crate::net::connection::{ActivityGuard, ActivityTracker, ConnectionId};
use crate::net::peer::PeerRegistry;
use crate::observability::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Received,
    HeadersTransformed,
    OutboundSent,
    Relaying,
    Completed,
    OutboundError,
    ErrorResponseSent,
    Aborted,
}

impl RequestPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestPhase::Completed | RequestPhase::ErrorResponseSent | RequestPhase::Aborted
        )
    }
}

/// Current phase of one request plus its in-flight slot.
///
/// Dropping a tracker before a terminal phase records `Aborted`.
#[derive(Debug)]
pub struct PhaseTracker {
    phase: RequestPhase,
    path: &'static str,
    _activity: ActivityGuard,
    id: ConnectionId,
}

impl PhaseTracker {
    pub fn new(activity: ActivityGuard, path: &'static str) -> Self {
        let id = activity.id();
        tracing::debug!(request_id = %id, path, phase = ?RequestPhase::Received, "Request phase");
        Self {
            phase: RequestPhase::Received,
            path,
            _activity: activity,
            id,
        }
    }

    pub fn phase(&self) -> RequestPhase {
        self.phase
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Move to `next`. Terminal phases are final.
    pub fn advance(&mut self, next: RequestPhase) {
        if self.phase.is_terminal() {
            return;
        }
        tracing::debug!(request_id = %self.id, path = self.path, from = ?self.phase, to = ?next, "Request phase");
        self.phase = next;
    }
}

impl Drop for PhaseTracker {
    fn drop(&mut self) {
        if !self.phase.is_terminal() {
            self.advance(RequestPhase::Aborted);
        }
    }
}

/// Why a request could not be mapped to an origin.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetError {
    #[error("Only \"{0}:\" protocol prefix is supported")]
    UnsupportedScheme(&'static str),

    #[error("Missing Host header")]
    MissingHost,

    #[error("Invalid request target {0}")]
    Invalid(String),
}

/// Where a request is going.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub url: Url,
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn from_url(url: Url) -> Result<Self, TargetError> {
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TargetError::Invalid(url.to_string()))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| TargetError::Invalid(url.to_string()))?;
        Ok(Self { url, host, port })
    }

    /// `host[:port]` as it should appear in a synthesized `Host` header.
    pub fn authority(&self) -> String {
        match self.url.port() {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }

    /// Path and query for the outbound request line.
    pub fn origin_form(&self) -> String {
        match self.url.query() {
            Some(query) => format!("{}?{}", self.url.path(), query),
            None => self.url.path().to_string(),
        }
    }
}

/// Everything one proxy path needs to forward requests.
#[derive(Debug, Clone)]
pub struct ForwardContext {
    /// `"plain"` or `"secure"`, for logs and metrics.
    pub path: &'static str,
    pub connector: UpstreamConnector,
    pub via: String,
    pub monitor: TrafficMonitor,
    pub requests: ActivityTracker,
}

/// Answer a request the proxy could not map to an origin.
pub fn reject(ctx: &ForwardContext, error: &TargetError) -> Response<ProxyBody> {
    tracing::info!(path = ctx.path, error = %error, "Rejecting request");
    metrics::record_request(ctx.path, StatusCode::BAD_REQUEST.as_u16(), Instant::now());
    error_response(StatusCode::BAD_REQUEST, error)
}

/// Forward `request` to `target` and relay the answer.
///
/// Always yields a response; failures before the origin answers become
/// 404/500, failures after become body errors that abort the client.
pub async fn forward(
    ctx: &ForwardContext,
    client: SocketAddr,
    target: Target,
    request: Request<Incoming>,
) -> Response<ProxyBody> {
    let start = Instant::now();
    let mut phase = PhaseTracker::new(ctx.requests.track(), ctx.path);
    let method = request.method().clone();

    tracing::debug!(
        request_id = %phase.id(),
        %client,
        %method,
        url = %target.url,
        "Proxying request"
    );

    match send(ctx, client, &target, request, &mut phase).await {
        Ok(relay) => {
            tracing::debug!(
                request_id = %phase.id(),
                status = %relay.parts.status,
                capturing = relay.tap.is_some(),
                "Relaying response"
            );
            phase.advance(RequestPhase::Relaying);
            metrics::record_request(ctx.path, relay.parts.status.as_u16(), start);

            let body = RelayBody::new(relay.body, relay.tap, phase, relay.guard);
            Response::from_parts(relay.parts, body.boxed())
        }
        Err(e) => {
            phase.advance(RequestPhase::OutboundError);
            let status = e.status();
            tracing::warn!(
                request_id = %phase.id(),
                url = %target.url,
                %status,
                error = %e,
                "Origin request failed"
            );
            metrics::record_request(ctx.path, status.as_u16(), start);
            phase.advance(RequestPhase::ErrorResponseSent);
            error_response(status, e)
        }
    }
}

/// Serve HTTP/1.1 on one client connection, mapping each request with `resolve`.
///
/// `remote` is the socket peer; the real client is looked up in `peers` per
/// request, after the router has registered the splice.
pub async fn serve<I, F>(io: I, remote: SocketAddr, peers: PeerRegistry, ctx: Arc<ForwardContext>, resolve: F)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    F: Fn(&Request<Incoming>) -> Result<Target, TargetError> + Clone + Send + Sync + 'static,
{
    let path = ctx.path;
    let service = service_fn(move |request: Request<Incoming>| {
        let ctx = Arc::clone(&ctx);
        let resolve = resolve.clone();
        let client = peers.resolve(remote);
        async move {
            let response = match resolve(&request) {
                Ok(target) => forward(&ctx, client, target, request).await,
                Err(e) => reject(&ctx, &e),
            };
            Ok::<_, Infallible>(response)
        }
    });

    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(io), service)
        .await
    {
        tracing::debug!(path, %remote, error = %e, "Client connection ended with error");
    }
}

/// An origin response ready to be relayed.
struct Relay {
    parts: http::response::Parts,
    body: Incoming,
    tap: Option<CaptureSink>,
    guard: UpstreamGuard,
}

async fn send(
    ctx: &ForwardContext,
    client: SocketAddr,
    target: &Target,
    request: Request<Incoming>,
    phase: &mut PhaseTracker,
) -> Result<Relay, UpstreamError> {
    let (parts, body) = request.into_parts();
    let request_headers = HeaderList::from_header_map(&parts.headers);

    let outbound_transform = transform(&client.ip().to_string(), &ctx.via)?;
    let mut outbound_headers = outbound_transform.apply(&request_headers);
    if !outbound_headers.contains(HOST.as_str()) {
        if let Ok(host) = HeaderValue::from_str(&target.authority()) {
            outbound_headers.push(HOST.as_str(), host);
        }
    }
    phase.advance(RequestPhase::HeadersTransformed);

    let mut connection = ctx.connector.connect(&target.host, target.port).await?;

    let uri: Uri = target.origin_form().parse().map_err(http::Error::from)?;
    let mut outbound = Request::builder()
        .method(parts.method.clone())
        .uri(uri)
        .version(Version::HTTP_11)
        .body(body)?;
    *outbound.headers_mut() = outbound_headers
        .to_header_map()
        .map_err(http::Error::from)?;

    phase.advance(RequestPhase::OutboundSent);
    let response = connection
        .sender
        .send_request(outbound)
        .await
        .map_err(UpstreamError::Request)?;

    let (mut response_parts, response_body) = response.into_parts();
    let origin_headers = HeaderList::from_header_map(&response_parts.headers);
    let inbound_transform = transform(&connection.peer.ip().to_string(), &ctx.via)?;
    response_parts.headers = inbound_transform
        .apply(&origin_headers)
        .to_header_map()
        .map_err(http::Error::from)?;
    response_parts.version = Version::HTTP_11;

    let event = ObservedEvent::new(
        target.url.clone(),
        parts.method,
        response_parts.status,
        request_headers,
        origin_headers,
    );
    let tap = ctx.monitor.observe(&event).await;

    Ok(Relay {
        parts: response_parts,
        body: response_body,
        tap,
        guard: connection.guard,
    })
}

fn transform(peer: &str, via: &str) -> Result<HeaderTransform, UpstreamError> {
    HeaderTransform::new(peer, via).map_err(|e| UpstreamError::Build(http::Error::from(e)))
}
