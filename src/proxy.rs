//! Streaming reverse proxy for one exchange at a time
//!
//! Request and response bodies are relayed frame by frame. Nothing is
//! accumulated across frames, so an event stream that never ends is
//! forwarded as it is produced.

use crate::error::{json_error_response, ErrorCode, GatewayError};
use crate::headers::{
    client_wants_close, compute_response_headers, is_event_stream_request, outbound_request_headers, CorsPolicy,
};
use crate::routes::ResolvedRoute;
use crate::upstream::{UpstreamClient, UpstreamError};
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::header::ACCEPT;
use hyper::{Request, Response, Uri};
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::{debug, warn};
use uuid::Uuid;

/// Body type of every response the gateway produces
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Forwards requests to resolved backends
pub struct StreamingProxy {
    upstream: UpstreamClient,
    cors: CorsPolicy,
    sse_path: String,
}

impl StreamingProxy {
    pub fn new(upstream: UpstreamClient, cors: CorsPolicy, sse_path: &str) -> Self {
        Self {
            upstream,
            cors,
            sse_path: sse_path.to_string(),
        }
    }

    /// Forward one request and return the client-facing response.
    ///
    /// Failures before response headers become a `502`; after that the
    /// response is already committed and a backend error only ends the body.
    pub async fn forward(&self, req: Request<Incoming>, resolved: &ResolvedRoute<'_>) -> Response<ProxyBody> {
        let exchange = Uuid::new_v4();
        let server = resolved.route.name.as_str();
        let authority = resolved.route.authority();
        let path_and_query = resolved.path_and_query(req.uri().query());
        let is_event_stream = is_event_stream_request(
            &resolved.remainder,
            req.headers().get(ACCEPT),
            &self.sse_path,
        );
        let client_close = client_wants_close(req.headers());

        debug!(
            server,
            %exchange,
            method = %req.method(),
            path = %path_and_query,
            is_event_stream,
            "Proxying request"
        );

        let outbound = match build_outbound(req, &authority, &path_and_query) {
            Ok(outbound) => outbound,
            Err(e) => {
                warn!(server, %exchange, error = %e, "Failed to build outbound request");
                return json_error_response(ErrorCode::InternalError, Some(server), e.to_string(), &self.cors);
            }
        };

        let response = match self.upstream.send(outbound).await {
            Ok(response) => response,
            Err(e) => {
                let message = e.root_cause();
                let err = GatewayError::BackendUnreachable {
                    server: server.to_string(),
                    message: message.clone(),
                };
                warn!(server, %exchange, "{}", err);
                return json_error_response(ErrorCode::BackendUnreachable, Some(server), message, &self.cors);
            }
        };

        let (parts, body) = response.into_parts();
        debug!(server, %exchange, status = %parts.status, "Backend responded");

        let headers = compute_response_headers(&parts.headers, is_event_stream, client_close, &self.cors);
        let relay = RelayBody::new(body, server, exchange);

        let mut client_response = Response::new(relay.boxed());
        *client_response.status_mut() = parts.status;
        *client_response.headers_mut() = headers;
        client_response
    }
}

fn build_outbound(
    req: Request<Incoming>,
    authority: &str,
    path_and_query: &str,
) -> Result<Request<Incoming>, UpstreamError> {
    let uri: Uri = format!("http://{}{}", authority, path_and_query)
        .parse()
        .map_err(|e| UpstreamError::Request(format!("bad uri: {}", e)))?;

    let (parts, body) = req.into_parts();
    let headers = outbound_request_headers(&parts.headers, authority)
        .map_err(|e| UpstreamError::Request(format!("bad host header: {}", e)))?;

    // The inbound body is handed over as-is and streams as the client sends it
    let mut outbound = Request::new(body);
    *outbound.method_mut() = parts.method;
    *outbound.uri_mut() = uri;
    *outbound.headers_mut() = headers;
    Ok(outbound)
}

/// Backend response body relayed to the client.
///
/// A backend error after headers ends the stream cleanly, since the status
/// line is already on the wire. Dropping the relay before the end (client
/// went away) drops the backend body, which closes that backend connection.
pub struct RelayBody {
    inner: Incoming,
    server: String,
    exchange: Uuid,
    bytes: u64,
    finished: bool,
}

impl RelayBody {
    fn new(inner: Incoming, server: &str, exchange: Uuid) -> Self {
        Self {
            inner,
            server: server.to_string(),
            exchange,
            bytes: 0,
            finished: false,
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
        if this.finished {
            return Poll::Ready(None);
        }

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.bytes += data.len() as u64;
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finished = true;
                let err = GatewayError::StreamInterrupted {
                    server: this.server.clone(),
                    message: e.to_string(),
                };
                warn!(server = %this.server, exchange = %this.exchange, bytes = this.bytes, "{}", err);
                Poll::Ready(None)
            }
            Poll::Ready(None) => {
                this.finished = true;
                debug!(server = %this.server, exchange = %this.exchange, bytes = this.bytes, "Stream complete");
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.finished || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        if self.finished {
            SizeHint::with_exact(0)
        } else {
            self.inner.size_hint()
        }
    }
}

impl Drop for RelayBody {
    fn drop(&mut self) {
        if !self.finished && !self.inner.is_end_stream() {
            debug!(
                server = %self.server,
                exchange = %self.exchange,
                bytes = self.bytes,
                "Client disconnected, closing backend stream"
            );
        }
    }
}
