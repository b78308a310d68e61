//! Header rules for proxied exchanges
//!
//! Everything here is a pure function over header maps so the rules can be
//! checked without a socket.

use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, InvalidHeaderValue, ACCESS_CONTROL_ALLOW_HEADERS,
    ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE,
    CACHE_CONTROL, CONNECTION, CONTENT_TYPE, HOST, TRANSFER_ENCODING,
};

/// Media type of an event stream
pub const EVENT_STREAM: &str = "text/event-stream";

/// Tells nginx-style intermediaries not to buffer the response
pub const X_ACCEL_BUFFERING: &str = "x-accel-buffering";

const ALLOW_METHODS: &str = "GET, POST, PUT, PATCH, DELETE, OPTIONS";
const ALLOW_HEADERS: &str =
    "Content-Type, Authorization, Accept, Cache-Control, Last-Event-ID, Mcp-Session-Id, X-Requested-With";
const PREFLIGHT_MAX_AGE: &str = "86400";

/// Connection-scoped response headers that hyper regenerates itself
const HOP_BY_HOP: &[&str] = &["keep-alive", "proxy-connection", "te", "trailer", "upgrade"];

/// CORS headers stamped on every response the gateway produces
#[derive(Debug, Clone)]
pub struct CorsPolicy {
    origin: HeaderValue,
}

impl CorsPolicy {
    pub fn new(origin: &str) -> Result<Self, InvalidHeaderValue> {
        Ok(Self {
            origin: HeaderValue::from_str(origin)?,
        })
    }

    pub fn apply(&self, headers: &mut HeaderMap) {
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, self.origin.clone());
        headers.insert(
            ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(ALLOW_METHODS),
        );
        headers.insert(
            ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static(ALLOW_HEADERS),
        );
    }

    /// Headers for an `OPTIONS` preflight answer
    pub fn preflight_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        self.apply(&mut headers);
        headers.insert(
            ACCESS_CONTROL_MAX_AGE,
            HeaderValue::from_static(PREFLIGHT_MAX_AGE),
        );
        headers
    }
}

/// Whether a request targets an event-stream endpoint.
///
/// True when the rewritten path ends with the configured stream path or the
/// client explicitly accepts `text/event-stream`.
pub fn is_event_stream_request(
    remainder: &str,
    accept: Option<&HeaderValue>,
    sse_path: &str,
) -> bool {
    let path_match = !sse_path.is_empty()
        && sse_path != "/"
        && remainder.trim_end_matches('/').ends_with(sse_path.trim_end_matches('/'));

    let accept_match = accept
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains(EVENT_STREAM))
        .unwrap_or(false);

    path_match || accept_match
}

/// Whether the client's `Connection` header asks to close after this exchange
pub fn client_wants_close(inbound: &HeaderMap) -> bool {
    inbound
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("close"))
}

/// Headers for the outbound request: everything from the client except
/// `Host` and `Connection`, which are regenerated for the backend.
pub fn outbound_request_headers(
    inbound: &HeaderMap,
    authority: &str,
) -> Result<HeaderMap, InvalidHeaderValue> {
    let mut headers = HeaderMap::with_capacity(inbound.len() + 2);

    for (name, value) in inbound {
        if name == HOST || name == CONNECTION {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    headers.insert(HOST, HeaderValue::from_str(authority)?);
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    Ok(headers)
}

/// Final client-facing headers for a backend response.
///
/// Backend headers are copied, then CORS, caching and anti-buffering headers
/// are forced regardless of what the backend sent. Event streams without a
/// content type get `text/event-stream`. `Connection` is `keep-alive` unless
/// the client asked to close.
pub fn compute_response_headers(
    backend: &HeaderMap,
    is_event_stream: bool,
    client_close: bool,
    cors: &CorsPolicy,
) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(backend.len() + 8);

    for (name, value) in backend {
        if is_connection_scoped(name) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    cors.apply(&mut headers);
    headers.insert(
        CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-transform"),
    );
    let connection = if client_close { "close" } else { "keep-alive" };
    headers.insert(CONNECTION, HeaderValue::from_static(connection));
    headers.insert(X_ACCEL_BUFFERING, HeaderValue::from_static("no"));

    if is_event_stream && !headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(EVENT_STREAM));
    }

    headers
}

fn is_connection_scoped(name: &HeaderName) -> bool {
    name == CONNECTION
        || name == TRANSFER_ENCODING
        || HOP_BY_HOP.contains(&name.as_str())
}
