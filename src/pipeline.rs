//! Per-request interception pipeline
//!
//! Every request walks the same stages in order:
//!
//! 1. record the inbound request (draining `POST` bodies),
//! 2. resolve the `Host` header to an upstream address,
//! 3. replay the request against the upstream and buffer the response,
//! 4. record the response,
//! 5. relay the response to the client untouched.
//!
//! Stages 1-3 can fail. Each one consumes the previous stage's output and
//! returns a `Result`, so a failure skips everything after it and ends up in
//! the JSON failure response.

use crate::context::{ErrorRecord, RequestContext, RequestId, RequestIdGenerator};
use crate::resolver::{AddressResolver, ResolveError};
use crate::upstream::{strip_port, Upstream, UpstreamError, UpstreamResponse};
use bytes::Bytes;
use flate2::read::GzDecoder;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Body;
use hyper::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING};
use hyper::{HeaderMap, Method, Request, Response, StatusCode, Version};
use std::fmt::Display;
use std::io::Read;
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

/// Why a request could not be proxied
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("host header NOT present")]
    MissingHost,

    #[error("host to ip resolve error")]
    Resolve(#[source] ResolveError),

    #[error("{}", .0.message())]
    Upstream(#[source] UpstreamError),

    #[error("{0}")]
    Unclassified(String),
}

impl PipelineError {
    /// Client-facing record for this failure
    pub fn to_record(&self) -> ErrorRecord {
        match self {
            PipelineError::MissingHost => ErrorRecord::new(502, self.to_string()),
            PipelineError::Resolve(cause) => {
                ErrorRecord::new(502, self.to_string()).with_detail(cause.to_string())
            }
            PipelineError::Upstream(cause) => {
                ErrorRecord::new(502, cause.message()).with_detail(cause.to_string())
            }
            PipelineError::Unclassified(message) => ErrorRecord::new(500, message.clone()),
        }
    }
}

/// Request whose upstream address is known
struct Resolved {
    ctx: RequestContext,
    addr: Ipv4Addr,
}

/// Request together with the buffered upstream response
struct Proxied {
    ctx: RequestContext,
    addr: Ipv4Addr,
    response: UpstreamResponse,
}

/// The request handler behind every intercepted connection
pub struct Pipeline {
    resolver: Arc<AddressResolver>,
    upstream: Arc<dyn Upstream>,
    ids: RequestIdGenerator,
}

impl Pipeline {
    pub fn new(resolver: Arc<AddressResolver>, upstream: Arc<dyn Upstream>) -> Self {
        Self {
            resolver,
            upstream,
            ids: RequestIdGenerator::default(),
        }
    }

    pub fn resolver(&self) -> &Arc<AddressResolver> {
        &self.resolver
    }

    /// Run one request through every stage and build the client response
    pub async fn handle<B>(&self, req: Request<B>) -> Response<BoxBody<Bytes, hyper::Error>>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Display,
    {
        let id = self.ids.next_id();
        let span = info_span!("request", id = %id);

        async move {
            info!("{}", "-".repeat(30));

            match self.process(id, req).await {
                Ok(exchange) => finish(dump_response(exchange)),
                Err(e) => failure(e),
            }
        }
        .instrument(span)
        .await
    }

    async fn process<B>(&self, id: RequestId, req: Request<B>) -> Result<Proxied, PipelineError>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Display,
    {
        let ctx = dump_request(id, req).await?;
        let resolved = self.select_host(ctx).await?;
        self.proxy(resolved).await
    }

    async fn select_host(&self, ctx: RequestContext) -> Result<Resolved, PipelineError> {
        let host = ctx
            .head
            .headers
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .map(strip_port)
            .filter(|h| !h.is_empty())
            .ok_or(PipelineError::MissingHost)?
            .to_string();

        let addr = self
            .resolver
            .resolve(&host)
            .await
            .map_err(PipelineError::Resolve)?;

        debug!("{} -> {}", host, addr);
        Ok(Resolved { ctx, addr })
    }

    async fn proxy(&self, resolved: Resolved) -> Result<Proxied, PipelineError> {
        let Resolved { ctx, addr } = resolved;

        let mut builder = Request::builder()
            .method(ctx.head.method.clone())
            .uri(ctx.path())
            .version(Version::HTTP_11);

        for (key, value) in ctx.head.headers.iter() {
            // A dropped body must not keep its framing
            if ctx.body.is_none() && (*key == CONTENT_LENGTH || *key == TRANSFER_ENCODING) {
                continue;
            }
            builder = builder.header(key, value);
        }

        let request = builder
            .body(Full::new(ctx.body.clone().unwrap_or_default()))
            .map_err(|e| PipelineError::Unclassified(format!("failed to build upstream request: {}", e)))?;

        let response = self
            .upstream
            .send(addr, request)
            .await
            .map_err(PipelineError::Upstream)?;

        Ok(Proxied {
            ctx,
            addr,
            response,
        })
    }
}

async fn dump_request<B>(id: RequestId, req: Request<B>) -> Result<RequestContext, PipelineError>
where
    B: Body<Data = Bytes> + Send,
    B::Error: Display,
{
    let (head, body) = req.into_parts();
    let path = head.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    info!(">> method: {} {} {:?}", head.method, path, head.version);
    info!(">> headers:");
    log_headers(">>", &head.headers);

    // Only POST bodies are buffered and forwarded
    let body = if head.method == Method::POST {
        let data = body
            .collect()
            .await
            .map_err(|e| PipelineError::Unclassified(format!("failed to read request body: {}", e)))?
            .to_bytes();
        info!(">> data: {}", String::from_utf8_lossy(&data));
        Some(data)
    } else {
        None
    };

    Ok(RequestContext { id, head, body })
}

fn dump_response(exchange: Proxied) -> Proxied {
    let response = &exchange.response;

    info!("<< status: {}", status_line(exchange.ctx.path(), exchange.addr, response));
    info!("<< headers:");
    log_headers("<<", &response.headers);

    if !response.body.is_empty() {
        match body_text(&response.headers, &response.body) {
            Some(text) => info!("<< body: {}", text),
            None => debug!("<< body: {} bytes could not be decoded", response.body.len()),
        }
    }

    exchange
}

fn status_line(path: &str, addr: Ipv4Addr, response: &UpstreamResponse) -> String {
    format!("{:?} {} for {} (from {})", response.version, response.status, path, addr)
}

fn finish(exchange: Proxied) -> Response<BoxBody<Bytes, hyper::Error>> {
    let UpstreamResponse {
        status,
        headers,
        body,
        ..
    } = exchange.response;

    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn failure(error: PipelineError) -> Response<BoxBody<Bytes, hyper::Error>> {
    let record = error.to_record();
    warn!("request failed: {:?}", record);
    error_response(&record)
}

/// JSON error response carrying `record.code` as its status
pub fn error_response(record: &ErrorRecord) -> Response<BoxBody<Bytes, hyper::Error>> {
    let status = StatusCode::from_u16(record.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::to_vec(record).unwrap_or_default();

    let mut response = Response::new(full_body(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("application/json"));
    response
}

fn log_headers(direction: &str, headers: &HeaderMap) {
    for (name, value) in headers.iter() {
        info!("{}  {}: {}", direction, name, String::from_utf8_lossy(value.as_bytes()));
    }
}

/// Printable form of a response body, gunzipped when the response says so.
///
/// A truncated gzip stream yields whatever decoded before the cut. Returns
/// `None` when nothing at all can be decoded.
pub fn body_text(headers: &HeaderMap, body: &[u8]) -> Option<String> {
    let gzipped = headers
        .get(CONTENT_ENCODING)
        .map(|v| v.as_bytes().eq_ignore_ascii_case(b"gzip"))
        .unwrap_or(false);

    if !gzipped {
        return Some(String::from_utf8_lossy(body).into_owned());
    }

    let mut decoder = GzDecoder::new(body);
    let mut decoded = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match decoder.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => decoded.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if decoded.is_empty() {
                    return None;
                }
                debug!("gzip body ends early: {}", e);
                break;
            }
        }
    }
    Some(String::from_utf8_lossy(&decoded).into_owned())
}

fn full_body(bytes: Bytes) -> BoxBody<Bytes, hyper::Error> {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}
