//! The rewriting reverse proxy: transport abstraction, hook contracts, and
//! the request pipeline.
//!
//! A [`Proxy`] resolves every inbound request to a [`HostConfig`] through
//! its host mapper, rewrites the request for the upstream (outbound
//! direction), executes it over a pluggable [`Transport`], and rewrites the
//! response for the client (inbound direction). Bodies are buffered in full
//! so middleware always observes a coherent byte buffer.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{header, request, response, HeaderValue, Request, Response, StatusCode, Uri};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{BoxError, ProxyError};
use crate::host::{self, HostConfig, Origin};
use crate::mapper::HostMapper;
use crate::rewrite;

/// Response body type produced by the proxy and its transports.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Boxed future returned by [`Transport::round_trip`].
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Request middleware: runs after the outbound rewrite with the buffered
/// request body; may mutate the request head and returns the body to send.
pub type ReqMiddleware =
    Arc<dyn Fn(&mut request::Parts, &HostConfig, Bytes) -> Result<Bytes, BoxError> + Send + Sync>;

/// Response middleware: runs after the inbound rewrite with the buffered
/// response body; may mutate the response head and returns the body to
/// deliver.
pub type RespMiddleware =
    Arc<dyn Fn(&mut response::Parts, &HostConfig, Bytes) -> Result<Bytes, BoxError> + Send + Sync>;

/// Observes request-side failures (host mapper, invariants, request
/// middleware) before the 502 is produced.
pub type OnRequestError = Arc<dyn Fn(&request::Parts, &ProxyError) + Send + Sync>;

/// Observes response-side failures (transport, response middleware). A
/// returned response replaces the default 502; `None` keeps it.
pub type OnResponseError =
    Arc<dyn Fn(&ProxyError) -> Option<Response<ProxyBody>> + Send + Sync>;

/// Executes one upstream request and returns one response.
///
/// Transports are shared across requests and must be concurrency-safe. TLS,
/// pooling, and retry policy all live behind this seam.
pub trait Transport: Send + Sync {
    /// Sends the fully rewritten request to the host in its URI.
    fn round_trip(
        &self,
        request: Request<Full<Bytes>>,
    ) -> BoxFuture<Result<Response<ProxyBody>, ProxyError>>;
}

/// Default transport: one plain-HTTP/1 connection per request.
///
/// `https` upstreams need a caller-supplied transport; this one refuses
/// them rather than pretending to speak TLS.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl HttpTransport {
    /// Creates a transport with the given connect and response deadlines.
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            read_timeout,
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(30))
    }
}

impl Transport for HttpTransport {
    fn round_trip(
        &self,
        request: Request<Full<Bytes>>,
    ) -> BoxFuture<Result<Response<ProxyBody>, ProxyError>> {
        let connect_timeout = self.connect_timeout;
        let read_timeout = self.read_timeout;

        Box::pin(async move {
            let uri = request.uri().clone();
            let scheme = uri.scheme_str().unwrap_or("http");
            if scheme != "http" {
                return Err(ProxyError::transport(format!(
                    "{scheme} upstreams require a custom transport"
                )));
            }
            let host = uri
                .host()
                .ok_or_else(|| ProxyError::transport("request URI has no host"))?;
            let port = uri.port_u16().unwrap_or(80);
            let addr = format!("{host}:{port}");

            let stream = match timeout(connect_timeout, TcpStream::connect(&addr)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    return Err(ProxyError::transport(format!(
                        "failed to connect to {addr}: {e}"
                    )))
                }
                Err(_) => return Err(ProxyError::Timeout(connect_timeout)),
            };

            let io = TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| ProxyError::transport(format!("handshake with {addr} failed: {e}")))?;

            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!(error = %e, "Upstream connection error");
                }
            });

            // Origin-form request line; the socket already points at the
            // upstream and the Host header announces the target.
            let (mut parts, body) = request.into_parts();
            let path_and_query = parts
                .uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string());
            parts.uri = path_and_query
                .parse::<Uri>()
                .map_err(|e| ProxyError::transport(format!("invalid request path: {e}")))?;
            let request = Request::from_parts(parts, body);

            let response = match timeout(read_timeout, sender.send_request(request)).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    return Err(ProxyError::transport(format!(
                        "failed to send request to {addr}: {e}"
                    )))
                }
                Err(_) => return Err(ProxyError::Timeout(read_timeout)),
            };

            Ok(response.map(|body| body.boxed()))
        })
    }
}

/// The proxy façade: a standard HTTP handler around the rewrite pipeline.
///
/// Constructed over a [`HostMapper`] with builder-style options; all four
/// hooks are optional and absent hooks behave as identity.
#[derive(Clone)]
pub struct Proxy {
    mapper: Arc<dyn HostMapper>,
    transport: Arc<dyn Transport>,
    req_middleware: Option<ReqMiddleware>,
    resp_middleware: Option<RespMiddleware>,
    on_request_error: Option<OnRequestError>,
    on_response_error: Option<OnResponseError>,
    max_body_bytes: Option<usize>,
}

impl Proxy {
    /// Creates a proxy over the given host mapper with the default
    /// transport and no hooks.
    pub fn new(mapper: impl HostMapper + 'static) -> Self {
        Self {
            mapper: Arc::new(mapper),
            transport: Arc::new(HttpTransport::default()),
            req_middleware: None,
            resp_middleware: None,
            on_request_error: None,
            on_response_error: None,
            max_body_bytes: None,
        }
    }

    /// Replaces the upstream transport.
    pub fn with_transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Arc::new(transport);
        self
    }

    /// Installs the request middleware hook.
    pub fn with_req_middleware(
        mut self,
        middleware: impl Fn(&mut request::Parts, &HostConfig, Bytes) -> Result<Bytes, BoxError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.req_middleware = Some(Arc::new(middleware));
        self
    }

    /// Installs the response middleware hook.
    pub fn with_resp_middleware(
        mut self,
        middleware: impl Fn(&mut response::Parts, &HostConfig, Bytes) -> Result<Bytes, BoxError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.resp_middleware = Some(Arc::new(middleware));
        self
    }

    /// Installs the request error hook.
    pub fn with_on_request_error(
        mut self,
        hook: impl Fn(&request::Parts, &ProxyError) + Send + Sync + 'static,
    ) -> Self {
        self.on_request_error = Some(Arc::new(hook));
        self
    }

    /// Installs the response error hook.
    pub fn with_on_response_error(
        mut self,
        hook: impl Fn(&ProxyError) -> Option<Response<ProxyBody>> + Send + Sync + 'static,
    ) -> Self {
        self.on_response_error = Some(Arc::new(hook));
        self
    }

    /// Caps buffered request and response bodies.
    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = Some(limit);
        self
    }

    /// Handles one request: the exposed interface of the proxy.
    ///
    /// An `Err` is only produced when the inbound body cannot be read (the
    /// client went away); every other failure is converted to a response,
    /// consulting the error hooks on the way.
    pub async fn handle<B>(&self, request: Request<B>) -> Result<Response<ProxyBody>, B::Error>
    where
        B: hyper::body::Body<Data = Bytes>,
    {
        let (parts, body) = request.into_parts();
        let body = body.collect().await?.to_bytes();
        Ok(self.forward(parts, body).await)
    }

    /// Runs the pipeline on a buffered request.
    async fn forward(&self, mut parts: request::Parts, body: Bytes) -> Response<ProxyBody> {
        debug!(method = %parts.method, uri = %parts.uri, "Request received");

        if let Some(limit) = self.max_body_bytes {
            if body.len() > limit {
                let err = ProxyError::BodyTooLarge {
                    size: body.len(),
                    limit,
                };
                return self.request_error(&parts, err);
            }
        }

        let exposed = match host::exposed_origin(&parts) {
            Ok(origin) => origin,
            Err(e) => return self.request_error(&parts, e),
        };
        let config = match self.mapper.map(&parts) {
            Ok(config) => config,
            Err(e) => return self.request_error(&parts, ProxyError::HostMapper(e)),
        };
        if let Err(e) = config.validate() {
            return self.request_error(&parts, e);
        }

        let body = match self.direct(&mut parts, &exposed, &config, body) {
            Ok(body) => body,
            Err(e) => return self.request_error(&parts, e),
        };
        let outbound = Request::from_parts(parts, Full::new(body));

        let response = match self.transport.round_trip(outbound).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Upstream round trip failed");
                return self.response_error(e);
            }
        };

        let (mut parts, body) = response.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return self.response_error(ProxyError::transport(format!(
                    "failed to read upstream body: {e}"
                )))
            }
        };
        if let Some(limit) = self.max_body_bytes {
            if body.len() > limit {
                let err = ProxyError::BodyTooLarge {
                    size: body.len(),
                    limit,
                };
                return self.response_error(err);
            }
        }

        let body = match self.modify(&mut parts, &exposed, &config, body) {
            Ok(body) => body,
            Err(e) => return self.response_error(e),
        };

        debug!(status = %parts.status, "Response forwarded");
        Response::from_parts(parts, full_body(body))
    }

    /// Outbound direction: rewrites the request for the upstream.
    fn direct(
        &self,
        parts: &mut request::Parts,
        exposed: &Origin,
        config: &HostConfig,
        body: Bytes,
    ) -> Result<Bytes, ProxyError> {
        // The path prefix is a client-side fiction; the upstream never
        // sees it.
        let path = match &config.path_prefix {
            Some(prefix) => strip_path_prefix(parts.uri.path(), prefix),
            None => parts.uri.path(),
        };
        let path_and_query = match parts.uri.query() {
            Some(query) => format!("{path}?{query}"),
            None => path.to_string(),
        };

        parts.uri = Uri::builder()
            .scheme(config.upstream_scheme.as_str())
            .authority(config.upstream_host.as_str())
            .path_and_query(path_and_query.as_str())
            .build()
            .map_err(|e| {
                ProxyError::config_validation(format!(
                    "Cannot address upstream {}: {e}",
                    config.upstream_host
                ))
            })?;

        rewrite::strip_hop_by_hop(&mut parts.headers);
        // The exposed identity stays on this side of the hop.
        parts.headers.remove("x-forwarded-host");
        parts.headers.remove("x-forwarded-proto");

        // The connection goes to the upstream; the Host header announces
        // the target.
        let host_value = HeaderValue::from_str(&config.target_host).map_err(|_| {
            ProxyError::config_validation(format!(
                "Target host {:?} is not a valid Host header",
                config.target_host
            ))
        })?;
        parts.headers.insert(header::HOST, host_value);

        let mut body = rewrite::rewrite_request_body(body, exposed, config);
        if let Some(middleware) = &self.req_middleware {
            body = middleware(parts, config, body).map_err(ProxyError::RequestMiddleware)?;
        }
        Ok(body)
    }

    /// Inbound direction: rewrites the response for the client.
    fn modify(
        &self,
        parts: &mut response::Parts,
        exposed: &Origin,
        config: &HostConfig,
        body: Bytes,
    ) -> Result<Bytes, ProxyError> {
        if parts.status.is_redirection() {
            rewrite::rewrite_location(&mut parts.headers, exposed, config);
        }
        rewrite::rewrite_set_cookie(&mut parts.headers, exposed, config);
        rewrite::strip_hop_by_hop(&mut parts.headers);

        let mut body = rewrite::rewrite_response_body(body, exposed, config);
        if let Some(middleware) = &self.resp_middleware {
            body = middleware(parts, config, body).map_err(ProxyError::ResponseMiddleware)?;
        }
        Ok(body)
    }

    /// Reports a request-side failure and produces the 502.
    fn request_error(&self, parts: &request::Parts, err: ProxyError) -> Response<ProxyBody> {
        warn!(method = %parts.method, uri = %parts.uri, error = %err, "Request rejected");
        if let Some(hook) = &self.on_request_error {
            hook(parts, &err);
        }
        bad_gateway(&err)
    }

    /// Reports a response-side failure; the hook may substitute its own
    /// response for the 502.
    fn response_error(&self, err: ProxyError) -> Response<ProxyBody> {
        if let Some(hook) = &self.on_response_error {
            if let Some(response) = hook(&err) {
                return response;
            }
        }
        bad_gateway(&err)
    }

    /// Accepts connections on the listener and serves them forever.
    pub async fn run(&self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(address = %addr, "Proxy server listening");

        loop {
            let (stream, client_addr) = listener.accept().await?;
            let proxy = self.clone();

            tokio::spawn(async move {
                let io = TokioIo::new(stream);

                let service = service_fn(move |request| {
                    let proxy = proxy.clone();
                    async move { proxy.handle(request).await }
                });

                if let Err(e) = http1::Builder::new()
                    .preserve_header_case(true)
                    .serve_connection(io, service)
                    .await
                {
                    // Filter out common benign errors
                    let err_str = e.to_string();
                    if !err_str.contains("connection closed")
                        && !err_str.contains("broken pipe")
                        && !err_str.contains("reset by peer")
                    {
                        debug!(client = %client_addr, error = %e, "Connection error");
                    }
                }
            });
        }
    }
}

/// Strips `prefix` from `path` at a segment boundary.
fn strip_path_prefix<'a>(path: &'a str, prefix: &str) -> &'a str {
    match path.strip_prefix(prefix) {
        Some("") => "/",
        Some(rest) if rest.starts_with('/') => rest,
        _ => path,
    }
}

/// Wraps buffered bytes in the body type the connection layer expects.
pub fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

/// Creates the default error response.
fn bad_gateway(err: &ProxyError) -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(Bytes::from(format!("Bad gateway: {err}"))))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_path_prefix() {
        assert_eq!(strip_path_prefix("/foo", "/foo"), "/");
        assert_eq!(strip_path_prefix("/foo/bar", "/foo"), "/bar");
        assert_eq!(strip_path_prefix("/foobar", "/foo"), "/foobar");
        assert_eq!(strip_path_prefix("/other", "/foo"), "/other");
    }

    #[test]
    fn test_bad_gateway_response() {
        let response = bad_gateway(&ProxyError::transport("connection refused"));
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
