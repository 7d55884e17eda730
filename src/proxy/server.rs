use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header;
use hyper::http::uri::{Authority, PathAndQuery, Scheme};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::{TokioExecutor, TokioIo};
use native_tls::TlsConnector;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use super::stream::{BoxError, ProxyBody, RequestRelease};
use crate::balancer::Balancer;

/// HTTP body type for responses
type BoxBody = http_body_util::combinators::BoxBody<Bytes, BoxError>;

/// Deadline for a complete origin exchange. Requests to `/stream` are exempt
/// so long-lived streaming responses stay open.
const ORIGIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Reverse proxy server: accepts client connections and forwards each request
/// to a backend chosen by the configured balancer.
pub struct ProxyServer {
    balancer: Arc<dyn Balancer>,
    listen: String,
    client: HyperClient<HttpsConnector<HttpConnector>, Incoming>,
}

impl ProxyServer {
    pub fn new(balancer: Arc<dyn Balancer>, listen: String) -> Self {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.enforce_http(false);
        http.set_connect_timeout(Some(Duration::from_secs(10)));

        let tls = TlsConnector::new().expect("Failed to build TLS connector");
        let https = HttpsConnector::from((http, tls.into()));

        let client = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .set_host(true)
            .build(https);

        Self {
            balancer,
            listen,
            client,
        }
    }

    /// Start the proxy server and listen for incoming connections.
    pub async fn run(self) -> Result<()> {
        let addr: SocketAddr = self
            .listen
            .parse()
            .context(format!("Invalid listen address: {}", self.listen))?;

        let listener = TcpListener::bind(addr)
            .await
            .context(format!("Failed to bind to {}", addr))?;

        info!("proxy listening on {}", addr);

        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let server = Arc::new(self);

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let server = Arc::clone(&server);

            tokio::spawn(async move {
                let io = TokioIo::new(stream);

                let service = service_fn(move |req| {
                    let server = Arc::clone(&server);
                    async move { server.handle_request(req).await }
                });

                if let Err(e) = http1::Builder::new()
                    .keep_alive(true)
                    .serve_connection(io, service)
                    .await
                {
                    // A reset or broken pipe mid-response is the client
                    // hanging up, not a backend fault.
                    let err_str = format!("{}", e);
                    if err_str.contains("connection reset") || err_str.contains("broken pipe") {
                        info!(remote = %remote_addr, "client disconnected: {}", e);
                    } else {
                        error!("Error serving connection from {}: {}", remote_addr, e);
                    }
                }
            });
        }
    }

    /// Forward one request: select → dial → copy → release.
    async fn handle_request(&self, req: Request<Incoming>) -> Result<Response<BoxBody>> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        // Select a backend; an empty set and an all-unhealthy set are both a
        // 503 to the client.
        let backend = match self.balancer.next_backend() {
            Ok(backend) => backend,
            Err(e) => {
                warn!(method = %method, path = %path, error = %e, "no backend for request");
                return error_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "No healthy backend available",
                );
            }
        };

        let (scheme, authority) = match parse_origin(backend.url()) {
            Some(parts) => parts,
            None => {
                error!(backend = %backend.url(), "invalid backend URL");
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Invalid backend URL");
            }
        };

        // Reserve capacity. From here the release ticket guarantees the
        // in-flight decrement on every exit path.
        let mut release =
            RequestRelease::new(backend.acquire(), Arc::clone(&self.balancer), method.clone());

        debug!(
            method = %method,
            path = %path,
            backend = %backend.url(),
            in_flight = backend.in_flight(),
            "forwarding request"
        );

        let (parts, body) = req.into_parts();

        let outbound = match build_outbound(&parts, scheme, authority, body) {
            Ok(outbound) => outbound,
            Err(e) => {
                warn!(backend = %backend.url(), error = %e, "could not build outbound request");
                release.set_status(StatusCode::INTERNAL_SERVER_ERROR);
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to create proxy request",
                );
            }
        };

        // Dispatch. `/stream` gets no deadline; everything else 10 s total.
        let is_stream = path == "/stream";
        let dispatched = Instant::now();
        let result = if is_stream {
            self.client
                .request(outbound)
                .await
                .map_err(anyhow::Error::from)
        } else {
            match tokio::time::timeout(ORIGIN_TIMEOUT, self.client.request(outbound)).await {
                Ok(result) => result.map_err(anyhow::Error::from),
                Err(elapsed) => Err(anyhow::Error::from(elapsed)),
            }
        };

        let origin_response = match result {
            Ok(response) => response,
            Err(e) => {
                // Transport failure before response headers: stop sending the
                // backend traffic until a probe clears it.
                backend.set_health(false);
                error!(backend = %backend.url(), error = %e, "backend unavailable");
                release.set_status(StatusCode::BAD_GATEWAY);
                return error_response(StatusCode::BAD_GATEWAY, "Backend unavailable");
            }
        };

        let status = origin_response.status();
        release.set_status(status);

        let (origin_parts, origin_body) = origin_response.into_parts();

        let streaming = origin_parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("text/plain"))
            .unwrap_or(false);

        let copy_deadline = if is_stream {
            None
        } else {
            Some(ORIGIN_TIMEOUT.saturating_sub(dispatched.elapsed()))
        };

        let body = if streaming {
            debug!(backend = %backend.url(), "streaming response line by line");
            ProxyBody::lines(origin_body, release, copy_deadline).boxed()
        } else {
            ProxyBody::passthrough(origin_body, release, copy_deadline).boxed()
        };

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = origin_parts.headers;
        // hyper re-frames the forwarded body itself.
        response.headers_mut().remove(header::TRANSFER_ENCODING);

        Ok(response)
    }
}

/// Split a backend URL into the scheme and authority of the outbound target.
fn parse_origin(url: &str) -> Option<(Scheme, Authority)> {
    let uri: Uri = url.parse().ok()?;
    let scheme = uri.scheme().cloned()?;
    let authority = uri.authority().cloned()?;
    Some((scheme, authority))
}

/// Copy method, path, raw query, headers and body onto a request aimed at the
/// backend. Headers are cloned into an independent map; `host` comes from the
/// backend authority instead of the client.
fn build_outbound(
    parts: &hyper::http::request::Parts,
    scheme: Scheme,
    authority: Authority,
    body: Incoming,
) -> Result<Request<Incoming>> {
    let path_and_query = parts
        .uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));

    let uri = Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(path_and_query)
        .build()?;

    let mut outbound = Request::builder()
        .method(parts.method.clone())
        .uri(uri)
        .body(body)?;

    let mut headers = parts.headers.clone();
    headers.remove(header::HOST);
    headers.remove(header::TRANSFER_ENCODING);
    *outbound.headers_mut() = headers;

    Ok(outbound)
}

fn error_response(status: StatusCode, message: &str) -> Result<Response<BoxBody>> {
    Ok(Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(string_body(message))
        .unwrap())
}

fn string_body(s: &str) -> BoxBody {
    Full::new(Bytes::copy_from_slice(s.as_bytes()))
        .map_err(|never| match never {})
        .boxed()
}
