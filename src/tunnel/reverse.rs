//! Local reverse server.
//!
//! Each tunnel binds an HTTP server on `127.0.0.1:0`. The relay leg bridges
//! raw bytes into it, so it must accept whatever the relay speaks: HTTP/1.1
//! or cleartext HTTP/2 (prior knowledge), detected per connection.
//!
//! Every request is replayed against `127.0.0.1:<kubectl port>`:
//!
//! - pseudo-headers, `host`, and hop-by-hop headers are dropped on the way in
//!   (the upstream client sets its own `host`);
//! - hop-by-hop headers are dropped on the way out;
//! - response bodies are streamed frame by frame, never buffered.
//!
//! When the supervisor announces a new kubectl port, requests still in flight
//! against the old port are aborted: the service returns an error or the
//! body stream fails, and hyper resets the client connection or stream.

use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, CONNECTION};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// Headers that describe a single hop and must never cross the proxy.
pub const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "transfer-encoding",
    "connection",
    "keep-alive",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
];

/// Prefix of HTTP/2 pseudo-header names (`:method`, `:path`, ...).
const PSEUDO_HEADER_PREFIX: char = ':';

/// The backing kubectl proxy restarted on another port mid-request.
#[derive(Debug)]
pub struct UpstreamChanged;

impl fmt::Display for UpstreamChanged {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("kubectl proxy port changed, request aborted")
    }
}

impl std::error::Error for UpstreamChanged {}

struct ProxyContext {
    tunnel: String,
    client: Client<HttpConnector, Incoming>,
    kubectl_port: watch::Receiver<Option<u16>>,
}

/// A bound, not yet serving, reverse server.
pub struct ReverseServer {
    listener: TcpListener,
    addr: SocketAddr,
}

impl ReverseServer {
    /// Bind to an OS-assigned port on loopback.
    pub async fn bind() -> std::io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        Ok(Self { listener, addr })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Serve until `exit` fires; then stop accepting and drop every open
    /// connection.
    pub fn spawn(
        self,
        tunnel: &str,
        kubectl_port: watch::Receiver<Option<u16>>,
        exit: CancellationToken,
    ) -> JoinHandle<()> {
        let ctx = Arc::new(ProxyContext {
            tunnel: tunnel.to_string(),
            client: Client::builder(TokioExecutor::new()).build_http(),
            kubectl_port,
        });
        tokio::spawn(serve(self.listener, ctx, exit))
    }
}

async fn serve(listener: TcpListener, ctx: Arc<ProxyContext>, exit: CancellationToken) {
    let tunnel = ctx.tunnel.clone();
    let tunnel = tunnel.as_str();
    info!(
        tunnel,
        port = listener.local_addr().map(|a| a.port()).unwrap_or_default(),
        "Reverse server listening"
    );

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            () = exit.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(tunnel, %peer, "Reverse server accepted connection");
                    connections.spawn(serve_connection(stream, ctx.clone()));
                }
                Err(e) => warn!(tunnel, "Reverse server accept failed: {e}"),
            },
            // Reap finished connections so the set does not grow unbounded.
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    connections.shutdown().await;
    info!(tunnel, "Reverse server closed");
}

async fn serve_connection(stream: TcpStream, ctx: Arc<ProxyContext>) {
    let tunnel = ctx.tunnel.clone();
    let service = service_fn(move |req| forward(ctx.clone(), req));
    let builder = auto::Builder::new(TokioExecutor::new());
    if let Err(e) = builder
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        debug!(tunnel = %tunnel, "Reverse connection ended: {e}");
    }
}

/// Forward one request to the current kubectl proxy.
async fn forward(
    ctx: Arc<ProxyContext>,
    req: Request<Incoming>,
) -> Result<Response<ProxyBody>, BoxError> {
    let mut port_rx = ctx.kubectl_port.clone();
    let Some(port) = *port_rx.borrow_and_update() else {
        return Ok(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "kubectl proxy is not ready",
        ));
    };

    let (parts, body) = req.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map_or("/", |p| p.as_str());
    let Ok(uri) = format!("http://127.0.0.1:{port}{path}").parse::<Uri>() else {
        return Ok(error_response(StatusCode::BAD_REQUEST, "invalid request path"));
    };

    let mut upstream = Request::new(body);
    *upstream.method_mut() = parts.method.clone();
    *upstream.uri_mut() = uri;
    *upstream.version_mut() = Version::HTTP_11;
    *upstream.headers_mut() = sanitize_request_headers(&parts.headers);

    debug!(tunnel = %ctx.tunnel, method = %parts.method, path, port, "Forwarding");

    let response = tokio::select! {
        res = ctx.client.request(upstream) => res,
        _ = port_rx.changed() => {
            debug!(tunnel = %ctx.tunnel, path, "Upstream changed before response, aborting");
            return Err(Box::new(UpstreamChanged));
        }
    };

    let response = match response {
        Ok(r) => r,
        Err(e) => {
            warn!(tunnel = %ctx.tunnel, port, "kubectl proxy request failed: {e}");
            return Ok(error_response(
                StatusCode::BAD_GATEWAY,
                "kubectl proxy request failed",
            ));
        }
    };

    let (parts, body) = response.into_parts();
    let mut out = Response::new(abort_on_port_change(body, port_rx));
    *out.status_mut() = parts.status;
    *out.headers_mut() = sanitize_response_headers(&parts.headers);
    Ok(out)
}

/// Stream `body` until it ends, failing the stream as soon as the kubectl
/// port changes (or its publisher goes away).
fn abort_on_port_change(body: Incoming, port_rx: watch::Receiver<Option<u16>>) -> ProxyBody {
    let frames = futures::stream::unfold(Some((body, port_rx)), |state| async move {
        let (mut body, mut port_rx) = state?;
        tokio::select! {
            frame = body.frame() => match frame {
                Some(Ok(frame)) => Some((Ok(frame), Some((body, port_rx)))),
                Some(Err(e)) => Some((Err(Box::new(e) as BoxError), None)),
                None => None,
            },
            _ = port_rx.changed() => Some((Err(Box::new(UpstreamChanged) as BoxError), None)),
        }
    });
    StreamBody::new(frames).boxed_unsync()
}

fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never: Infallible| match never {})
        .boxed_unsync()
}

fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let body = serde_json::json!({ "error": message }).to_string();
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

/// Header names listed in `Connection:` are hop-by-hop for this message too.
fn connection_listed(headers: &HeaderMap) -> Vec<HeaderName> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect()
}

fn is_hop_by_hop(name: &HeaderName, listed: &[HeaderName]) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str()) || listed.contains(name)
}

/// Headers to send upstream: everything except pseudo-headers, `host`, and
/// hop-by-hop headers.
pub fn sanitize_request_headers(headers: &HeaderMap) -> HeaderMap {
    let listed = connection_listed(headers);
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if name.as_str().starts_with(PSEUDO_HEADER_PREFIX)
            || name == hyper::header::HOST
            || is_hop_by_hop(name, &listed)
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Headers to return to the client: everything except hop-by-hop headers.
pub fn sanitize_response_headers(headers: &HeaderMap) -> HeaderMap {
    let listed = connection_listed(headers);
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name, &listed) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;
    use hyper::header::HeaderValue;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Fake kubectl proxy: echoes request headers, plus a never-ending stream.
    async fn spawn_upstream() -> u16 {
        async fn echo(headers: axum::http::HeaderMap) -> axum::response::Response {
            let mut seen = serde_json::Map::new();
            for (name, value) in &headers {
                seen.insert(
                    name.to_string(),
                    value.to_str().unwrap_or_default().into(),
                );
            }
            axum::response::Response::builder()
                .header("x-upstream", "kubectl")
                .header("content-type", "application/json")
                .body(axum::body::Body::from(serde_json::Value::Object(seen).to_string()))
                .unwrap()
        }
        async fn watch_forever() -> axum::body::Body {
            let first = futures::stream::once(async { Ok::<_, Infallible>("first-chunk\n") });
            axum::body::Body::from_stream(futures::StreamExt::chain(
                first,
                futures::stream::pending(),
            ))
        }

        let app = Router::new()
            .route("/api/v1/pods", get(echo))
            .route("/api/v1/watch", get(watch_forever));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        port
    }

    async fn raw_request(port: u16, request: &str) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        String::from_utf8_lossy(&buf).into_owned()
    }

    #[test]
    fn test_request_headers_sanitized() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("abc.relay.example.com"));
        headers.insert("accept", HeaderValue::from_static("application/json"));
        headers.insert("connection", HeaderValue::from_static("keep-alive, x-hop"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-hop", HeaderValue::from_static("1"));
        headers.insert("te", HeaderValue::from_static("trailers"));
        headers.append("x-multi", HeaderValue::from_static("a"));
        headers.append("x-multi", HeaderValue::from_static("b"));

        let out = sanitize_request_headers(&headers);
        assert_eq!(out.get("accept").unwrap(), "application/json");
        assert_eq!(out.get_all("x-multi").iter().count(), 2);
        for dropped in ["host", "connection", "keep-alive", "x-hop", "te"] {
            assert!(out.get(dropped).is_none(), "{dropped} should be dropped");
        }
    }

    #[test]
    fn test_response_headers_sanitized() {
        let mut headers = HeaderMap::new();
        for name in HOP_BY_HOP_HEADERS {
            headers.insert(name, HeaderValue::from_static("x"));
        }
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("audit-id", HeaderValue::from_static("42"));

        let out = sanitize_response_headers(&headers);
        assert_eq!(out.len(), 2);
        assert_eq!(out.get("audit-id").unwrap(), "42");
    }

    #[tokio::test]
    async fn test_forwards_to_kubectl_port() {
        let upstream = spawn_upstream().await;
        let (_port_tx, port_rx) = watch::channel(Some(upstream));
        let exit = CancellationToken::new();
        let server = ReverseServer::bind().await.unwrap();
        let port = server.port();
        let task = server.spawn("t1", port_rx, exit.clone());

        let response = raw_request(
            port,
            "GET /api/v1/pods HTTP/1.1\r\nHost: abc.relay.example.com\r\nX-Custom: yes\r\nConnection: close\r\n\r\n",
        )
        .await;

        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.to_ascii_lowercase().contains("x-upstream: kubectl"));
        assert!(response.contains(r#""x-custom":"yes""#));
        assert!(response.contains(&format!(r#""host":"127.0.0.1:{upstream}""#)));

        exit.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }

    #[tokio::test]
    async fn test_unavailable_before_port_known() {
        let (_port_tx, port_rx) = watch::channel(None);
        let exit = CancellationToken::new();
        let server = ReverseServer::bind().await.unwrap();
        let port = server.port();
        server.spawn("t1", port_rx, exit.clone());

        let response = raw_request(
            port,
            "GET /api HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 503"), "{response}");
        exit.cancel();
    }

    #[tokio::test]
    async fn test_port_change_aborts_inflight_stream() {
        let upstream = spawn_upstream().await;
        let (port_tx, port_rx) = watch::channel(Some(upstream));
        let exit = CancellationToken::new();
        let server = ReverseServer::bind().await.unwrap();
        let port = server.port();
        server.spawn("t1", port_rx, exit.clone());

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream
            .write_all(b"GET /api/v1/watch HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();

        let mut received = Vec::new();
        let mut chunk = [0u8; 1024];
        while !String::from_utf8_lossy(&received).contains("first-chunk") {
            let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut chunk))
                .await
                .unwrap()
                .unwrap();
            assert!(n > 0, "stream closed before first chunk");
            received.extend_from_slice(&chunk[..n]);
        }

        port_tx.send_replace(Some(upstream));

        // The connection is torn down instead of hanging forever.
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok());
        exit.cancel();
    }
}
