//! The proxy listener: one handler for every method and path.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{
        ws::rejection::WebSocketUpgradeRejection, ConnectInfo, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use http_body_util::BodyExt;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use log::{debug, warn};

use super::table::{RouteTable, Upstream};
use super::websocket::bridge_websocket;
use super::host::parse_host;

/// Retry backoff schedule for upstream connection failures.
const RETRY_BACKOFF: [Duration; 2] = [Duration::from_millis(50), Duration::from_millis(200)];

/// Cap on buffered request bodies (they must be replayable for retries).
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

const CORS_METHODS: &str = "GET,POST,PUT,PATCH,DELETE,OPTIONS";
const CORS_HEADERS: &str = "Content-Type, Authorization, X-Lab-Session-Id";

/// Shared state for the proxy listener.
#[derive(Clone)]
pub struct ProxyState {
    pub table: Arc<RouteTable>,
    pub base_domain: String,
    pub idle_timeout: Duration,
    client: Client<HttpConnector, Body>,
}

impl ProxyState {
    pub fn new(table: Arc<RouteTable>, base_domain: String, idle_timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            table,
            base_domain,
            idle_timeout,
            client,
        }
    }
}

/// Build the proxy router. Every request lands in the single entry
/// handler; the route table decides where it goes.
pub fn proxy_router(state: ProxyState) -> Router {
    Router::new().fallback(proxy_entry).with_state(state)
}

fn apply_cors(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(CORS_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(CORS_HEADERS),
    );
}

fn text_response(status: StatusCode, body: &'static str) -> Response {
    let mut response = (status, body).into_response();
    apply_cors(response.headers_mut());
    response
}

async fn proxy_entry(
    State(state): State<ProxyState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    req: Request<Body>,
) -> Response {
    // Preflight is answered before any routing.
    if req.method() == Method::OPTIONS {
        return text_response(StatusCode::NO_CONTENT, "");
    }

    let Some(host) = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
    else {
        return text_response(StatusCode::BAD_REQUEST, "Invalid subdomain");
    };

    let Ok((session_id, port)) = parse_host(host, &state.base_domain) else {
        return text_response(StatusCode::BAD_REQUEST, "Invalid subdomain");
    };

    let Some(upstream) = state.table.resolve(&session_id, port) else {
        return text_response(StatusCode::NOT_FOUND, "Session or port not available");
    };

    if let Ok(ws) = ws {
        let path_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let url = format!("ws://{}:{}{}", upstream.host, upstream.port, path_query);
        debug!("Proxying WebSocket for {} to {}", session_id, url);
        return ws.on_upgrade(move |socket| async move {
            if let Err(e) = bridge_websocket(socket, url).await {
                warn!("WebSocket proxy for session {} ended: {:?}", session_id, e);
            }
        });
    }

    forward_http(&state, upstream, peer, req).await
}

async fn forward_http(
    state: &ProxyState,
    upstream: Upstream,
    peer: SocketAddr,
    req: Request<Body>,
) -> Response {
    let (parts, body) = req.into_parts();

    let path_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let uri: Uri = match format!("http://{}:{}{}", upstream.host, upstream.port, path_query).parse()
    {
        Ok(uri) => uri,
        Err(e) => {
            warn!("Failed to build upstream URI: {}", e);
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal proxy error");
        }
    };

    // Bodies are buffered so connection-failure retries can replay them.
    let body_bytes = match http_body_util::Limited::new(body, MAX_BODY_BYTES)
        .collect()
        .await
    {
        Ok(collected) => collected.to_bytes(),
        Err(_) => {
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal proxy error");
        }
    };

    for attempt in 0..=RETRY_BACKOFF.len() {
        let mut builder = Request::builder().method(parts.method.clone()).uri(uri.clone());

        if let Some(headers) = builder.headers_mut() {
            for (name, value) in &parts.headers {
                if is_hop_by_hop(name.as_str()) || *name == header::HOST {
                    continue;
                }
                headers.insert(name.clone(), value.clone());
            }
            if let Ok(forwarded_for) = HeaderValue::from_str(&peer.ip().to_string()) {
                headers.insert("x-forwarded-for", forwarded_for);
            }
            if let Ok(forwarded_host) = HeaderValue::from_str(
                parts
                    .headers
                    .get(header::HOST)
                    .and_then(|h| h.to_str().ok())
                    .unwrap_or(""),
            ) {
                headers.insert("x-forwarded-host", forwarded_host);
            }
            headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
        }

        let outbound = match builder.body(Body::from(body_bytes.clone())) {
            Ok(req) => req,
            Err(e) => {
                warn!("Failed to build upstream request: {}", e);
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal proxy error");
            }
        };

        match tokio::time::timeout(state.idle_timeout, state.client.request(outbound)).await {
            Ok(Ok(upstream_response)) => {
                let mut response = upstream_response.map(Body::new);
                apply_cors(response.headers_mut());
                return response;
            }
            Ok(Err(e)) => {
                // Connection failures are retried with backoff; anything
                // that reached the upstream is not.
                if attempt < RETRY_BACKOFF.len() && e.is_connect() {
                    debug!(
                        "Upstream connect failed (attempt {}): {}; retrying",
                        attempt + 1,
                        e
                    );
                    tokio::time::sleep(RETRY_BACKOFF[attempt]).await;
                    continue;
                }
                warn!("Upstream request failed: {}", e);
                return text_response(StatusCode::BAD_GATEWAY, "Upstream unavailable");
            }
            Err(_) => {
                warn!("Upstream request timed out after {:?}", state.idle_timeout);
                return text_response(StatusCode::BAD_GATEWAY, "Upstream timeout");
            }
        }
    }

    text_response(StatusCode::BAD_GATEWAY, "Upstream unavailable")
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(!is_hop_by_hop("content-type"));
        assert!(!is_hop_by_hop("authorization"));
    }
}
