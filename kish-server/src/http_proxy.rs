//! HTTP reverse proxy for tunneled traffic.
//!
//! Each HTTP tunnel serves its hostname with a router bound to the tunnel's
//! session. Requests pass the tunnel's access checks and are then relayed
//! over a fresh multiplexed stream, one stream per request.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{
        header::{self, HeaderMap, HeaderName, HeaderValue},
        Request, Response, StatusCode,
    },
    response::IntoResponse,
    routing::any,
    Router,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use hyper_util::rt::TokioIo;
use kish_core::{is_websocket, passthrough, IpSet, TunnelSession};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use crate::config::WebsocketMode;

/// Build a plain-text error response.
pub fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(message.to_string()))
        .unwrap_or_else(|_| status.into_response())
}

/// The address a request came from.
///
/// With `trust_xff` the last `X-Forwarded-For` entry wins, since that is the
/// one appended by the proxy in front of us.
pub fn remote_ip(headers: &HeaderMap, peer: SocketAddr, trust_xff: bool) -> String {
    if trust_xff {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.rsplit(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }
    peer.ip().to_string()
}

/// Handshake headers a bridged upgrade must not copy across.
const BRIDGE_SKIP_HEADERS: [HeaderName; 6] = [
    header::HOST,
    header::CONNECTION,
    header::UPGRADE,
    header::SEC_WEBSOCKET_KEY,
    header::SEC_WEBSOCKET_VERSION,
    header::SEC_WEBSOCKET_EXTENSIONS,
];

/// One established HTTP tunnel.
pub struct HttpTunnel {
    host: String,
    session: TunnelSession,
    ip_set: IpSet,
    basic_auth: HashMap<String, String>,
    trust_xff: bool,
    websocket: WebsocketMode,
}

impl HttpTunnel {
    pub fn new(
        host: String,
        session: TunnelSession,
        ip_set: IpSet,
        basic_auth: HashMap<String, String>,
        trust_xff: bool,
        websocket: WebsocketMode,
    ) -> Self {
        Self {
            host,
            session,
            ip_set,
            basic_auth,
            trust_xff,
            websocket,
        }
    }

    /// Router serving every path of the tunnel's host.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/", any(proxy_handler))
            .route("/*path", any(proxy_handler))
            .with_state(self)
    }

    fn check_basic_auth(&self, headers: &HeaderMap) -> bool {
        if self.basic_auth.is_empty() {
            return true;
        }
        let credentials = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim_start().split_once(' '))
            .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("basic"))
            .and_then(|(_, v)| STANDARD.decode(v.trim()).ok())
            .and_then(|v| String::from_utf8(v).ok());
        let Some(credentials) = credentials else {
            return false;
        };
        match credentials.split_once(':') {
            Some((user, pass)) => self.basic_auth.get(user).is_some_and(|p| p == pass),
            None => false,
        }
    }

    async fn forward(&self, peer: SocketAddr, mut req: Request<Body>) -> Response<Body> {
        let ip = remote_ip(req.headers(), peer, self.trust_xff);
        if !self.ip_set.contains_str(&ip) {
            debug!("Rejecting {} for {}: address not allowed", ip, self.host);
            return error_response(StatusCode::FORBIDDEN, "Access from your IP is not allowed");
        }
        if !self.check_basic_auth(req.headers()) {
            let mut resp = error_response(StatusCode::UNAUTHORIZED, "Unauthorized");
            resp.headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Basic"));
            return resp;
        }

        if let Ok(value) = HeaderValue::from_str(&ip) {
            req.headers_mut().insert("x-forwarded-for", value);
        }
        req.headers_mut()
            .insert("x-forwarded-proto", HeaderValue::from_static("https"));

        let websocket = is_websocket(req.headers());
        if websocket && self.websocket == WebsocketMode::BridgeViaNewConnection {
            return self.bridge(req).await;
        }

        debug!("{} {} {} from {}", self.host, req.method(), req.uri(), ip);
        let stream = match self.session.open_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to open stream for {}: {}", self.host, e);
                return error_response(StatusCode::BAD_GATEWAY, &e.to_string());
            }
        };

        let (mut sender, conn) =
            match hyper::client::conn::http1::handshake::<_, Body>(TokioIo::new(stream)).await {
                Ok(pair) => pair,
                Err(e) => return error_response(StatusCode::BAD_GATEWAY, &e.to_string()),
            };
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!("Tunnel stream ended: {}", e);
            }
        });

        let client_upgrade = (websocket && self.websocket == WebsocketMode::Direct)
            .then(|| hyper::upgrade::on(&mut req));

        let mut resp = match sender.send_request(req).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!("Request through {} failed: {}", self.host, e);
                return error_response(StatusCode::BAD_GATEWAY, &e.to_string());
            }
        };

        if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
            let Some(client_upgrade) = client_upgrade else {
                return error_response(StatusCode::BAD_REQUEST, "WebSocket is not supported");
            };
            let tunnel_upgrade = hyper::upgrade::on(&mut resp);
            let host = self.host.clone();
            tokio::spawn(async move {
                match futures_util::future::try_join(client_upgrade, tunnel_upgrade).await {
                    Ok((client, tunnel)) => {
                        debug!("Start WebSocket passthrough for {}", host);
                        if let Err(e) = passthrough(TokioIo::new(client), TokioIo::new(tunnel)).await
                        {
                            debug!("WebSocket passthrough for {} ended: {}", host, e);
                        }
                    }
                    Err(e) => warn!("WebSocket upgrade for {} failed: {}", host, e),
                }
            });
        }

        resp.map(Body::new)
    }

    /// Relay a WebSocket upgrade by handshaking again over a new stream and
    /// splicing the two connections' messages.
    async fn bridge(&self, mut req: Request<Body>) -> Response<Body> {
        let Some(client_key) = req.headers().get(header::SEC_WEBSOCKET_KEY).cloned() else {
            return error_response(StatusCode::BAD_REQUEST, "missing Sec-WebSocket-Key");
        };

        let uri = format!(
            "ws://{}{}",
            self.host,
            req.uri().path_and_query().map(|p| p.as_str()).unwrap_or("/")
        );
        let mut inner_req = match uri.as_str().into_client_request() {
            Ok(inner_req) => inner_req,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
        };
        for (name, value) in req.headers() {
            if !BRIDGE_SKIP_HEADERS.contains(name) {
                inner_req.headers_mut().append(name.clone(), value.clone());
            }
        }
        if let Some(host) = req.headers().get(header::HOST) {
            inner_req.headers_mut().insert(header::HOST, host.clone());
        }

        let stream = match self.session.open_stream().await {
            Ok(stream) => stream,
            Err(e) => return error_response(StatusCode::BAD_GATEWAY, &e.to_string()),
        };
        let (inner_ws, inner_resp) = match tokio_tungstenite::client_async(inner_req, stream).await
        {
            Ok(pair) => pair,
            Err(e) => {
                warn!("Bridged WebSocket handshake for {} failed: {}", self.host, e);
                return error_response(StatusCode::BAD_GATEWAY, "WebSocket handshake failed");
            }
        };

        let mut builder = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
        for (name, value) in inner_resp.headers() {
            if *name != header::SEC_WEBSOCKET_ACCEPT && *name != header::SEC_WEBSOCKET_EXTENSIONS {
                builder = builder.header(name, value);
            }
        }
        let accept = derive_accept_key(client_key.as_bytes());
        let resp = match builder
            .header(header::SEC_WEBSOCKET_ACCEPT, accept)
            .body(Body::empty())
        {
            Ok(resp) => resp,
            Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        };

        let client_upgrade = hyper::upgrade::on(&mut req);
        let host = self.host.clone();
        tokio::spawn(async move {
            match client_upgrade.await {
                Ok(upgraded) => {
                    let outer_ws =
                        WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None)
                            .await;
                    debug!("Start WebSocket bridge for {}", host);
                    splice(outer_ws, inner_ws).await;
                    debug!("WebSocket bridge for {} closed", host);
                }
                Err(e) => warn!("WebSocket upgrade for {} failed: {}", host, e),
            }
        });

        resp
    }
}

/// Pass data and close messages between two WebSocket connections until
/// either one ends.
async fn splice<A, B>(a: WebSocketStream<A>, b: WebSocketStream<B>)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_tx, mut a_rx) = a.split();
    let (mut b_tx, mut b_rx) = b.split();

    let a_to_b = async {
        while let Some(Ok(msg)) = a_rx.next().await {
            if msg.is_ping() || msg.is_pong() {
                continue;
            }
            let close = msg.is_close();
            if b_tx.send(msg).await.is_err() || close {
                break;
            }
        }
        let _ = b_tx.close().await;
    };
    let b_to_a = async {
        while let Some(Ok(msg)) = b_rx.next().await {
            if msg.is_ping() || msg.is_pong() {
                continue;
            }
            let close = msg.is_close();
            if a_tx.send(msg).await.is_err() || close {
                break;
            }
        }
        let _ = a_tx.close().await;
    };

    tokio::select! {
        _ = a_to_b => {}
        _ = b_to_a => {}
    }
}

async fn proxy_handler(
    State(tunnel): State<Arc<HttpTunnel>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response<Body> {
    let mut resp = tunnel.forward(peer, req).await;
    resp.headers_mut()
        .insert("x-robots-tag", HeaderValue::from_static("none"));
    resp
}
