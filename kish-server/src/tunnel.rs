//! Tunnel establishment and the control endpoints.
//!
//! `/proxy2` creates an HTTP tunnel and `/proxy1` a raw TCP one. Both check
//! the bearer token before anything else and only then upgrade the
//! connection to a WebSocket, which carries the tunnel's multiplexed session
//! until either side closes it.

use axum::{
    body::Body,
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{HeaderMap, HeaderValue, Response, StatusCode},
    routing::get,
    Router,
};
use kish_core::error::{ErrorCategory, ERROR_MESSAGE_HEADER};
use kish_core::{
    IpSet, RoutingError, TunnelError, TunnelSession, WsPipe, HTTP_TUNNEL_PATH,
    KISH_ALLOW_IP_HEADER, KISH_URL_HEADER, TCP_TUNNEL_PATH,
};
use rand::Rng;
use regex::Regex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::http_proxy::{error_response, remote_ip, HttpTunnel};
use crate::router::normalize_host;
use crate::server::KishServer;
use crate::tcp_proxy;

const RANDOM_HOST_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const RANDOM_HOST_LEN: usize = 4;

/// Picks and validates tunnel hostnames under the public domain suffix.
pub struct HostNamer {
    suffix: String,
    label: Regex,
}

impl HostNamer {
    pub fn new(suffix: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            suffix: suffix.to_ascii_lowercase(),
            label: Regex::new("^[a-z0-9][-a-z0-9]*$")?,
        })
    }

    /// The requested host if it is acceptable, or a random one if none was
    /// requested.
    pub fn resolve(&self, requested: Option<&str>, remote_ip: &str) -> Result<String, RoutingError> {
        let Some(requested) = requested else {
            return Ok(self.random(remote_ip));
        };
        let host = requested.to_ascii_lowercase();
        match host.strip_suffix(&self.suffix) {
            Some(label) if self.label.is_match(label) => Ok(host),
            _ => Err(RoutingError::InvalidHostname(requested.to_string())),
        }
    }

    fn random(&self, remote_ip: &str) -> String {
        let mut rng = rand::thread_rng();
        let prefix: String = (0..RANDOM_HOST_LEN)
            .map(|_| RANDOM_HOST_CHARS[rng.gen_range(0..RANDOM_HOST_CHARS.len())] as char)
            .collect();
        format!("{}-{}{}", prefix, remote_ip.replace(['.', ':'], "-"), self.suffix)
    }
}

/// Router for the server's own hostname.
pub fn control_router(server: Arc<KishServer>) -> Router {
    Router::new()
        .route(TCP_TUNNEL_PATH, get(tcp_tunnel_handler))
        .route(HTTP_TUNNEL_PATH, get(http_tunnel_handler))
        .route("/health", get(health_handler))
        .with_state(server)
}

async fn health_handler() -> &'static str {
    "OK"
}

/// Error response for a refused tunnel request.
fn rejection(err: TunnelError) -> Response<Body> {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let message = err.client_message();
    let body = match (err.category(), &message) {
        (ErrorCategory::Authentication, _) => "Unauthorized".to_string(),
        (_, Some(message)) => message.clone(),
        (_, None) => status.canonical_reason().unwrap_or("error").to_string(),
    };
    let mut resp = error_response(status, &body);
    if let Some(message) = message {
        set_header(&mut resp, ERROR_MESSAGE_HEADER, &message);
    }
    resp
}

fn set_header(resp: &mut Response<Body>, name: &'static str, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            resp.headers_mut().insert(name, value);
        }
        Err(_) => warn!("Dropping invalid {} header value {:?}", name, value),
    }
}

/// Unregisters the host and closes the session however the tunnel ends.
struct TunnelCleanup {
    server: Arc<KishServer>,
    host: Option<String>,
    session: TunnelSession,
}

impl Drop for TunnelCleanup {
    fn drop(&mut self) {
        if let Some(host) = &self.host {
            self.server.router().unregister(host);
        }
        self.session.close();
    }
}

async fn http_tunnel_handler(
    State(server): State<Arc<KishServer>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response<Body> {
    let claims = match server.authorize(&headers) {
        Ok(claims) => claims,
        Err(e) => {
            warn!("Rejected HTTP tunnel request from {}: {}", peer, e);
            return rejection(e.into());
        }
    };

    let ip = remote_ip(&headers, peer, server.config().trust_x_forwarded_for);
    let host = match server.namer().resolve(claims.params.requested_host(), &ip) {
        Ok(host) => host,
        Err(e) => {
            info!("Rejected HTTP tunnel request from {}: {}", ip, e);
            return rejection(e.into());
        }
    };
    if server.router().is_registered(&host) {
        info!("Host {} is occupied", host);
        return rejection(RoutingError::HostOccupied(host).into());
    }

    let Some(ws) = ws else {
        return error_response(StatusCode::BAD_REQUEST, "WebSocket upgrade required");
    };

    let mut ip_set = IpSet::from_cidrs(&claims.params.allow_ip);
    if claims.params.allow_my_ip {
        match ip.parse::<IpAddr>() {
            Ok(addr) => ip_set.add_host(addr),
            Err(_) => warn!("Cannot allow unparsable address {:?}", ip),
        }
    }

    let kish_url = format!("https://{}", host);
    let allow_ip = ip_set.to_string();
    let basic_auth = claims.params.basic_auth;
    debug!("Upgrading HTTP tunnel for {} (allow: {})", host, allow_ip);

    let mut resp =
        ws.on_upgrade(move |socket| serve_http_tunnel(server, socket, host, ip_set, basic_auth));
    set_header(&mut resp, KISH_URL_HEADER, &kish_url);
    set_header(&mut resp, KISH_ALLOW_IP_HEADER, &allow_ip);
    resp
}

async fn serve_http_tunnel(
    server: Arc<KishServer>,
    socket: WebSocket,
    host: String,
    ip_set: IpSet,
    basic_auth: HashMap<String, String>,
) {
    let _tracked = server.shutdown().register_tunnel();
    let session = TunnelSession::server(WsPipe::new(socket));
    let tunnel = Arc::new(HttpTunnel::new(
        host.clone(),
        session.clone(),
        ip_set,
        basic_auth,
        server.config().trust_x_forwarded_for,
        server.config().websocket_handler,
    ));

    // The occupancy check ran before the upgrade; a concurrent request may
    // have taken the host since, and then this connection is dropped.
    if let Err(e) = server
        .router()
        .register(&host, Arc::new(move || tunnel.clone().router()))
    {
        warn!("Failed to register {}: {}", host, e);
        session.close();
        return;
    }
    let _cleanup = TunnelCleanup {
        server: server.clone(),
        host: Some(host.clone()),
        session: session.clone(),
    };

    info!("Tunnel for {} has been established", host);
    tokio::select! {
        _ = session.closed() => info!("Tunnel for {} closed", host),
        _ = server.shutdown().wait() => info!("Closing tunnel for {} on shutdown", host),
    }
}

async fn tcp_tunnel_handler(
    State(server): State<Arc<KishServer>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response<Body> {
    if let Err(e) = server.authorize(&headers) {
        warn!("Rejected TCP tunnel request from {}: {}", peer, e);
        return rejection(e.into());
    }
    if !server.config().enable_tcp_forwarding {
        return rejection(TunnelError::Configuration(
            "TCP forwarding is not enabled".to_string(),
        ));
    }
    let Some(ws) = ws else {
        return error_response(StatusCode::BAD_REQUEST, "WebSocket upgrade required");
    };

    let listener = match tcp_proxy::bind_ephemeral().await {
        Ok(listener) => listener,
        Err(e) => {
            warn!("Failed to bind TCP tunnel port: {}", e);
            return rejection(TunnelError::Internal(e.to_string()));
        }
    };
    let port = match listener.local_addr() {
        Ok(addr) => addr.port(),
        Err(e) => return rejection(TunnelError::Internal(e.to_string())),
    };

    let kish_url = format!("tcp://{}:{}", normalize_host(&server.config().host), port);
    let mut resp = ws.on_upgrade(move |socket| serve_tcp_tunnel(server, socket, listener, port));
    set_header(&mut resp, KISH_URL_HEADER, &kish_url);
    resp
}

async fn serve_tcp_tunnel(
    server: Arc<KishServer>,
    socket: WebSocket,
    listener: TcpListener,
    port: u16,
) {
    let _tracked = server.shutdown().register_tunnel();
    let session = TunnelSession::server(WsPipe::new(socket));
    let _cleanup = TunnelCleanup {
        server: server.clone(),
        host: None,
        session: session.clone(),
    };

    info!("TCP tunnel on port {} has been established", port);
    tokio::select! {
        _ = tcp_proxy::run(listener, session.clone()) => info!("TCP tunnel on port {} closed", port),
        _ = server.shutdown().wait() => info!("Closing TCP tunnel on port {} on shutdown", port),
    }
}
