//! Tunnel connection and local forwarding.
//!
//! The client dials a control endpoint, runs the client end of the
//! multiplexed session over the WebSocket and relays every stream the server
//! opens to the local target, as HTTP or as raw bytes.

use anyhow::Result;
use hyper::header::{HeaderValue, AUTHORIZATION, ORIGIN};
use hyper::StatusCode;
use kish_core::auth::now_secs;
use kish_core::error::ERROR_MESSAGE_HEADER;
use kish_core::{
    forward_http, generate_token, passthrough, ForwardHooks, IncomingStreams, StreamHandle,
    TunnelSession, WsPipe, KISH_ALLOW_IP_HEADER, KISH_URL_HEADER,
};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::{origin_for, parse_key, ClientConfig, Command};
use crate::rewrite::HeaderRewriter;

/// The server refused the tunnel handshake.
#[derive(Debug, thiserror::Error)]
#[error("{}{}", .status, .message.as_ref().map(|m| format!(": {}", m)).unwrap_or_default())]
pub struct Rejected {
    pub status: StatusCode,
    pub message: Option<String>,
}

impl Rejected {
    /// Rejections that retrying cannot fix.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.status,
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::CONFLICT
        )
    }
}

/// What the local end of the tunnel is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Http(String),
    Tcp(String),
}

impl Target {
    fn endpoint(&self) -> &'static str {
        match self {
            Target::Http(_) => "proxy2",
            Target::Tcp(_) => "proxy1",
        }
    }

    fn addr(&self) -> &str {
        match self {
            Target::Http(addr) | Target::Tcp(addr) => addr,
        }
    }
}

impl From<&Command> for Target {
    fn from(command: &Command) -> Self {
        match command {
            Command::Http { target } => Target::Http(target.clone()),
            Command::Tcp { target } => Target::Tcp(target.clone()),
        }
    }
}

/// Everything needed to (re)establish a tunnel.
pub struct TunnelClient {
    pub config: ClientConfig,
    pub target: Target,
    pub host_header: Option<String>,
    pub reconnect_delay: Duration,
    pub max_reconnects: u32,
}

/// An accepted tunnel handshake.
pub struct Dialed {
    pub ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pub public_url: String,
    pub allow_ip: Option<String>,
}

/// Open the WebSocket to a control endpoint with a fresh token.
pub async fn dial(config: &ClientConfig, endpoint: &str) -> Result<Dialed> {
    let (key_id, secret) = parse_key(&config.key)?;
    let token = generate_token(now_secs(), &config.parameters(), secret.as_bytes(), key_id)?;
    let url = config.endpoint_url(endpoint)?;

    let mut request = url.as_str().into_client_request()?;
    request.headers_mut().insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", token))?,
    );
    request
        .headers_mut()
        .insert(ORIGIN, HeaderValue::from_str(&origin_for(&url))?);

    debug!("Connecting to {}", url);
    let (ws, response) = match connect_async(request).await {
        Ok(connected) => connected,
        Err(WsError::Http(response)) => {
            let message = response
                .headers()
                .get(ERROR_MESSAGE_HEADER)
                .and_then(|v| v.to_str().ok())
                .filter(|m| !m.is_empty())
                .map(str::to_string);
            return Err(Rejected {
                status: response.status(),
                message,
            }
            .into());
        }
        Err(e) => return Err(e.into()),
    };

    let header = |name: &str| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    Ok(Dialed {
        ws,
        public_url: header(KISH_URL_HEADER).unwrap_or_default(),
        allow_ip: header(KISH_ALLOW_IP_HEADER),
    })
}

/// Run the tunnel, reconnecting after failures until a fatal rejection or
/// the reconnect limit.
pub async fn run_tunnel_loop(client: &TunnelClient) -> Result<()> {
    let mut attempts = 0u32;

    loop {
        attempts += 1;

        let err = match run_tunnel(client).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        if let Some(rejected) = err.downcast_ref::<Rejected>() {
            if rejected.is_fatal() {
                error!("Tunnel rejected: {}", rejected);
                return Err(err);
            }
        }
        error!("Tunnel error: {}", err);

        if client.max_reconnects > 0 && attempts >= client.max_reconnects {
            error!("Max reconnect attempts ({}) reached", client.max_reconnects);
            return Err(err);
        }

        info!(
            "Reconnecting in {:?}... (attempt {})",
            client.reconnect_delay,
            attempts + 1
        );
        tokio::time::sleep(client.reconnect_delay).await;
    }
}

async fn run_tunnel(client: &TunnelClient) -> Result<()> {
    let dialed = dial(&client.config, client.target.endpoint()).await?;
    info!("{} -> {}", dialed.public_url, client.target.addr());
    if let Some(allow_ip) = &dialed.allow_ip {
        info!("Allow IP: {}", allow_ip);
    }

    let hooks = match &client.target {
        Target::Http(addr) => {
            HeaderRewriter::new(&dialed.public_url, addr, client.host_header.clone()).into_hooks()
        }
        Target::Tcp(_) => ForwardHooks::default(),
    };

    let (_session, incoming) = TunnelSession::client(WsPipe::new(dialed.ws));
    serve_streams(incoming, client.target.clone(), hooks).await;
    anyhow::bail!("tunnel connection closed")
}

/// Relay every stream the server opens until the session ends.
pub async fn serve_streams(mut incoming: IncomingStreams, target: Target, hooks: ForwardHooks) {
    while let Some(stream) = incoming.accept().await {
        tokio::spawn(forward_stream(stream, target.clone(), hooks.clone()));
    }
    debug!("Session ended");
}

async fn forward_stream(stream: StreamHandle, target: Target, hooks: ForwardHooks) {
    let conn = match TcpStream::connect(target.addr()).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!("Failed to connect to {}: {}", target.addr(), e);
            return;
        }
    };

    let result = match target {
        Target::Http(_) => forward_http(stream, None, conn, hooks).await,
        Target::Tcp(_) => passthrough(stream, conn)
            .await
            .map_err(kish_core::TunnelError::transport),
    };
    if let Err(e) = result {
        debug!("Stream to {} ended: {}", target.addr(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http_body_util::{BodyExt, Empty, Full};
    use hyper::body::Incoming;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Local HTTP service answering with the Host and Origin it received.
    async fn local_http_service() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((conn, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let service = service_fn(|req: Request<Incoming>| async move {
                        let header = |name: &str| {
                            req.headers()
                                .get(name)
                                .and_then(|v| v.to_str().ok())
                                .unwrap_or("-")
                                .to_string()
                        };
                        let body = format!("host={} origin={}", header("host"), header("origin"));
                        Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(conn), service)
                        .await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_http_streams_reach_target_rewritten() {
        let addr = local_http_service().await;
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let server = TunnelSession::server(server_io);
        let (_client, incoming) = TunnelSession::client(client_io);

        let hooks = HeaderRewriter::new("https://demo.t.example.com", &addr, None).into_hooks();
        tokio::spawn(serve_streams(incoming, Target::Http(addr.clone()), hooks));

        let stream = server.open_stream().await.unwrap();
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .unwrap();
        tokio::spawn(conn);

        let req = Request::builder()
            .uri("/")
            .header("host", "demo.t.example.com")
            .header("origin", "https://demo.t.example.com")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let resp = sender.send_request(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(
            String::from_utf8_lossy(&body),
            format!("host=demo.t.example.com origin=http://{}", addr)
        );
    }

    #[tokio::test]
    async fn test_tcp_streams_are_piped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            buf.reverse();
            conn.write_all(&buf).await.unwrap();
        });

        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let server = TunnelSession::server(server_io);
        let (_client, incoming) = TunnelSession::client(client_io);
        tokio::spawn(serve_streams(incoming, Target::Tcp(addr), ForwardHooks::default()));

        let mut stream = server.open_stream().await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"olleh");
    }

    #[test]
    fn test_rejections() {
        let rejected = Rejected {
            status: StatusCode::CONFLICT,
            message: Some("domain name is already in use".to_string()),
        };
        assert!(rejected.is_fatal());
        assert_eq!(
            rejected.to_string(),
            "409 Conflict: domain name is already in use"
        );

        let rejected = Rejected {
            status: StatusCode::BAD_GATEWAY,
            message: None,
        };
        assert!(!rejected.is_fatal());
        assert_eq!(rejected.to_string(), "502 Bad Gateway");
    }

    #[test]
    fn test_target_from_command() {
        let target = Target::from(&Command::Tcp {
            target: "127.0.0.1:22".to_string(),
        });
        assert_eq!(target, Target::Tcp("127.0.0.1:22".to_string()));
        assert_eq!(target.endpoint(), "proxy1");
        assert_eq!(
            Target::Http("127.0.0.1:80".to_string()).endpoint(),
            "proxy2"
        );
    }
}
