//! Relaying HTTP from a tunnel stream to a local target.
//!
//! One tunnel stream is served as an HTTP/1.1 connection and every request
//! on it is forwarded over a single connection to the target. Hooks may
//! rewrite requests and responses, or answer a request without contacting
//! the target at all. A successful WebSocket upgrade turns both connections
//! into a plain byte relay.

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper::header::{HeaderMap, CONNECTION, UPGRADE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::TunnelResult;
use crate::pipe::{passthrough, Rewind};

/// Body type used for relayed responses.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Inspects a request before it is forwarded; returning a response answers
/// the request directly.
pub type RequestHook =
    Arc<dyn Fn(&mut Request<Incoming>) -> Option<Response<Full<Bytes>>> + Send + Sync>;

/// Inspects a response before it is written back.
pub type ResponseHook = Arc<dyn Fn(&mut Response<Incoming>) + Send + Sync>;

#[derive(Clone, Default)]
pub struct ForwardHooks {
    pub request: Option<RequestHook>,
    pub response: Option<ResponseHook>,
}

/// Whether the headers ask for a WebSocket upgrade.
pub fn is_websocket(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    let upgrade_websocket = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    connection_upgrade && upgrade_websocket
}

/// Wrap a complete body into a [`ProxyBody`].
pub fn full_body(body: Full<Bytes>) -> ProxyBody {
    body.map_err(|never: Infallible| match never {}).boxed()
}

/// Serve `stream` as HTTP, forwarding every request to `target`.
///
/// `prebuffered` holds bytes already read off the stream; they are parsed
/// before anything else. Returns when either connection closes.
pub async fn forward_http<S, T>(
    stream: S,
    prebuffered: Option<Bytes>,
    target: T,
    hooks: ForwardHooks,
) -> TunnelResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, conn) =
        hyper::client::conn::http1::handshake::<_, Incoming>(TokioIo::new(target)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!("Target connection ended: {}", e);
        }
    });

    let sender = Arc::new(Mutex::new(sender));
    let service = service_fn(move |req| relay(req, sender.clone(), hooks.clone()));

    http1::Builder::new()
        .serve_connection(TokioIo::new(Rewind::new(stream, prebuffered)), service)
        .with_upgrades()
        .await?;
    Ok(())
}

async fn relay(
    mut req: Request<Incoming>,
    sender: Arc<Mutex<SendRequest<Incoming>>>,
    hooks: ForwardHooks,
) -> Result<Response<ProxyBody>, hyper::Error> {
    if let Some(hook) = &hooks.request {
        if let Some(canned) = hook(&mut req) {
            return Ok(canned.map(full_body));
        }
    }

    debug!("Forwarding {} {}", req.method(), req.uri());
    let client_upgrade = is_websocket(req.headers()).then(|| hyper::upgrade::on(&mut req));

    let mut resp = {
        let mut sender = sender.lock().await;
        sender.ready().await?;
        sender.send_request(req).await?
    };

    if let Some(hook) = &hooks.response {
        hook(&mut resp);
    }

    if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
        if let Some(client_upgrade) = client_upgrade {
            let target_upgrade = hyper::upgrade::on(&mut resp);
            tokio::spawn(async move {
                match futures_util::future::try_join(client_upgrade, target_upgrade).await {
                    Ok((client, target)) => {
                        if let Err(e) = passthrough(TokioIo::new(client), TokioIo::new(target)).await
                        {
                            debug!("Upgraded relay ended: {}", e);
                        }
                    }
                    Err(e) => warn!("Upgrade failed: {}", e),
                }
            });
        }
    }

    Ok(resp.map(|body| body.boxed()))
}
