//! The public listener and the state shared by every connection.

use anyhow::{Context, Result};
use axum::extract::ConnectInfo;
use axum::http::{header::AUTHORIZATION, HeaderMap, Request};
use axum::Router;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use kish_core::{
    extract_bearer_token, AuthError, Authenticator, FileKeyStore, KeyStore, ProxyClaims,
};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::router::HostRouter;
use crate::shutdown::ShutdownSignal;
use crate::tunnel::{control_router, HostNamer};

pub struct KishServer {
    config: ServerConfig,
    router: HostRouter,
    auth: Authenticator<Arc<dyn KeyStore>>,
    namer: HostNamer,
    shutdown: ShutdownSignal,
}

impl KishServer {
    /// Create a server and register its own hostname for the control
    /// endpoints.
    pub fn new(config: ServerConfig, keys: Arc<dyn KeyStore>) -> Result<Arc<Self>> {
        let namer = HostNamer::new(&config.domain_suffix)?;
        let server = Arc::new(Self {
            config,
            router: HostRouter::new(),
            auth: Authenticator::new(keys),
            namer,
            shutdown: ShutdownSignal::default(),
        });

        let weak = Arc::downgrade(&server);
        server.router.register(
            &server.config.host,
            Arc::new(move || match weak.upgrade() {
                Some(server) => control_router(server),
                None => Router::new(),
            }),
        )?;
        Ok(server)
    }

    /// Create a server with keys from the configured account file. Without
    /// one every token is rejected.
    pub fn from_config(config: ServerConfig) -> Result<Arc<Self>> {
        let keys: Arc<dyn KeyStore> = match &config.account {
            Some(path) => {
                info!("Loading keys from {}", path.display());
                Arc::new(FileKeyStore::new(path.clone()))
            }
            None => {
                warn!("No account file configured, all tunnel requests will be rejected");
                Arc::new(HashMap::<String, String>::new())
            }
        };
        Self::new(config, keys)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn router(&self) -> &HostRouter {
        &self.router
    }

    pub fn namer(&self) -> &HostNamer {
        &self.namer
    }

    pub fn shutdown(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Validate the bearer token of a tunnel request.
    pub fn authorize(&self, headers: &HeaderMap) -> Result<ProxyClaims, AuthError> {
        let header = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthError::Malformed)?;
        let token = extract_bearer_token(header)?;
        self.auth.validate(token)
    }

    /// Accept connections until shutdown is initiated.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, tls: Option<TlsAcceptor>) -> Result<()> {
        let addr = listener.local_addr().context("listener has no address")?;
        info!(
            "Listening on {} ({})",
            addr,
            if tls.is_some() { "https" } else { "http" }
        );

        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        continue;
                    }
                },
                _ = self.shutdown.wait() => break,
            };

            let server = self.clone();
            let tls = tls.clone();
            tokio::spawn(async move {
                match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(stream) => server.serve_connection(stream, peer).await,
                        Err(e) => debug!("TLS handshake with {} failed: {}", peer, e),
                    },
                    None => server.serve_connection(stream, peer).await,
                }
            });
        }

        // The control router holds the server; dropping it ends the cycle.
        self.router.unregister(&self.config.host);
        info!("Stopped accepting connections on {}", addr);
        Ok(())
    }

    async fn serve_connection<I>(self: Arc<Self>, io: I, peer: SocketAddr)
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let service = service_fn(move |mut req: Request<Incoming>| {
            let server = self.clone();
            async move {
                req.extensions_mut().insert(ConnectInfo(peer));
                Ok::<_, Infallible>(server.router.dispatch(req).await)
            }
        });

        if let Err(e) = http1::Builder::new()
            .serve_connection(TokioIo::new(io), service)
            .with_upgrades()
            .await
        {
            debug!("Connection from {} ended: {}", peer, e);
        }
    }
}
