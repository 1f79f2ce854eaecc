//! Core types and protocols for the kish tunneling service.
//!
//! This crate provides shared functionality between the tunnel server and client:
//! token authentication, the multiplexed session carried over a WebSocket, and
//! the byte and HTTP relaying used on both ends of a tunnel.

pub mod auth;
pub mod error;
pub mod forward;
pub mod ipset;
pub mod keystore;
pub mod pipe;
pub mod session;

pub use auth::{
    extract_bearer_token, generate_token, Authenticator, KeyId, ProxyClaims, ProxyParameters,
    Validity,
};
pub use error::{AccessError, AuthError, RoutingError, TunnelError, TunnelResult};
pub use forward::{forward_http, is_websocket, ForwardHooks};
pub use ipset::IpSet;
pub use keystore::{FileKeyStore, KeyStore};
pub use pipe::{passthrough, Rewind, WsPipe};
pub use session::{IncomingStreams, StreamHandle, TunnelSession};

/// Response header carrying the public URL of a new tunnel.
pub const KISH_URL_HEADER: &str = "X-Kish-URL";

/// Response header carrying the IP allowlist of a new HTTP tunnel.
pub const KISH_ALLOW_IP_HEADER: &str = "X-Kish-Allow-IP";

/// Control path for raw TCP tunnels.
pub const TCP_TUNNEL_PATH: &str = "/proxy1";

/// Control path for HTTP tunnels.
pub const HTTP_TUNNEL_PATH: &str = "/proxy2";
