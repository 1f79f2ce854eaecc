//! Kish server: token-authorized HTTP and TCP reverse tunnels.
//!
//! A client opens a WebSocket to one of the control endpoints and the server
//! publishes the local service behind it, either under a hostname within the
//! configured domain suffix or on an ephemeral TCP port.

pub mod config;
pub mod http_proxy;
pub mod router;
pub mod server;
pub mod shutdown;
pub mod tcp_proxy;
pub mod tls;
pub mod tunnel;

pub use config::{ServerConfig, WebsocketMode};
pub use server::KishServer;
