//! Error taxonomy for the tunnel system.
//!
//! Every failure a tunnel request can hit maps to one category, and every
//! category maps to the HTTP status the server answers with. Errors that are
//! meant for the client's eyes also carry a short `X-Error-Message` text.

use std::fmt;
use std::io;
use thiserror::Error;

/// Header carrying a short human readable reason on error responses.
pub const ERROR_MESSAGE_HEADER: &str = "X-Error-Message";

/// Error categories for the tunnel system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Token authentication errors.
    Authentication,
    /// Hostname resolution and registration errors.
    Routing,
    /// Per-request access control errors.
    Access,
    /// Session, stream or target connection errors.
    Transport,
    /// Malformed HTTP on either side of a relay.
    Protocol,
    /// Server-side configuration errors (e.g. a disabled feature).
    Configuration,
    /// Internal server errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Authentication => write!(f, "authentication"),
            ErrorCategory::Routing => write!(f, "routing"),
            ErrorCategory::Access => write!(f, "access"),
            ErrorCategory::Transport => write!(f, "transport"),
            ErrorCategory::Protocol => write!(f, "protocol"),
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Internal => write!(f, "internal"),
        }
    }
}

/// Token validation failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("malformed bearer token")]
    Malformed,
    #[error("key not found")]
    KeyNotFound,
    #[error("token signature is invalid")]
    InvalidSignature,
    #[error("token does not contain nbf, exp and jti")]
    MissingClaims,
    #[error("token lifetime is too long")]
    LifetimeTooLong,
    #[error("token has expired")]
    Expired,
    #[error("token is not valid yet")]
    NotYetValid,
}

/// Hostname resolution and registration failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("host {0} is already registered")]
    HostOccupied(String),
    #[error("invalid hostname {0}")]
    InvalidHostname(String),
}

/// Per-request access control failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccessError {
    #[error("access from {0} is not allowed")]
    IpNotAllowed(String),
    #[error("basic authentication failed")]
    BasicAuthFailed,
}

/// Any error surfaced by the tunnel core.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error("transport: {0}")]
    Transport(#[source] io::Error),
    #[error("protocol: {0}")]
    Protocol(#[from] hyper::Error),
    #[error("{0}")]
    Configuration(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl TunnelError {
    /// Create a transport error from anything convertible to an I/O error.
    pub fn transport(err: impl Into<io::Error>) -> Self {
        TunnelError::Transport(err.into())
    }

    /// The category this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            TunnelError::Auth(_) => ErrorCategory::Authentication,
            TunnelError::Routing(_) => ErrorCategory::Routing,
            TunnelError::Access(_) => ErrorCategory::Access,
            TunnelError::Transport(_) => ErrorCategory::Transport,
            TunnelError::Protocol(_) => ErrorCategory::Protocol,
            TunnelError::Configuration(_) => ErrorCategory::Configuration,
            TunnelError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Get the HTTP status code for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            TunnelError::Auth(_) => 401,
            TunnelError::Routing(RoutingError::HostOccupied(_)) => 409,
            TunnelError::Routing(RoutingError::InvalidHostname(_)) => 400,
            TunnelError::Access(AccessError::IpNotAllowed(_)) => 403,
            TunnelError::Access(AccessError::BasicAuthFailed) => 401,
            TunnelError::Transport(_) | TunnelError::Protocol(_) => 502,
            TunnelError::Configuration(_) => 400,
            TunnelError::Internal(_) => 500,
        }
    }

    /// Text for the `X-Error-Message` header, if the client should see one.
    ///
    /// Authentication failures never leak detail.
    pub fn client_message(&self) -> Option<String> {
        match self {
            TunnelError::Routing(RoutingError::HostOccupied(_)) => {
                Some("domain name is already in use".to_string())
            }
            TunnelError::Routing(RoutingError::InvalidHostname(_)) => {
                Some("wrong domain name".to_string())
            }
            TunnelError::Configuration(message) => Some(message.clone()),
            _ => None,
        }
    }
}

/// Result type using TunnelError.
pub type TunnelResult<T> = Result<T, TunnelError>;
