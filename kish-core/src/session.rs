//! Multiplexed session over a single duplex byte stream.
//!
//! Wraps a yamux session: a background task drives the session and reports
//! when it ends, while [`TunnelSession`] handles open streams and observe
//! liveness from any task.

use futures_util::StreamExt;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Notify};
use tokio_yamux::session::SessionType;
use tokio_yamux::{Config, Control, Session};
use tracing::{debug, trace};

pub use tokio_yamux::StreamHandle;

/// Handle to a running multiplexed session.
#[derive(Clone)]
pub struct TunnelSession {
    control: Control,
    closed: watch::Receiver<bool>,
    shutdown: Arc<Notify>,
}

/// Streams opened by the remote end of a client session.
pub struct IncomingStreams {
    rx: mpsc::Receiver<StreamHandle>,
}

impl IncomingStreams {
    /// Next stream opened by the peer, or `None` once the session is over.
    pub async fn accept(&mut self) -> Option<StreamHandle> {
        self.rx.recv().await
    }
}

impl TunnelSession {
    /// Server end: opens streams, refuses the ones the peer opens.
    pub fn server<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::spawn(io, SessionType::Server, None)
    }

    /// Client end: streams opened by the server come out of the returned
    /// [`IncomingStreams`].
    pub fn client<T>(io: T) -> (Self, IncomingStreams)
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(64);
        let session = Self::spawn(io, SessionType::Client, Some(tx));
        (session, IncomingStreams { rx })
    }

    fn spawn<T>(io: T, kind: SessionType, incoming: Option<mpsc::Sender<StreamHandle>>) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut session = Session::new(io, Config::default(), kind);
        let control = session.control();
        let (closed_tx, closed_rx) = watch::channel(false);
        let shutdown = Arc::new(Notify::new());
        let stop = shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    next = session.next() => match next {
                        Some(Ok(stream)) => match &incoming {
                            Some(tx) => {
                                if tx.send(stream).await.is_err() {
                                    trace!("No one is accepting streams, dropping");
                                }
                            }
                            None => trace!("Refusing stream opened by peer"),
                        },
                        Some(Err(e)) => {
                            debug!("Session ended with error: {}", e);
                            break;
                        }
                        None => break,
                    },
                    _ = stop.notified() => {
                        debug!("Session closed locally");
                        break;
                    }
                }
            }
            // Dropping the session drops the transport, which the peer sees as EOF.
            drop(session);
            let _ = closed_tx.send(true);
        });

        Self {
            control,
            closed: closed_rx,
            shutdown,
        }
    }

    /// Open a new stream to the peer.
    pub async fn open_stream(&self) -> io::Result<StreamHandle> {
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "session is closed",
            ));
        }
        let mut control = self.control.clone();
        control
            .open_stream()
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, format!("{:?}", e)))
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the session has terminated, for whatever reason.
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Terminate the session and every stream on it.
    pub fn close(&self) {
        self.shutdown.notify_one();
    }
}
