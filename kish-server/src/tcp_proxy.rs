//! Raw TCP forwarding through a tunnel session.
//!
//! Every connection accepted on the tunnel's ephemeral port gets its own
//! stream. Connections are not filtered: the token that created the tunnel
//! is the only authorization.

use kish_core::{passthrough, TunnelSession};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Bind an ephemeral port on all interfaces.
pub async fn bind_ephemeral() -> std::io::Result<TcpListener> {
    TcpListener::bind("0.0.0.0:0").await
}

/// Accept connections until the session ends, relaying each one over a new
/// stream. The listener is dropped, releasing the port, on return.
pub async fn run(listener: TcpListener, session: TunnelSession) {
    let port = listener.local_addr().map(|a| a.port()).unwrap_or_default();
    loop {
        let (socket, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept on port {} failed: {}", port, e);
                    break;
                }
            },
            _ = session.closed() => break,
        };

        debug!("TCP connection from {} on port {}", peer, port);
        let session = session.clone();
        tokio::spawn(async move {
            let stream = match session.open_stream().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Failed to open stream for {}: {}", peer, e);
                    return;
                }
            };
            if let Err(e) = passthrough(socket, stream).await {
                debug!("TCP relay for {} ended: {}", peer, e);
            }
        });
    }
    info!("Released port {}", port);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_relays_connections_over_streams() {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let session = TunnelSession::server(server_io);
        let (_client, mut incoming) = TunnelSession::client(client_io);

        // Client end echoes every stream back.
        tokio::spawn(async move {
            while let Some(mut stream) = incoming.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let relay = tokio::spawn(run(listener, session.clone()));

        for message in [&b"first"[..], &b"second"[..]] {
            let mut conn = TcpStream::connect(addr).await.unwrap();
            conn.write_all(message).await.unwrap();
            let mut buf = vec![0u8; message.len()];
            conn.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, message);
        }

        session.close();
        tokio::time::timeout(Duration::from_secs(5), relay)
            .await
            .unwrap()
            .unwrap();
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
