//! Multiplexed transport: one TCP listener shared by consensus peers and
//! RPC clients.
//!
//! Peers open every outbound connection with a single discriminator byte;
//! the accept side peeks at it without consuming it from client streams,
//! so client connections begin their RPC framing untouched.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// First byte of every outbound consensus connection.
pub const RAFT_RPC: u8 = 0x01;

/// A classified inbound connection.
pub enum Connection {
    /// Consensus traffic; the discriminator byte has been consumed.
    Peer(TcpStream),
    /// Client RPC traffic; the stream is untouched.
    Client(TcpStream),
}

pub struct StreamLayer {
    listener: TcpListener,
}

impl StreamLayer {
    pub fn new(listener: TcpListener) -> Self {
        Self { listener }
    }

    pub async fn bind(addr: &str) -> io::Result<Self> {
        Ok(Self::new(TcpListener::bind(addr).await?))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts the next connection and classifies it by its first byte.
    pub async fn accept(&self) -> io::Result<Connection> {
        Self::classify(self.accept_stream().await?).await
    }

    /// Accepts without classifying. Callers that must not let one idle
    /// connection stall the accept loop classify in their own task.
    pub async fn accept_stream(&self) -> io::Result<TcpStream> {
        let (stream, _) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Peeks at the first byte without consuming it from client
    /// streams; the discriminator is consumed from peer streams.
    pub async fn classify(mut stream: TcpStream) -> io::Result<Connection> {
        let mut first = [0u8; 1];
        let n = stream.peek(&mut first).await?;
        if n == 1 && first[0] == RAFT_RPC {
            stream.read_exact(&mut first).await?;
            Ok(Connection::Peer(stream))
        } else {
            Ok(Connection::Client(stream))
        }
    }

    /// Closes the listener. Connections already accepted stay open;
    /// dropping the layer has the same effect.
    pub fn close(self) {}

    /// Dials a consensus peer: connect, then write the discriminator.
    pub async fn dial(addr: &str, timeout: Duration) -> io::Result<TcpStream> {
        let mut stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timed out"))??;
        stream.set_nodelay(true)?;
        stream.write_all(&[RAFT_RPC]).await?;
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn classifies_peer_and_client_connections() {
        let layer = StreamLayer::bind("127.0.0.1:0").await.unwrap();
        let addr = layer.local_addr().unwrap().to_string();

        // Peer dial: discriminator consumed before the payload.
        let mut outbound = StreamLayer::dial(&addr, Duration::from_secs(1))
            .await
            .unwrap();
        outbound.write_all(b"ping").await.unwrap();

        match layer.accept().await.unwrap() {
            Connection::Peer(mut stream) => {
                let mut buf = [0u8; 4];
                stream.read_exact(&mut buf).await.unwrap();
                assert_eq!(&buf, b"ping");
            }
            Connection::Client(_) => panic!("expected a peer connection"),
        }

        // Client connection: first byte left in the stream.
        let mut client = TcpStream::connect(&addr).await.unwrap();
        client.write_all(b"rpc").await.unwrap();

        match layer.accept().await.unwrap() {
            Connection::Client(mut stream) => {
                let mut buf = [0u8; 3];
                stream.read_exact(&mut buf).await.unwrap();
                assert_eq!(&buf, b"rpc");
            }
            Connection::Peer(_) => panic!("expected a client connection"),
        }
    }
}
