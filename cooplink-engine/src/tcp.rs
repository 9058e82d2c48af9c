use std::net::SocketAddr;

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, info};

use cooplink_core::transport::{Connection, Connector, Listener, ListenerFactory, ReadHalf, WriteHalf};

/// A TCP connection wrapping a [`tokio::net::TcpStream`].
pub struct TcpConnection {
    stream: net::TcpStream,
    peer_addr: SocketAddr,
}

/// Receiving half of a [`TcpConnection`].
pub struct TcpReadHalf(OwnedReadHalf);

/// Sending half of a [`TcpConnection`].
pub struct TcpWriteHalf(OwnedWriteHalf);

impl ReadHalf for TcpReadHalf {
    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = anyhow::Result<usize>> + Send + 'a {
        async move {
            self.0
                .read(buf)
                .await
                .context("failed to read from TCP connection")
        }
    }
}

impl WriteHalf for TcpWriteHalf {
    fn write_all<'a>(
        &'a mut self,
        buf: &'a [u8],
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move {
            self.0
                .write_all(buf)
                .await
                .context("failed to write to TCP connection")
        }
    }

    fn shutdown(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send + '_ {
        async move {
            self.0
                .shutdown()
                .await
                .context("failed to shut down TCP connection")
        }
    }
}

impl Connection for TcpConnection {
    type Reader = TcpReadHalf;
    type Writer = TcpWriteHalf;

    fn peer(&self) -> SocketAddr {
        self.peer_addr
    }

    fn into_split(
        self,
    ) -> impl Future<Output = anyhow::Result<(Self::Reader, Self::Writer)>> + Send {
        async move {
            let (read, write) = self.stream.into_split();
            Ok((TcpReadHalf(read), TcpWriteHalf(write)))
        }
    }
}

/// A TCP listener wrapping a [`tokio::net::TcpListener`].
pub struct TcpListener {
    inner: net::TcpListener,
    local_addr: SocketAddr,
}

impl Listener for TcpListener {
    type Conn = TcpConnection;

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn accept(&mut self) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + '_ {
        async move {
            let (stream, peer_addr) = self
                .inner
                .accept()
                .await
                .context("failed to accept TCP connection")?;
            stream.set_nodelay(true).context("failed to set TCP_NODELAY")?;
            debug!(peer = %peer_addr, "Accepted TCP connection");
            Ok(TcpConnection { stream, peer_addr })
        }
    }
}

/// Factory that binds [`TcpListener`] instances on the given address.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpListenerFactory;

impl ListenerFactory for TcpListenerFactory {
    type L = TcpListener;

    fn bind<'a>(
        &'a self,
        addr: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::L>> + Send + 'a {
        async move {
            let inner = net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind TCP listener on {addr}"))?;
            let local_addr = inner
                .local_addr()
                .context("failed to retrieve local address")?;
            info!(addr = %local_addr, "TCP listener bound");
            Ok(TcpListener { inner, local_addr })
        }
    }
}

/// Opens outbound [`TcpConnection`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Conn = TcpConnection;

    fn connect(
        &self,
        addr: SocketAddr,
    ) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + '_ {
        async move {
            let stream = net::TcpStream::connect(addr)
                .await
                .with_context(|| format!("failed to connect to {addr}"))?;
            stream.set_nodelay(true).context("failed to set TCP_NODELAY")?;
            debug!(peer = %addr, "TCP connection established");
            Ok(TcpConnection {
                stream,
                peer_addr: addr,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn when_binding_invalid_address_expect_error() {
        let factory = TcpListenerFactory;
        let result = factory.bind("999.999.999.999:0").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn when_client_connects_expect_peer_matches_client_address() {
        let mut listener = TcpListenerFactory.bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();

        let client = net::TcpStream::connect(addr).await.unwrap();
        let client_local = client.local_addr().unwrap();

        let conn = listener.accept().await.unwrap();
        assert_eq!(conn.peer(), client_local);
    }

    #[tokio::test]
    async fn when_two_clients_connect_expect_distinct_peers() {
        let mut listener = TcpListenerFactory.bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();

        let _c1 = TcpConnector.connect(addr).await.unwrap();
        let conn1 = listener.accept().await.unwrap();

        let _c2 = TcpConnector.connect(addr).await.unwrap();
        let conn2 = listener.accept().await.unwrap();

        assert_ne!(
            conn1.peer(),
            conn2.peer(),
            "each connection should have a distinct peer address"
        );
    }

    #[tokio::test]
    async fn when_connecting_to_closed_port_expect_error() {
        let listener = TcpListenerFactory.bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();
        drop(listener);
        assert!(TcpConnector.connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn when_split_halves_exchange_bytes_expect_both_directions_work() {
        let mut listener = TcpListenerFactory.bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();
        let (client, server) = tokio::join!(TcpConnector.connect(addr), listener.accept());
        let (mut cr, mut cw) = client.unwrap().into_split().await.unwrap();
        let (mut sr, mut sw) = server.unwrap().into_split().await.unwrap();

        cw.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        let n = sr.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        sw.write_all(b"pong").await.unwrap();
        sw.shutdown().await.unwrap();
        let n = cr.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
        assert_eq!(cr.read(&mut buf).await.unwrap(), 0);
    }
}
