use std::future::Future;
use std::net::SocketAddr;

/// The receiving half of a split [`Connection`].
pub trait ReadHalf: Send + 'static {
    /// Reads bytes into `buf`, returning how many bytes were read.
    ///
    /// Returns `Ok(0)` when the remote end has closed the connection.
    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = anyhow::Result<usize>> + Send + 'a;
}

/// The sending half of a split [`Connection`].
pub trait WriteHalf: Send + 'static {
    /// Writes the entirety of `buf` to the connection.
    fn write_all<'a>(
        &'a mut self,
        buf: &'a [u8],
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a;

    /// Shuts down the write half, signalling to the remote end that no
    /// more data will be sent.
    fn shutdown(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send + '_;
}

/// A transport-agnostic, ordered, reliable byte channel between two devices.
///
/// A session runs one reader and one writer concurrently, so a connection
/// is consumed by [`into_split`](Connection::into_split) right after it is
/// established. Everything the protocol needs (control frames, file chunks,
/// input and clipboard events) travels over this single channel.
pub trait Connection: Send + 'static {
    type Reader: ReadHalf;
    type Writer: WriteHalf;

    /// Address of the remote end.
    fn peer(&self) -> SocketAddr;

    /// Splits the connection into independently owned halves.
    ///
    /// For transports with lazily created streams this is where the
    /// stream is opened (connecting side) or accepted (listening side).
    fn into_split(
        self,
    ) -> impl Future<Output = anyhow::Result<(Self::Reader, Self::Writer)>> + Send;
}

/// An async listener that accepts incoming [`Connection`]s.
pub trait Listener: Send + 'static {
    /// The concrete connection type produced by [`accept`](Listener::accept).
    type Conn: Connection;

    /// Returns the local address the listener is bound to.
    fn local_addr(&self) -> SocketAddr;

    /// Waits for and accepts the next inbound connection.
    fn accept(&mut self) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + '_;
}

/// Factory for creating [`Listener`] instances.
///
/// Separating creation from usage lets the engine remain generic: pass the
/// TCP factory in production and another transport in tests.
pub trait ListenerFactory: Send + Sync + 'static {
    /// The concrete listener type produced by [`bind`](ListenerFactory::bind).
    type L: Listener;

    /// Binds a new listener to the given address.
    ///
    /// Use `"<ip>:0"` to let the OS assign an available port.
    fn bind<'a>(
        &'a self,
        addr: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::L>> + Send + 'a;
}

/// Factory for creating outbound [`Connection`]s (client side).
///
/// This is the counterpart to [`ListenerFactory`]: where the listener
/// accepts inbound connections, the connector initiates outbound ones.
pub trait Connector: Send + Sync + 'static {
    /// The concrete connection type produced by [`connect`](Connector::connect).
    type Conn: Connection;

    /// Opens a new outbound connection to the given address.
    fn connect(
        &self,
        addr: SocketAddr,
    ) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + '_;
}
