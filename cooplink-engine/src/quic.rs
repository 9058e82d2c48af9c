//! QUIC transport.
//!
//! A session uses a single bi-directional stream per QUIC connection. The
//! certificate is self-signed and peers do not verify it against a root:
//! devices are admitted by the pairing handshake. Handshake signatures are
//! still checked, so the peer must hold the key for the certificate it
//! presents.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use tracing::{debug, info};

use cooplink_core::tls;
use cooplink_core::transport::{Connection, Connector, Listener, ListenerFactory, ReadHalf, WriteHalf};

const ALPN: &[u8] = b"cooplink/1";

/// Name in the certificate and the SNI sent when connecting.
const SERVER_NAME: &str = "cooplink.local";

/// Drops connections silent for this long; session heartbeats keep live
/// ones busy well within it.
const IDLE_TIMEOUT_MS: u32 = 15_000;

const FINISH_TIMEOUT: Duration = Duration::from_secs(2);

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn transport_config() -> Arc<quinn::TransportConfig> {
    let mut config = quinn::TransportConfig::default();
    config.max_idle_timeout(Some(quinn::VarInt::from_u32(IDLE_TIMEOUT_MS).into()));
    Arc::new(config)
}

fn server_config() -> anyhow::Result<quinn::ServerConfig> {
    let identity = tls::SelfSigned::generate(&[SERVER_NAME, "localhost"])?;
    let chain = vec![CertificateDer::from(identity.cert_der)];
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(identity.key_pkcs8_der));

    let mut crypto = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 unavailable")?
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .context("invalid certificate or key")?;
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let crypto = QuicServerConfig::try_from(crypto).context("TLS config unusable for QUIC")?;
    let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    config.transport_config(transport_config());
    Ok(config)
}

fn client_config() -> anyhow::Result<quinn::ClientConfig> {
    let provider = provider();
    let mut crypto = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 unavailable")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AnyCertificate { provider }))
        .with_no_client_auth();
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let crypto = QuicClientConfig::try_from(crypto).context("TLS config unusable for QUIC")?;
    let mut config = quinn::ClientConfig::new(Arc::new(crypto));
    config.transport_config(transport_config());
    Ok(config)
}

/// Accepts any server certificate but checks the handshake signatures made
/// with it.
#[derive(Debug)]
struct AnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// An established QUIC connection, not yet carrying a stream.
///
/// The stream is created in [`into_split`](Connection::into_split). QUIC
/// announces a stream to the peer only once data is written on it, so the
/// accepting side's split completes when the dialer sends its first frame.
pub struct QuicConnection {
    inner: quinn::Connection,
    dialed: bool,
}

pub struct QuicReader(quinn::RecvStream);

pub struct QuicWriter(quinn::SendStream);

impl ReadHalf for QuicReader {
    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = anyhow::Result<usize>> + Send + 'a {
        async move {
            let n = self.0.read(buf).await.context("QUIC stream read failed")?;
            // `None` marks a finished stream.
            Ok(n.unwrap_or(0))
        }
    }
}

impl WriteHalf for QuicWriter {
    fn write_all<'a>(
        &'a mut self,
        buf: &'a [u8],
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move { self.0.write_all(buf).await.context("QUIC stream write failed") }
    }

    fn shutdown(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send + '_ {
        async move {
            self.0.finish().context("QUIC stream already closed")?;
            let _ = tokio::time::timeout(FINISH_TIMEOUT, self.0.stopped()).await;
            Ok(())
        }
    }
}

impl Connection for QuicConnection {
    type Reader = QuicReader;
    type Writer = QuicWriter;

    fn peer(&self) -> SocketAddr {
        self.inner.remote_address()
    }

    fn into_split(
        self,
    ) -> impl Future<Output = anyhow::Result<(Self::Reader, Self::Writer)>> + Send {
        async move {
            let (send, recv) = if self.dialed {
                self.inner.open_bi().await.context("cannot open QUIC stream")?
            } else {
                self.inner.accept_bi().await.context("peer opened no QUIC stream")?
            };
            Ok((QuicReader(recv), QuicWriter(send)))
        }
    }
}

pub struct QuicListener {
    endpoint: quinn::Endpoint,
    local_addr: SocketAddr,
}

impl Listener for QuicListener {
    type Conn = QuicConnection;

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn accept(&mut self) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + '_ {
        async move {
            let incoming = self
                .endpoint
                .accept()
                .await
                .context("QUIC endpoint closed")?;
            let inner = incoming.await.context("QUIC handshake failed")?;
            debug!(peer = %inner.remote_address(), "QUIC connection accepted");
            Ok(QuicConnection {
                inner,
                dialed: false,
            })
        }
    }
}

/// Binds QUIC listeners. One certificate is generated per factory.
pub struct QuicListenerFactory {
    config: quinn::ServerConfig,
}

impl QuicListenerFactory {
    /// # Errors
    ///
    /// Fails if the certificate or TLS configuration cannot be built.
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            config: server_config()?,
        })
    }
}

impl ListenerFactory for QuicListenerFactory {
    type L = QuicListener;

    fn bind<'a>(
        &'a self,
        addr: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::L>> + Send + 'a {
        async move {
            let addr: SocketAddr = addr
                .parse()
                .with_context(|| format!("not a socket address: {addr}"))?;
            let endpoint = quinn::Endpoint::server(self.config.clone(), addr)
                .with_context(|| format!("cannot bind QUIC endpoint on {addr}"))?;
            let local_addr = endpoint.local_addr().context("endpoint has no local address")?;
            info!(addr = %local_addr, "QUIC listener bound");
            Ok(QuicListener {
                endpoint,
                local_addr,
            })
        }
    }
}

/// Dials peers from one client endpoint on an ephemeral port.
pub struct QuicConnector {
    endpoint: quinn::Endpoint,
}

impl QuicConnector {
    /// # Errors
    ///
    /// Fails if the client endpoint cannot be bound or TLS configuration
    /// cannot be built.
    pub fn new() -> anyhow::Result<Self> {
        let mut endpoint = quinn::Endpoint::client(SocketAddr::from(([0, 0, 0, 0], 0)))
            .context("cannot bind QUIC client endpoint")?;
        endpoint.set_default_client_config(client_config()?);
        Ok(Self { endpoint })
    }
}

impl Connector for QuicConnector {
    type Conn = QuicConnection;

    fn connect(
        &self,
        addr: SocketAddr,
    ) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + '_ {
        async move {
            let inner = self
                .endpoint
                .connect(addr, SERVER_NAME)
                .with_context(|| format!("cannot dial {addr}"))?
                .await
                .with_context(|| format!("QUIC handshake with {addr} failed"))?;
            debug!(peer = %addr, "QUIC connection established");
            Ok(QuicConnection {
                inner,
                dialed: true,
            })
        }
    }
}
