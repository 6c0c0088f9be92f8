// SPDX-License-Identifier: AGPL-3.0-only

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use anyhow::anyhow;
use rustls::ClientConfig;
use serde_derive::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// TCP network type.
pub const TCP_NETWORK: &str = "tcp";

/// Unix domain socket network type.
pub const UNIX_NETWORK: &str = "unix";

/// A point-to-point, bidirectional transport carrying opaque text payloads.
///
/// One instance represents one connection epoch. `connect` may be invoked
/// several times on the same instance while an epoch retries, but once `close`
/// has been called the instance is never reused: the next epoch gets a fresh
/// one from the [`TransportFactory`].
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
  /// Establishes the underlying connection.
  ///
  /// # Errors
  ///
  /// Returns an error if the connection cannot be established or if the
  /// cancellation token fires first.
  async fn connect(&self, cancellation: &CancellationToken) -> anyhow::Result<()>;

  /// Reports whether the transport currently believes it is connected.
  fn is_connected(&self) -> bool;

  /// Writes a single payload.
  ///
  /// # Errors
  ///
  /// Returns an error if the transport is not connected or the write fails.
  async fn send(&self, payload: &str, cancellation: &CancellationToken) -> anyhow::Result<()>;

  /// Waits for the next inbound payload.
  ///
  /// Returns `Ok(None)` when the peer closed the connection, the transport was
  /// closed locally or the cancellation token fired.
  async fn receive(&self, cancellation: &CancellationToken) -> anyhow::Result<Option<String>>;

  /// Closes the transport and releases every underlying resource.
  ///
  /// No separate dispose step follows, and the call must be safe on a
  /// transport that never connected.
  async fn close(&self);
}

/// Creates a fresh [`Transport`] for each connection epoch.
pub trait TransportFactory: Send + Sync + 'static {
  /// The type of transport produced by this factory.
  type Transport: Transport;

  /// Creates a new, unconnected transport instance.
  ///
  /// # Errors
  ///
  /// Returns an error if the transport cannot be instantiated.
  fn create(&self) -> anyhow::Result<Self::Transport>;
}

// Line transport configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportConfig {
  /// The network type. Either "tcp" or "unix".
  /// Default is "tcp".
  #[serde(default = "default_network")]
  pub network: String,

  /// The address of the server.
  /// This should be in the format "host:port".
  #[serde(default)]
  pub address: String,

  /// The unix domain socket path.
  /// This is used when the network type is "unix".
  #[serde(default)]
  pub socket_path: String,

  /// Whether to wrap the tcp connection in TLS.
  #[serde(default)]
  pub secure: bool,

  /// Whether to verify the server certificate when `secure` is enabled.
  #[serde(default = "default_verify_certificates")]
  pub verify_certificates: bool,

  /// The terminator appended to every outbound payload and used to split
  /// inbound payloads.
  #[serde(default = "default_line_terminator")]
  pub line_terminator: String,
}

impl Default for TransportConfig {
  fn default() -> Self {
    Self {
      network: default_network(),
      address: String::new(),
      socket_path: String::new(),
      secure: false,
      verify_certificates: default_verify_certificates(),
      line_terminator: default_line_terminator(),
    }
  }
}

fn default_network() -> String {
  TCP_NETWORK.to_string()
}

fn default_verify_certificates() -> bool {
  true
}

fn default_line_terminator() -> String {
  "\r\n".to_string()
}

// === impl TransportConfig ===

impl TransportConfig {
  /// Validates the configuration.
  pub fn validate(&self) -> anyhow::Result<()> {
    if self.network != TCP_NETWORK && self.network != UNIX_NETWORK {
      return Err(anyhow!("invalid network type: {}", self.network));
    }

    if self.network == UNIX_NETWORK && self.socket_path.is_empty() {
      return Err(anyhow!("socket path must be specified for unix network type"));
    }

    if self.network == TCP_NETWORK && self.address.trim().is_empty() {
      return Err(anyhow!("address must be specified for tcp network type"));
    }

    if self.network == UNIX_NETWORK && self.secure {
      return Err(anyhow!("secure transport is only supported for tcp network type"));
    }

    if !self.line_terminator.ends_with('\n') {
      return Err(anyhow!("line terminator must end with a newline"));
    }

    Ok(())
  }
}

/// A unified stream type over the supported connection mediums.
#[derive(Debug)]
pub enum Stream {
  /// A plain TCP connection.
  Tcp(TcpStream),

  /// A TLS connection over TCP.
  Tls(Box<TlsStream<TcpStream>>),

  /// A Unix domain socket connection.
  Unix(UnixStream),
}

// ===== impl Stream =====

impl AsyncRead for Stream {
  fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
    match self.get_mut() {
      Stream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      Stream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
      Stream::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for Stream {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
    match self.get_mut() {
      Stream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      Stream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
      Stream::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    match self.get_mut() {
      Stream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      Stream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
      Stream::Unix(stream) => Pin::new(stream).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    match self.get_mut() {
      Stream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      Stream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
      Stream::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
    }
  }
}

#[derive(Clone)]
struct TlsSettings {
  connector: TlsConnector,
  server_name: rustls::pki_types::ServerName<'static>,
}

/// Creates [`LineTransport`] instances sharing one configuration and TLS setup.
#[derive(Clone)]
pub struct LineTransportFactory {
  config: Arc<TransportConfig>,
  tls: Option<TlsSettings>,
}

// ===== impl LineTransportFactory =====

impl LineTransportFactory {
  /// Creates a new factory from the given configuration.
  ///
  /// # Errors
  ///
  /// Returns an error if the configuration is invalid or the TLS server name
  /// cannot be derived from the address.
  pub fn new(config: TransportConfig) -> anyhow::Result<Self> {
    config.validate()?;

    let tls = if config.secure { Some(Self::tls_settings(&config)?) } else { None };

    Ok(Self { config: Arc::new(config), tls })
  }

  fn tls_settings(config: &TransportConfig) -> anyhow::Result<TlsSettings> {
    let tls_config = if config.verify_certificates {
      ClientConfig::builder()
        .with_root_certificates(rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()))
        .with_no_client_auth()
    } else {
      // Development only: accepts any certificate.
      ClientConfig::builder().dangerous().with_custom_certificate_verifier(Arc::new(NoVerifier)).with_no_client_auth()
    };

    let server_name = config.address.split(':').next().ok_or_else(|| anyhow!("invalid address format"))?.to_string();
    let server_name =
      rustls::pki_types::ServerName::try_from(server_name).map_err(|_| anyhow!("invalid server name"))?.to_owned();

    Ok(TlsSettings { connector: TlsConnector::from(Arc::new(tls_config)), server_name })
  }
}

impl TransportFactory for LineTransportFactory {
  type Transport = LineTransport;

  fn create(&self) -> anyhow::Result<LineTransport> {
    Ok(LineTransport {
      config: self.config.clone(),
      tls: self.tls.clone(),
      reader: Mutex::new(None),
      writer: Mutex::new(None),
      connected: AtomicBool::new(false),
      close_token: CancellationToken::new(),
    })
  }
}

/// A line-delimited text transport over TCP, TLS or a Unix domain socket.
pub struct LineTransport {
  config: Arc<TransportConfig>,
  tls: Option<TlsSettings>,
  reader: Mutex<Option<BufReader<ReadHalf<Stream>>>>,
  writer: Mutex<Option<WriteHalf<Stream>>>,
  connected: AtomicBool,
  close_token: CancellationToken,
}

// ===== impl LineTransport =====

impl LineTransport {
  async fn dial(&self) -> anyhow::Result<Stream> {
    if self.config.network == UNIX_NETWORK {
      let unix_stream = UnixStream::connect(&self.config.socket_path)
        .await
        .map_err(|e| anyhow!("failed to connect to {}: {}", self.config.socket_path, e))?;

      return Ok(Stream::Unix(unix_stream));
    }

    let tcp_stream = TcpStream::connect(&self.config.address)
      .await
      .map_err(|e| anyhow!("failed to connect to {}: {}", self.config.address, e))?;

    tcp_stream.set_nodelay(true)?;

    match &self.tls {
      Some(tls) => {
        let tls_stream = tls
          .connector
          .connect(tls.server_name.clone(), tcp_stream)
          .await
          .map_err(|e| anyhow!("TLS handshake failed: {}", e))?;

        Ok(Stream::Tls(Box::new(tls_stream)))
      },
      None => Ok(Stream::Tcp(tcp_stream)),
    }
  }

  async fn write_line(&self, payload: &str) -> anyhow::Result<()> {
    let mut writer = self.writer.lock().await;
    let wh = writer.as_mut().ok_or_else(|| anyhow!("transport is not connected"))?;

    wh.write_all(payload.as_bytes()).await?;
    wh.write_all(self.config.line_terminator.as_bytes()).await?;
    wh.flush().await?;

    Ok(())
  }
}

#[async_trait::async_trait]
impl Transport for LineTransport {
  async fn connect(&self, cancellation: &CancellationToken) -> anyhow::Result<()> {
    if self.close_token.is_cancelled() {
      return Err(anyhow!("transport is closed"));
    }

    let stream = tokio::select! {
      res = self.dial() => res?,
      _ = cancellation.cancelled() => return Err(anyhow!("connect cancelled")),
    };

    let (rh, wh) = tokio::io::split(stream);
    *self.reader.lock().await = Some(BufReader::new(rh));
    *self.writer.lock().await = Some(wh);
    self.connected.store(true, Ordering::SeqCst);

    debug!(network = self.config.network.as_str(), secure = self.tls.is_some(), "transport connected");

    Ok(())
  }

  fn is_connected(&self) -> bool {
    self.connected.load(Ordering::SeqCst)
  }

  async fn send(&self, payload: &str, cancellation: &CancellationToken) -> anyhow::Result<()> {
    let res = tokio::select! {
      res = self.write_line(payload) => res,
      _ = cancellation.cancelled() => Err(anyhow!("send cancelled")),
    };

    if let Err(e) = &res
      && !cancellation.is_cancelled()
    {
      debug!("transport write failed: {}", e);
      self.connected.store(false, Ordering::SeqCst);
    }

    res
  }

  async fn receive(&self, cancellation: &CancellationToken) -> anyhow::Result<Option<String>> {
    let mut reader = self.reader.lock().await;
    let Some(rh) = reader.as_mut() else {
      return Ok(None);
    };

    let mut line = String::new();

    tokio::select! {
      res = rh.read_line(&mut line) => match res {
        Ok(0) => {
          debug!("connection closed by peer");
          self.connected.store(false, Ordering::SeqCst);
          Ok(None)
        },
        Ok(n) => {
          trace!(bytes = n, "received line");
          Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
        },
        Err(e) => {
          self.connected.store(false, Ordering::SeqCst);
          Err(e.into())
        },
      },
      _ = cancellation.cancelled() => Ok(None),
      _ = self.close_token.cancelled() => Ok(None),
    }
  }

  async fn close(&self) {
    self.close_token.cancel();
    self.connected.store(false, Ordering::SeqCst);

    if let Some(mut wh) = self.writer.lock().await.take()
      && let Err(e) = wh.shutdown().await
    {
      debug!("failed to shutdown transport stream: {}", e);
    }
    self.reader.lock().await.take();
  }
}

/// Certificate verifier that accepts all certificates without validation.
///
/// Only meant for development against self-signed servers.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &rustls::pki_types::CertificateDer<'_>,
    _intermediates: &[rustls::pki_types::CertificateDer<'_>],
    _server_name: &rustls::pki_types::ServerName<'_>,
    _ocsp_response: &[u8],
    _now: rustls::pki_types::UnixTime,
  ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
    Ok(rustls::client::danger::ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &rustls::pki_types::CertificateDer<'_>,
    _dss: &rustls::DigitallySignedStruct,
  ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
    Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &rustls::pki_types::CertificateDer<'_>,
    _dss: &rustls::DigitallySignedStruct,
  ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
    Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
    vec![
      rustls::SignatureScheme::RSA_PKCS1_SHA256,
      rustls::SignatureScheme::RSA_PKCS1_SHA384,
      rustls::SignatureScheme::RSA_PKCS1_SHA512,
      rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
      rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
      rustls::SignatureScheme::RSA_PSS_SHA256,
      rustls::SignatureScheme::RSA_PSS_SHA384,
      rustls::SignatureScheme::RSA_PSS_SHA512,
      rustls::SignatureScheme::ED25519,
    ]
  }
}
