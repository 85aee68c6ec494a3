//! Network connections and TLS policy

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use log::{debug, info};
use rustls::pki_types::ServerName;
use rustls::{
    ClientConfig, ClientConnection, ProtocolVersion, RootCertStore, StreamOwned,
    SupportedProtocolVersion,
};

use crate::smtp::error::TransportError;

/// How the channel gets encrypted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    /// Plain connection upgraded with STARTTLS (RFC 3207)
    StartTls,
    /// TLS from the first byte (RFC 8314)
    Implicit,
    /// No encryption; always refused
    None,
}

impl TlsMode {
    /// Implicit TLS on the submissions port, STARTTLS everywhere else
    pub fn for_port(port: u16) -> Self {
        if port == 465 {
            TlsMode::Implicit
        } else {
            TlsMode::StartTls
        }
    }
}

/// TLS protocol versions, ordered oldest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls10,
    Tls11,
    Tls12,
    Tls13,
}

impl TlsVersion {
    /// Oldest version this crate will ever negotiate
    pub const MINIMUM_ALLOWED: TlsVersion = TlsVersion::Tls12;

    fn from_rustls(version: ProtocolVersion) -> Option<Self> {
        match version {
            ProtocolVersion::TLSv1_0 => Some(TlsVersion::Tls10),
            ProtocolVersion::TLSv1_1 => Some(TlsVersion::Tls11),
            ProtocolVersion::TLSv1_2 => Some(TlsVersion::Tls12),
            ProtocolVersion::TLSv1_3 => Some(TlsVersion::Tls13),
            _ => None,
        }
    }
}

/// Encryption requirements for a send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsPolicy {
    pub mode: TlsMode,
    pub min_version: TlsVersion,
}

impl TlsPolicy {
    /// Policy used by default for a port
    pub fn for_port(port: u16) -> Self {
        Self {
            mode: TlsMode::for_port(port),
            min_version: TlsVersion::MINIMUM_ALLOWED,
        }
    }

    /// Refuse policies that would send credentials over a weak or plain channel
    pub fn check(&self) -> Result<(), TransportError> {
        if self.mode == TlsMode::None {
            return Err(TransportError::Insecure(
                "TLS is disabled; XOAUTH2 tokens are only sent over TLS".to_owned(),
            ));
        }
        if self.min_version < TlsVersion::MINIMUM_ALLOWED {
            return Err(TransportError::Insecure(format!(
                "minimum TLS version {:?} is below {:?}",
                self.min_version,
                TlsVersion::MINIMUM_ALLOWED
            )));
        }
        Ok(())
    }
}

impl Default for TlsPolicy {
    fn default() -> Self {
        Self::for_port(587)
    }
}

/// A bidirectional byte stream to an SMTP server that can be upgraded to TLS
pub trait Connection: Read + Write {
    /// Run the TLS handshake on the existing stream
    fn start_tls(&mut self, host: &str) -> Result<(), TransportError>;

    /// Negotiated TLS version; `None` while the stream is plain
    fn tls_version(&self) -> Option<TlsVersion>;
}

/// Opens connections to SMTP servers
pub trait Connector {
    type Conn: Connection;

    fn connect(&self, host: &str, port: u16) -> Result<Self::Conn, TransportError>;
}

static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

/// Direct TCP connector with rustls for TLS.
///
/// Connections go straight to the resolved address; proxy settings from the
/// environment are never consulted.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    tls_config: Arc<ClientConfig>,
}

impl TcpConnector {
    /// Build a connector trusting the webpki root set
    pub fn new(policy: &TlsPolicy) -> Result<Self, TransportError> {
        policy.check()?;

        let versions = match policy.min_version {
            TlsVersion::Tls13 => TLS13_ONLY,
            _ => rustls::DEFAULT_VERSIONS,
        };

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_protocol_versions(versions)
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();

        Ok(Self {
            tls_config: Arc::new(config),
        })
    }
}

impl Connector for TcpConnector {
    type Conn = TcpConnection;

    fn connect(&self, host: &str, port: u16) -> Result<TcpConnection, TransportError> {
        let addr = format!("{host}:{port}");
        debug!("Connecting directly to {addr}");

        let stream = TcpStream::connect((host, port))
            .map_err(|source| TransportError::Connect { addr, source })?;

        Ok(TcpConnection {
            stream: NetworkStream::Tcp(stream),
            tls_config: Arc::clone(&self.tls_config),
        })
    }
}

enum NetworkStream {
    Tcp(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
    /// Left behind when a handshake fails midway
    Closed,
}

/// A TCP connection, plain or TLS
pub struct TcpConnection {
    stream: NetworkStream,
    tls_config: Arc<ClientConfig>,
}

impl Connection for TcpConnection {
    fn start_tls(&mut self, host: &str) -> Result<(), TransportError> {
        let tcp = match std::mem::replace(&mut self.stream, NetworkStream::Closed) {
            NetworkStream::Tcp(tcp) => tcp,
            other => {
                self.stream = other;
                return Err(TransportError::Tls(
                    "connection is not a plain TCP stream".to_owned(),
                ));
            }
        };

        let server_name = ServerName::try_from(host.to_owned())
            .map_err(|e| TransportError::Tls(format!("invalid server name {host}: {e}")))?;
        let conn = ClientConnection::new(Arc::clone(&self.tls_config), server_name)
            .map_err(|e| TransportError::Tls(e.to_string()))?;

        let mut tls = StreamOwned::new(conn, tcp);
        while tls.conn.is_handshaking() {
            tls.conn
                .complete_io(&mut tls.sock)
                .map_err(|e| TransportError::Tls(format!("handshake with {host} failed: {e}")))?;
        }

        let version = tls.conn.protocol_version();
        info!("TLS established with {host} ({version:?})");
        self.stream = NetworkStream::Tls(Box::new(tls));
        Ok(())
    }

    fn tls_version(&self) -> Option<TlsVersion> {
        match &self.stream {
            NetworkStream::Tls(tls) => tls.conn.protocol_version().and_then(TlsVersion::from_rustls),
            _ => None,
        }
    }
}

impl Read for TcpConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.stream {
            NetworkStream::Tcp(s) => s.read(buf),
            NetworkStream::Tls(s) => s.read(buf),
            NetworkStream::Closed => Err(io::ErrorKind::NotConnected.into()),
        }
    }
}

impl Write for TcpConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.stream {
            NetworkStream::Tcp(s) => s.write(buf),
            NetworkStream::Tls(s) => s.write(buf),
            NetworkStream::Closed => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.stream {
            NetworkStream::Tcp(s) => s.flush(),
            NetworkStream::Tls(s) => s.flush(),
            NetworkStream::Closed => Err(io::ErrorKind::NotConnected.into()),
        }
    }
}
