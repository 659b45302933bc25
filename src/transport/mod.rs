//! Plain TCP or TLS connections to the collector, behind a [Connector] seam so that sessions can
//!  be tested against in-memory streams.

pub mod compression;
pub mod tls;

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::config::UldpConfig;
use crate::error::UldpError;

pub trait UldpStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> UldpStream for T {}

/// An established (and, for TLS, authorized) connection to a collector
pub struct Connection {
    pub stream: Box<dyn UldpStream>,
    /// the local address of the connection, used as origin address for log messages that do not
    ///  specify one
    pub local_addr: IpAddr,
    pub peer: String,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, config: &UldpConfig) -> Result<Connection, UldpError>;
}

/// Connects via TCP, wrapped in TLS if the configuration has TLS material
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, config: &UldpConfig) -> Result<Connection, UldpError> {
        let endpoint = config.endpoint();
        let connect_error = |source: std::io::Error| UldpError::Connect { endpoint: endpoint.clone(), source };

        // certificate material is checked before connecting
        let tls_config = match &config.tls {
            Some(tls) => Some(tls::client_config(tls)?),
            None => None,
        };

        let tcp = timeout(config.connect_timeout, TcpStream::connect((config.host.as_str(), config.port)))
            .await
            .map_err(|_| connect_error(std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out")))?
            .map_err(connect_error)?;
        tcp.set_nodelay(true)
            .map_err(connect_error)?;

        let local_addr = tcp.local_addr().map_err(connect_error)?.ip();
        let peer = tcp.peer_addr()
            .map(|a: SocketAddr| a.to_string())
            .unwrap_or_else(|_| endpoint.clone());

        let Some(tls_config) = tls_config else {
            info!("connected to {} (plain TCP)", peer);
            return Ok(Connection { stream: Box::new(tcp), local_addr, peer });
        };

        let server_name = tls::server_name(&config.host)?;
        let tls_stream = timeout(config.connect_timeout, TlsConnector::from(tls_config).connect(server_name, tcp))
            .await
            .map_err(|_| UldpError::Tls("TLS handshake timed out".to_string()))?
            .map_err(|e| UldpError::Tls(format!("TLS handshake with {} failed: {}", peer, e)))?;

        let (_, session) = tls_stream.get_ref();
        debug!("TLS session established: {:?}", session.protocol_version());
        info!("connected to {} (TLS)", peer);

        Ok(Connection { stream: Box::new(tls_stream), local_addr, peer })
    }
}
