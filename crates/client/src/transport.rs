//! Broker transport
//!
//! A [`Transport`] owns one stream connection to the broker and exposes raw
//! byte send/receive. It never retries; any fault closes the stream and the
//! transport stays closed. Connectors for vsock and Unix sockets live here
//! too.

use common::{BoxedStream, Connector, Endpoint};
use std::io;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio_vsock::{VsockAddr, VsockStream};
use tracing::{debug, info};

use crate::error::{ApiError, Result};

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected
    Unconnected,
    /// Stream open
    Connected,
    /// Closed by us, by the peer or by a fault; never reopened
    Closed,
}

/// One stream connection to the broker
pub struct Transport<S> {
    stream: Option<S>,
    peer: String,
}

impl<S> Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Open a connection through `connector`
    pub async fn connect<C>(connector: &C) -> Result<Self>
    where
        C: Connector<Stream = S>,
    {
        let peer = connector.describe();
        info!("Connecting to broker at {}", peer);

        let stream = connector
            .connect()
            .await
            .map_err(|source| ApiError::Connect {
                endpoint: peer.clone(),
                source,
            })?;

        info!("Connected to broker at {}", peer);
        Ok(Self {
            stream: Some(stream),
            peer,
        })
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        if self.stream.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Closed
        }
    }

    /// Address of the peer, as described by the connector
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Write every byte of `bytes`
    ///
    /// Short writes are continued until done. On failure the stream is
    /// closed.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(ApiError::NotConnected)?;

        let result = async {
            stream.write_all(bytes).await?;
            stream.flush().await
        }
        .await;

        if let Err(e) = result {
            self.close().await;
            return Err(ApiError::Io(e));
        }
        Ok(())
    }

    /// Read up to `buf.len()` bytes
    ///
    /// `Ok(0)` means the peer closed the stream; the transport is closed as
    /// well in that case.
    pub async fn receive(&mut self, buf: &mut [u8]) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or(ApiError::NotConnected)?;

        match stream.read(buf).await {
            Ok(0) => {
                debug!("Broker at {} closed the connection", self.peer);
                self.close().await;
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) => {
                self.close().await;
                Err(ApiError::Io(e))
            }
        }
    }

    /// Close the stream; safe to call repeatedly or after a fault
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("Shutdown of connection to {} failed: {}", self.peer, e);
            }
            debug!("Closed connection to {}", self.peer);
        }
    }
}

/// Connector for the broker's vsock port
#[derive(Debug, Clone)]
pub struct VsockConnector {
    endpoint: Endpoint,
}

impl VsockConnector {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }
}

impl Connector for VsockConnector {
    type Stream = VsockStream;

    async fn connect(&self) -> io::Result<VsockStream> {
        VsockStream::connect(VsockAddr::new(self.endpoint.cid, self.endpoint.port)).await
    }

    fn describe(&self) -> String {
        self.endpoint.to_string()
    }
}

/// Connector for a broker (or relay) listening on a Unix stream socket
#[derive(Debug, Clone)]
pub struct UnixConnector {
    path: PathBuf,
}

impl UnixConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Connector for UnixConnector {
    type Stream = UnixStream;

    async fn connect(&self) -> io::Result<UnixStream> {
        UnixStream::connect(&self.path).await
    }

    fn describe(&self) -> String {
        format!("unix://{}", self.path.display())
    }
}

/// Runtime choice between the supported transports
#[derive(Debug, Clone)]
pub enum BrokerConnector {
    Vsock(VsockConnector),
    Unix(UnixConnector),
}

impl Connector for BrokerConnector {
    type Stream = BoxedStream;

    async fn connect(&self) -> io::Result<BoxedStream> {
        match self {
            BrokerConnector::Vsock(connector) => Ok(Box::new(connector.connect().await?)),
            BrokerConnector::Unix(connector) => Ok(Box::new(connector.connect().await?)),
        }
    }

    fn describe(&self) -> String {
        match self {
            BrokerConnector::Vsock(connector) => connector.describe(),
            BrokerConnector::Unix(connector) => connector.describe(),
        }
    }
}
