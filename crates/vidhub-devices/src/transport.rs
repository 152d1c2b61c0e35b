/*!
 * Byte transports for the line protocol.
 *
 * A [`Connector`] opens a connection and hands back separate reader and
 * writer halves so the read loop and command writers never contend for
 * the same handle.
 */
use std::fmt::Debug;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace};

const READ_CHUNK_SIZE: usize = 4096;

/// Receiving half of an open transport
#[async_trait]
pub trait TransportReader: Send + Debug {
    /// Suspend until data can be read
    async fn wait_until_data_ready(&mut self) -> io::Result<()>;

    /// Drain everything that is currently available without blocking
    ///
    /// May return an empty buffer after a spurious wakeup. A closed peer is
    /// reported as [`io::ErrorKind::UnexpectedEof`].
    fn read_available(&mut self) -> io::Result<Bytes>;
}

/// Sending half of an open transport
#[async_trait]
pub trait TransportWriter: Send + Debug {
    /// Write all of `data`
    async fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Close the transport
    async fn close(&mut self) -> io::Result<()>;
}

/// The two halves of an opened transport
#[derive(Debug)]
pub struct TransportHalves {
    /// Receiving half, owned by the read loop
    pub reader: Box<dyn TransportReader>,
    /// Sending half, shared by command writers
    pub writer: Box<dyn TransportWriter>,
}

/// Opens transports to devices
#[async_trait]
pub trait Connector: Send + Sync + Debug {
    /// Open a connection to `host:port`
    async fn open(&self, host: &str, port: u16) -> io::Result<TransportHalves>;
}

/// TCP connector
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Option<Duration>,
}

impl TcpConnector {
    /// Create a connector without a connect timeout
    pub fn new() -> Self {
        Self { connect_timeout: None }
    }

    /// Create a connector that gives up connecting after `timeout`
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            connect_timeout: Some(timeout),
        }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn open(&self, host: &str, port: u16) -> io::Result<TransportHalves> {
        debug!("Opening TCP connection to {}:{}", host, port);
        let stream = match self.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, TcpStream::connect((host, port)))
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connecting to {}:{} timed out", host, port),
                    )
                })??,
            None => TcpStream::connect((host, port)).await?,
        };
        stream.set_nodelay(true)?;

        let (reader, writer) = stream.into_split();
        Ok(TransportHalves {
            reader: Box::new(TcpReader(reader)),
            writer: Box::new(TcpWriter(writer)),
        })
    }
}

#[derive(Debug)]
struct TcpReader(OwnedReadHalf);

#[async_trait]
impl TransportReader for TcpReader {
    async fn wait_until_data_ready(&mut self) -> io::Result<()> {
        self.0.readable().await
    }

    fn read_available(&mut self) -> io::Result<Bytes> {
        let mut collected = BytesMut::new();
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            match self.0.try_read(&mut chunk) {
                Ok(0) if collected.is_empty() => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by device",
                    ));
                }
                // Hand over what we have; the next call reports the close.
                Ok(0) => break,
                Ok(n) => collected.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        trace!("Read {} bytes", collected.len());
        Ok(collected.freeze())
    }
}

#[derive(Debug)]
struct TcpWriter(OwnedWriteHalf);

#[async_trait]
impl TransportWriter for TcpWriter {
    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.0.write_all(data).await?;
        self.0.flush().await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.0.shutdown().await
    }
}
