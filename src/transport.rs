//! byte stream transports for talking to the meter

use std::str::FromStr;

use async_trait::async_trait;
use bluer::{rfcomm, Address};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Debug, thiserror::Error)]
pub(crate) enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport is not connected")]
    NotConnected,

    #[error("connection closed by remote")]
    Closed,

    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// A connection oriented byte stream.
///
/// `receive` may return fewer bytes than asked for, including none at all.
#[async_trait]
pub(crate) trait Transport: Send {
    async fn connect(&mut self) -> Result<(), TransportError>;
    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError>;
    async fn receive(&mut self, max_bytes: usize) -> Result<Vec<u8>, TransportError>;
    async fn close(&mut self);

    /// address the transport dials, also the source of the device serial
    fn address(&self) -> &str;
}

/// RFCOMM serial link over BlueZ
pub(crate) struct RfcommTransport {
    address: String,
    target: rfcomm::SocketAddr,
    stream: Option<rfcomm::Stream>,
}

impl RfcommTransport {
    pub(crate) fn new(address: &str, channel: u8) -> Result<Self, TransportError> {
        let parsed = Address::from_str(address)
            .map_err(|e| TransportError::InvalidAddress(format!("{address}: {e}")))?;

        return Ok(Self {
            address: address.to_string(),
            target: rfcomm::SocketAddr::new(parsed, channel),
            stream: None,
        });
    }
}

#[async_trait]
impl Transport for RfcommTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        log::info!(
            "connecting to {} on channel {}",
            self.target.addr,
            self.target.channel
        );
        let stream = rfcomm::Stream::connect(self.target).await?;
        self.stream = Some(stream);
        log::info!("connected to {}", self.target.addr);
        return Ok(());
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        stream.write_all(bytes).await?;
        return Ok(());
    }

    async fn receive(&mut self, max_bytes: usize) -> Result<Vec<u8>, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        let mut buf = vec![0u8; max_bytes];
        let n = stream.read(&mut buf).await?;
        if n == 0 && max_bytes > 0 {
            return Err(TransportError::Closed);
        }
        buf.truncate(n);
        log::trace!("received {} bytes", n);
        return Ok(buf);
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                log::debug!("failed to shut down stream: {:?}", e);
            }
            log::info!("disconnected from {}", self.target.addr);
        }
    }

    fn address(&self) -> &str {
        &self.address
    }
}
