//! Serial transports the bus runs on.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_serial::{DataBits, SerialPort, SerialPortBuilderExt, SerialStream, StopBits};

use crate::model::{BusConfig, Parity};

/// Half-duplex byte transport with a direction line.
pub trait SerialLink: AsyncRead + AsyncWrite + Unpin + Send {
    /// Drive the transceiver to transmit (`true`) or receive (`false`).
    fn set_direction(&mut self, transmit: bool) -> io::Result<()>;
}

/// How the RS-485 transceiver direction is switched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectionMode {
    /// RTS drives DE/RE.
    #[default]
    Rts,
    /// The adapter switches direction by itself.
    #[serde(rename = "none")]
    Passive,
}

/// Serial port whose RTS line drives the transceiver.
pub struct RtsDirectionLink {
    port: SerialStream,
}

impl RtsDirectionLink {
    pub fn new(port: SerialStream) -> Self {
        Self { port }
    }
}

impl SerialLink for RtsDirectionLink {
    fn set_direction(&mut self, transmit: bool) -> io::Result<()> {
        self.port
            .write_request_to_send(transmit)
            .map_err(io::Error::from)
    }
}

impl AsyncRead for RtsDirectionLink {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.port).poll_read(cx, buf)
    }
}

impl AsyncWrite for RtsDirectionLink {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.port).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.port).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.port).poll_shutdown(cx)
    }
}

/// Transport without direction control.
///
/// Used for auto-direction adapters and for in-memory pipes.
pub struct PassiveLink<T> {
    inner: T,
}

impl<T> PassiveLink<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialLink for PassiveLink<T> {
    fn set_direction(&mut self, _transmit: bool) -> io::Result<()> {
        Ok(())
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for PassiveLink<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for PassiveLink<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Opens the transport for a bus configuration.
pub trait LinkOpener: Send + Sync {
    fn open(&self, config: &BusConfig) -> io::Result<Box<dyn SerialLink>>;
}

impl<F> LinkOpener for F
where
    F: Fn(&BusConfig) -> io::Result<Box<dyn SerialLink>> + Send + Sync,
{
    fn open(&self, config: &BusConfig) -> io::Result<Box<dyn SerialLink>> {
        self(config)
    }
}

/// Opens a `tokio-serial` port.
#[derive(Debug, Clone)]
pub struct SerialOpener {
    path: String,
    direction: DirectionMode,
}

impl SerialOpener {
    pub fn new(path: impl Into<String>, direction: DirectionMode) -> Self {
        Self {
            path: path.into(),
            direction,
        }
    }
}

impl LinkOpener for SerialOpener {
    fn open(&self, config: &BusConfig) -> io::Result<Box<dyn SerialLink>> {
        let parity = match config.serial_format.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        };
        let stop_bits = match config.serial_format.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        };

        let port = tokio_serial::new(&self.path, config.baud)
            .data_bits(DataBits::Eight)
            .parity(parity)
            .stop_bits(stop_bits)
            .open_native_async()
            .map_err(io::Error::from)?;

        Ok(match self.direction {
            DirectionMode::Rts => Box::new(RtsDirectionLink::new(port)),
            DirectionMode::Passive => Box::new(PassiveLink::new(port)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_passive_link_passes_bytes() {
        let (near, mut far) = tokio::io::duplex(64);
        let mut link: Box<dyn SerialLink> = Box::new(PassiveLink::new(near));

        link.set_direction(true).unwrap();
        link.write_all(&[1, 2, 3]).await.unwrap();
        link.set_direction(false).unwrap();

        let mut buf = [0u8; 3];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn test_closure_opener() {
        let opener = |_: &BusConfig| -> io::Result<Box<dyn SerialLink>> {
            Err(io::Error::new(io::ErrorKind::NotFound, "no port"))
        };
        let result = opener.open(&BusConfig::default());
        assert_eq!(result.err().map(|e| e.kind()), Some(io::ErrorKind::NotFound));
    }

    #[test]
    fn test_direction_mode_names() {
        let mode: DirectionMode = serde_json::from_str("\"none\"").unwrap();
        assert_eq!(mode, DirectionMode::Passive);
        let mode: DirectionMode = serde_json::from_str("\"rts\"").unwrap();
        assert_eq!(mode, DirectionMode::Rts);
    }
}
