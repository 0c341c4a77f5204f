//! Trait abstraction for serial port operations to enable testing

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_serial::SerialPortBuilderExt;

/// Trait for serial port I/O operations
#[async_trait]
pub trait SerialPortIO: Send {
    /// Write all data to the port
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Flush the output buffer
    async fn flush(&mut self) -> io::Result<()>;

    /// Read available bytes into `buf`. `Ok(0)` means the port was closed.
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Opens transports for a board address.
///
/// Kept separate from [`SerialPortIO`] so the registry can reopen a port on
/// reconnect without knowing what kind of transport it is.
pub trait PortOpener: Send + Sync {
    fn open(&self, address: &str, baud_rate: u32) -> io::Result<Box<dyn SerialPortIO>>;
}

/// Adapter from any tokio byte stream to [`SerialPortIO`]
pub struct StreamPort<S> {
    stream: S,
}

impl<S> StreamPort<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }
}

/// Wrapper around tokio_serial::SerialStream that implements SerialPortIO
pub type TokioSerialPort = StreamPort<tokio_serial::SerialStream>;

#[async_trait]
impl<S> SerialPortIO for StreamPort<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.stream.flush().await
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf).await
    }
}

/// Opens real serial devices with 8N1 framing
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSerialOpener;

impl PortOpener for TokioSerialOpener {
    fn open(&self, address: &str, baud_rate: u32) -> io::Result<Box<dyn SerialPortIO>> {
        let port = tokio_serial::new(address, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(io::Error::from)?;

        Ok(Box::new(TokioSerialPort::new(port)))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_port_writes_and_reads() {
        let stream = tokio_test::io::Builder::new()
            .write(b"TEST:13\n")
            .read(b"OK\n")
            .build();
        let mut port = StreamPort::new(stream);

        port.write_all(b"TEST:13\n").await.unwrap();
        port.flush().await.unwrap();

        let mut buf = [0u8; 16];
        let n = port.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"OK\n");
    }

    #[tokio::test]
    async fn test_tokio_opener_missing_device() {
        let result = TokioSerialOpener.open("/dev/nonexistent_serial_device_12345", 115_200);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_mock_port_splits_long_replies() {
        let mut port = mocks::MockSerialPort::new();
        port.push_reply(b"OK:PWM:9:128\n");

        let mut buf = [0u8; 4];
        let n = port.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"OK:P");
        let n = port.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"WM:9");
    }
}
