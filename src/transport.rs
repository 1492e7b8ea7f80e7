//! # Byte-stream transports
//!
//! The engine talks to the wire through [`ModbusTransport`]: connect/close
//! lifecycle, a flush that discards stale input, byte-level send/receive
//! and a readiness wait with an optional deadline. `receive` returns
//! whatever is available up to the buffer size, so the engine can ask for
//! more bytes than a short frame contains without stalling.
//!
//! Two implementations are provided:
//!
//! - [`TcpTransport`]: a Tokio TCP socket, reconnectable, with
//!   `TCP_NODELAY` set since Modbus exchanges are small and latency-bound
//! - [`SerialTransport`]: a serial line via `tokio-serial`, byte-at-a-time
//!   reads paced by the readiness wait

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_serial::{DataBits, Parity, SerialStream, StopBits};

use crate::error::{ModbusError, ModbusResult};
use crate::MAX_ADU_LENGTH;

/// Byte-stream collaborator driven by the transaction engine
#[async_trait]
pub trait ModbusTransport: Send {
    /// Establish (or re-establish) the underlying connection
    async fn connect(&mut self) -> ModbusResult<()>;

    /// Tear the connection down; safe to call when already closed
    async fn close(&mut self) -> ModbusResult<()>;

    /// Discard any unread input without blocking
    async fn flush(&mut self) -> ModbusResult<()>;

    /// Send the whole buffer
    async fn send(&mut self, data: &[u8]) -> ModbusResult<usize>;

    /// Read available bytes, at most `buf.len()`. Zero means the peer
    /// closed the connection.
    async fn receive(&mut self, buf: &mut [u8]) -> ModbusResult<usize>;

    /// Wait until at least one byte can be received. `None` waits forever.
    async fn wait_readable(&mut self, timeout: Option<Duration>) -> ModbusResult<()>;

    fn is_connected(&self) -> bool;
}

fn not_connected() -> ModbusError {
    ModbusError::connection("transport is not connected")
}

fn timeout_ms(timeout: Duration) -> u64 {
    timeout.as_millis() as u64
}

/// TCP socket transport
pub struct TcpTransport {
    address: Option<SocketAddr>,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    /// Transport that will dial `address` on [`connect`](ModbusTransport::connect)
    pub fn new(address: SocketAddr) -> Self {
        TcpTransport {
            address: Some(address),
            stream: None,
        }
    }

    /// Wrap an already-accepted stream (server side). Without a remote
    /// address the transport cannot reconnect.
    pub fn from_stream(stream: TcpStream) -> Self {
        let address = stream.peer_addr().ok();
        TcpTransport {
            address,
            stream: Some(stream),
        }
    }
}

#[async_trait]
impl ModbusTransport for TcpTransport {
    async fn connect(&mut self) -> ModbusResult<()> {
        let address = self.address.ok_or_else(|| {
            ModbusError::configuration("no remote address available for reconnection")
        })?;
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| ModbusError::connection(format!("connect to {} failed: {}", address, e)))?;
        let _ = stream.set_nodelay(true);
        debug!("TCP transport connected to {}", address);
        self.stream = Some(stream);
        Ok(())
    }

    async fn close(&mut self) -> ModbusResult<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!("TCP transport closed");
        }
        Ok(())
    }

    async fn flush(&mut self) -> ModbusResult<()> {
        if let Some(stream) = &mut self.stream {
            let mut scratch = [0u8; MAX_ADU_LENGTH];
            while let Ok(n) = stream.try_read(&mut scratch) {
                if n == 0 {
                    break;
                }
                debug!("TCP transport discarded {} stale bytes", n);
            }
        }
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> ModbusResult<usize> {
        let stream = self.stream.as_mut().ok_or_else(not_connected)?;
        stream.write_all(data).await?;
        Ok(data.len())
    }

    async fn receive(&mut self, buf: &mut [u8]) -> ModbusResult<usize> {
        let stream = self.stream.as_mut().ok_or_else(not_connected)?;
        let n = stream.read(buf).await?;
        Ok(n)
    }

    async fn wait_readable(&mut self, timeout: Option<Duration>) -> ModbusResult<()> {
        let stream = self.stream.as_ref().ok_or_else(not_connected)?;
        match timeout {
            Some(duration) => tokio::time::timeout(duration, stream.readable())
                .await
                .map_err(|_| ModbusError::timeout("waiting for readable socket", timeout_ms(duration)))?
                .map_err(ModbusError::from),
            None => stream.readable().await.map_err(ModbusError::from),
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

/// Serial line parameters consumed by [`SerialTransport`]. These exist only
/// on the RTU path; a TCP context has nowhere to put them.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub path: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
}

impl SerialConfig {
    /// 8N1 at the given baud rate
    pub fn new<S: Into<String>>(path: S, baud_rate: u32) -> Self {
        SerialConfig {
            path: path.into(),
            baud_rate,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
        }
    }
}

/// Serial line transport for RTU framing
pub struct SerialTransport {
    config: SerialConfig,
    port: Option<SerialStream>,
    /// Byte consumed by the readiness wait, handed back by the next receive
    lookahead: Option<u8>,
}

impl SerialTransport {
    pub fn new(config: SerialConfig) -> Self {
        SerialTransport {
            config,
            port: None,
            lookahead: None,
        }
    }
}

#[async_trait]
impl ModbusTransport for SerialTransport {
    async fn connect(&mut self) -> ModbusResult<()> {
        let builder = tokio_serial::new(&self.config.path, self.config.baud_rate)
            .data_bits(self.config.data_bits)
            .stop_bits(self.config.stop_bits)
            .parity(self.config.parity);
        let port = SerialStream::open(&builder).map_err(|e| {
            ModbusError::connection(format!("open {} failed: {}", self.config.path, e))
        })?;
        debug!(
            "serial transport opened {} at {} baud",
            self.config.path, self.config.baud_rate
        );
        self.port = Some(port);
        self.lookahead = None;
        Ok(())
    }

    async fn close(&mut self) -> ModbusResult<()> {
        if self.port.take().is_some() {
            debug!("serial transport closed {}", self.config.path);
        }
        self.lookahead = None;
        Ok(())
    }

    async fn flush(&mut self) -> ModbusResult<()> {
        self.lookahead = None;
        if let Some(port) = &mut self.port {
            let mut scratch = [0u8; MAX_ADU_LENGTH];
            let mut discarded = 0usize;
            loop {
                match tokio::time::timeout(Duration::from_millis(1), port.read(&mut scratch)).await
                {
                    Ok(Ok(n)) if n > 0 => discarded += n,
                    _ => break,
                }
            }
            if discarded > 0 {
                debug!("serial transport discarded {} stale bytes", discarded);
            }
        }
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> ModbusResult<usize> {
        let port = self.port.as_mut().ok_or_else(not_connected)?;
        port.write_all(data).await?;
        port.flush().await?;
        Ok(data.len())
    }

    async fn receive(&mut self, buf: &mut [u8]) -> ModbusResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if let Some(byte) = self.lookahead.take() {
            buf[0] = byte;
            return Ok(1);
        }
        let port = self.port.as_mut().ok_or_else(not_connected)?;
        let n = port.read(buf).await?;
        Ok(n)
    }

    async fn wait_readable(&mut self, timeout: Option<Duration>) -> ModbusResult<()> {
        if self.lookahead.is_some() {
            return Ok(());
        }
        let port = self.port.as_mut().ok_or_else(not_connected)?;
        let mut byte = [0u8; 1];
        let n = match timeout {
            Some(duration) => tokio::time::timeout(duration, port.read(&mut byte))
                .await
                .map_err(|_| {
                    ModbusError::timeout("waiting for serial data", timeout_ms(duration))
                })??,
            None => port.read(&mut byte).await?,
        };
        if n == 0 {
            return Err(ModbusError::connection("serial port closed"));
        }
        self.lookahead = Some(byte[0]);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }
}
