//! Serial transport.
//!
//! A [`LineTransport`] owns one serial line and turns it into logical lines.
//! Devices in this family disagree with themselves about terminators: they
//! take commands ending in CR, answer with CR, and emit error or status lines
//! ending in LF or CRLF. Reads therefore treat CR, LF and CRLF alike, while
//! writes append exactly the terminator the protocol asks for.
//!
//! A read that times out returns an empty string rather than an error. The
//! layers above read emptiness as "no reply yet" and decide whether to retry.
//!
//! [`Connection`] wraps a transport in a shared handle whose lock is scoped
//! to one guard, so at most one command/response cycle runs at a time.
//!
//! # Example
//!
//! ```rust,ignore
//! use scope_core::serial::{Connection, SerialSettings};
//!
//! let settings = SerialSettings::new("/dev/ttyUSB0", 115_200)
//!     .with_timeout(Duration::from_secs(2))
//!     .with_terminator("\r");
//! let connection = Connection::open("FW102C", &settings).await?;
//! let mut line = connection.lock().await;
//! line.write_line("pcount?").await?;
//! let echo = line.read_line().await?;
//! ```

use crate::error::{DeviceError, DeviceResult};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;

// =============================================================================
// Serial Port Trait
// =============================================================================

/// Trait alias for async serial port I/O.
///
/// Satisfied by `tokio_serial::SerialStream` for hardware and by
/// `tokio::io::DuplexStream` for simulated devices.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

// =============================================================================
// Settings
// =============================================================================

/// Line settings. Parity, stop bits and byte size are fixed at 8N1.
#[derive(Debug, Clone, PartialEq)]
pub struct SerialSettings {
    /// Port path, e.g. `/dev/ttyUSB0` or `COM4`
    pub port: String,
    pub baud_rate: u32,
    /// Per-line read timeout
    pub timeout: Duration,
    /// Appended by [`LineTransport::write_line`]
    pub write_terminator: String,
}

impl SerialSettings {
    /// Settings with a one second timeout and CR terminator.
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            timeout: Duration::from_secs(1),
            write_terminator: "\r".to_string(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.write_terminator = terminator.into();
        self
    }
}

// =============================================================================
// Opening ports
// =============================================================================

/// Open a serial port asynchronously using spawn_blocking.
///
/// Standard settings are applied: 8N1, no flow control.
#[cfg(feature = "serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    device_name: &str,
) -> anyhow::Result<tokio_serial::SerialStream> {
    use anyhow::Context;
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();
    let device_name_owned = device_name.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .with_context(|| {
                format!(
                    "Failed to open {} serial port: {}",
                    device_name_owned, port_path_owned
                )
            })
    })
    .await
    .context("spawn_blocking for serial port opening failed")?
}

// =============================================================================
// LineTransport
// =============================================================================

/// Exclusively owned serial line with normalised line reads.
pub struct LineTransport {
    port: DynSerial,
    timeout: Duration,
    terminator: String,
    pending: VecDeque<u8>,
    /// Last byte consumed ended a line with CR; a following LF is swallowed.
    after_cr: bool,
}

impl LineTransport {
    /// Open the configured port. Failure is an initialization error.
    #[cfg(feature = "serial")]
    pub async fn open(settings: &SerialSettings, device_name: &str) -> DeviceResult<Self> {
        let stream = open_serial_async(&settings.port, settings.baud_rate, device_name)
            .await
            .map_err(|e| DeviceError::Initialization(format!("{:#}", e)))?;
        tracing::info!(
            device = device_name,
            port = %settings.port,
            baud = settings.baud_rate,
            "Opened serial port"
        );
        Ok(Self::from_port(
            Box::new(stream),
            settings.timeout,
            &settings.write_terminator,
        ))
    }

    /// Wrap an already open port.
    pub fn from_port(port: DynSerial, timeout: Duration, terminator: &str) -> Self {
        Self {
            port,
            timeout,
            terminator: terminator.to_string(),
            pending: VecDeque::new(),
            after_cr: false,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Write raw bytes and flush.
    pub async fn write(&mut self, bytes: &[u8]) -> DeviceResult<()> {
        self.port.write_all(bytes).await?;
        self.port.flush().await?;
        Ok(())
    }

    /// Write `text` followed by the protocol terminator.
    pub async fn write_line(&mut self, text: &str) -> DeviceResult<()> {
        tracing::trace!(line = %text, "serial write");
        let mut bytes = Vec::with_capacity(text.len() + self.terminator.len());
        bytes.extend_from_slice(text.as_bytes());
        bytes.extend_from_slice(self.terminator.as_bytes());
        self.write(&bytes).await
    }

    /// Read one logical line without its terminator.
    ///
    /// Returns an empty string when the timeout expires with nothing read,
    /// and the partial line when it expires mid-line. End of stream behaves
    /// like a timeout.
    pub async fn read_line(&mut self) -> DeviceResult<String> {
        let deadline = Instant::now() + self.timeout;
        let mut line = Vec::new();

        loop {
            while let Some(byte) = self.pending.pop_front() {
                match byte {
                    b'\n' if self.after_cr => {
                        self.after_cr = false;
                    }
                    b'\r' => {
                        self.after_cr = true;
                        return Ok(finish_line(line));
                    }
                    b'\n' => {
                        return Ok(finish_line(line));
                    }
                    _ => {
                        self.after_cr = false;
                        line.push(byte);
                    }
                }
            }

            let mut buf = [0u8; 256];
            match tokio::time::timeout_at(deadline, self.port.read(&mut buf)).await {
                Ok(Ok(0)) => return Ok(finish_line(line)),
                Ok(Ok(n)) => self.pending.extend(&buf[..n]),
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => {
                    return Ok(finish_line(line));
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    if !line.is_empty() {
                        tracing::trace!(partial = %String::from_utf8_lossy(&line), "read timed out mid-line");
                    }
                    return Ok(finish_line(line));
                }
            }
        }
    }

    /// Discard everything the device has already sent.
    ///
    /// Reads with a short quiet window until nothing more arrives. Returns the
    /// number of bytes discarded.
    pub async fn drain(&mut self, quiet: Duration) -> usize {
        let mut total = self.pending.len();
        self.pending.clear();
        self.after_cr = false;

        let mut buf = [0u8; 256];
        loop {
            match tokio::time::timeout(quiet, self.port.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
                Ok(Ok(n)) => total += n,
            }
        }
        if total > 0 {
            tracing::debug!(discarded = total, "Drained stale serial input");
        }
        total
    }

    /// Shut down the write half. The port is released when dropped.
    pub async fn close(&mut self) -> DeviceResult<()> {
        self.port.shutdown().await?;
        Ok(())
    }
}

fn finish_line(line: Vec<u8>) -> String {
    String::from_utf8_lossy(&line).into_owned()
}

// =============================================================================
// Connection
// =============================================================================

/// Shared handle to a device's serial line.
///
/// Clones refer to the same line. [`Connection::lock`] waits for exclusive
/// access and releases it when the guard drops; the underlying mutex is
/// never exposed.
#[derive(Clone)]
pub struct Connection {
    name: Arc<str>,
    inner: Arc<Mutex<LineTransport>>,
}

impl Connection {
    pub fn new(name: &str, transport: LineTransport) -> Self {
        Self {
            name: Arc::from(name),
            inner: Arc::new(Mutex::new(transport)),
        }
    }

    /// Open a hardware port and wrap it.
    #[cfg(feature = "serial")]
    pub async fn open(name: &str, settings: &SerialSettings) -> DeviceResult<Self> {
        let transport = LineTransport::open(settings, name).await?;
        Ok(Self::new(name, transport))
    }

    /// Device name used in log fields.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for exclusive use of the line.
    pub async fn lock(&self) -> ConnectionGuard {
        ConnectionGuard {
            guard: self.inner.clone().lock_owned().await,
        }
    }
}

/// Exclusive access to a [`LineTransport`], released on drop.
pub struct ConnectionGuard {
    guard: OwnedMutexGuard<LineTransport>,
}

impl Deref for ConnectionGuard {
    type Target = LineTransport;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for ConnectionGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    fn transport(timeout_ms: u64) -> (LineTransport, tokio::io::DuplexStream) {
        let (host, device) = duplex(256);
        (
            LineTransport::from_port(Box::new(host), Duration::from_millis(timeout_ms), "\r"),
            device,
        )
    }

    #[tokio::test]
    async fn test_read_line_normalises_terminators() {
        let (mut line, mut device) = transport(100);
        device.write_all(b"one\rtwo\nthree\r\nfour\r").await.unwrap();

        assert_eq!(line.read_line().await.unwrap(), "one");
        assert_eq!(line.read_line().await.unwrap(), "two");
        assert_eq!(line.read_line().await.unwrap(), "three");
        assert_eq!(line.read_line().await.unwrap(), "four");
    }

    #[tokio::test]
    async fn test_crlf_split_across_reads() {
        let (mut line, mut device) = transport(100);
        device.write_all(b"value\r").await.unwrap();
        assert_eq!(line.read_line().await.unwrap(), "value");

        device.write_all(b"\nnext\r").await.unwrap();
        assert_eq!(line.read_line().await.unwrap(), "next");
    }

    #[tokio::test]
    async fn test_timeout_returns_empty() {
        let (mut line, _device) = transport(20);
        assert_eq!(line.read_line().await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_timeout_returns_partial_line() {
        let (mut line, mut device) = transport(30);
        device.write_all(b"parti").await.unwrap();
        assert_eq!(line.read_line().await.unwrap(), "parti");
    }

    #[tokio::test]
    async fn test_write_line_appends_terminator() {
        let (mut line, mut device) = transport(50);
        line.write_line("pos?").await.unwrap();

        let mut buf = [0u8; 5];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pos?\r");
    }

    #[tokio::test]
    async fn test_drain_discards_pending() {
        let (mut line, mut device) = transport(50);
        device.write_all(b"stale\rjunk\r").await.unwrap();

        let discarded = line.drain(Duration::from_millis(10)).await;
        assert_eq!(discarded, 11);
        assert_eq!(line.read_line().await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_connection_lock_serialises() {
        let (transport, _device) = transport(50);
        let connection = Connection::new("test", transport);
        let guard = connection.lock().await;

        let other = connection.clone();
        let waiter = tokio::spawn(async move {
            let _g = other.lock().await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }
}
