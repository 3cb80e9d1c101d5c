//! In-memory serial port with a scripted device on the far end.
//!
//! [`SimulatedPort::spawn`] returns the host end of a duplex stream. The
//! device end runs two tasks: a reader that splits incoming bytes into
//! command lines, and a responder that feeds each line to a
//! [`DeviceModel`] and writes back whatever the model produces.
//!
//! Every command is logged as [`WireEvent::Received`] the moment it
//! arrives, and every output chunk as [`WireEvent::Sent`] just before it is
//! written, so the [`WireLog`] shows exactly how traffic interleaved.

use parking_lot::Mutex;
use scope_core::serial::{Connection, LineTransport};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

const PIPE_CAPACITY: usize = 8192;

/// Device behaviour behind a simulated port.
pub trait DeviceModel: Send + 'static {
    /// Raw output (terminators included) for one command line.
    fn respond(&mut self, command: &str) -> Vec<String>;
}

/// One entry of the wire log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    /// Command line from the host, terminator removed
    Received(String),
    /// Chunk written by the device, terminators kept
    Sent(String),
}

/// Shared record of traffic on a simulated port.
#[derive(Debug, Clone, Default)]
pub struct WireLog {
    events: Arc<Mutex<Vec<WireEvent>>>,
}

impl WireLog {
    fn push(&self, event: WireEvent) {
        self.events.lock().push(event);
    }

    pub fn events(&self) -> Vec<WireEvent> {
        self.events.lock().clone()
    }

    /// Commands received, in order.
    pub fn received(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                WireEvent::Received(line) => Some(line.clone()),
                WireEvent::Sent(_) => None,
            })
            .collect()
    }

    /// Chunks sent, in order.
    pub fn sent(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                WireEvent::Sent(chunk) => Some(chunk.clone()),
                WireEvent::Received(_) => None,
            })
            .collect()
    }

    /// How many times `command` was received.
    pub fn count_received(&self, command: &str) -> usize {
        self.received().iter().filter(|c| *c == command).count()
    }

    /// How many sent chunks start with `prefix`.
    pub fn count_sent_prefix(&self, prefix: &str) -> usize {
        self.sent().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

/// Factory for simulated ports.
pub struct SimulatedPort;

impl SimulatedPort {
    /// Start `model` behind a new in-memory port.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<M: DeviceModel>(model: M) -> (DuplexStream, WireLog) {
        Self::spawn_with_latency(model, Duration::ZERO)
    }

    /// Like [`spawn`](Self::spawn), waiting `latency` before each answer.
    pub fn spawn_with_latency<M: DeviceModel>(model: M, latency: Duration) -> (DuplexStream, WireLog) {
        let (host, device) = duplex(PIPE_CAPACITY);
        let (rd, wr) = tokio::io::split(device);
        let (tx, rx) = mpsc::unbounded_channel();
        let log = WireLog::default();

        tokio::spawn(read_commands(rd, tx, log.clone()));
        tokio::spawn(answer_commands(model, rx, wr, log.clone(), latency));
        (host, log)
    }

    /// Simulated port wrapped as a [`Connection`], commands terminated by CR.
    pub fn connection<M: DeviceModel>(name: &str, model: M, timeout: Duration) -> (Connection, WireLog) {
        Self::connection_with_latency(name, model, timeout, Duration::ZERO)
    }

    pub fn connection_with_latency<M: DeviceModel>(
        name: &str,
        model: M,
        timeout: Duration,
        latency: Duration,
    ) -> (Connection, WireLog) {
        let (host, log) = Self::spawn_with_latency(model, latency);
        let transport = LineTransport::from_port(Box::new(host), timeout, "\r");
        (Connection::new(name, transport), log)
    }

    /// Simulated port wrapped as a [`Connection`] that ends commands with
    /// `terminator`.
    pub fn connection_with_terminator<M: DeviceModel>(
        name: &str,
        model: M,
        timeout: Duration,
        terminator: &str,
    ) -> (Connection, WireLog) {
        let (host, log) = Self::spawn(model);
        let transport = LineTransport::from_port(Box::new(host), timeout, terminator);
        (Connection::new(name, transport), log)
    }
}

async fn read_commands(
    mut rd: ReadHalf<DuplexStream>,
    tx: mpsc::UnboundedSender<String>,
    log: WireLog,
) {
    let mut pending = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        let n = match rd.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &byte in &buf[..n] {
            if byte != b'\r' && byte != b'\n' {
                pending.push(byte);
                continue;
            }
            if pending.is_empty() {
                continue;
            }
            let line = String::from_utf8_lossy(&pending).into_owned();
            pending.clear();
            log.push(WireEvent::Received(line.clone()));
            if tx.send(line).is_err() {
                return;
            }
        }
    }
}

async fn answer_commands<M: DeviceModel>(
    mut model: M,
    mut rx: mpsc::UnboundedReceiver<String>,
    mut wr: WriteHalf<DuplexStream>,
    log: WireLog,
    latency: Duration,
) {
    while let Some(command) = rx.recv().await {
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        for chunk in model.respond(&command) {
            log.push(WireEvent::Sent(chunk.clone()));
            if wr.write_all(chunk.as_bytes()).await.is_err() {
                tracing::debug!(command = %command, "Host end closed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    impl DeviceModel for Upper {
        fn respond(&mut self, command: &str) -> Vec<String> {
            vec![format!("{}\r", command.to_uppercase())]
        }
    }

    #[tokio::test]
    async fn test_model_answers_each_line() {
        let (connection, log) = SimulatedPort::connection("upper", Upper, Duration::from_millis(200));
        let mut line = connection.lock().await;
        line.write_line("abc").await.unwrap();
        assert_eq!(line.read_line().await.unwrap(), "ABC");
        line.write_line("xyz").await.unwrap();
        assert_eq!(line.read_line().await.unwrap(), "XYZ");
        drop(line);

        assert_eq!(log.received(), vec!["abc", "xyz"]);
        assert_eq!(
            log.events(),
            vec![
                WireEvent::Received("abc".into()),
                WireEvent::Sent("ABC\r".into()),
                WireEvent::Received("xyz".into()),
                WireEvent::Sent("XYZ\r".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_blank_lines_are_ignored() {
        let (connection, log) = SimulatedPort::connection("upper", Upper, Duration::from_millis(50));
        let mut line = connection.lock().await;
        line.write(b"\r\n\rq\r").await.unwrap();
        assert_eq!(line.read_line().await.unwrap(), "Q");
        assert_eq!(log.received(), vec!["q"]);
    }
}
