//! Omicron framing and ad-hoc frame demultiplexing.
//!
//! Commands go out as `?CMD<payload>|` + CR. Synchronous replies come back
//! as `!CMD<field>|<field>...` + CR, where `CMD` repeats the first three
//! characters of the command. With ad-hoc mode enabled the device also
//! pushes unsolicited frames at any time, `$` plus a command tag:
//!
//! ```text
//! host:   ?GLP|
//! device: $MDP12.03          <- ad-hoc, applied to the cache
//! device: $GAS0282           <- ad-hoc, applied to the cache
//! device: !GLP7FF            <- the reply
//! ```
//!
//! Every line read while waiting for a reply is classified by its first
//! byte. Ad-hoc frames update [`AdhocState`] and are never returned to the
//! caller. A reply whose tag belongs to another command is logged and the
//! command resent, up to the attempt bound.

use crate::registers::{OperationMode, Status};
use parking_lot::RwLock;
use scope_core::error::{DeviceError, DeviceResult};
use scope_core::serial::{Connection, ConnectionGuard};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// First byte of an unsolicited frame.
pub const ADHOC_MARKER: char = '$';

/// Ad-hoc frames absorbed while waiting for one reply before the attempt
/// counts as failed.
const MAX_ADHOC_PER_ATTEMPT: usize = 64;

// =============================================================================
// Frames
// =============================================================================

/// Synchronous reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Three-character command tag
    pub tag: String,
    pub fields: Vec<String>,
}

impl Reply {
    /// Parse `!CMD<f1>|<f2>...`. Needs at least marker plus tag.
    pub fn parse(line: &str) -> Option<Self> {
        let tag = line.get(1..4)?;
        let payload = line.get(4..)?;
        Some(Self {
            tag: tag.to_string(),
            fields: payload.split('|').map(str::to_string).collect(),
        })
    }

    /// First payload field (empty if none).
    pub fn first(&self) -> &str {
        self.fields.first().map(String::as_str).unwrap_or("")
    }

    /// Field `index`, or a decode error naming `what`.
    pub fn field(&self, index: usize, what: &'static str) -> DeviceResult<&str> {
        self.fields
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| DeviceError::decode(what, self.fields.join("|")))
    }

    /// Set commands answer `>` when accepted.
    pub fn is_ack(&self) -> bool {
        self.first() == ">"
    }

    /// Parse the first field as a float.
    pub fn first_f64(&self, what: &'static str) -> DeviceResult<f64> {
        self.first()
            .trim()
            .parse()
            .map_err(|_| DeviceError::decode(what, self.first()))
    }
}

/// Unsolicited frame pushed by the device.
#[derive(Debug, Clone, PartialEq)]
pub enum AdhocFrame {
    Status(Status),
    OperationMode(OperationMode),
    /// `$TPP`: power during the last pulse, mW
    TemporalPower(f64),
    /// `$MDP`: measured diode power, mW
    DiodePower(f64),
    /// `$RsC`: reset finished
    ResetComplete,
    /// Any other tag; logged and otherwise ignored
    Other { tag: String, payload: String },
}

impl AdhocFrame {
    /// Parse a line starting with [`ADHOC_MARKER`].
    pub fn parse(line: &str) -> DeviceResult<Self> {
        let tag = line
            .get(..4)
            .ok_or_else(|| DeviceError::decode("ad-hoc frame", line))?;
        let payload = line.get(4..).unwrap_or("");
        let first = payload.split('|').next().unwrap_or("").trim();
        let float = |what| {
            first
                .parse::<f64>()
                .map_err(|_| DeviceError::decode(what, first))
        };
        Ok(match tag {
            "$GAS" => Self::Status(Status::from_hex(first)?),
            "$GOM" => Self::OperationMode(OperationMode::from_hex(first)?),
            "$TPP" => Self::TemporalPower(float("temporal power")?),
            "$MDP" => Self::DiodePower(float("diode power")?),
            "$RsC" => Self::ResetComplete,
            _ => Self::Other {
                tag: tag.to_string(),
                payload: payload.to_string(),
            },
        })
    }
}

// =============================================================================
// Cached device state
// =============================================================================

/// How many frames of each kind have been applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCounts {
    pub status: u64,
    pub operation_mode: u64,
    pub temporal_power: u64,
    pub diode_power: u64,
    pub other: u64,
}

/// Last known device state, fed by ad-hoc frames and by synchronous reads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdhocState {
    pub status: Option<Status>,
    pub operation_mode: Option<OperationMode>,
    pub temporal_power_mw: Option<f64>,
    pub diode_power_mw: Option<f64>,
    /// Ad-hoc frames only; synchronous reads are not counted
    pub frames: FrameCounts,
}

impl AdhocState {
    fn apply(&mut self, frame: AdhocFrame) {
        match frame {
            AdhocFrame::Status(status) => {
                self.status = Some(status);
                self.frames.status += 1;
            }
            AdhocFrame::OperationMode(mode) => {
                self.operation_mode = Some(mode);
                self.frames.operation_mode += 1;
            }
            AdhocFrame::TemporalPower(mw) => {
                self.temporal_power_mw = Some(mw);
                self.frames.temporal_power += 1;
            }
            AdhocFrame::DiodePower(mw) => {
                self.diode_power_mw = Some(mw);
                self.frames.diode_power += 1;
            }
            AdhocFrame::ResetComplete | AdhocFrame::Other { .. } => {
                self.frames.other += 1;
            }
        }
    }
}

// =============================================================================
// OmicronLink
// =============================================================================

/// Framed command channel with ad-hoc demultiplexing.
#[derive(Clone)]
pub struct OmicronLink {
    connection: Connection,
    state: Arc<RwLock<AdhocState>>,
    max_attempts: u32,
}

impl OmicronLink {
    pub fn new(connection: Connection, max_attempts: u32) -> Self {
        Self {
            connection,
            state: Arc::new(RwLock::new(AdhocState::default())),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn name(&self) -> &str {
        self.connection.name()
    }

    /// Wire form of a command.
    pub fn frame(command: &str, payload: &str) -> String {
        format!("?{}{}|", command, payload)
    }

    /// Snapshot of the cached state.
    pub fn state(&self) -> AdhocState {
        self.state.read().clone()
    }

    /// Update the cache from a synchronous read.
    pub fn update_state(&self, update: impl FnOnce(&mut AdhocState)) {
        update(&mut self.state.write());
    }

    /// Lock the line for several commands.
    pub async fn session(&self) -> OmicronSession<'_> {
        OmicronSession {
            line: self.connection.lock().await,
            link: self,
        }
    }

    /// Query without payload, e.g. `GOM`.
    pub async fn ask(&self, command: &str) -> DeviceResult<Reply> {
        self.session().await.ask(command).await
    }

    /// Command with payload, e.g. `SOM` + `a100`.
    pub async fn set(&self, command: &str, payload: &str) -> DeviceResult<Reply> {
        self.session().await.set(command, payload).await
    }

    fn apply(&self, frame: AdhocFrame) {
        match &frame {
            AdhocFrame::Other { tag, payload } => {
                tracing::debug!(device = self.name(), tag = %tag, payload = %payload, "Ad-hoc message");
            }
            other => tracing::trace!(device = self.name(), frame = ?other, "Ad-hoc frame"),
        }
        self.state.write().apply(frame);
    }
}

/// What the demultiplexer found while waiting for a reply.
enum Inbound {
    Reply(Reply, String),
    Malformed(String),
    Silence,
    ResetComplete,
}

/// A locked line on which several framed commands run back to back.
pub struct OmicronSession<'a> {
    line: ConnectionGuard,
    link: &'a OmicronLink,
}

impl OmicronSession<'_> {
    /// See [`OmicronLink::ask`].
    pub async fn ask(&mut self, command: &str) -> DeviceResult<Reply> {
        self.set(command, "").await
    }

    /// See [`OmicronLink::set`].
    pub async fn set(&mut self, command: &str, payload: &str) -> DeviceResult<Reply> {
        let framed = OmicronLink::frame(command, payload);
        self.exchange(&framed, command).await
    }

    /// Discard stale input.
    pub async fn drain(&mut self) -> usize {
        self.line.drain(Duration::from_millis(10)).await
    }

    /// Send `RsC` and wait for the device to announce the end of its reset.
    pub async fn reset(&mut self, timeout: Duration) -> DeviceResult<()> {
        let reply = self.exchange("?RsC", "RsC").await?;
        tracing::info!(device = self.link.name(), reply = ?reply.fields, "Reset acknowledged");

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            match self.next_inbound().await? {
                Inbound::ResetComplete => {
                    tracing::info!(device = self.link.name(), "Reset complete");
                    return Ok(());
                }
                Inbound::Reply(_, raw) | Inbound::Malformed(raw) => {
                    tracing::info!(device = self.link.name(), line = %raw, "Reset in progress");
                }
                Inbound::Silence => {}
            }
        }
        Err(DeviceError::Timeout {
            what: "reset completion".to_string(),
            waited: timeout,
        })
    }

    async fn exchange(&mut self, framed: &str, command: &str) -> DeviceResult<Reply> {
        let tag = command.get(..3).unwrap_or(command);
        let mut mismatch = None;

        for attempt in 1..=self.link.max_attempts {
            self.line.write_line(framed).await?;
            match self.next_inbound().await? {
                Inbound::Reply(reply, raw) if reply.tag == tag => {
                    tracing::debug!(device = self.link.name(), cmd = %framed, response = %raw, "exchange");
                    return Ok(reply);
                }
                Inbound::Reply(_, raw) | Inbound::Malformed(raw) => {
                    tracing::warn!(device = self.link.name(), cmd = %framed, reply = %raw, attempt, "Unexpected answer, resending");
                    mismatch = Some(raw);
                }
                Inbound::Silence | Inbound::ResetComplete => {
                    tracing::warn!(device = self.link.name(), cmd = %framed, attempt, "No answer, resending");
                }
            }
        }

        Err(match mismatch {
            Some(reply) => DeviceError::EchoMismatch {
                command: framed.to_string(),
                reply,
                attempts: self.link.max_attempts,
            },
            None => DeviceError::NoReply {
                command: framed.to_string(),
                attempts: self.link.max_attempts,
            },
        })
    }

    /// Read until a synchronous line arrives, applying ad-hoc frames.
    async fn next_inbound(&mut self) -> DeviceResult<Inbound> {
        for _ in 0..MAX_ADHOC_PER_ATTEMPT {
            let raw = self.line.read_line().await?;
            let line = raw.trim_start_matches('\0');
            if line.is_empty() {
                return Ok(Inbound::Silence);
            }
            if line.starts_with(ADHOC_MARKER) {
                match AdhocFrame::parse(line) {
                    Ok(AdhocFrame::ResetComplete) => {
                        self.link.apply(AdhocFrame::ResetComplete);
                        return Ok(Inbound::ResetComplete);
                    }
                    Ok(frame) => self.link.apply(frame),
                    Err(e) => {
                        tracing::warn!(device = self.link.name(), line = %line, error = %e, "Undecodable ad-hoc frame")
                    }
                }
                continue;
            }
            return Ok(match Reply::parse(line) {
                Some(reply) => Inbound::Reply(reply, line.to_string()),
                None => Inbound::Malformed(line.to_string()),
            });
        }
        tracing::warn!(device = self.link.name(), "Ad-hoc flood while waiting for a reply");
        Ok(Inbound::Silence)
    }
}
