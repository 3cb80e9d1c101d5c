//! Half-duplex command/response exchange.
//!
//! One exchange is: write the command, consume the device's echo of it (for
//! echoing devices), then read the value line if the command is a query.
//! The connection stays locked for the whole cycle, including retries, so two
//! callers never interleave on the wire.
//!
//! Retries are bounded by [`ExchangeSettings::max_attempts`]. An attempt
//! fails when the echo never arrives, when a query's value is empty, when it
//! equals one of the device's busy sentinels, or when it does not parse.
//! Every retry first drains the line until it has been quiet for one line
//! timeout, so a late answer to the failed attempt is never taken as the
//! answer to the next one. Running out of attempts yields
//! [`DeviceError::NoReply`]. Worst-case
//! blocking is therefore bounded by the line timeout times the number of
//! reads per attempt times `max_attempts`.
//!
//! Compound operations that must not be split by another caller take a
//! [`ExchangeSession`] with [`Exchanger::session`] and issue several
//! exchanges through it.

use crate::error::{DeviceError, DeviceResult};
use crate::serial::{Connection, ConnectionGuard};
use std::str::FromStr;
use std::sync::Arc;

/// Default bound on attempts per exchange.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Lines not matching the echo that one attempt will skip before giving up.
const MAX_STRAY_LINES: usize = 16;

/// Whether the device repeats each command before answering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoMode {
    /// Command is echoed verbatim; queries are followed by a value line.
    Echoed,
    /// No echo; every command is answered by exactly one line.
    Silent,
    /// No echo; only queries are answered, actions get no reply at all.
    QueryOnly,
}

/// Per-protocol exchange parameters.
#[derive(Debug, Clone)]
pub struct ExchangeSettings {
    pub echo: EchoMode,
    /// Trailing character of the command word that marks a query
    pub query_marker: char,
    /// Characters trimmed from both ends of every line (prompts, stray CR/LF)
    pub strip: String,
    pub max_attempts: u32,
    /// Values the device sends in place of data while busy
    pub busy_sentinels: Vec<String>,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            echo: EchoMode::Echoed,
            query_marker: '?',
            strip: "> \r\n".to_string(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            busy_sentinels: Vec::new(),
        }
    }
}

impl ExchangeSettings {
    /// Settings for a device that answers without echoing.
    pub fn silent() -> Self {
        Self {
            echo: EchoMode::Silent,
            strip: " \r\n".to_string(),
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_busy_sentinel(mut self, sentinel: impl Into<String>) -> Self {
        self.busy_sentinels.push(sentinel.into());
        self
    }

    fn clean<'a>(&self, line: &'a str) -> &'a str {
        line.trim_matches(|c| self.strip.contains(c))
    }

    /// Settings for a device that only answers queries.
    pub fn query_only() -> Self {
        Self {
            echo: EchoMode::QueryOnly,
            ..Self::silent()
        }
    }

    fn is_query(&self, command: &str) -> bool {
        command
            .split_whitespace()
            .next()
            .is_some_and(|word| word.ends_with(self.query_marker))
    }

    fn is_busy(&self, value: &str) -> bool {
        self.busy_sentinels.iter().any(|s| s == value)
    }
}

// =============================================================================
// Exchanger
// =============================================================================

/// Reliable request/reply over an unreliable half-duplex line.
#[derive(Clone)]
pub struct Exchanger {
    connection: Connection,
    settings: Arc<ExchangeSettings>,
}

impl Exchanger {
    pub fn new(connection: Connection, settings: ExchangeSettings) -> Self {
        Self {
            connection,
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &ExchangeSettings {
        &self.settings
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Lock the line for a sequence of exchanges.
    pub async fn session(&self) -> ExchangeSession<'_> {
        ExchangeSession {
            line: self.connection.lock().await,
            settings: &*self.settings,
            device: self.connection.name(),
        }
    }

    /// One exchange. Returns the value line for queries (and the
    /// acknowledgement line for silent devices), `None` otherwise.
    ///
    /// A command is a query when its first word ends with the query marker,
    /// so `pos?` and `POS? 1` both are.
    pub async fn send(&self, command: &str) -> DeviceResult<Option<String>> {
        self.session().await.send(command).await
    }

    /// Query exchange returning the non-empty, non-busy value.
    pub async fn query(&self, command: &str) -> DeviceResult<String> {
        self.session().await.query(command).await
    }

    /// Query exchange whose value must parse as `T`.
    pub async fn query_parsed<T: FromStr>(&self, command: &str) -> DeviceResult<T> {
        self.session().await.query_parsed(command).await
    }

    /// See [`ExchangeSession::query_parsed_unless`].
    pub async fn query_parsed_unless<T: FromStr>(
        &self,
        command: &str,
        busy: &[&str],
    ) -> DeviceResult<T> {
        self.session()
            .await
            .query_parsed_unless(command, busy)
            .await
    }

    /// Query and decode the reply with `parse`; `None` counts as a failed attempt.
    pub async fn query_with<T, F>(&self, command: &str, parse: F) -> DeviceResult<T>
    where
        F: Fn(&str) -> Option<T>,
    {
        self.session().await.query_with(command, parse).await
    }

    /// Drain stale input under the lock.
    pub async fn drain(&self) -> usize {
        self.session().await.drain().await
    }
}

// =============================================================================
// ExchangeSession
// =============================================================================

/// Result of a single attempt, before retry policy is applied.
enum Attempt {
    /// Echo phase or value read came back empty.
    Empty,
    /// Completed; the value line if one was read.
    Done(Option<String>),
}

/// A locked line on which several exchanges run back to back.
pub struct ExchangeSession<'a> {
    line: ConnectionGuard,
    settings: &'a ExchangeSettings,
    device: &'a str,
}

impl ExchangeSession<'_> {
    /// See [`Exchanger::send`].
    pub async fn send(&mut self, command: &str) -> DeviceResult<Option<String>> {
        if self.settings.is_query(command) {
            return self.query(command).await.map(Some);
        }

        match self.settings.echo {
            EchoMode::QueryOnly => {
                self.line.write_line(command).await?;
                tracing::debug!(device = self.device, cmd = %command, "exchange");
                Ok(None)
            }
            // Acknowledgements are informational; an empty one is not retried.
            EchoMode::Silent => match self.attempt(command, 1).await? {
                Attempt::Done(ack) => Ok(ack),
                Attempt::Empty => {
                    let quiet = self.line.timeout();
                    self.line.drain(quiet).await;
                    Ok(None)
                }
            },
            EchoMode::Echoed => {
                for attempt in 1..=self.settings.max_attempts {
                    match self.attempt(command, attempt).await? {
                        Attempt::Done(_) => return Ok(None),
                        Attempt::Empty => {
                            tracing::warn!(
                                device = self.device,
                                cmd = %command,
                                attempt,
                                "No echo, resending"
                            );
                        }
                    }
                }
                Err(DeviceError::NoReply {
                    command: command.to_string(),
                    attempts: self.settings.max_attempts,
                })
            }
        }
    }

    /// See [`Exchanger::query`].
    pub async fn query(&mut self, command: &str) -> DeviceResult<String> {
        self.query_with(command, |value| Some(value.to_string()))
            .await
    }

    /// See [`Exchanger::query_parsed`].
    pub async fn query_parsed<T: FromStr>(&mut self, command: &str) -> DeviceResult<T> {
        self.query_with(command, |value| value.parse().ok()).await
    }

    /// Like [`query_parsed`](Self::query_parsed), also treating `busy` values
    /// as placeholders to retry. For sentinels that are only placeholders for
    /// some commands.
    pub async fn query_parsed_unless<T: FromStr>(
        &mut self,
        command: &str,
        busy: &[&str],
    ) -> DeviceResult<T> {
        self.query_inner(command, busy, |value| value.parse().ok())
            .await
    }

    /// Query with a caller-supplied parser; `None` from the parser counts as
    /// a failed attempt.
    pub async fn query_with<T, F>(&mut self, command: &str, parse: F) -> DeviceResult<T>
    where
        F: Fn(&str) -> Option<T>,
    {
        self.query_inner(command, &[], parse).await
    }

    async fn query_inner<T, F>(&mut self, command: &str, busy: &[&str], parse: F) -> DeviceResult<T>
    where
        F: Fn(&str) -> Option<T>,
    {
        for attempt in 1..=self.settings.max_attempts {
            let reason = match self.attempt(command, attempt).await? {
                Attempt::Done(Some(value))
                    if self.settings.is_busy(&value) || busy.contains(&value.as_str()) =>
                {
                    "busy"
                }
                Attempt::Done(Some(value)) if !value.is_empty() => match parse(&value) {
                    Some(parsed) => return Ok(parsed),
                    None => "unparsable",
                },
                Attempt::Done(_) | Attempt::Empty => "empty",
            };
            tracing::warn!(
                device = self.device,
                cmd = %command,
                attempt,
                max_attempts = self.settings.max_attempts,
                reason,
                "Unusable reply, retrying"
            );
        }
        Err(DeviceError::NoReply {
            command: command.to_string(),
            attempts: self.settings.max_attempts,
        })
    }

    /// Discard stale input.
    pub async fn drain(&mut self) -> usize {
        self.line.drain(std::time::Duration::from_millis(10)).await
    }

    async fn attempt(&mut self, command: &str, attempt: u32) -> DeviceResult<Attempt> {
        // A late reply to the previous attempt would otherwise answer this one.
        if attempt > 1 {
            let quiet = self.line.timeout();
            self.line.drain(quiet).await;
        }
        self.line.write_line(command).await?;

        if self.settings.echo == EchoMode::Echoed {
            let mut stray = 0;
            loop {
                let raw = self.line.read_line().await?;
                let line = self.settings.clean(&raw);
                if line == command {
                    break;
                }
                if raw.is_empty() || stray >= MAX_STRAY_LINES {
                    return Ok(Attempt::Empty);
                }
                stray += 1;
                tracing::trace!(device = self.device, cmd = %command, line = %line, "Skipping non-echo line");
            }
            if !self.settings.is_query(command) {
                tracing::debug!(device = self.device, cmd = %command, "exchange");
                return Ok(Attempt::Done(None));
            }
        }

        let raw = self.line.read_line().await?;
        let value = self.settings.clean(&raw).to_string();
        tracing::debug!(device = self.device, cmd = %command, response = %value, "exchange");
        if value.is_empty() {
            Ok(Attempt::Empty)
        } else {
            Ok(Attempt::Done(Some(value)))
        }
    }
}
