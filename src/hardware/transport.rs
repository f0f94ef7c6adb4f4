//! Paced serial session with one Silverpak 23CE.
//!
//! The driver needs turnaround time between interactions. Every physical
//! read or write first waits for the session's "next allowed interaction"
//! instant and then pushes that instant `delay_factor × delay_unit` into the
//! future. The instant lives next to the port handle, so whoever holds the
//! session (the controller lock, in practice) also owns the pacing.
//!
//! I/O failures never escape as errors. Writes that fail are logged and
//! dropped, reads that fail count as "no bytes", and a reply that never
//! completes turns into `None`. Only contract violations (writing on a
//! closed port, connecting twice) come back as [`SilverpakError`].

use super::serial::{is_access_conflict, DynSerial, PortOpener};
use crate::config::TransportConfig;
use crate::error::{Result, SilverpakError};
use crate::protocol::{self, DriverAddress, SAFE_QUERY};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;

/// Delay factor for the safe query sent on connect.
pub const SAFE_QUERY_DELAY_FACTOR: f32 = 3.0;

const READ_CHUNK: usize = 256;

/// Where a session connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportTarget {
    /// Serial port name
    pub port_name: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Driver the safe query is addressed to
    pub driver_address: DriverAddress,
}

/// Result of opening a port and sending the safe query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The port is held by another process
    Busy,
    /// The port could not be opened or written to
    Invalid,
    /// A complete reply came back; the port is left open
    Responded,
    /// The line stayed quiet or the reply never completed
    Silent,
}

/// One serial connection plus its pacing clock.
pub struct TransportSession {
    opener: Arc<dyn PortOpener>,
    target: Option<TransportTarget>,
    port: Option<DynSerial>,
    delay_unit: Duration,
    read_window: Duration,
    next_interaction: Instant,
}

impl std::fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSession")
            .field("target", &self.target)
            .field("open", &self.port.is_some())
            .field("delay_unit", &self.delay_unit)
            .finish()
    }
}

impl TransportSession {
    /// Closed session that will open ports through `opener`.
    pub fn new(opener: Arc<dyn PortOpener>, config: &TransportConfig) -> Self {
        Self {
            opener,
            target: None,
            port: None,
            delay_unit: config.delay_unit(),
            read_window: config.read_window(),
            next_interaction: Instant::now(),
        }
    }

    /// Closed session aimed at `target`.
    pub fn with_target(
        opener: Arc<dyn PortOpener>,
        config: &TransportConfig,
        target: TransportTarget,
    ) -> Self {
        let mut session = Self::new(opener, config);
        session.target = Some(target);
        session
    }

    /// Current connection target.
    pub fn target(&self) -> Option<&TransportTarget> {
        self.target.as_ref()
    }

    /// Point the session somewhere else. Only allowed while closed.
    pub fn set_target(&mut self, target: TransportTarget) -> Result<()> {
        if self.is_open() {
            return Err(SilverpakError::invalid_state(
                "Cannot change the connection target while connected.",
            ));
        }
        self.target = Some(target);
        Ok(())
    }

    /// True while a port is open.
    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    /// Open the port and check for a Silverpak with the safe query.
    ///
    /// Returns `Ok(false)` (with the port closed) on any I/O failure or when
    /// nothing answers.
    ///
    /// # Errors
    /// `InvalidOperationState` if already connected, `ArgumentInvalid` if no
    /// target was set.
    pub async fn connect(&mut self) -> Result<bool> {
        Ok(self.probe().await? == ProbeOutcome::Responded)
    }

    /// Like [`connect`](Self::connect) but reports why the attempt failed.
    pub async fn probe(&mut self) -> Result<ProbeOutcome> {
        if self.is_open() {
            return Err(SilverpakError::invalid_state("Already connected."));
        }
        let target = self.target.clone().ok_or_else(|| {
            SilverpakError::ArgumentInvalid("No connection target set.".to_string())
        })?;

        let port = match self.opener.open(&target.port_name, target.baud_rate).await {
            Ok(port) => port,
            Err(e) if is_access_conflict(&e) => {
                tracing::debug!(target: "silverpak::transport", port = %target.port_name, error = %e, "Port busy");
                return Ok(ProbeOutcome::Busy);
            }
            Err(e) => {
                tracing::debug!(target: "silverpak::transport", port = %target.port_name, error = %e, "Port open failed");
                return Ok(ProbeOutcome::Invalid);
            }
        };
        self.port = Some(port);

        let query = protocol::generate_message(
            target.driver_address,
            &protocol::generate_command(SAFE_QUERY, ""),
        );
        self.discard_input().await;
        if let Err(e) = self.send(&query, SAFE_QUERY_DELAY_FACTOR).await {
            tracing::debug!(target: "silverpak::transport", port = %target.port_name, error = %e, "Safe query write failed");
            self.disconnect().await;
            return Ok(ProbeOutcome::Invalid);
        }

        match self.read_reply().await {
            Some(_) => {
                tracing::info!(
                    target: "silverpak::transport",
                    port = %target.port_name,
                    baud_rate = target.baud_rate,
                    address = %target.driver_address,
                    "Silverpak answered safe query"
                );
                Ok(ProbeOutcome::Responded)
            }
            None => {
                self.disconnect().await;
                Ok(ProbeOutcome::Silent)
            }
        }
    }

    /// Close the port if open. Close errors are ignored.
    pub async fn disconnect(&mut self) {
        if let Some(mut port) = self.port.take() {
            if let Err(e) = port.shutdown().await {
                tracing::debug!(target: "silverpak::transport", error = %e, "Ignoring error while closing port");
            }
        }
    }

    /// Write a complete message.
    ///
    /// `delay_factor` is how long the driver is expected to take to process
    /// the message, as a multiple of the delay unit (typically 1.0 to 4.0).
    pub async fn write(&mut self, message: &str, delay_factor: f32) -> Result<()> {
        self.ensure_open()?;
        if let Err(e) = self.send(message, delay_factor).await {
            tracing::warn!(target: "silverpak::transport", message = message.trim_end(), error = %e, "Write failed");
        }
        Ok(())
    }

    /// Write a message and return the reply payload (status byte removed).
    ///
    /// `Ok(None)` means nothing (or nothing complete) came back.
    pub async fn write_and_get_response(
        &mut self,
        message: &str,
        delay_factor: f32,
    ) -> Result<Option<String>> {
        self.ensure_open()?;
        self.discard_input().await;
        if let Err(e) = self.send(message, delay_factor).await {
            tracing::warn!(target: "silverpak::transport", message = message.trim_end(), error = %e, "Write failed");
        }
        Ok(self.read_reply().await)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(SilverpakError::invalid_state("Serial port is not open."))
        }
    }

    /// Block until the next interaction is allowed, then book the following one.
    async fn pace(&mut self, delay_factor: f32) {
        tokio::time::sleep_until(self.next_interaction).await;
        self.next_interaction = Instant::now() + self.delay_unit.mul_f32(delay_factor.max(0.0));
    }

    async fn send(&mut self, message: &str, delay_factor: f32) -> std::io::Result<()> {
        self.pace(delay_factor).await;
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotConnected))?;
        tracing::trace!(target: "silverpak::transport", message = message.trim_end(), "TX");
        port.write_all(message.as_bytes()).await?;
        port.flush().await
    }

    /// Whatever arrives within the read window; empty on timeout, EOF or error.
    async fn read_chunk(&mut self, delay_factor: f32, window: Duration) -> Vec<u8> {
        self.pace(delay_factor).await;
        let Some(port) = self.port.as_mut() else {
            return Vec::new();
        };
        let mut buf = [0u8; READ_CHUNK];
        match tokio::time::timeout(window, port.read(&mut buf)).await {
            Ok(Ok(n)) => buf[..n].to_vec(),
            Ok(Err(e)) => {
                tracing::debug!(target: "silverpak::transport", error = %e, "Read failed");
                Vec::new()
            }
            Err(_) => Vec::new(),
        }
    }

    async fn discard_input(&mut self) {
        loop {
            let stale = self.read_chunk(0.0, Duration::ZERO).await;
            if stale.is_empty() {
                break;
            }
            tracing::trace!(target: "silverpak::transport", bytes = stale.len(), "Discarded stale input");
        }
    }

    async fn read_reply(&mut self) -> Option<String> {
        let mut accumulated = Vec::new();
        loop {
            let chunk = self.read_chunk(1.0, self.read_window).await;
            if chunk.is_empty() {
                if !accumulated.is_empty() {
                    tracing::debug!(
                        target: "silverpak::transport",
                        partial = %String::from_utf8_lossy(&accumulated),
                        "Incomplete reply"
                    );
                }
                return None;
            }
            accumulated.extend_from_slice(&chunk);
            if protocol::is_complete(&accumulated) {
                let payload = protocol::trim(&accumulated);
                tracing::trace!(target: "silverpak::transport", payload = ?payload, "RX");
                return payload;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock_serial::{reply_frame, MockPortOpener};
    use std::sync::Mutex;

    fn fast_config() -> TransportConfig {
        TransportConfig {
            delay_unit_ms: 5,
            read_window_ms: 20,
        }
    }

    fn target(port: &str) -> TransportTarget {
        TransportTarget {
            port_name: port.to_string(),
            baud_rate: 9600,
            driver_address: DriverAddress::Driver1,
        }
    }

    fn session(opener: &MockPortOpener, port: &str) -> TransportSession {
        TransportSession::with_target(Arc::new(opener.clone()), &fast_config(), target(port))
    }

    #[tokio::test]
    async fn connect_succeeds_when_device_answers() {
        let opener = MockPortOpener::new();
        opener.add_device(
            "COM1",
            Some(9600),
            Arc::new(|frame| (frame == "/1QR\r").then(|| reply_frame(""))),
        );
        let mut session = session(&opener, "COM1");

        assert!(session.connect().await.unwrap());
        assert!(session.is_open());

        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, SilverpakError::InvalidOperationState(_)));
    }

    #[tokio::test]
    async fn connect_fails_quietly_on_silent_line() {
        let opener = MockPortOpener::new();
        opener.add_empty("COM1");
        let mut session = session(&opener, "COM1");

        assert!(!session.connect().await.unwrap());
        assert!(!session.is_open());
    }

    #[tokio::test]
    async fn probe_classifies_busy_and_rejected_writes() {
        let opener = MockPortOpener::new();
        opener.add_busy("COM1");
        opener.add_write_rejecting("COM2");

        assert_eq!(session(&opener, "COM1").probe().await.unwrap(), ProbeOutcome::Busy);
        let mut rejecting = session(&opener, "COM2");
        assert_eq!(rejecting.probe().await.unwrap(), ProbeOutcome::Invalid);
        assert!(!rejecting.is_open());
    }

    #[tokio::test]
    async fn connect_without_target_is_an_argument_error() {
        let opener = MockPortOpener::new();
        let mut session = TransportSession::new(Arc::new(opener), &fast_config());
        assert!(matches!(
            session.connect().await,
            Err(SilverpakError::ArgumentInvalid(_))
        ));
    }

    #[tokio::test]
    async fn io_on_closed_port_is_invalid_state() {
        let opener = MockPortOpener::new();
        let mut session = session(&opener, "COM1");
        assert!(session.write("/1TR\r", 1.0).await.is_err());
        assert!(session.write_and_get_response("/1?0R\r", 1.0).await.is_err());
        // Disconnect stays idempotent
        session.disconnect().await;
        session.disconnect().await;
    }

    #[tokio::test]
    async fn response_payload_has_status_byte_removed() {
        let opener = MockPortOpener::new();
        opener.add_device(
            "COM1",
            None,
            Arc::new(|frame| match frame {
                "/1QR\r" => Some(reply_frame("")),
                "/1?0R\r" => Some(reply_frame("12345")),
                _ => None,
            }),
        );
        let mut session = session(&opener, "COM1");
        assert!(session.connect().await.unwrap());

        let reply = session.write_and_get_response("/1?0R\r", 1.0).await.unwrap();
        assert_eq!(reply.as_deref(), Some("12345"));

        let silent = session.write_and_get_response("/1&R\r", 1.0).await.unwrap();
        assert_eq!(silent, None);
    }

    #[tokio::test]
    async fn writes_are_paced_by_delay_factor() {
        let stamps: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let opener = MockPortOpener::new();
        let recorder = stamps.clone();
        opener.add_device(
            "COM1",
            None,
            Arc::new(move |frame| {
                recorder.lock().unwrap().push(Instant::now());
                (frame == "/1QR\r").then(|| reply_frame(""))
            }),
        );
        let mut session = session(&opener, "COM1");
        assert!(session.connect().await.unwrap());

        for _ in 0..3 {
            session.write("/1P1R\r", 4.0).await.unwrap();
        }

        let stamps = stamps.lock().unwrap().clone();
        assert_eq!(stamps.len(), 4);
        // 4.0 x 5 ms between consecutive writes, minus scheduling slack
        for pair in stamps[1..].windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(18));
        }
    }
}
