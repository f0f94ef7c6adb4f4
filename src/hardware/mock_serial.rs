//! Mock serial port implementation for testing async serial communication
//!
//! This module provides `MockSerialPort` which implements `AsyncRead` and `AsyncWrite`,
//! and a corresponding `MockDeviceHarness` to control the mock from within tests.
//! [`MockPortOpener`] hands such ports out through the [`PortOpener`] trait so
//! discovery and the motor controller can be exercised without hardware.
//!
//! # Architecture
//!
//! The mock uses a pair of unbounded channels to simulate bidirectional communication:
//! - `MockSerialPort` (given to application): implements AsyncRead/AsyncWrite
//! - `MockDeviceHarness` (kept in test): scripts device behavior
//!
//! # Example
//!
//! ```rust,ignore
//! use silverpak::hardware::mock_serial::{self, reply_frame, MockPortOpener};
//!
//! #[tokio::test]
//! async fn test_status_query() {
//!     // Scripted exchange on a bare port pair
//!     let (mut port, mut harness) = mock_serial::new();
//!     port.write_all(b"/1QR\r").await.unwrap();
//!     harness.expect_and_reply(b"/1QR\r", "").await;
//!
//!     // Or a whole simulated device behind a port name
//!     let opener = MockPortOpener::new();
//!     opener.add_device("COM1", Some(9600), Arc::new(|frame| {
//!         (frame == "/1QR\r").then(|| reply_frame(""))
//!     }));
//! }
//! ```

use super::serial::{DynSerial, PortOpener};
use crate::protocol::{RX_END, RX_START};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Status byte a healthy, idle Silverpak puts in front of its reply data.
pub const STATUS_READY: u8 = b'`';

/// Build a complete DT reply frame around `data`.
pub fn reply_frame(data: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(data.len() + 6);
    frame.push(0xff);
    frame.extend_from_slice(RX_START);
    frame.push(STATUS_READY);
    frame.extend_from_slice(data.as_bytes());
    frame.push(RX_END);
    frame.extend_from_slice(b"\r\n");
    frame
}

/// The client-facing side of the mock serial port
///
/// This struct implements `AsyncRead` and `AsyncWrite` and is intended to be
/// passed to the application code under test as a drop-in replacement for a
/// real `tokio_serial::SerialStream`.
#[derive(Debug)]
pub struct MockSerialPort {
    /// Channel to send written data to the harness
    writes_tx: UnboundedSender<Vec<u8>>,
    /// Channel to receive data from the harness to be read
    reads_rx: UnboundedReceiver<Vec<u8>>,
    /// Buffer for data received from the harness but not yet read by the client
    read_buffer: VecDeque<u8>,
}

/// The test-facing side for controlling the mock serial port
///
/// This harness allows a test to assert on data written by the client
/// and to send data back as if it were a real device.
#[derive(Debug)]
pub struct MockDeviceHarness {
    /// Channel to receive data written by the client
    writes_rx: UnboundedReceiver<Vec<u8>>,
    /// Channel to send data to the client for it to read
    reads_tx: UnboundedSender<Vec<u8>>,
    /// Buffer for data received from the client but not yet asserted by the test
    write_buffer: Vec<u8>,
}

/// Creates a new connected pair of `MockSerialPort` and `MockDeviceHarness`
pub fn new() -> (MockSerialPort, MockDeviceHarness) {
    let (client_to_harness_tx, client_to_harness_rx) = mpsc::unbounded_channel();
    let (harness_to_client_tx, harness_to_client_rx) = mpsc::unbounded_channel();

    let port = MockSerialPort {
        writes_tx: client_to_harness_tx,
        reads_rx: harness_to_client_rx,
        read_buffer: VecDeque::new(),
    };

    let harness = MockDeviceHarness {
        writes_rx: client_to_harness_rx,
        reads_tx: harness_to_client_tx,
        write_buffer: Vec::new(),
    };

    (port, harness)
}

// =============================================================================
// MockSerialPort Implementations
// =============================================================================

impl MockSerialPort {
    fn fill(&mut self, buf: &mut ReadBuf<'_>) {
        let to_read = std::cmp::min(buf.remaining(), self.read_buffer.len());
        let chunk: Vec<u8> = self.read_buffer.drain(..to_read).collect();
        buf.put_slice(&chunk);
    }
}

impl AsyncRead for MockSerialPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.read_buffer.is_empty() {
            self.fill(buf);
            return Poll::Ready(Ok(()));
        }

        match self.reads_rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                self.read_buffer.extend(chunk);
                self.fill(buf);
                Poll::Ready(Ok(()))
            }
            // Harness gone: end-of-file
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for MockSerialPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.writes_tx.send(buf.to_vec()) {
            Ok(_) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock device harness disconnected",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

// =============================================================================
// MockDeviceHarness Implementations
// =============================================================================

impl MockDeviceHarness {
    /// Sends raw bytes to the client
    ///
    /// # Errors
    /// Returns error if the client port has been disconnected
    pub fn send_response(&self, data: &[u8]) -> Result<(), &'static str> {
        self.reads_tx
            .send(data.to_vec())
            .map_err(|_| "Failed to send response: client port disconnected")
    }

    /// Sends a complete DT reply carrying `data`
    pub fn reply(&self, data: &str) -> Result<(), &'static str> {
        self.send_response(&reply_frame(data))
    }

    /// Waits for the client to write specific data and asserts its correctness
    ///
    /// # Panics
    /// Panics if the expected data is not received within 2 seconds or if
    /// the received data does not match the expected data.
    pub async fn expect_write(&mut self, expected: &[u8]) {
        use tokio::time::timeout;

        let timeout_duration = Duration::from_secs(2);

        while self.write_buffer.len() < expected.len() {
            match timeout(timeout_duration, self.writes_rx.recv()).await {
                Ok(Some(chunk)) => self.write_buffer.extend_from_slice(&chunk),
                Ok(None) => panic!("Client-side port closed while expecting a write."),
                Err(_) => {
                    panic!(
                        "Timeout waiting for write. Expected `{:?}` ({} bytes), but only received `{:?}` ({} bytes).",
                        String::from_utf8_lossy(expected),
                        expected.len(),
                        String::from_utf8_lossy(&self.write_buffer),
                        self.write_buffer.len()
                    );
                }
            }
        }

        let actual = &self.write_buffer[..expected.len()];
        assert_eq!(
            actual,
            expected,
            "Mismatch in expected write. Expected `{:?}`, got `{:?}`.",
            String::from_utf8_lossy(expected),
            String::from_utf8_lossy(actual)
        );

        self.write_buffer.drain(..expected.len());
    }

    /// Expects a write and sends a DT reply in one operation
    pub async fn expect_and_reply(&mut self, expected: &[u8], data: &str) {
        self.expect_write(expected).await;
        if self.reply(data).is_err() {
            panic!("Failed to send reply: client port disconnected");
        }
    }

    /// Next CR-terminated frame written by the client
    ///
    /// Returns `None` if no complete frame arrives within `wait` or the client
    /// side is gone.
    pub async fn next_frame(&mut self, wait: Duration) -> Option<String> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(end) = self.write_buffer.iter().position(|b| *b == b'\r') {
                let frame: Vec<u8> = self.write_buffer.drain(..=end).collect();
                return Some(String::from_utf8_lossy(&frame).into_owned());
            }
            match tokio::time::timeout_at(deadline, self.writes_rx.recv()).await {
                Ok(Some(chunk)) => self.write_buffer.extend_from_slice(&chunk),
                Ok(None) | Err(_) => return None,
            }
        }
    }

    /// Drains any pending writes without asserting their content
    pub async fn drain_writes(&mut self) {
        use tokio::time::timeout;
        let short_timeout = Duration::from_millis(50);

        while let Ok(Some(chunk)) = timeout(short_timeout, self.writes_rx.recv()).await {
            self.write_buffer.extend_from_slice(&chunk);
        }
        self.write_buffer.clear();
    }

    /// Answer every frame with `responder` until the client goes away
    ///
    /// A `None` from the responder leaves the frame unanswered.
    pub async fn serve(mut self, responder: Responder) {
        while let Some(frame) = self.next_frame(Duration::from_secs(3600)).await {
            if let Some(bytes) = responder(&frame) {
                if self.send_response(&bytes).is_err() {
                    break;
                }
            }
        }
    }
}

// =============================================================================
// MockPortOpener
// =============================================================================

/// Maps a complete outbound frame to the bytes the simulated device sends back.
pub type Responder = Arc<dyn Fn(&str) -> Option<Vec<u8>> + Send + Sync>;

#[derive(Clone)]
enum MockPortBehavior {
    /// Open fails with an access conflict
    Busy,
    /// Open fails because the device node is gone
    Missing,
    /// Opens, but every write fails
    RejectWrites,
    /// Opens; frames are answered only at the matching baud rate
    Device {
        baud_rate: Option<u32>,
        responder: Responder,
    },
}

/// [`PortOpener`] that serves scripted mock ports by name.
///
/// Ports never registered behave like empty ports: they open, accept writes,
/// and never answer.
#[derive(Clone, Default)]
pub struct MockPortOpener {
    ports: Arc<Mutex<HashMap<String, MockPortBehavior>>>,
    order: Arc<Mutex<Vec<String>>>,
    opened: Arc<Mutex<Vec<(String, u32)>>>,
}

impl MockPortOpener {
    /// Empty opener with no ports.
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, port_name: &str, behavior: MockPortBehavior) {
        if let Ok(mut ports) = self.ports.lock() {
            ports.insert(port_name.to_string(), behavior);
        }
        if let Ok(mut order) = self.order.lock() {
            if !order.iter().any(|p| p == port_name) {
                order.push(port_name.to_string());
            }
        }
    }

    /// Register a port with nothing attached.
    pub fn add_empty(&self, port_name: &str) {
        self.insert(
            port_name,
            MockPortBehavior::Device {
                baud_rate: None,
                responder: Arc::new(|_| None),
            },
        );
    }

    /// Register a port already held open by someone else.
    pub fn add_busy(&self, port_name: &str) {
        self.insert(port_name, MockPortBehavior::Busy);
    }

    /// Register a port that disappears when opened.
    pub fn add_missing(&self, port_name: &str) {
        self.insert(port_name, MockPortBehavior::Missing);
    }

    /// Register a port that opens but rejects writes (e.g. a virtual port).
    pub fn add_write_rejecting(&self, port_name: &str) {
        self.insert(port_name, MockPortBehavior::RejectWrites);
    }

    /// Register a port with a device answering through `responder`.
    ///
    /// With `baud_rate` set, opens at any other rate see a silent line.
    pub fn add_device(&self, port_name: &str, baud_rate: Option<u32>, responder: Responder) {
        self.insert(
            port_name,
            MockPortBehavior::Device {
                baud_rate,
                responder,
            },
        );
    }

    /// Every `(port, baud)` opened so far, in order.
    pub fn opened(&self) -> Vec<(String, u32)> {
        self.opened.lock().map(|o| o.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PortOpener for MockPortOpener {
    async fn open(&self, port_name: &str, baud_rate: u32) -> io::Result<DynSerial> {
        let behavior = self
            .ports
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "mock port table poisoned"))?
            .get(port_name)
            .cloned();

        match behavior {
            Some(MockPortBehavior::Busy) => {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("{port_name} is in use"),
                ))
            }
            Some(MockPortBehavior::Missing) => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{port_name} does not exist"),
                ))
            }
            _ => {}
        }

        if let Ok(mut opened) = self.opened.lock() {
            opened.push((port_name.to_string(), baud_rate));
        }

        let (port, harness) = new();
        match behavior {
            Some(MockPortBehavior::RejectWrites) => drop(harness),
            Some(MockPortBehavior::Device {
                baud_rate: expected,
                responder,
            }) if expected.map_or(true, |b| b == baud_rate) => {
                tokio::spawn(harness.serve(responder));
            }
            _ => {
                tokio::spawn(harness.serve(Arc::new(|_| None)));
            }
        }
        Ok(Box::new(port))
    }

    async fn available_ports(&self) -> io::Result<Vec<String>> {
        Ok(self.order.lock().map(|o| o.clone()).unwrap_or_default())
    }
}
