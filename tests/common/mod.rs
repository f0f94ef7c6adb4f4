//! Shared fixtures: a simulated Silverpak 23CE behind the mock serial port.
//!
//! The simulator keeps a tiny motion model. `A<n>` sets a target, every
//! position query (`?0`) moves one step towards it, `T` halts, `z<n>`
//! redefines the current position and `Z<n>` starts a short home seek.
//! Replies can be overridden with [`Reply`] injections to simulate a flaky
//! line.

#![allow(dead_code)]

use silverpak::config::SilverpakConfig;
use silverpak::hardware::mock_serial::{reply_frame, MockPortOpener, Responder};
use silverpak::hardware::{MotorController, MotorEvent};
use silverpak::protocol::DriverAddress;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// Position the firmware quirk makes old drivers stall at.
pub const QUIRK_POSITION: i64 = 5_000_050;

/// Override for the next position query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Complete frame with a non-numeric payload
    Garbage,
    /// No reply at all
    Silent,
    /// Whatever the motion model says
    Model,
    /// A fixed position, leaving the motion model untouched
    Position(i64),
}

#[derive(Debug)]
struct SimState {
    address: DriverAddress,
    position: i64,
    target: i64,
    step: i64,
    home_travel: i64,
    home_runaway: bool,
    stall_at: Option<i64>,
    firmware: String,
    injected: VecDeque<Reply>,
    frames: Vec<String>,
}

/// A Silverpak answering on one driver address.
#[derive(Clone)]
pub struct SimulatedSilverpak {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedSilverpak {
    pub fn new(address: DriverAddress) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                address,
                position: 0,
                target: 0,
                step: 1_000_000,
                home_travel: 3,
                home_runaway: false,
                stall_at: None,
                firmware: "SPK23CE v6.21".to_string(),
                injected: VecDeque::new(),
                frames: Vec::new(),
            })),
        }
    }

    /// Distance covered per position query while moving.
    pub fn with_step(self, step: i64) -> Self {
        self.set_step(step);
        self
    }

    pub fn set_step(&self, step: i64) {
        self.state.lock().unwrap().step = step;
    }

    /// Stop once at `position` the first time a move passes it.
    pub fn with_stall_at(self, position: i64) -> Self {
        self.state.lock().unwrap().stall_at = Some(position);
        self
    }

    /// Make the home seek creep forever.
    pub fn with_home_runaway(self) -> Self {
        self.state.lock().unwrap().home_runaway = true;
        self
    }

    /// Queue reply overrides; returns the frame count at injection time.
    pub fn inject(&self, replies: &[Reply]) -> usize {
        let mut state = self.state.lock().unwrap();
        state.injected.extend(replies.iter().copied());
        state.frames.len()
    }

    /// Every frame addressed to this driver so far.
    pub fn frames(&self) -> Vec<String> {
        self.state.lock().unwrap().frames.clone()
    }

    /// Command lists (frame without `/`, address and `R\r`) so far.
    pub fn commands(&self) -> Vec<String> {
        self.frames()
            .iter()
            .map(|f| f[2..f.len() - 2].to_string())
            .collect()
    }

    /// How many times `commands` was sent.
    pub fn count(&self, commands: &str) -> usize {
        self.commands().iter().filter(|c| c.as_str() == commands).count()
    }

    pub fn position(&self) -> i64 {
        self.state.lock().unwrap().position
    }

    pub fn responder(&self) -> Responder {
        let state = self.state.clone();
        Arc::new(move |frame: &str| state.lock().unwrap().handle(frame))
    }
}

impl SimState {
    fn handle(&mut self, frame: &str) -> Option<Vec<u8>> {
        let bytes = frame.as_bytes();
        if bytes.len() < 4 || bytes[0] != b'/' || !frame.ends_with("R\r") {
            return None;
        }
        if bytes[1] != self.address.as_byte() {
            return None;
        }
        self.frames.push(frame.to_string());
        let body = &frame[2..frame.len() - 2];

        match body {
            "Q" => Some(reply_frame("")),
            "&" => Some(reply_frame(&self.firmware)),
            "?0" => match self.injected.pop_front().unwrap_or(Reply::Model) {
                Reply::Garbage => Some(reply_frame("ERR")),
                Reply::Silent => None,
                Reply::Position(position) => Some(reply_frame(&position.to_string())),
                Reply::Model => {
                    self.advance();
                    Some(reply_frame(&self.position.to_string()))
                }
            },
            _ => {
                for (opcode, operand) in tokenize(body) {
                    self.execute(&opcode, operand);
                }
                None
            }
        }
    }

    fn execute(&mut self, opcode: &str, operand: Option<i64>) {
        match (opcode, operand) {
            ("z", Some(n)) => {
                self.position = n;
                self.target = n;
            }
            ("A", Some(n)) => self.target = n,
            ("P", Some(n)) => {
                self.position += n;
                self.target = self.position;
            }
            ("Z", _) => {
                self.target = if self.home_runaway {
                    self.position - 1_000_000_000
                } else {
                    self.position - self.home_travel
                };
            }
            ("T", _) => self.target = self.position,
            _ => {}
        }
    }

    fn advance(&mut self) {
        let delta = (self.target - self.position).clamp(-self.step, self.step);
        let next = self.position + delta;
        if let Some(stall) = self.stall_at {
            let (low, high) = if next < self.position {
                (next, self.position)
            } else {
                (self.position, next)
            };
            if low <= stall && stall <= high && self.position != stall {
                self.stall_at = None;
                self.position = stall;
                self.target = stall;
                return;
            }
        }
        self.position = next;
    }
}

/// Split `z5133000aE10266A0` into `[("z", 5133000), ("aE", 10266), ("A", 0)]`.
fn tokenize(body: &str) -> Vec<(String, Option<i64>)> {
    let chars: Vec<char> = body.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let width = if matches!(chars[i], 'a' | '?') { 2 } else { 1 };
        let end = (i + width).min(chars.len());
        let opcode: String = chars[i..end].iter().collect();
        i = end;
        let start = i;
        while i < chars.len() && (chars[i].is_ascii_digit() || (i == start && chars[i] == '-')) {
            i += 1;
        }
        let operand: String = chars[start..i].iter().collect();
        out.push((opcode, operand.parse().ok()));
    }
    out
}

/// Configuration with short pacing so tests run quickly.
pub fn fast_config() -> SilverpakConfig {
    let mut config = SilverpakConfig::default();
    config.transport.delay_unit_ms = 1;
    config.transport.read_window_ms = 20;
    config.poller.interval_ms = 25;
    config.poller.stop_timeout_ms = 500;
    config
}

/// Controller wired to a simulator on `port` at 9600 baud, driver 1.
pub fn controller_with(sim: &SimulatedSilverpak, port: &str) -> (MotorController, MockPortOpener) {
    let opener = MockPortOpener::new();
    opener.add_device(port, Some(9600), sim.responder());

    let mut config = fast_config();
    config.connection.port_name = Some(port.to_string());
    config.connection.baud_rate = Some(9600);
    config.connection.driver_address = Some(DriverAddress::Driver1);
    (MotorController::new(Arc::new(opener.clone()), &config), opener)
}

/// Controller connected and taken through settings and smooth motion.
pub async fn initialized_controller(sim: &SimulatedSilverpak) -> MotorController {
    let (motor, _opener) = controller_with(sim, "COM1");
    assert!(motor.connect().await.unwrap());
    motor.initialize_motor_settings().await.unwrap();
    motor.initialize_smooth_motion().await.unwrap();
    motor
}

/// Collect events until `done` matches one (inclusive), or panic after `wait`.
pub async fn events_until(
    events: &mut broadcast::Receiver<MotorEvent>,
    wait: Duration,
    done: impl Fn(&MotorEvent) -> bool,
) -> Vec<MotorEvent> {
    let mut seen = Vec::new();
    let result = tokio::time::timeout(wait, async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let finished = done(&event);
                    seen.push(event);
                    if finished {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for event; saw {seen:?}");
    seen
}

/// Events published within `wait`.
pub async fn drain_events(
    events: &mut broadcast::Receiver<MotorEvent>,
    wait: Duration,
) -> Vec<MotorEvent> {
    let mut seen = Vec::new();
    let _ = tokio::time::timeout(wait, async {
        while let Ok(event) = events.recv().await {
            seen.push(event);
        }
    })
    .await;
    seen
}
