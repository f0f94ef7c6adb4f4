//! Background position polling.
//!
//! While coordinates are being initialized and afterwards, a tokio task asks
//! the motor for its position every `poll_interval` (start to start) and
//! drives the state transitions only it can observe: reaching the limit
//! switch, finishing home calibration, finishing a move, losing the device.
//!
//! Each iteration holds the controller lock for exactly one position query
//! and the decision that follows it; the sleep happens outside the lock.
//! The failure and home-calibration counters belong to the running loop.
//!
//! Stopping:
//! - from outside, [`PositionPoller::stop`] signals the loop and waits for it
//!   to exit, bounded by `stop_timeout`, then aborts it;
//! - from inside the poll task itself, the stop is handed to a freshly
//!   spawned task so the loop never waits on itself.

use super::controller::{
    ControllerCore, ControllerShared, MotorEvent, MotorState, StoppedMovingReason,
    COMMAND_DELAY_FACTOR,
};
use crate::config::PollerConfig;
use crate::protocol::{generate_command, Command};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

static NEXT_POLLER_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    /// (poller id, generation) of the poll task currently running.
    static POLL_TASK: (u64, u64);
}

#[derive(Default)]
struct PollerControl {
    generation: u64,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

/// Owns the poll task. Guarded by its own lock, independent of the
/// controller lock.
pub(crate) struct PositionPoller {
    id: u64,
    config: PollerConfig,
    control: Mutex<PollerControl>,
}

impl PositionPoller {
    pub(crate) fn new(config: PollerConfig) -> Self {
        Self {
            id: NEXT_POLLER_ID.fetch_add(1, Ordering::Relaxed),
            config,
            control: Mutex::new(PollerControl::default()),
        }
    }

    pub(crate) fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Replace any running loop with the one built by `make_loop`.
    ///
    /// `make_loop` gets the shutdown receiver and the new generation.
    pub(crate) async fn spawn<F, Fut>(self: &Arc<Self>, make_loop: F)
    where
        F: FnOnce(oneshot::Receiver<()>, u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.stop().await;

        let mut control = self.control.lock().await;
        control.generation += 1;
        let generation = control.generation;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = POLL_TASK.scope((self.id, generation), make_loop(shutdown_rx, generation));
        control.handle = Some(tokio::spawn(task));
        control.shutdown = Some(shutdown_tx);
        tracing::debug!(target: "silverpak::poller", generation, "Position poller started");
    }

    /// True while a poll task exists and has not finished.
    #[cfg(test)]
    pub(crate) async fn is_running(&self) -> bool {
        let control = self.control.lock().await;
        control.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the poll task and make sure it is gone.
    ///
    /// Called from the poll task itself this returns immediately and the
    /// stop happens on a separate task.
    pub(crate) async fn stop(self: &Arc<Self>) {
        match POLL_TASK.try_with(|task| *task) {
            Ok((id, generation)) if id == self.id => self.dispatch_stop(generation),
            _ => self.halt(None).await,
        }
    }

    /// Stop `generation` from a separate task. A newer generation is left alone.
    pub(crate) fn dispatch_stop(self: &Arc<Self>, generation: u64) {
        let poller = Arc::clone(self);
        tokio::spawn(async move { poller.halt(Some(generation)).await });
    }

    async fn halt(&self, generation: Option<u64>) {
        let mut control = self.control.lock().await;
        if generation.is_some_and(|g| g != control.generation) {
            return;
        }
        if let Some(tx) = control.shutdown.take() {
            let _ = tx.send(());
        }
        // The lock stays held until the task is gone so a restart cannot overlap it
        let Some(mut handle) = control.handle.take() else {
            return;
        };
        match tokio::time::timeout(self.config.stop_timeout(), &mut handle).await {
            Ok(_) => {
                tracing::debug!(target: "silverpak::poller", generation = control.generation, "Position poller stopped");
            }
            Err(_) => {
                tracing::warn!(
                    target: "silverpak::poller",
                    timeout_ms = self.config.stop_timeout_ms,
                    "Position poller did not stop in time; aborting"
                );
                handle.abort();
            }
        }
    }
}

/// Start polling for `shared`'s motor.
pub(crate) async fn start(shared: &Arc<ControllerShared>) {
    let controller = Arc::downgrade(shared);
    let config = shared.poller.config().clone();
    shared
        .poller
        .spawn(move |shutdown, generation| poll_loop(controller, config, generation, shutdown))
        .await;
}

/// Counters owned by one running loop.
#[derive(Debug, Default)]
pub(crate) struct PollCounters {
    consecutive_failures: u32,
    home_calibration_steps: u32,
}

/// What one iteration produced.
#[derive(Debug, Default)]
pub(crate) struct PollOutcome {
    events: Vec<MotorEvent>,
    stop: bool,
}

impl PollOutcome {
    fn stop_with(events: Vec<MotorEvent>) -> Self {
        Self { events, stop: true }
    }
}

async fn poll_loop(
    controller: Weak<ControllerShared>,
    config: PollerConfig,
    generation: u64,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut counters = PollCounters::default();
    loop {
        if !matches!(shutdown_rx.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
            break;
        }
        let started = Instant::now();

        // Controller dropped: nothing left to poll for
        let Some(shared) = controller.upgrade() else {
            break;
        };

        let outcome = {
            let mut core = shared.core.lock().await;
            poll_once(&mut core, &config, &mut counters).await
        };
        for event in outcome.events {
            shared.publish(event);
        }
        if outcome.stop {
            shared.poller.dispatch_stop(generation);
            break;
        }
        drop(shared);

        let sleep = config.interval().saturating_sub(started.elapsed());
        tokio::select! {
            _ = &mut shutdown_rx => break,
            _ = tokio::time::sleep(sleep) => {}
        }
    }
    tracing::debug!(target: "silverpak::poller", generation, "Position poll loop exited");
}

/// One position query and the decision that follows. Caller holds the
/// controller lock.
pub(crate) async fn poll_once(
    core: &mut ControllerCore,
    config: &PollerConfig,
    counters: &mut PollCounters,
) -> PollOutcome {
    if core.fault.is_some() {
        return PollOutcome::stop_with(Vec::new());
    }

    let query = generate_command(Command::QueryMotorPosition, "");
    let response = match core.request(&query, COMMAND_DELAY_FACTOR).await {
        Ok(response) => response,
        Err(e) => {
            // Disconnected underneath us
            tracing::debug!(target: "silverpak::poller", error = %e, "Position query impossible; stopping");
            return PollOutcome::stop_with(Vec::new());
        }
    };

    let Some(position) = response.as_deref().and_then(|r| r.trim().parse::<i64>().ok()) else {
        return record_failure(core, config, counters, response.as_deref()).await;
    };
    counters.consecutive_failures = 0;

    if position == core.position {
        on_stopped(core, config, counters, position).await
    } else {
        on_moved(core, config, counters, position).await
    }
}

async fn record_failure(
    core: &mut ControllerCore,
    config: &PollerConfig,
    counters: &mut PollCounters,
    response: Option<&str>,
) -> PollOutcome {
    counters.consecutive_failures += 1;
    tracing::debug!(
        target: "silverpak::poller",
        failures = counters.consecutive_failures,
        ?response,
        "No valid position reply"
    );
    if counters.consecutive_failures < config.max_consecutive_failures {
        return PollOutcome::default();
    }

    counters.consecutive_failures = 0;
    tracing::warn!(
        target: "silverpak::poller",
        failures = config.max_consecutive_failures,
        "Silverpak stopped answering; disconnecting"
    );
    core.set_state(MotorState::Disconnected);
    core.transport.disconnect().await;
    PollOutcome::stop_with(vec![MotorEvent::ConnectionLost])
}

async fn on_stopped(
    core: &mut ControllerCore,
    config: &PollerConfig,
    counters: &mut PollCounters,
    position: i64,
) -> PollOutcome {
    let mut outcome = PollOutcome::default();
    match core.state {
        MotorState::InitializingCoordinatesMoveToZero => {
            // Old firmware sometimes halts here and claims to be at the top
            let from_quirk = position.abs_diff(config.firmware_quirk_position);
            if from_quirk < config.firmware_quirk_tolerance.unsigned_abs() {
                tracing::info!(target: "silverpak::poller", position, "Stalled at firmware quirk position; reissuing move to zero");
                if let Err(e) = core.move_to_zero().await {
                    tracing::warn!(target: "silverpak::poller", error = %e, "Move to zero failed");
                }
            } else {
                core.set_state(MotorState::InitializingCoordinatesCalibrateHome);
                if let Err(e) = core.go_home().await {
                    tracing::warn!(target: "silverpak::poller", error = %e, "Home seek failed");
                }
                counters.home_calibration_steps = 0;
            }
        }
        MotorState::InitializingCoordinatesCalibrateHome => {
            core.set_state(MotorState::Ready);
            outcome
                .events
                .push(MotorEvent::StoppedMoving(StoppedMovingReason::Initialized));
        }
        MotorState::AbortingCoordinateInit => {
            core.set_state(MotorState::InitializedSmoothMotion);
            outcome
                .events
                .push(MotorEvent::StoppedMoving(StoppedMovingReason::InitializationAborted));
        }
        MotorState::Moving => {
            core.set_state(MotorState::Ready);
            outcome
                .events
                .push(MotorEvent::StoppedMoving(StoppedMovingReason::Normal));
        }
        _ => {}
    }
    outcome
}

async fn on_moved(
    core: &mut ControllerCore,
    config: &PollerConfig,
    counters: &mut PollCounters,
    position: i64,
) -> PollOutcome {
    core.position = position;
    let mut outcome = PollOutcome {
        events: vec![MotorEvent::PositionChanged(position)],
        stop: false,
    };

    if core.state != MotorState::InitializingCoordinatesCalibrateHome {
        return outcome;
    }
    counters.home_calibration_steps += 1;
    if counters.home_calibration_steps <= config.max_home_calibration_steps {
        return outcome;
    }

    // Home calibration keeps creeping: old firmware misbehaving
    for _ in 0..3 {
        if let Err(e) = core.terminate().await {
            tracing::warn!(target: "silverpak::poller", error = %e, "Terminate failed");
        }
    }
    let reason = format!(
        "home calibration moved more than {} times; outdated motor firmware",
        config.max_home_calibration_steps
    );
    tracing::error!(target: "silverpak::poller", position, %reason, "Motor misbehavior detected");
    core.fault = Some(reason.clone());
    outcome.events.push(MotorEvent::DeviceMisbehavior(reason));
    outcome.stop = true;
    outcome
}
