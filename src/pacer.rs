//! Pacing, retry and time budget around motor moves.
//!
//! The motor driver drops commands that arrive too close together and
//! latches an alarm after a rejected move. A [`MotionPacer`] keeps the bus
//! quiet between commands, retries a failed move exactly once after clearing
//! the alarm, and bounds the wait for each move with a time budget after
//! which the motor is stopped.
//!
//! ```text
//! Idle -> Commanded -> AwaitingAck -> Commanded -> WaitingBudget -> Idle
//!                           |                            |
//!                           +-> Idle (error)             +-> Stopping -> Idle
//! ```
use crate::error::{Error, Result};
use crate::motor_client::MotorDriver;
use crate::motor_protocol::Ack;
use crate::transport::Transport;
use log::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, Instant};

/// Delays used by the [`MotionPacer`].
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(default))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacerTiming {
    /// Minimum time between two move commands.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub min_interval: Duration,
    /// Quiet time on the bus before each command.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub inter_command_gap: Duration,
    /// Settle time after a successful alarm clear.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub post_clear_settle: Duration,
    /// Settle time before the retry of a failed move.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub retry_settle: Duration,
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub poll_interval: Duration,
    /// Time a move may take before the motor is stopped.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub move_budget: Duration,
    /// Time allowed for the motor to come to rest after a stop.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub stop_grace: Duration,
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub post_stop_settle: Duration,
}

impl Default for PacerTiming {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(500),
            inter_command_gap: Duration::from_millis(120),
            post_clear_settle: Duration::from_millis(200),
            retry_settle: Duration::from_millis(250),
            poll_interval: Duration::from_millis(120),
            move_budget: Duration::from_secs(5),
            stop_grace: Duration::from_millis(1200),
            post_stop_settle: Duration::from_millis(350),
        }
    }
}

/// Where the pacer is in the life of one move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionState {
    Idle,
    /// A move is being paced or is in flight.
    Commanded,
    /// The move frame is on the wire and the reply is being read.
    AwaitingAck,
    /// Polling the driver until the move completes or the budget runs out.
    WaitingBudget,
    /// The budget ran out and the motor is being stopped.
    Stopping,
}

/// How the wait for a move ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    Completed,
    /// The motor was still moving at the end of the budget and was stopped.
    BudgetExpired,
}

/// A repeated open/close run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CyclePlan {
    pub open: i32,
    pub close: i32,
    pub cycles: u32,
}

/// The result of [`MotionPacer::run_cycles`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Full open/close cycles performed.
    pub completed: u32,
    /// Moves that ran out of budget and were stopped.
    pub budget_stops: u32,
    /// The run ended early on the cancel flag.
    pub cancelled: bool,
}

/// Paces the moves of one motor driver.
#[derive(Debug)]
pub struct MotionPacer<'a, T> {
    driver: &'a MotorDriver<T>,
    timing: PacerTiming,
    state: MotionState,
    last_command: Option<Instant>,
    cancel: Option<Arc<AtomicBool>>,
}

impl<'a, T: Transport> MotionPacer<'a, T> {
    pub fn new(driver: &'a MotorDriver<T>, timing: PacerTiming) -> Self {
        Self {
            driver,
            timing,
            state: MotionState::Idle,
            last_command: None,
            cancel: None,
        }
    }

    /// Stops [`Self::run_cycles`] before the next move once `flag` is set.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn state(&self) -> MotionState {
        self.state
    }

    pub fn timing(&self) -> &PacerTiming {
        &self.timing
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    fn drain(&self) {
        if let Err(error) = self.driver.drain() {
            warn!("Cannot drain motor transport: {error}");
        }
    }

    fn clear_alarm(&self) {
        if self.driver.clear_alarm() {
            sleep(self.timing.post_clear_settle);
        }
    }

    fn send(&mut self, angle: i32) -> Result<Ack> {
        if let Some(last) = self.last_command {
            if let Some(remaining) = self.timing.min_interval.checked_sub(last.elapsed()) {
                sleep(remaining);
            }
        }
        self.state = MotionState::AwaitingAck;
        let result = self.driver.move_to(angle);
        self.last_command = Some(Instant::now());
        result
    }

    /// Sends a move with bus hygiene and one retry.
    ///
    /// The first attempt is preceded by the inter-command gap and a drain. If
    /// the driver does not acknowledge it the alarm is cleared and the same
    /// move is sent once more; the error of that second attempt is returned.
    /// Transport failures and locally rejected moves are returned at once.
    pub fn paced_move(&mut self, angle: i32) -> Result<Ack> {
        self.state = MotionState::Commanded;
        sleep(self.timing.inter_command_gap);
        self.drain();

        let result = match self.send(angle) {
            Err(Error::Protocol(first)) => {
                warn!("Move to {angle} failed ({first}), clearing alarm and retrying once");
                self.state = MotionState::Commanded;
                self.clear_alarm();
                sleep(self.timing.retry_settle);
                self.drain();
                sleep(self.timing.inter_command_gap);
                self.send(angle)
            }
            other => other,
        };
        self.state = match result {
            Ok(_) => MotionState::Commanded,
            Err(_) => MotionState::Idle,
        };
        result
    }

    /// Waits until the driver reports the move as finished or `budget`
    /// elapsed. On expiry the motor is stopped once and given the grace
    /// period to come to rest; the post-stop settle is taken from what is
    /// left of the grace period.
    pub fn await_completion(&mut self, budget: Duration) -> MoveOutcome {
        self.state = MotionState::WaitingBudget;
        let started = Instant::now();
        while let Some(remaining) = budget.checked_sub(started.elapsed()) {
            if !self.driver.is_busy() {
                self.state = MotionState::Idle;
                return MoveOutcome::Completed;
            }
            sleep(self.timing.poll_interval.min(remaining));
        }

        self.state = MotionState::Stopping;
        warn!("Move still running after {budget:?}, stopping");
        self.driver.stop();
        let stopped = Instant::now();
        while let Some(remaining) = self.timing.stop_grace.checked_sub(stopped.elapsed()) {
            if !self.driver.is_busy() {
                break;
            }
            sleep(self.timing.poll_interval.min(remaining));
        }
        let left = self.timing.stop_grace.saturating_sub(stopped.elapsed());
        sleep(self.timing.post_stop_settle.min(left));
        self.state = MotionState::Idle;
        MoveOutcome::BudgetExpired
    }

    fn budgeted_move(&mut self, angle: i32, report: &mut CycleReport) -> Result<()> {
        if let Err(error) = self.paced_move(angle) {
            warn!("Move to {angle} failed after retry, stopping the run");
            self.clear_alarm();
            self.driver.stop();
            return Err(error);
        }
        if self.await_completion(self.timing.move_budget) == MoveOutcome::BudgetExpired {
            report.budget_stops += 1;
        }
        Ok(())
    }

    /// Moves between `plan.open` and `plan.close` `plan.cycles` times.
    ///
    /// The run starts by stopping the motor, clearing any alarm and homing to
    /// the close position. A failed homing move is logged and the run goes
    /// on; any later failed move stops the run with its error.
    pub fn run_cycles(&mut self, plan: CyclePlan) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        self.driver.stop();
        self.clear_alarm();

        info!("Homing to {} (budget {:?})", plan.close, self.timing.move_budget);
        match self.paced_move(plan.close) {
            Ok(_) => {
                if self.await_completion(self.timing.move_budget) == MoveOutcome::BudgetExpired {
                    report.budget_stops += 1;
                }
            }
            Err(error) => warn!("Homing move failed: {error}"),
        }

        'cycles: for cycle in 1..=plan.cycles {
            info!("Cycle {cycle}/{}", plan.cycles);
            for angle in [plan.open, plan.close] {
                if self.cancelled() {
                    report.cancelled = true;
                    break 'cycles;
                }
                self.budgeted_move(angle, &mut report)?;
            }
            report.completed += 1;
        }
        info!(
            "Cycle run finished: {} of {} cycles, {} budget stops",
            report.completed, plan.cycles, report.budget_stops
        );
        Ok(report)
    }
}
