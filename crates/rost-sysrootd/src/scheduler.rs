//! Debounced reload scheduler.
//!
//! Pure state machine: callers feed it events and clock readings and act on
//! the returned [`SchedulerAction`]. The coordinator owns the actual timer and
//! reload tasks.
//!
//! ```text
//!   IDLE --event--> ARMED --quiet for a window--> RUNNING --ok--> IDLE
//!                    ^  |                            |
//!                    +--+ newer event: re-arm        +--err--> ARMED (retry)
//! ```

use std::time::{Duration, Instant};

/// Default debounce window
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerAction {
    /// Nothing to do
    Idle,
    /// Arm a one-shot timer for one window, then call [`Scheduler::on_timer`]
    ArmTimer,
    /// Dispatch the reload task now
    StartReload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Armed,
    Running,
}

#[derive(Debug)]
pub struct Scheduler {
    window: Duration,
    /// Time of the newest unprocessed change event; `None` is the zero sentinel
    pending_since: Option<Instant>,
    timer_armed: bool,
    reloading: bool,
    /// A quiescence check arrived while a reload was running
    rerun: bool,
}

impl Scheduler {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending_since: None,
            timer_armed: false,
            reloading: false,
            rerun: false,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn state(&self) -> SchedulerState {
        if self.reloading {
            SchedulerState::Running
        } else if self.timer_armed || self.pending_since.is_some() {
            SchedulerState::Armed
        } else {
            SchedulerState::Idle
        }
    }

    /// True when no change event is waiting to be processed
    pub fn is_settled(&self) -> bool {
        self.pending_since.is_none()
    }

    pub fn is_reloading(&self) -> bool {
        self.reloading
    }

    /// Claim the reload slot for a load the caller runs itself, finished with
    /// [`Scheduler::on_reload_finished`]. Returns false while a reload is
    /// running; pending events stay pending either way.
    pub fn begin_load(&mut self) -> bool {
        if self.reloading {
            return false;
        }
        self.reloading = true;
        true
    }

    /// A relevant filesystem change was observed
    pub fn on_event(&mut self, now: Instant) -> SchedulerAction {
        self.pending_since = Some(now);
        if self.timer_armed {
            SchedulerAction::Idle
        } else {
            self.timer_armed = true;
            SchedulerAction::ArmTimer
        }
    }

    /// The armed timer fired
    pub fn on_timer(&mut self, now: Instant) -> SchedulerAction {
        self.timer_armed = false;
        self.check(now)
    }

    /// Quiescence check; also the immediate-trigger entry point
    pub fn check(&mut self, now: Instant) -> SchedulerAction {
        if self.reloading {
            self.rerun = true;
            return SchedulerAction::Idle;
        }

        let quiet = match self.pending_since {
            None => true,
            Some(since) => now.saturating_duration_since(since) >= self.window,
        };

        if quiet {
            self.pending_since = None;
            self.reloading = true;
            SchedulerAction::StartReload
        } else if self.timer_armed {
            SchedulerAction::Idle
        } else {
            self.timer_armed = true;
            SchedulerAction::ArmTimer
        }
    }

    /// The dispatched reload finished
    pub fn on_reload_finished(&mut self, outcome: ReloadOutcome) -> SchedulerAction {
        self.reloading = false;
        let rerun = std::mem::take(&mut self.rerun);

        match outcome {
            ReloadOutcome::Cancelled => SchedulerAction::Idle,
            ReloadOutcome::Failed => self.arm_if_needed(),
            ReloadOutcome::Succeeded => {
                if rerun && self.pending_since.is_none() {
                    self.reloading = true;
                    SchedulerAction::StartReload
                } else if self.pending_since.is_some() {
                    self.arm_if_needed()
                } else {
                    SchedulerAction::Idle
                }
            }
        }
    }

    fn arm_if_needed(&mut self) -> SchedulerAction {
        if self.timer_armed {
            SchedulerAction::Idle
        } else {
            self.timer_armed = true;
            SchedulerAction::ArmTimer
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}
