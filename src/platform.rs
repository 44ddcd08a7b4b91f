//! Collaborators the engine and the scheduler are driven by.
//!
//! The firmware provides these through its runtime; [`crate::host`] has
//! hosted implementations and the tests use small fakes.
use crate::protocol::{BaudRate, Parity};

/// The delayed callbacks the core arms. Each is a single named task: arming
/// it again replaces the previous deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerTask {
    /// Fires when a master query stayed unanswered.
    ReplyTimeout,
    /// Re-enters the query scheduler.
    PeriodicWork,
}

/// Delayed-callback primitive.
pub trait TaskTimer {
    /// Requests one invocation of `task` after `delay_ms`.
    fn schedule(&self, task: TimerTask, delay_ms: u32, max_exec_time_us: u32);

    /// Drops a pending invocation of `task`, if any.
    fn cancel(&self, task: TimerTask);
}

impl<T: TaskTimer + ?Sized> TaskTimer for &T {
    fn schedule(&self, task: TimerTask, delay_ms: u32, max_exec_time_us: u32) {
        (**self).schedule(task, delay_ms, max_exec_time_us)
    }

    fn cancel(&self, task: TimerTask) {
        (**self).cancel(task)
    }
}

/// Dual time source of the scheduler.
pub trait Clock {
    /// Free-running microsecond counter, wraps at `u32::MAX`.
    fn now_hp(&self) -> u32;

    /// Free-running counter in 1/128 s ticks.
    fn now_coarse(&self) -> u32;

    /// Longest delay the microsecond counter represents unambiguously.
    fn max_hp_delay_us(&self) -> u32;
}

impl<T: Clock + ?Sized> Clock for &T {
    fn now_hp(&self) -> u32 {
        (**self).now_hp()
    }

    fn now_coarse(&self) -> u32 {
        (**self).now_coarse()
    }

    fn max_hp_delay_us(&self) -> u32 {
        (**self).max_hp_delay_us()
    }
}

/// Half-duplex serial line with a direction-control pin.
pub trait SerialTransport {
    /// Switches the line to transmit and waits for the driver to settle.
    fn begin_transmit(&mut self);

    /// Writes `frame`, returning the number of bytes accepted.
    fn send(&mut self, frame: &[u8]) -> usize;

    /// Applies line settings. Returns false if the driver rejects them.
    fn configure(&mut self, baud_rate: BaudRate, parity: Parity) -> bool {
        let _ = (baud_rate, parity);
        true
    }
}
