//! Reply timeout of the master exchange, expiring at most once per arming.
use log::trace;

use crate::platform::{TaskTimer, TimerTask};

/// Worst-case execution time announced for the timeout callback.
pub const TIMEOUT_EXEC_TIME_US: u32 = 500;

/// The single outstanding reply timeout of a handler.
#[derive(Debug, Default)]
pub struct ReplyTimeout {
    armed: bool,
}

impl ReplyTimeout {
    /// Replaces any stale timeout with a fresh one of `period_ms`.
    pub fn arm<M: TaskTimer + ?Sized>(&mut self, timer: &M, period_ms: u32) {
        timer.cancel(TimerTask::ReplyTimeout);
        timer.schedule(TimerTask::ReplyTimeout, period_ms, TIMEOUT_EXEC_TIME_US);
        self.armed = true;
        trace!("reply timeout armed for {period_ms} ms");
    }

    pub fn disarm<M: TaskTimer + ?Sized>(&mut self, timer: &M) {
        if self.armed {
            timer.cancel(TimerTask::ReplyTimeout);
            self.armed = false;
        }
    }

    /// Consumes a firing. Returns false for a firing that was already
    /// superseded by a reply.
    pub fn expire(&mut self) -> bool {
        std::mem::replace(&mut self.armed, false)
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct RecordingTimer {
        calls: RefCell<Vec<(&'static str, TimerTask, u32)>>,
    }

    impl TaskTimer for RecordingTimer {
        fn schedule(&self, task: TimerTask, delay_ms: u32, _max_exec_time_us: u32) {
            self.calls.borrow_mut().push(("schedule", task, delay_ms));
        }
        fn cancel(&self, task: TimerTask) {
            self.calls.borrow_mut().push(("cancel", task, 0));
        }
    }

    #[test]
    fn arm_cancels_stale_timeout_first() {
        let timer = RecordingTimer::default();
        let mut timeout = ReplyTimeout::default();
        timeout.arm(&timer, 1000);
        assert!(timeout.is_armed());
        assert_eq!(
            timer.calls.borrow().as_slice(),
            &[
                ("cancel", TimerTask::ReplyTimeout, 0),
                ("schedule", TimerTask::ReplyTimeout, 1000)
            ]
        );
    }

    #[test]
    fn fires_once() {
        let timer = RecordingTimer::default();
        let mut timeout = ReplyTimeout::default();
        timeout.arm(&timer, 10);
        assert!(timeout.expire());
        assert!(!timeout.expire());

        timeout.arm(&timer, 10);
        timeout.disarm(&timer);
        assert!(!timeout.expire());
    }
}
