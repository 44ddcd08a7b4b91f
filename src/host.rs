//! Hosted collaborators: a monotonic clock, a deadline table standing in for
//! the firmware task timer, and a serial link with RTS direction control.
//!
//! The [`Poller`] ties them to a [`Handler`] and a [`QueryScheduler`] in a
//! single-threaded event loop.
use std::io::{ErrorKind, Read, Write};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::handler::Handler;
use crate::platform::{Clock, SerialTransport, TaskTimer, TimerTask};
use crate::protocol::{BaudRate, Parity, MAX_FRAME_SIZE};
use crate::report::Uplink;
use crate::scheduler::QueryScheduler;
use crate::settings::Storage;

/// The number of stop bits used for serial communication.
pub const STOP_BITS: &tokio_serial::StopBits = &tokio_serial::StopBits::One;
/// The number of data bits used for serial communication.
pub const DATA_BITS: &tokio_serial::DataBits = &tokio_serial::DataBits::Eight;
/// Time the line driver gets after RTS is raised.
pub const DEFAULT_SETTLE_TIME: Duration = Duration::from_millis(1);

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }
}

/// Creates a `tokio_serial::SerialPortBuilder` with the specified settings.
///
/// # Arguments
///
/// * `device` - The path to the serial port device (e.g., `/dev/ttyUSB0`).
/// * `baud_rate` - The baud rate for the serial communication.
/// * `parity` - The parity bit setting.
pub fn serial_port_builder(device: &str, baud_rate: BaudRate, parity: Parity) -> tokio_serial::SerialPortBuilder {
    tokio_serial::new(device, u32::from(baud_rate))
        .parity(parity.into())
        .stop_bits(*STOP_BITS)
        .data_bits(*DATA_BITS)
        .flow_control(tokio_serial::FlowControl::None)
}

/// Microsecond and 1/128 s counters derived from one [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now_hp(&self) -> u32 {
        // truncation is the counter wrap
        self.origin.elapsed().as_micros() as u32
    }

    fn now_coarse(&self) -> u32 {
        (self.origin.elapsed().as_millis() * 128 / 1000) as u32
    }

    fn max_hp_delay_us(&self) -> u32 {
        i32::MAX as u32
    }
}

/// Pending deadlines of the two timer tasks.
#[derive(Debug, Default)]
pub struct DelayedTasks {
    deadlines: Mutex<[Option<Instant>; 2]>,
}

fn slot(task: TimerTask) -> usize {
    match task {
        TimerTask::ReplyTimeout => 0,
        TimerTask::PeriodicWork => 1,
    }
}

const TASKS: [TimerTask; 2] = [TimerTask::ReplyTimeout, TimerTask::PeriodicWork];

impl DelayedTasks {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut [Option<Instant>; 2]) -> R) -> R {
        f(&mut self.deadlines.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Takes the task whose deadline passed first, if any.
    pub fn pop_due(&self, now: Instant) -> Option<TimerTask> {
        self.with(|deadlines| {
            let (index, _) = deadlines
                .iter()
                .enumerate()
                .filter_map(|(index, deadline)| deadline.map(|at| (index, at)))
                .filter(|&(_, at)| at <= now)
                .min_by_key(|&(_, at)| at)?;
            deadlines[index] = None;
            Some(TASKS[index])
        })
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.with(|deadlines| deadlines.iter().flatten().min().copied())
    }

    pub fn is_pending(&self, task: TimerTask) -> bool {
        self.with(|deadlines| deadlines[slot(task)].is_some())
    }
}

impl TaskTimer for DelayedTasks {
    fn schedule(&self, task: TimerTask, delay_ms: u32, _max_exec_time_us: u32) {
        let at = Instant::now() + Duration::from_millis(delay_ms.into());
        self.with(|deadlines| deadlines[slot(task)] = Some(at));
    }

    fn cancel(&self, task: TimerTask) {
        self.with(|deadlines| deadlines[slot(task)] = None);
    }
}

/// Transmit side of a half-duplex RS-485 port.
pub struct SerialLink {
    port: Box<dyn tokio_serial::SerialPort>,
    settle: Duration,
}

impl SerialLink {
    /// Opens `device` and returns the link together with a read handle.
    pub fn open(
        device: &str,
        baud_rate: BaudRate,
        parity: Parity,
    ) -> tokio_serial::Result<(Self, Box<dyn tokio_serial::SerialPort>)> {
        let port = serial_port_builder(device, baud_rate, parity).open()?;
        let reader = port.try_clone()?;
        Ok((
            Self {
                port,
                settle: DEFAULT_SETTLE_TIME,
            },
            reader,
        ))
    }

    pub fn set_settle_time(&mut self, settle: Duration) {
        self.settle = settle;
    }
}

impl SerialTransport for SerialLink {
    fn begin_transmit(&mut self) {
        if let Err(err) = self.port.write_request_to_send(true) {
            warn!("Cannot raise RTS: {err}");
        }
        std::thread::sleep(self.settle);
    }

    fn send(&mut self, frame: &[u8]) -> usize {
        let sent = match self.port.write_all(frame).and_then(|()| self.port.flush()) {
            Ok(()) => frame.len(),
            Err(err) => {
                warn!("Serial write failed: {err}");
                0
            }
        };
        if let Err(err) = self.port.write_request_to_send(false) {
            warn!("Cannot release RTS: {err}");
        }
        sent
    }

    fn configure(&mut self, baud_rate: BaudRate, parity: Parity) -> bool {
        let result = self
            .port
            .set_baud_rate(baud_rate.into())
            .and_then(|()| self.port.set_parity(parity.into()));
        match result {
            Ok(()) => true,
            Err(err) => {
                warn!("Cannot apply {baud_rate} baud {parity:?}: {err}");
                false
            }
        }
    }
}

/// Routes a fired timer task to its owner.
pub fn dispatch<T, U, S, C, M>(
    task: TimerTask,
    handler: &Mutex<Handler<T, U>>,
    scheduler: &QueryScheduler<S>,
    clock: &C,
    timer: &M,
) where
    T: SerialTransport,
    U: Uplink,
    S: Storage,
    C: Clock + ?Sized,
    M: TaskTimer + ?Sized,
{
    trace!("timer task {task:?} fired");
    match task {
        TimerTask::ReplyTimeout => handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .on_reply_timeout(timer),
        TimerTask::PeriodicWork => scheduler.periodic_work(handler, clock, timer),
    }
}

/// Event loop of one serial port.
pub struct Poller<T, U, S> {
    pub handler: Mutex<Handler<T, U>>,
    pub scheduler: QueryScheduler<S>,
    pub clock: SystemClock,
    pub timer: DelayedTasks,
    reader: Box<dyn tokio_serial::SerialPort>,
}

impl<T: SerialTransport, U: Uplink, S: Storage> Poller<T, U, S> {
    pub fn new(handler: Handler<T, U>, scheduler: QueryScheduler<S>, reader: Box<dyn tokio_serial::SerialPort>) -> Self {
        Self {
            handler: Mutex::new(handler),
            scheduler,
            clock: SystemClock::new(),
            timer: DelayedTasks::new(),
            reader,
        }
    }

    /// Runs until `stop` returns true, checked after every wake-up.
    ///
    /// Slave frames are answered as soon as they are complete.
    pub fn run_until(&mut self, mut stop: impl FnMut(&Self) -> bool, idle_wait: Duration) -> std::io::Result<()> {
        let mut buffer = [0u8; MAX_FRAME_SIZE];
        while !stop(self) {
            while let Some(task) = self.timer.pop_due(Instant::now()) {
                dispatch(task, &self.handler, &self.scheduler, &self.clock, &self.timer);
            }

            let wait = self
                .timer
                .next_deadline()
                .map_or(idle_wait, |at| at.saturating_duration_since(Instant::now()))
                .max(Duration::from_millis(1));
            self.reader.set_timeout(wait)?;
            match self.reader.read(&mut buffer) {
                Ok(0) => {}
                Ok(len) => {
                    debug!("rx {:02x?}", &buffer[..len]);
                    let mut handler = self.handler.lock().unwrap_or_else(PoisonError::into_inner);
                    handler.on_receive(&buffer[..len], &self.timer);
                    if let Some(Err(err)) = handler.process_slave_frame() {
                        debug!("Slave request rejected: {err}");
                    }
                }
                Err(err) if err.kind() == ErrorKind::TimedOut => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}
