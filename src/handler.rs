//! Modbus RTU protocol engine.
//!
//! A [`Handler`] drives one half-duplex serial link, either as master or as
//! slave, over a single 64-byte comms buffer that is reused for transmit and
//! receive.
//!
//! As master it sends one [`MasterQuery`] at a time. The serial driver feeds
//! received bytes through [`Handler::on_receive`]; once the expected reply
//! length has arrived, or the reply timeout fires
//! ([`Handler::on_reply_timeout`]), the exchange is finalized exactly once:
//! the reply is decoded into the register image and a [`StatusReport`] goes
//! to the [`Uplink`].
//!
//! As slave it collects fixed 8-byte requests and answers them from the main
//! loop through [`Handler::process_slave_frame`].
//!
//! ```
//! use rtu_poller_lib::handler::{Handler, HandlerConfig};
//! use rtu_poller_lib::platform::{SerialTransport, TaskTimer, TimerTask};
//! use rtu_poller_lib::protocol::{FunctionCode, MasterQuery, QueryId};
//! use rtu_poller_lib::report::{StatusReport, Uplink};
//!
//! struct Wire(Vec<Vec<u8>>);
//! impl SerialTransport for Wire {
//!     fn begin_transmit(&mut self) {}
//!     fn send(&mut self, frame: &[u8]) -> usize {
//!         self.0.push(frame.to_vec());
//!         frame.len()
//!     }
//! }
//!
//! struct Reports(Vec<StatusReport>);
//! impl Uplink for Reports {
//!     fn send(&mut self, report: &StatusReport) {
//!         self.0.push(report.clone());
//!     }
//! }
//!
//! struct NoTimer;
//! impl TaskTimer for NoTimer {
//!     fn schedule(&self, _: TimerTask, _: u32, _: u32) {}
//!     fn cancel(&self, _: TimerTask) {}
//! }
//!
//! let mut handler = Handler::new(HandlerConfig::default(), Wire(Vec::new()), Reports(Vec::new()));
//! let query = MasterQuery::new(QueryId::try_from(1)?, 5, FunctionCode::ReadHoldingRegisters, 10, 3)
//!     .one_shot();
//! handler.submit_query(&query, &NoTimer)?;
//! assert_eq!(&handler.transport().0[0][..6], &[5, 3, 0, 10, 0, 3]);
//! # Ok::<(), rtu_poller_lib::Error>(())
//! ```
use std::sync::{Mutex, PoisonError};

use log::{debug, trace, warn};

use crate::crc;
use crate::dedup::DedupCache;
use crate::error::{Error, Result};
use crate::frame::{self, FrameBuffer};
use crate::platform::{SerialTransport, TaskTimer};
use crate::protocol::{
    BaudRate, FunctionCode, MasterQuery, Parity, StationId, ADDRESS_MAX, ADDRESS_MIN,
    CHECKSUM_SIZE, EXCEPTION_FLAG, EXCEPTION_SIZE, FUNC, ID, MAX_FRAME_SIZE, MIN_REPLY_SIZE,
    SLAVE_FRAME_SIZE,
};
use crate::report::{Status, StatusReport, Uplink};
use crate::scheduler::QueryExecutor;
use crate::timeout::ReplyTimeout;

/// Size of the scratch register image.
pub const REGISTER_IMAGE_SIZE: usize = 56;
pub const DEFAULT_REPLY_TIMEOUT_MS: u32 = 1000;
/// Receive bursts of this length or more are discarded.
pub const MAX_RX_BURST: usize = 256;
const EXCEPTION_REPLY_SIZE: usize = EXCEPTION_SIZE + CHECKSUM_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave(StationId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommState {
    #[default]
    Idle,
    WaitingReply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerConfig {
    pub role: Role,
    /// Number of registers of the image exposed to the bus.
    pub register_count: usize,
    pub reply_timeout_ms: u32,
    /// Report every exchange instead of changes only.
    pub continuous_reporting: bool,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            role: Role::Master,
            register_count: REGISTER_IMAGE_SIZE,
            reply_timeout_ms: DEFAULT_REPLY_TIMEOUT_MS,
            continuous_reporting: false,
        }
    }
}

/// Frame and error counters, wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Statistics {
    pub frames_in: u16,
    pub frames_out: u16,
    pub errors: u16,
}

/// The master query currently on the wire.
#[derive(Debug)]
struct Exchange {
    query: MasterQuery,
    expected_len: usize,
}

#[derive(Debug, Default)]
struct MasterReceiver {
    index: usize,
    ready: bool,
    received: usize,
}

impl MasterReceiver {
    fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Default)]
struct SlaveReceiver {
    frame: [u8; SLAVE_FRAME_SIZE],
    index: usize,
    ready: bool,
    overflow: bool,
}

impl SlaveReceiver {
    fn push(&mut self, byte: u8) {
        if self.ready {
            // the pending frame has not been consumed yet
            self.overflow = true;
            return;
        }
        if self.index == 0 {
            self.overflow = false;
        }
        self.frame[self.index] = byte;
        self.index += 1;
        if self.index == SLAVE_FRAME_SIZE {
            self.ready = true;
            self.index = 0;
        }
    }

    fn take(&mut self) -> Option<[u8; SLAVE_FRAME_SIZE]> {
        if self.ready {
            self.ready = false;
            Some(self.frame)
        } else {
            None
        }
    }
}

enum Outcome {
    Received(usize),
    TimedOut,
}

pub struct Handler<T, U> {
    config: HandlerConfig,
    transport: T,
    uplink: U,
    baud_rate: BaudRate,
    parity: Parity,
    buffer: FrameBuffer,
    registers: [u16; REGISTER_IMAGE_SIZE],
    state: CommState,
    last_error: Option<Error>,
    stats: Statistics,
    exchange: Option<Exchange>,
    master_rx: MasterReceiver,
    slave_rx: SlaveReceiver,
    timeout: ReplyTimeout,
    dedup: DedupCache,
}

impl<T: SerialTransport, U: Uplink> Handler<T, U> {
    pub fn new(config: HandlerConfig, transport: T, uplink: U) -> Self {
        Self {
            config,
            transport,
            uplink,
            baud_rate: BaudRate::default(),
            parity: Parity::default(),
            buffer: FrameBuffer::new(),
            registers: [0; REGISTER_IMAGE_SIZE],
            state: CommState::Idle,
            last_error: None,
            stats: Statistics::default(),
            exchange: None,
            master_rx: MasterReceiver::default(),
            slave_rx: SlaveReceiver::default(),
            timeout: ReplyTimeout::default(),
            dedup: DedupCache::new(),
        }
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    pub fn state(&self) -> CommState {
        self.state
    }

    pub fn last_error(&self) -> Option<Error> {
        self.last_error
    }

    pub fn statistics(&self) -> Statistics {
        self.stats
    }

    pub fn baud_rate(&self) -> BaudRate {
        self.baud_rate
    }

    pub fn parity(&self) -> Parity {
        self.parity
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn uplink(&self) -> &U {
        &self.uplink
    }

    pub fn uplink_mut(&mut self) -> &mut U {
        &mut self.uplink
    }

    fn register_count(&self) -> usize {
        self.config.register_count.min(REGISTER_IMAGE_SIZE)
    }

    pub fn registers(&self) -> &[u16] {
        &self.registers[..self.register_count()]
    }

    pub fn registers_mut(&mut self) -> &mut [u16] {
        let count = self.register_count();
        &mut self.registers[..count]
    }

    pub fn set_reply_timeout_ms(&mut self, timeout_ms: u32) {
        self.config.reply_timeout_ms = timeout_ms;
    }

    pub fn set_continuous_reporting(&mut self, continuous: bool) {
        self.config.continuous_reporting = continuous;
    }

    /// True if slave bytes were dropped because a frame was still pending.
    pub fn receive_overflowed(&self) -> bool {
        self.slave_rx.overflow
    }

    /// Selects line settings by their persisted indices. An unknown baud
    /// index keeps the current baud rate.
    pub fn apply_line_settings(&mut self, baud_index: u8, parity_index: u8) -> bool {
        match BaudRate::from_index(baud_index) {
            Some(baud_rate) => self.baud_rate = baud_rate,
            None => warn!(
                "unknown baud index {baud_index}, keeping {}",
                self.baud_rate
            ),
        }
        match Parity::from_index(parity_index) {
            Some(parity) => self.parity = parity,
            None => warn!("unknown parity index {parity_index}, keeping {:?}", self.parity),
        }
        self.transport.configure(self.baud_rate, self.parity)
    }

    /// Back to a freshly initialized engine: idle, counters and report cache
    /// cleared. Line settings and register image are kept.
    pub fn reset(&mut self) {
        self.state = CommState::Idle;
        self.exchange = None;
        self.last_error = None;
        self.stats = Statistics::default();
        self.master_rx.reset();
        self.slave_rx = SlaveReceiver::default();
        self.timeout = ReplyTimeout::default();
        self.dedup.clear();
        self.buffer.clear();
    }

    /// Copies inline write data (little-endian register image) into the
    /// scratch registers.
    pub fn stage_write_data(&mut self, data: &[u8]) {
        for (word, chunk) in self.registers.iter_mut().zip(data.chunks(2)) {
            let [_, hi] = word.to_le_bytes();
            *word = u16::from_le_bytes([chunk[0], chunk.get(1).copied().unwrap_or(hi)]);
        }
    }

    /// Stages the write data of `query`, if any, and submits it.
    pub fn execute<M: TaskTimer + ?Sized>(&mut self, query: &MasterQuery, timer: &M) -> Result<()> {
        if query.is_write() {
            self.stage_write_data(&query.write_data);
        }
        self.submit_query(query, timer)
    }

    /// Encodes and transmits `query`, then waits for its reply.
    pub fn submit_query<M: TaskTimer + ?Sized>(&mut self, query: &MasterQuery, timer: &M) -> Result<()> {
        let result = self.transmit_query(query, timer);
        if let Err(err) = result {
            warn!("query {} to slave {} rejected: {err}", query.id, query.slave_id);
            self.last_error = Some(err);
        }
        result
    }

    fn transmit_query<M: TaskTimer + ?Sized>(&mut self, query: &MasterQuery, timer: &M) -> Result<()> {
        if let Role::Slave(_) = self.config.role {
            return Err(Error::NotMaster);
        }
        if self.state != CommState::Idle {
            return Err(Error::AlreadyPolling);
        }
        if !(ADDRESS_MIN..=ADDRESS_MAX).contains(&query.slave_id) {
            return Err(Error::InvalidSlaveId(query.slave_id));
        }
        let expected_len = frame::reply_length(query.function, query.count);
        if expected_len > MAX_FRAME_SIZE {
            return Err(Error::BufferOverflow(expected_len));
        }
        frame::encode_request(query, &self.registers, &mut self.buffer)?;
        self.transmit()?;

        self.exchange = Some(Exchange {
            query: query.clone(),
            expected_len,
        });
        self.master_rx.reset();
        self.last_error = None;
        // a write echo carries nothing to wait for, the timeout still
        // catches a dead line
        self.state = if query.is_write() {
            CommState::Idle
        } else {
            CommState::WaitingReply
        };
        self.timeout.arm(timer, self.config.reply_timeout_ms);
        Ok(())
    }

    /// Appends the checksum and puts the buffer on the wire.
    fn transmit(&mut self) -> Result<()> {
        self.buffer.append_crc()?;
        debug!("tx {:02x?}", self.buffer.as_slice());
        self.transport.begin_transmit();
        let sent = self.transport.send(self.buffer.as_slice());
        if sent < self.buffer.len() {
            warn!("serial driver accepted {sent} of {} bytes", self.buffer.len());
        }
        self.stats.frames_out = self.stats.frames_out.wrapping_add(1);
        self.buffer.clear();
        Ok(())
    }

    fn count_error(&mut self) {
        self.stats.errors = self.stats.errors.wrapping_add(1);
    }

    /// Entry point of the serial driver for a burst of received bytes.
    pub fn on_receive<M: TaskTimer + ?Sized>(&mut self, bytes: &[u8], timer: &M) {
        if bytes.is_empty() || bytes.len() >= MAX_RX_BURST {
            return;
        }
        match self.config.role {
            Role::Slave(_) => bytes.iter().for_each(|byte| self.slave_rx.push(*byte)),
            Role::Master => {
                let Some(expected_len) = self.exchange.as_ref().map(|e| e.expected_len) else {
                    trace!("dropping {} unsolicited bytes", bytes.len());
                    return;
                };
                for byte in bytes {
                    if self.master_rx.ready {
                        break;
                    }
                    self.buffer.store(self.master_rx.index, *byte);
                    if self.master_rx.index < MAX_FRAME_SIZE {
                        self.master_rx.index += 1;
                    }
                    let exception = self.master_rx.index == EXCEPTION_REPLY_SIZE
                        && self.buffer.stored(FUNC) & EXCEPTION_FLAG != 0;
                    if self.master_rx.index >= expected_len || exception {
                        self.master_rx.received = self.master_rx.index;
                        self.master_rx.ready = true;
                        self.master_rx.index = 0;
                    }
                }
                if self.master_rx.ready {
                    let received = self.master_rx.received;
                    self.finish_exchange(Outcome::Received(received), timer);
                }
            }
        }
    }

    /// Entry point of the reply timeout task.
    pub fn on_reply_timeout<M: TaskTimer + ?Sized>(&mut self, timer: &M) {
        if self.timeout.expire() {
            self.finish_exchange(Outcome::TimedOut, timer);
        }
    }

    fn finish_exchange<M: TaskTimer + ?Sized>(&mut self, outcome: Outcome, timer: &M) {
        let Some(Exchange { query, .. }) = self.exchange.take() else {
            return;
        };
        self.timeout.disarm(timer);
        self.state = CommState::Idle;
        let partial = self.master_rx.index;
        self.master_rx.reset();

        let report = match outcome {
            // whatever arrived before the deadline is discarded
            Outcome::TimedOut => {
                warn!(
                    "query {} to slave {}: no reply ({partial} bytes buffered)",
                    query.id, query.slave_id
                );
                self.last_error = Some(Error::NoReply);
                self.count_error();
                StatusReport::new(&query, Status::TimedOut)
            }
            Outcome::Received(len) => {
                self.buffer.set_len(len);
                self.stats.frames_in = self.stats.frames_in.wrapping_add(1);
                debug!("rx {:02x?}", self.buffer.as_slice());
                let exception =
                    len == EXCEPTION_REPLY_SIZE && self.buffer.byte(FUNC) & EXCEPTION_FLAG != 0;
                if len < MIN_REPLY_SIZE && !exception {
                    self.reject_short_reply(&query, len)
                } else {
                    match self.process_reply(&query) {
                        Some(report) => report,
                        None => return,
                    }
                }
            }
        };
        self.uplink.send(&report);
    }

    fn reject_short_reply(&mut self, query: &MasterQuery, len: usize) -> StatusReport {
        let err = Error::BadSize(len);
        warn!("query {} to slave {}: {err}", query.id, query.slave_id);
        self.last_error = Some(err);
        self.count_error();
        StatusReport::new(query, Status::Failed(err))
    }

    /// Validates and decodes a complete reply. Decoding happens even when
    /// validation fails; the report then carries the failure status. Returns
    /// `None` when the report is suppressed as unchanged.
    fn process_reply(&mut self, query: &MasterQuery) -> Option<StatusReport> {
        let verdict = self.validate_reply();
        if let Err(err) = verdict {
            warn!("query {} to slave {}: {err}", query.id, query.slave_id);
            self.count_error();
        }
        self.last_error = verdict.err();
        let status = Status::from(self.last_error);

        let reply = self.buffer.as_slice();
        let Ok(function) = FunctionCode::try_from(reply[FUNC] & !EXCEPTION_FLAG) else {
            return Some(StatusReport::new(query, status));
        };
        match function {
            FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
                frame::decode_bits(reply, &mut self.registers)
            }
            FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
                frame::decode_words(reply, &mut self.registers)
            }
            _ => frame::decode_write_echo(reply, &mut self.registers),
        }

        let len = frame::report_length(function, query.count);
        let report = StatusReport::new(query, status).with_registers(&self.registers, len);
        let filtered =
            !function.is_write() && !self.config.continuous_reporting && !query.is_one_shot();
        if filtered && !self.dedup.should_report(query.id, &report.payload) {
            trace!("query {} unchanged, report suppressed", query.id);
            return None;
        }
        Some(report)
    }

    /// The first failure found wins: checksum, exception flag, function.
    fn validate_reply(&self) -> Result<()> {
        let reply = self.buffer.as_slice();
        crc::verify(reply).map_err(|(expected, received)| Error::BadCrc { expected, received })?;
        let function = reply[FUNC];
        if function & EXCEPTION_FLAG != 0 {
            return Err(Error::Exception {
                function: function & !EXCEPTION_FLAG,
                code: reply[2],
            });
        }
        FunctionCode::try_from(function)?;
        Ok(())
    }

    /// Answers a pending slave request. Returns `None` when no request is
    /// pending or it is addressed to another station.
    pub fn process_slave_frame(&mut self) -> Option<Result<()>> {
        let Role::Slave(station) = self.config.role else {
            return None;
        };
        let request = self.slave_rx.take()?;
        self.stats.frames_in = self.stats.frames_in.wrapping_add(1);
        self.buffer.load(&request);
        debug!("rx {:02x?}", self.buffer.as_slice());
        if request[ID] != station.get() {
            trace!("ignoring request for station {}", request[ID]);
            return None;
        }
        let result = self.answer_request();
        self.last_error = result.err();
        Some(result)
    }

    fn answer_request(&mut self) -> Result<()> {
        if let Err((expected, received)) = crc::verify(self.buffer.as_slice()) {
            // cannot trust which station the request was for
            debug!("dropping request, CRC {received:#06x} expected {expected:#06x}");
            self.count_error();
            return Err(Error::NoReply);
        }
        let function = match frame::validate_request(&self.buffer, self.register_count()) {
            Ok(function) => function,
            Err(err) => {
                warn!("rejecting request: {err}");
                self.count_error();
                if let Some(exception) = err.exception() {
                    frame::build_exception(&mut self.buffer, exception);
                    self.transmit()?;
                }
                return Err(err);
            }
        };
        let count = self.register_count();
        frame::respond(function, &mut self.buffer, &mut self.registers[..count])?;
        self.transmit()
    }
}

impl<T: SerialTransport, U: Uplink> QueryExecutor for Mutex<Handler<T, U>> {
    fn execute<M: TaskTimer + ?Sized>(&self, query: &MasterQuery, timer: &M) -> Result<()> {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .execute(query, timer)
    }
}
