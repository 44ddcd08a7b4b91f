//! A Modbus RTU engine for serial gateways.
//!
//! The crate has two halves:
//!
//! 1.  **The protocol engine** ([`handler::Handler`]): a master/slave state
//!     machine over one half-duplex serial line. As master it sends one query
//!     at a time, validates and decodes the reply into a register image and
//!     forwards a [`report::StatusReport`] upstream. As slave it answers
//!     read and write requests from the same image.
//!
//! 2.  **The query scheduler** ([`scheduler::QueryScheduler`]): a fixed table
//!     of periodic and one-shot queries, persisted through
//!     [`settings::Storage`], executed in earliest-due order.
//!
//! The core does not allocate and never blocks. Time, timers, the serial
//! line, persistence and the upstream link are collaborators described in
//! [`platform`], [`settings`] and [`report`]. With the `host` feature,
//! [`host`] provides implementations on top of `std` and `tokio-serial`.
//!
//! ## Quick Start
//!
//! ```no_run
//! use rtu_poller_lib::{
//!     handler::{Handler, HandlerConfig},
//!     host::{Poller, SerialLink},
//!     protocol::{BaudRate, FunctionCode, MasterQuery, Parity, QueryId},
//!     report::{StatusReport, Uplink},
//!     scheduler::QueryScheduler,
//!     settings::MemoryStorage,
//! };
//!
//! struct Print;
//! impl Uplink for Print {
//!     fn send(&mut self, report: &StatusReport) {
//!         println!("{report}");
//!     }
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (link, reader) = SerialLink::open("/dev/ttyUSB0", BaudRate::B9600, Parity::None)?;
//!     let handler = Handler::new(HandlerConfig::default(), link, Print);
//!     let scheduler = QueryScheduler::new(MemoryStorage::new());
//!     let mut poller = Poller::new(handler, scheduler, reader);
//!     poller.scheduler.init(&poller.clock, &poller.timer)?;
//!
//!     let query = MasterQuery::new(QueryId::try_from(1)?, 17, FunctionCode::ReadHoldingRegisters, 0, 4)
//!         .with_interval(10);
//!     poller.scheduler.add_task(query, &poller.clock, &poller.timer)?;
//!     poller.run_until(|_| false, std::time::Duration::from_secs(1))?;
//!     Ok(())
//! }
//! ```

pub mod crc;
pub mod dedup;
pub mod error;
pub mod frame;
pub mod handler;
pub mod platform;
pub mod protocol;
pub mod report;
pub mod scheduler;
pub mod settings;
pub mod timeout;
pub mod timestamp;

#[cfg_attr(docsrs, doc(cfg(feature = "host")))]
#[cfg(feature = "host")]
pub mod host;

pub use error::{Error, SchedulerError, StorageError};
