//! rtupoll CLI
//!
//! A command-line front end of the `rtu_poller_lib` engine on a local
//! RS-485 serial port.
//!
//! This tool allows users to:
//! - Run the periodic query scheduler and print every status report.
//! - Send a single query and print its report.
//! - List, remove and clear the persisted queries.
//! - Act as a Modbus RTU slave answering from a local register image.
//!
//! Persistent settings (queries, line settings, reporting settings) live in a
//! binary image file with the same layout the firmware uses.

use anyhow::{Context, Result, bail};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use rtu_poller_lib::{
    handler::{Handler, HandlerConfig, REGISTER_IMAGE_SIZE, Role},
    host::{DelayedTasks, Poller, SerialLink, SystemClock},
    protocol as proto,
    report::{StatusReport, Uplink},
    scheduler::QueryScheduler,
    settings::{MemoryStorage, ReportingRecord, Storage, UartRecord},
};
use std::sync::PoisonError;
use std::time::{Duration, Instant};
use std::panic;

mod commandline;
mod config;
mod file_storage;

use file_storage::FileStorage;

/// Query id used for ad-hoc reads; never persisted.
const ADHOC_QUERY_ID: u8 = 0xFE;
const IDLE_WAIT: Duration = Duration::from_millis(100);

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0));

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            std::thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    log_handle
}

/// Prints every status report to stdout.
#[derive(Default)]
struct ConsoleUplink {
    reports: usize,
}

impl Uplink for ConsoleUplink {
    fn send(&mut self, report: &StatusReport) {
        println!("{report}");
        self.reports += 1;
    }
}

struct Settings {
    uart: UartRecord,
    reporting: ReportingRecord,
}

fn millis(duration: Duration, what: &str) -> Result<u16> {
    u16::try_from(duration.as_millis()).with_context(|| format!("{what} of {duration:?} is too long"))
}

/// Loads the persisted line and reporting settings, applies the overrides of
/// the command line and the configuration file and persists the result.
fn load_settings(
    storage: &mut impl Storage,
    args: &commandline::CliArgs,
    config: &config::Config,
) -> Result<Settings> {
    let stored_uart = UartRecord::load(storage).context("Cannot load line settings")?;
    let mut uart = stored_uart;
    let configured_baud = config
        .serial
        .baud_rate
        .map(proto::BaudRate::try_from)
        .transpose()
        .context("Invalid baud rate in config file")?;
    if let Some(baud_rate) = args.baud_rate.or(configured_baud) {
        uart.baud_index = baud_rate.index();
    }
    if let Some(parity) = config.serial.parity {
        uart.parity_index = parity as u8;
    }
    if uart != stored_uart {
        uart.store(storage).context("Cannot store line settings")?;
    }

    let stored_reporting = ReportingRecord::load(storage).context("Cannot load reporting settings")?;
    let mut reporting = stored_reporting;
    if let Some(timeout) = args.timeout.or(config.reporting.reply_timeout) {
        reporting.reply_timeout_ms = millis(timeout, "Reply timeout")?;
    }
    if let Some(delay) = config.reporting.inter_query_delay {
        reporting.inter_query_delay_ms = millis(delay, "Inter-query delay")?;
    }
    if let Some(continuous) = config.reporting.continuous {
        reporting.continuous = continuous;
    }
    if reporting != stored_reporting {
        reporting.store(storage).context("Cannot store reporting settings")?;
    }
    Ok(Settings { uart, reporting })
}

/// Opens the serial port and builds a handler for `role` on it.
fn connect(
    args: &commandline::CliArgs,
    config: &config::Config,
    role: Role,
    settings: &Settings,
) -> Result<(Handler<SerialLink, ConsoleUplink>, Box<dyn tokio_serial::SerialPort>)> {
    let device = args.device.as_deref().unwrap_or(&config.serial.device);
    let baud_rate = proto::BaudRate::from_index(settings.uart.baud_index).unwrap_or_default();
    let parity = proto::Parity::from_index(settings.uart.parity_index).unwrap_or_default();
    info!("Opening {device} at {baud_rate} baud, parity {parity:?}");
    let (mut link, reader) = SerialLink::open(device, baud_rate, parity)
        .with_context(|| format!("Cannot open serial port {device}"))?;
    link.set_settle_time(config.serial.settle_time);

    let handler_config = HandlerConfig {
        role,
        register_count: REGISTER_IMAGE_SIZE,
        reply_timeout_ms: settings.reporting.reply_timeout_ms.into(),
        continuous_reporting: settings.reporting.continuous,
    };
    let mut handler = Handler::new(handler_config, link, ConsoleUplink::default());
    if !handler.apply_line_settings(settings.uart.baud_index, settings.uart.parity_index) {
        warn!("Serial driver rejected the line settings, keeping the port defaults");
    }
    Ok((handler, reader))
}

fn log_statistics<S: Storage>(poller: &Poller<SerialLink, ConsoleUplink, S>) {
    let handler = poller.handler.lock().unwrap_or_else(PoisonError::into_inner);
    let stats = handler.statistics();
    info!(
        "Frames in: {}, frames out: {}, errors: {}, reports: {}",
        stats.frames_in,
        stats.frames_out,
        stats.errors,
        handler.uplink().reports
    );
}

fn until(duration: Option<Duration>) -> impl Fn() -> bool {
    let deadline = duration.map(|duration| Instant::now() + duration);
    move || deadline.is_some_and(|at| Instant::now() >= at)
}

fn run_poll(args: &commandline::CliArgs, config: &config::Config, duration: Option<Duration>) -> Result<()> {
    let mut storage = FileStorage::open(&config.storage)?;
    let settings = load_settings(&mut storage, args, config)?;
    let (handler, reader) = connect(args, config, Role::Master, &settings)?;

    let scheduler = QueryScheduler::new(storage);
    scheduler.set_inter_query_delay_ms(settings.reporting.inter_query_delay_ms.into());
    let mut poller = Poller::new(handler, scheduler, reader);
    let restored = poller
        .scheduler
        .init(&poller.clock, &poller.timer)
        .context("Cannot restore persisted queries")?;
    info!("Restored {restored} persisted queries");

    for query_config in &config.queries {
        let query = query_config.to_query()?;
        let id = query.id;
        poller
            .scheduler
            .add_task(query, &poller.clock, &poller.timer)
            .with_context(|| format!("Cannot schedule query {id}"))?;
    }
    if poller.scheduler.active_tasks() == 0 {
        bail!("No queries to poll. Add some to the configuration file.");
    }

    info!("Polling {} queries", poller.scheduler.active_tasks());
    let stop = until(duration);
    poller
        .run_until(|_| stop(), IDLE_WAIT)
        .context("Serial port failure")?;
    log_statistics(&poller);
    Ok(())
}

fn run_read(
    args: &commandline::CliArgs,
    config: &config::Config,
    query: proto::MasterQuery,
) -> Result<()> {
    let mut storage = FileStorage::open(&config.storage)?;
    let settings = load_settings(&mut storage, args, config)?;
    let (handler, reader) = connect(args, config, Role::Master, &settings)?;

    let mut poller = Poller::new(handler, QueryScheduler::new(MemoryStorage::new()), reader);
    poller.scheduler.init(&poller.clock, &poller.timer)?;
    poller
        .scheduler
        .add_task(query, &poller.clock, &poller.timer)
        .context("Cannot schedule query")?;
    poller
        .run_until(
            |poller| {
                poller
                    .handler
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .uplink()
                    .reports
                    > 0
            },
            IDLE_WAIT,
        )
        .context("Serial port failure")?;
    log_statistics(&poller);
    Ok(())
}

fn run_slave(
    args: &commandline::CliArgs,
    config: &config::Config,
    address: proto::StationId,
    duration: Option<Duration>,
) -> Result<()> {
    let mut storage = FileStorage::open(&config.storage)?;
    let settings = load_settings(&mut storage, args, config)?;
    let (handler, reader) = connect(args, config, Role::Slave(address), &settings)?;

    let mut poller = Poller::new(handler, QueryScheduler::new(MemoryStorage::new()), reader);
    info!("Answering as station {address}");
    let stop = until(duration);
    poller
        .run_until(|_| stop(), IDLE_WAIT)
        .context("Serial port failure")?;
    log_statistics(&poller);
    Ok(())
}

/// Opens the persisted query table without touching the serial port.
fn open_table(config: &config::Config) -> Result<(QueryScheduler<FileStorage>, SystemClock, DelayedTasks)> {
    let scheduler = QueryScheduler::new(FileStorage::open(&config.storage)?);
    let (clock, timer) = (SystemClock::new(), DelayedTasks::new());
    scheduler
        .init(&clock, &timer)
        .context("Cannot read persisted queries")?;
    Ok((scheduler, clock, timer))
}

fn print_queries(config: &config::Config) -> Result<()> {
    let (scheduler, _, _) = open_table(config)?;
    let ids = scheduler.stored_ids();
    if ids.is_empty() {
        println!("No persisted queries.");
        return Ok(());
    }
    for id in ids {
        let Some(query) = scheduler.stored_query(id)? else {
            continue;
        };
        println!(
            "query {id}: slave {} {:?} address {:#06x} count {} every {}s{}",
            query.slave_id,
            query.function,
            query.address,
            query.count,
            query.interval,
            if query.is_write() {
                format!(" data {:02x?}", query.write_data.as_slice())
            } else {
                String::new()
            }
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());
    info!("rtupoll started. Log level: {}", args.verbose.log_level_filter());

    let config = config::get_config(args.config.as_deref())?;
    trace!("Config: {config:?}");

    match &args.command {
        commandline::CliCommands::Poll { duration } => run_poll(&args, &config, *duration),
        commandline::CliCommands::Read {
            slave,
            function,
            address,
            count,
            data,
        } => {
            let query = proto::MasterQuery::new(
                proto::QueryId::try_from(ADHOC_QUERY_ID)?,
                slave.get(),
                *function,
                *address,
                *count,
            )
            .one_shot()
            .with_write_data(data)
            .context("Invalid write data")?;
            run_read(&args, &config, query)
        }
        commandline::CliCommands::List => print_queries(&config),
        commandline::CliCommands::Remove { id } => {
            let (scheduler, _, timer) = open_table(&config)?;
            scheduler
                .cancel_task(*id, &timer)
                .with_context(|| format!("Cannot remove query {id}"))?;
            println!("Query {id} removed.");
            Ok(())
        }
        commandline::CliCommands::Clear => {
            let (scheduler, _, timer) = open_table(&config)?;
            scheduler
                .remove_all(&timer)
                .context("Cannot remove persisted queries")?;
            println!("All persisted queries removed.");
            Ok(())
        }
        commandline::CliCommands::Slave { address, duration } => {
            run_slave(&args, &config, *address, *duration)
        }
    }
}
