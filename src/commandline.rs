use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use rtu_poller_lib::protocol as proto;
use std::path::PathBuf;
use std::time::Duration;

fn parse_station(s: &str) -> Result<proto::StationId, String> {
    let value = clap_num::maybe_hex::<u8>(s).map_err(|e| format!("Invalid station address format: {e}"))?;
    proto::StationId::try_from(value).map_err(|e| e.to_string())
}

fn parse_query_id(s: &str) -> Result<proto::QueryId, String> {
    let value = clap_num::maybe_hex::<u8>(s).map_err(|e| format!("Invalid query id format: {e}"))?;
    proto::QueryId::try_from(value).map_err(|e| e.to_string())
}

fn parse_function(s: &str) -> Result<proto::FunctionCode, String> {
    let value = clap_num::maybe_hex::<u8>(s).map_err(|e| format!("Invalid function code format: {e}"))?;
    proto::FunctionCode::try_from(value).map_err(|e| e.to_string())
}

fn parse_baud_rate(s: &str) -> Result<proto::BaudRate, String> {
    let value = s
        .parse::<u32>()
        .map_err(|e| format!("Invalid baud rate number format: {e}"))?;
    proto::BaudRate::try_from(value).map_err(|e| e.to_string())
}

fn parse_word(s: &str) -> Result<u16, String> {
    clap_num::maybe_hex::<u16>(s)
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Run the query scheduler: restore the persisted queries, add the ones
    /// from the configuration file and print every status report.
    #[clap(verbatim_doc_comment)]
    Poll {
        /// Stop after this long (e.g., "30s", "5m"). Runs forever if omitted.
        #[arg(long, value_parser = humantime::parse_duration)]
        duration: Option<Duration>,
    },

    /// Send one query and print its status report.
    Read {
        /// Target slave address (1 to 247), decimal or hexadecimal.
        #[arg(value_parser = parse_station)]
        slave: proto::StationId,
        /// Function code, e.g. "3" or "0x03".
        #[arg(value_parser = parse_function)]
        function: proto::FunctionCode,
        /// First register or coil address.
        #[arg(value_parser = parse_word)]
        address: u16,
        /// Number of registers or coils.
        #[arg(value_parser = parse_word, default_value = "1")]
        count: u16,
        /// Little-endian register image written by write functions, hex bytes.
        #[arg(long, value_parser = clap_num::maybe_hex::<u8>, num_args = 1..=8, value_delimiter = ',')]
        data: Vec<u8>,
    },

    /// List the persisted queries.
    List,

    /// Remove one persisted query.
    Remove {
        #[arg(value_parser = parse_query_id)]
        id: proto::QueryId,
    },

    /// Remove all persisted queries.
    Clear,

    /// Answer requests of a master on the bus from a local register image.
    Slave {
        /// Own station address (1 to 247).
        #[arg(value_parser = parse_station)]
        address: proto::StationId,
        /// Stop after this long. Runs forever if omitted.
        #[arg(long, value_parser = humantime::parse_duration)]
        duration: Option<Duration>,
    },
}

const fn about_text() -> &'static str {
    "rtupoll - Poll Modbus RTU slaves on a schedule, or act as a slave."
}

#[derive(Parser, Debug)]
#[command(name = "rtupoll", author, version, about = about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is warnings.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    /// YAML configuration file. Defaults to "rtupoll.yml" when present.
    #[arg(global = true, short, long)]
    pub config: Option<PathBuf>,

    /// Serial port device name, overrides the configuration file.
    /// Examples: "/dev/ttyUSB0" (Linux), "COM3" (Windows).
    #[arg(global = true, short, long, verbatim_doc_comment)]
    pub device: Option<String>,

    /// Baud rate, overrides the persisted line settings.
    /// Supported values: 9600, 19200, 38400, 57600, 115200.
    #[arg(global = true, long, value_parser = parse_baud_rate, verbatim_doc_comment)]
    pub baud_rate: Option<proto::BaudRate>,

    /// Reply timeout, overrides the persisted setting.
    /// Examples: "1s", "500ms".
    #[arg(global = true, long, value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub timeout: Option<Duration>,

    #[command(subcommand)]
    pub command: CliCommands,
}
