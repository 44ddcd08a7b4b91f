//! Status records sent upstream after every master exchange.
//!
//! Wire layout (packed, little-endian):
//!
//! | offset | field |
//! |---|---|
//! | 0 | slave id |
//! | 1 | device id |
//! | 2 | status (i8) |
//! | 3..5 | attribute id |
//! | 5 | payload byte count |
//! | 6.. | payload, up to 58 bytes |
use heapless::Vec;

use crate::error::Error;
use crate::protocol::{DeviceDetail, MasterQuery};

pub const MAX_REPORT_PAYLOAD: usize = 58;
pub const REPORT_HEADER_SIZE: usize = 6;
pub const MAX_REPORT_SIZE: usize = REPORT_HEADER_SIZE + MAX_REPORT_PAYLOAD;

/// Outcome of an exchange as carried in the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    TimedOut,
    Failed(Error),
}

impl Status {
    pub fn code(&self) -> i8 {
        match self {
            Status::Ok => 0,
            Status::TimedOut => -8,
            Status::Failed(err) => err.code(),
        }
    }
}

impl From<Option<Error>> for Status {
    fn from(error: Option<Error>) -> Self {
        error.map_or(Status::Ok, Status::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub slave_id: u8,
    /// Device detail of the query, its status replaced by the outcome.
    pub device: DeviceDetail,
    pub payload: Vec<u8, MAX_REPORT_PAYLOAD>,
}

impl StatusReport {
    pub fn new(query: &MasterQuery, status: Status) -> Self {
        Self {
            slave_id: query.slave_id,
            device: DeviceDetail {
                status: status.code(),
                ..query.device
            },
            payload: Vec::new(),
        }
    }

    /// Attaches the first `len` bytes of the little-endian register image.
    pub fn with_registers(mut self, registers: &[u16], len: usize) -> Self {
        self.payload.clear();
        let bytes = registers.iter().flat_map(|word| word.to_le_bytes());
        for byte in bytes.take(len.min(MAX_REPORT_PAYLOAD)) {
            // capacity is checked by the take above
            let _ = self.payload.push(byte);
        }
        self
    }

    pub fn status(&self) -> i8 {
        self.device.status
    }

    pub fn encode(&self) -> Vec<u8, MAX_REPORT_SIZE> {
        let mut out = Vec::new();
        let [attr_lo, attr_hi] = self.device.attribute_id.to_le_bytes();
        let header = [
            self.slave_id,
            self.device.device_id,
            self.device.status as u8,
            attr_lo,
            attr_hi,
            self.payload.len() as u8,
        ];
        // header plus a bounded payload always fits
        let _ = out.extend_from_slice(&header);
        let _ = out.extend_from_slice(&self.payload);
        out
    }
}

impl std::fmt::Display for StatusReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "slave {} device {} attribute {:#06x} status {}:",
            self.slave_id, self.device.device_id, self.device.attribute_id, self.device.status
        )?;
        for byte in &self.payload {
            write!(f, " {byte:02x}")?;
        }
        Ok(())
    }
}

/// Upstream sink of status records.
pub trait Uplink {
    fn send(&mut self, report: &StatusReport);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FunctionCode, QueryId};

    fn query() -> MasterQuery {
        MasterQuery::new(QueryId::try_from(9).unwrap(), 5, FunctionCode::ReadHoldingRegisters, 0, 2)
            .with_device(DeviceDetail {
                device_id: 3,
                status: 0,
                attribute_id: 0x1234,
            })
    }

    #[test]
    fn timeout_record_is_header_only() {
        let report = StatusReport::new(&query(), Status::TimedOut);
        assert_eq!(report.status(), -8);
        assert_eq!(report.encode().as_slice(), &[5, 3, 0xF8, 0x34, 0x12, 0]);
    }

    #[test]
    fn payload_is_little_endian_image() {
        let report = StatusReport::new(&query(), Status::Ok).with_registers(&[0x0102, 0x0304], 3);
        assert_eq!(report.payload.as_slice(), &[0x02, 0x01, 0x04]);
        assert_eq!(
            report.encode().as_slice(),
            &[5, 3, 0, 0x34, 0x12, 3, 0x02, 0x01, 0x04]
        );
    }

    #[test]
    fn payload_is_capped() {
        let report = StatusReport::new(&query(), Status::Ok).with_registers(&[0xFFFF; 56], 112);
        assert_eq!(report.payload.len(), MAX_REPORT_PAYLOAD);
        assert_eq!(report.encode().len(), MAX_REPORT_SIZE);
    }

    #[test]
    fn failure_status_codes() {
        let bad_crc = Status::Failed(Error::BadCrc {
            expected: 1,
            received: 2,
        });
        assert_eq!(StatusReport::new(&query(), bad_crc).status(), -4);
        assert_eq!(Status::from(None), Status::Ok);
        assert_eq!(Status::from(Some(Error::BadSize(4))).code(), -6);
    }
}
