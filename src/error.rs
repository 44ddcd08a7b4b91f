//! Error types shared by the protocol engine, the query scheduler and the
//! persistence layer.
//!
//! Every fallible operation returns one of these synchronously; nothing in
//! the crate panics or restarts on a protocol failure. The numeric codes
//! returned by [`Error::code`] are the ones carried in upstream status
//! reports.
use crate::protocol::{Exception, QueryId};

/// Protocol-level failures of the master and slave paths.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A master query was submitted to a handler configured as a slave.
    #[error("handler is configured as a slave and cannot issue queries")]
    NotMaster,

    /// A master query is already waiting for its reply.
    #[error("a master query is already outstanding")]
    AlreadyPolling,

    /// The request or its expected reply does not fit the comms buffer.
    #[error("frame of {0} bytes exceeds the comms buffer")]
    BufferOverflow(usize),

    /// The received checksum does not match the computed one.
    #[error("CRC mismatch: expected {expected:#06x}, received {received:#06x}")]
    BadCrc { expected: u16, received: u16 },

    /// The responder answered with an exception frame.
    #[error("responder raised exception {code:#04x} for function {function:#04x}")]
    Exception { function: u8, code: u8 },

    /// Function code outside the supported set.
    #[error("function code {0:#04x} is not supported")]
    IllegalFunction(u8),

    /// Register span reaches beyond the configured register image.
    #[error("register span {span} exceeds register image of {size}")]
    IllegalDataAddress { span: u32, size: usize },

    /// Quantity is zero or the declared payload does not fit the frame.
    #[error("request quantity or payload is invalid")]
    IllegalDataValue,

    /// The reply is shorter than the smallest valid reply.
    #[error("reply of {0} bytes is too short")]
    BadSize(usize),

    /// Nothing (trustworthy) was received.
    #[error("no reply")]
    NoReply,

    /// Target station outside 1..=247.
    #[error("invalid slave id {0}, expected 1..=247")]
    InvalidSlaveId(u8),

    /// The query identifier 0xFF marks an empty slot and cannot be used.
    #[error("query id {0:#04x} is reserved")]
    InvalidQueryId(u8),

    /// Inline write data longer than the query can carry.
    #[error("write data of {0} bytes exceeds the inline buffer")]
    WriteDataTooLong(usize),

    /// Baud rate not in the supported table.
    #[error("unsupported baud rate {0}")]
    UnsupportedBaudRate(u32),
}

impl Error {
    /// Numeric status code of this error.
    pub fn code(&self) -> i8 {
        match self {
            Error::NotMaster => -1,
            Error::AlreadyPolling => -2,
            Error::BufferOverflow(_) => -3,
            Error::BadCrc { .. } => -4,
            Error::Exception { .. } => -5,
            Error::BadSize(_) => -6,
            Error::IllegalDataAddress { .. } => -7,
            Error::InvalidSlaveId(_) => -9,
            Error::IllegalFunction(_) => Exception::IllegalFunction as i8,
            Error::IllegalDataValue => Exception::IllegalDataValue as i8,
            Error::NoReply => 15,
            Error::InvalidQueryId(_) => -10,
            Error::WriteDataTooLong(_) => -11,
            Error::UnsupportedBaudRate(_) => -12,
        }
    }

    /// The exception a slave answers with for this validation failure, if any.
    pub fn exception(&self) -> Option<Exception> {
        match self {
            Error::IllegalFunction(_) => Some(Exception::IllegalFunction),
            Error::IllegalDataAddress { .. } => Some(Exception::IllegalDataAddress),
            Error::IllegalDataValue => Some(Exception::IllegalDataValue),
            _ => None,
        }
    }
}

/// The result type for protocol operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by the persistence collaborator.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage read of {len} bytes at offset {offset} failed")]
    Read { offset: usize, len: usize },

    #[error("storage write of {len} bytes at offset {offset} failed")]
    Write { offset: usize, len: usize },

    /// All persistent query slots are in use.
    #[error("no free persistent query slot")]
    Full,

    /// A query record keeps the element count in a single byte.
    #[error("element count {0} does not fit a query record")]
    CountTooLarge(u16),
}

/// Failures of the query table.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("query table is full")]
    NoMoreTasks,

    #[error("no task with query id {0}")]
    UnknownTask(QueryId),

    #[error("query scheduler used before initialization")]
    Uninitialized,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SchedulerError {
    /// Numeric result code of the scheduler API.
    pub fn code(&self) -> u8 {
        match self {
            SchedulerError::NoMoreTasks => 1,
            SchedulerError::UnknownTask(_) => 2,
            SchedulerError::Uninitialized => 3,
            SchedulerError::Storage(_) => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(Error::NotMaster.code(), -1);
        assert_eq!(Error::AlreadyPolling.code(), -2);
        assert_eq!(
            Error::BadCrc {
                expected: 0,
                received: 1
            }
            .code(),
            -4
        );
        assert_eq!(Error::BadSize(3).code(), -6);
        assert_eq!(Error::InvalidSlaveId(0).code(), -9);
        assert_eq!(Error::IllegalFunction(0x07).code(), 1);
        assert_eq!(Error::NoReply.code(), 15);
        assert_eq!(Error::InvalidQueryId(0xFF).code(), -10);
        assert_eq!(Error::WriteDataTooLong(9).code(), -11);
        assert_eq!(Error::UnsupportedBaudRate(4800).code(), -12);
    }

    #[test]
    fn slave_exceptions() {
        assert_eq!(
            Error::IllegalFunction(0x2B).exception(),
            Some(Exception::IllegalFunction)
        );
        assert_eq!(
            Error::IllegalDataAddress { span: 9, size: 8 }.exception(),
            Some(Exception::IllegalDataAddress)
        );
        assert_eq!(Error::NoReply.exception(), None);
        assert_eq!(SchedulerError::NoMoreTasks.code(), 1);
        assert_eq!(SchedulerError::Uninitialized.code(), 3);
    }
}
