use crate::Error;
use heapless::Vec;

/// Capacity of the shared transmit/receive comms buffer.
pub const MAX_FRAME_SIZE: usize = 64;
/// Size of every request a slave accepts.
pub const SLAVE_FRAME_SIZE: usize = 8;
/// Smallest reply a master accepts (id, function, 2 data bytes, CRC).
pub const MIN_REPLY_SIZE: usize = 6;
/// Size of an exception reply without checksum.
pub const EXCEPTION_SIZE: usize = 3;
pub const CHECKSUM_SIZE: usize = 2;
/// Bytes of inline write data a query carries.
pub const MAX_WRITE_DATA: usize = 8;

pub const EXCEPTION_FLAG: u8 = 0x80;
pub const COIL_ON: u16 = 0xFF00;

pub const ADDRESS_MIN: u8 = 1;
pub const ADDRESS_MAX: u8 = 247;
/// Query id marking an empty slot in storage.
pub const QUERY_ID_EMPTY: u8 = 0xFF;

// Byte positions of the request header.
pub(crate) const ID: usize = 0;
pub(crate) const FUNC: usize = 1;
pub(crate) const ADD_HI: usize = 2;
pub(crate) const NB_HI: usize = 4;
pub(crate) const BYTE_CNT: usize = 6;

/// The supported Modbus function codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum FunctionCode {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleCoils = 0x0F,
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self,
            FunctionCode::WriteSingleCoil
                | FunctionCode::WriteSingleRegister
                | FunctionCode::WriteMultipleCoils
                | FunctionCode::WriteMultipleRegisters
        )
    }

    /// True for functions addressing single bits (coils and discrete inputs).
    pub fn is_bit_access(&self) -> bool {
        matches!(
            self,
            FunctionCode::ReadCoils
                | FunctionCode::ReadDiscreteInputs
                | FunctionCode::WriteSingleCoil
                | FunctionCode::WriteMultipleCoils
        )
    }
}

impl TryFrom<u8> for FunctionCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FunctionCode::ReadCoils),
            0x02 => Ok(FunctionCode::ReadDiscreteInputs),
            0x03 => Ok(FunctionCode::ReadHoldingRegisters),
            0x04 => Ok(FunctionCode::ReadInputRegisters),
            0x05 => Ok(FunctionCode::WriteSingleCoil),
            0x06 => Ok(FunctionCode::WriteSingleRegister),
            0x0F => Ok(FunctionCode::WriteMultipleCoils),
            0x10 => Ok(FunctionCode::WriteMultipleRegisters),
            other => Err(Error::IllegalFunction(other)),
        }
    }
}

/// Exception codes a slave answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Exception {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
}

/// A validated slave station address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StationId(u8);

impl StationId {
    pub fn get(&self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for StationId {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if (ADDRESS_MIN..=ADDRESS_MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(Error::InvalidSlaveId(value))
        }
    }
}

impl std::fmt::Display for StationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// Identifier of a master query, unique within the query table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct QueryId(u8);

impl QueryId {
    pub fn get(&self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for QueryId {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if value == QUERY_ID_EMPTY {
            Err(Error::InvalidQueryId(value))
        } else {
            Ok(Self(value))
        }
    }
}

impl std::fmt::Display for QueryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum BaudRate {
    #[default]
    B9600 = 0,
    B19200 = 1,
    B38400 = 2,
    B57600 = 3,
    B115200 = 4,
}

impl BaudRate {
    /// Maps a persisted baud index, `None` for unknown indices.
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(BaudRate::B9600),
            1 => Some(BaudRate::B19200),
            2 => Some(BaudRate::B38400),
            3 => Some(BaudRate::B57600),
            4 => Some(BaudRate::B115200),
            _ => None,
        }
    }

    pub fn index(&self) -> u8 {
        *self as u8
    }
}

impl From<BaudRate> for u32 {
    fn from(baud_rate: BaudRate) -> u32 {
        match baud_rate {
            BaudRate::B9600 => 9600,
            BaudRate::B19200 => 19200,
            BaudRate::B38400 => 38400,
            BaudRate::B57600 => 57600,
            BaudRate::B115200 => 115200,
        }
    }
}

impl TryFrom<u32> for BaudRate {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            9600 => Ok(BaudRate::B9600),
            19200 => Ok(BaudRate::B19200),
            38400 => Ok(BaudRate::B38400),
            57600 => Ok(BaudRate::B57600),
            115200 => Ok(BaudRate::B115200),
            other => Err(Error::UnsupportedBaudRate(other)),
        }
    }
}

impl std::fmt::Display for BaudRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u32::from(*self))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
#[repr(u8)]
pub enum Parity {
    #[default]
    None = 0,
    Odd = 1,
    Even = 2,
}

impl Parity {
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Parity::None),
            1 => Some(Parity::Odd),
            2 => Some(Parity::Even),
            _ => None,
        }
    }
}

/// Device description echoed in every status report of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceDetail {
    pub device_id: u8,
    pub status: i8,
    pub attribute_id: u16,
}

/// A request the master issues periodically or once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterQuery {
    pub id: QueryId,
    pub slave_id: u8,
    pub device: DeviceDetail,
    pub function: FunctionCode,
    pub address: u16,
    pub count: u16,
    /// Polling period in seconds, 0 runs the query once.
    pub interval: u16,
    pub one_shot: bool,
    /// Little-endian register image written by write functions.
    pub write_data: Vec<u8, MAX_WRITE_DATA>,
}

impl MasterQuery {
    pub fn new(id: QueryId, slave_id: u8, function: FunctionCode, address: u16, count: u16) -> Self {
        Self {
            id,
            slave_id,
            device: DeviceDetail::default(),
            function,
            address,
            count,
            interval: 0,
            one_shot: false,
            write_data: Vec::new(),
        }
    }

    pub fn with_device(mut self, device: DeviceDetail) -> Self {
        self.device = device;
        self
    }

    pub fn with_interval(mut self, seconds: u16) -> Self {
        self.interval = seconds;
        self
    }

    pub fn one_shot(mut self) -> Self {
        self.one_shot = true;
        self
    }

    pub fn with_write_data(mut self, data: &[u8]) -> std::result::Result<Self, Error> {
        self.write_data =
            Vec::from_slice(data).map_err(|_| Error::WriteDataTooLong(data.len()))?;
        Ok(self)
    }

    pub fn is_write(&self) -> bool {
        self.function.is_write()
    }

    /// One-shot queries and queries without interval run exactly once.
    pub fn is_one_shot(&self) -> bool {
        self.one_shot || self.interval == 0
    }

    pub fn interval_ms(&self) -> u32 {
        self.interval as u32 * 1000
    }
}
