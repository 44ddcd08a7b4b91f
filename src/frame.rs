//! Frame codec: encodes master requests, decodes replies into the register
//! image, and builds slave responses in the shared comms buffer.
//!
//! Coils are bit offsets into the 16-bit register image: coil `n` lives in
//! `registers[n / 16]` at bit `n % 16`. On the wire the first coil of a
//! request is bit 0 of the first data byte.
use crate::crc;
use crate::error::{Error, Result};
use crate::protocol::{
    Exception, FunctionCode, MasterQuery, ADD_HI, BYTE_CNT, CHECKSUM_SIZE, COIL_ON,
    EXCEPTION_FLAG, EXCEPTION_SIZE, FUNC, ID, MAX_FRAME_SIZE, NB_HI,
};

/// Fixed-capacity buffer shared by transmit and receive.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    bytes: [u8; MAX_FRAME_SIZE],
    len: usize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffer {
    pub const fn new() -> Self {
        Self {
            bytes: [0; MAX_FRAME_SIZE],
            len: 0,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Replaces the content with `data`, truncated to the buffer capacity.
    pub fn load(&mut self, data: &[u8]) {
        let len = data.len().min(MAX_FRAME_SIZE);
        self.bytes[..len].copy_from_slice(&data[..len]);
        self.len = len;
    }

    pub(crate) fn put(&mut self, byte: u8) -> Result<()> {
        if self.len >= MAX_FRAME_SIZE {
            return Err(Error::BufferOverflow(self.len + 1));
        }
        self.bytes[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    fn put_word(&mut self, word: u16) -> Result<()> {
        let [hi, lo] = word.to_be_bytes();
        self.put(hi)?;
        self.put(lo)
    }

    /// Stores one received byte at `index`; bytes beyond capacity are dropped.
    pub(crate) fn store(&mut self, index: usize, byte: u8) {
        if let Some(slot) = self.bytes.get_mut(index) {
            *slot = byte;
        }
    }

    /// Reads a received byte that is not yet part of the frame length.
    pub(crate) fn stored(&self, index: usize) -> u8 {
        self.bytes.get(index).copied().unwrap_or(0)
    }

    pub(crate) fn set_len(&mut self, len: usize) {
        self.len = len.min(MAX_FRAME_SIZE);
    }

    pub(crate) fn byte(&self, index: usize) -> u8 {
        self.as_slice().get(index).copied().unwrap_or(0)
    }

    fn word(&self, index: usize) -> u16 {
        u16::from_be_bytes([self.byte(index), self.byte(index + 1)])
    }

    /// Appends the checksum of the current content.
    pub fn append_crc(&mut self) -> Result<()> {
        if self.len + CHECKSUM_SIZE > MAX_FRAME_SIZE {
            return Err(Error::BufferOverflow(self.len + CHECKSUM_SIZE));
        }
        let crc = crc::checksum(self.as_slice());
        self.put((crc >> 8) as u8)?;
        self.put(crc as u8)
    }
}

fn coil_bytes(count: u16) -> usize {
    (count as usize).div_ceil(8)
}

/// Length of a request frame including checksum.
pub fn request_length(function: FunctionCode, count: u16) -> usize {
    match function {
        FunctionCode::WriteMultipleCoils => 9 + coil_bytes(count),
        FunctionCode::WriteMultipleRegisters => 9 + 2 * count as usize,
        _ => 8,
    }
}

/// Length of the reply a master waits for, including checksum.
pub fn reply_length(function: FunctionCode, count: u16) -> usize {
    match function {
        FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
            5 + coil_bytes(count).max(1)
        }
        FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
            5 + 2 * count as usize
        }
        _ => 8,
    }
}

/// Number of register image bytes carried in a status report.
pub fn report_length(function: FunctionCode, count: u16) -> usize {
    match function {
        FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => coil_bytes(count).max(1),
        FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
            2 * count as usize
        }
        _ => 7,
    }
}

/// Packs `count` coils starting at coil `first` of the register image.
/// Returns the number of bytes written, `ceil(count / 8)`.
pub fn pack_coils(registers: &[u16], first: u16, count: u16, out: &mut [u8]) -> usize {
    let len = coil_bytes(count).min(out.len());
    out[..len].fill(0);
    for i in 0..count as usize {
        let coil = first as usize + i;
        let on = registers
            .get(coil / 16)
            .is_some_and(|word| word & (1 << (coil % 16)) != 0);
        if on {
            if let Some(byte) = out.get_mut(i / 8) {
                *byte |= 1 << (i % 8);
            }
        }
    }
    len
}

/// Writes `count` packed coils from `bytes` into the register image starting
/// at coil `first`.
pub fn unpack_coils(bytes: &[u8], first: u16, count: u16, registers: &mut [u16]) {
    for i in 0..count as usize {
        let Some(byte) = bytes.get(i / 8) else {
            break;
        };
        let coil = first as usize + i;
        if let Some(word) = registers.get_mut(coil / 16) {
            let mask = 1 << (coil % 16);
            if byte & (1 << (i % 8)) != 0 {
                *word |= mask;
            } else {
                *word &= !mask;
            }
        }
    }
}

/// Encodes `query` into `buf` without checksum. Write functions take their
/// values from the register image.
pub fn encode_request(query: &MasterQuery, registers: &[u16], buf: &mut FrameBuffer) -> Result<()> {
    let length = request_length(query.function, query.count);
    if length > MAX_FRAME_SIZE {
        return Err(Error::BufferOverflow(length));
    }
    let register = |i: usize| registers.get(i).copied().unwrap_or(0);

    buf.clear();
    buf.put(query.slave_id)?;
    buf.put(query.function.code())?;
    buf.put_word(query.address)?;
    match query.function {
        FunctionCode::ReadCoils
        | FunctionCode::ReadDiscreteInputs
        | FunctionCode::ReadHoldingRegisters
        | FunctionCode::ReadInputRegisters => buf.put_word(query.count)?,
        FunctionCode::WriteSingleCoil => {
            buf.put_word(if register(0) > 0 { COIL_ON } else { 0 })?;
        }
        FunctionCode::WriteSingleRegister => buf.put_word(register(0))?,
        FunctionCode::WriteMultipleCoils => {
            let mut packed = [0u8; MAX_FRAME_SIZE];
            let len = pack_coils(registers, 0, query.count, &mut packed);
            buf.put_word(query.count)?;
            buf.put(len as u8)?;
            for byte in &packed[..len] {
                buf.put(*byte)?;
            }
        }
        FunctionCode::WriteMultipleRegisters => {
            buf.put_word(query.count)?;
            buf.put((2 * query.count) as u8)?;
            for i in 0..query.count as usize {
                buf.put_word(register(i))?;
            }
        }
    }
    Ok(())
}

/// Bit-read reply: data byte `i` fills the low (even `i`) or high (odd `i`)
/// byte of `registers[i / 2]`.
pub fn decode_bits(frame: &[u8], registers: &mut [u16]) {
    let data = reply_data(frame);
    for (i, byte) in data.iter().enumerate() {
        let Some(word) = registers.get_mut(i / 2) else {
            break;
        };
        if i % 2 == 0 {
            *word = *byte as u16;
        } else {
            *word = ((*byte as u16) << 8) | (*word & 0x00FF);
        }
    }
}

/// Word-read reply: register `i` of the reply lands at `registers[i]`.
pub fn decode_words(frame: &[u8], registers: &mut [u16]) {
    let data = reply_data(frame);
    for (word, pair) in registers.iter_mut().zip(data.chunks_exact(2)) {
        *word = u16::from_be_bytes([pair[0], pair[1]]);
    }
}

/// Write echo: station and function into the first two registers, then the
/// remaining bytes as big-endian words.
pub fn decode_write_echo(frame: &[u8], registers: &mut [u16]) {
    let byte = |i: usize| frame.get(i).copied().unwrap_or(0);
    for (i, word) in registers.iter_mut().take(5).enumerate() {
        *word = match i {
            0 | 1 => byte(i) as u16,
            _ => u16::from_be_bytes([byte(2 * i - 2), byte(2 * i - 1)]),
        };
    }
}

fn reply_data(frame: &[u8]) -> &[u8] {
    let declared = frame.get(2).copied().unwrap_or(0) as usize;
    let available = frame.len().saturating_sub(3 + CHECKSUM_SIZE);
    let end = 3 + declared.min(available);
    frame.get(3..end).unwrap_or(&[])
}

/// Replaces the buffer with an exception response for the request it holds.
pub fn build_exception(buf: &mut FrameBuffer, exception: Exception) {
    let station = buf.byte(ID);
    let function = buf.byte(FUNC);
    buf.load(&[station, function | EXCEPTION_FLAG, exception as u8]);
    debug_assert_eq!(buf.len(), EXCEPTION_SIZE);
}

/// Checks a slave request against the register image before dispatch.
pub fn validate_request(buf: &FrameBuffer, register_count: usize) -> Result<FunctionCode> {
    let function = FunctionCode::try_from(buf.byte(FUNC))?;
    let address = buf.word(ADD_HI) as u32;
    let count = buf.word(NB_HI) as u32;
    let out_of_range = |last: u32| {
        if last as usize >= register_count {
            Err(Error::IllegalDataAddress {
                span: last + 1,
                size: register_count,
            })
        } else {
            Ok(())
        }
    };

    match function {
        FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
            if count == 0 || 3 + coil_bytes(count as u16) + CHECKSUM_SIZE > MAX_FRAME_SIZE {
                return Err(Error::IllegalDataValue);
            }
            out_of_range((address + count - 1) / 16)?;
        }
        FunctionCode::WriteMultipleCoils => {
            if count == 0 {
                return Err(Error::IllegalDataValue);
            }
            out_of_range((address + count - 1) / 16)?;
            declared_payload_fits(buf, coil_bytes(count as u16))?;
        }
        FunctionCode::WriteSingleCoil => out_of_range(address / 16)?,
        FunctionCode::WriteSingleRegister => out_of_range(address)?,
        FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
            if count == 0 || 3 + 2 * count as usize + CHECKSUM_SIZE > MAX_FRAME_SIZE {
                return Err(Error::IllegalDataValue);
            }
            out_of_range(address + count - 1)?;
        }
        FunctionCode::WriteMultipleRegisters => {
            if count == 0 {
                return Err(Error::IllegalDataValue);
            }
            out_of_range(address + count - 1)?;
            declared_payload_fits(buf, 2 * count as usize)?;
        }
    }
    Ok(function)
}

fn declared_payload_fits(buf: &FrameBuffer, needed: usize) -> Result<()> {
    let declared = buf.byte(BYTE_CNT) as usize;
    if declared < needed || BYTE_CNT + 1 + declared + CHECKSUM_SIZE > buf.len() {
        Err(Error::IllegalDataValue)
    } else {
        Ok(())
    }
}

/// Executes a validated slave request against the register image and leaves
/// the response (without checksum) in the buffer.
pub fn respond(function: FunctionCode, buf: &mut FrameBuffer, registers: &mut [u16]) -> Result<()> {
    let address = buf.word(ADD_HI);
    let count = buf.word(NB_HI);
    match function {
        FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
            let mut packed = [0u8; MAX_FRAME_SIZE];
            let len = pack_coils(registers, address, count, &mut packed);
            buf.set_len(2);
            buf.put(len as u8)?;
            for byte in &packed[..len] {
                buf.put(*byte)?;
            }
        }
        FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
            let start = address as usize;
            buf.set_len(2);
            buf.put((2 * count) as u8)?;
            for i in start..start + count as usize {
                buf.put_word(registers.get(i).copied().unwrap_or(0))?;
            }
        }
        FunctionCode::WriteSingleCoil => {
            let on = buf.byte(NB_HI) == 0xFF;
            let bits = [on as u8];
            unpack_coils(&bits, address, 1, registers);
            buf.set_len(6);
        }
        FunctionCode::WriteSingleRegister => {
            if let Some(word) = registers.get_mut(address as usize) {
                *word = count;
            }
            buf.set_len(6);
        }
        FunctionCode::WriteMultipleCoils => {
            let mut packed = [0u8; MAX_FRAME_SIZE];
            let len = coil_bytes(count);
            for (i, byte) in packed.iter_mut().take(len).enumerate() {
                *byte = buf.byte(BYTE_CNT + 1 + i);
            }
            unpack_coils(&packed[..len], address, count, registers);
            buf.set_len(6);
        }
        FunctionCode::WriteMultipleRegisters => {
            let start = address as usize;
            for i in 0..count as usize {
                let value = buf.word(BYTE_CNT + 1 + 2 * i);
                if let Some(word) = registers.get_mut(start + i) {
                    *word = value;
                }
            }
            buf.set_len(6);
        }
    }
    Ok(())
}
