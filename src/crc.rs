//! Modbus RTU checksum.
//!
//! The value returned by [`checksum`] is byte-swapped relative to the usual
//! CRC-16/MODBUS register so that it appends to a frame high byte first.
use crc::{Crc, CRC_16_MODBUS};

use crate::protocol::CHECKSUM_SIZE;

const CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Checksum of `data`, ready to append as `[(crc >> 8) as u8, crc as u8]`.
pub fn checksum(data: &[u8]) -> u16 {
    CRC.checksum(data).swap_bytes()
}

/// The checksum carried in the trailing two bytes of `frame`.
pub fn received(frame: &[u8]) -> Option<u16> {
    match frame {
        [.., hi, lo] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}

/// Compares the trailing checksum with the one computed over the rest of
/// the frame. Returns `(expected, received)` on mismatch.
pub fn verify(frame: &[u8]) -> Result<(), (u16, u16)> {
    if frame.len() < CHECKSUM_SIZE {
        return Err((0, 0));
    }
    let (body, _) = frame.split_at(frame.len() - CHECKSUM_SIZE);
    let expected = checksum(body);
    match received(frame) {
        Some(crc) if crc == expected => Ok(()),
        Some(crc) => Err((expected, crc)),
        None => Err((expected, 0)),
    }
}
