//! MODBUS CRC-16 framing.
//!
//! The battery only accepts requests carrying the MODBUS flavour of CRC-16
//! (initial value `0xFFFF`, reflected polynomial `0xA001`), appended little-endian.
//! Anything else is dropped silently by the device.

use crc16::{State, MODBUS};

/// Compute the CRC check value for the given bytes
pub fn crc(data: &[u8]) -> [u8; 2] {
    State::<MODBUS>::calculate(data).to_le_bytes()
}

/// Return a copy of `bytes` with its CRC appended.
pub fn frame(bytes: &[u8]) -> Vec<u8> {
    debug_assert!(!bytes.is_empty(), "cannot frame an empty command");
    let mut framed = Vec::with_capacity(bytes.len() + 2);
    framed.extend_from_slice(bytes);
    framed.extend_from_slice(&crc(bytes));
    framed
}

/// Check the trailing CRC of a complete frame.
///
/// Frames shorter than three bytes cannot carry both a payload and a CRC and never verify.
pub fn verify(frame: &[u8]) -> bool {
    match split_crc(frame) {
        Some((body, actual)) => crc(body) == actual,
        None => false,
    }
}

/// Split a frame into its body and the CRC it carries.
pub(crate) fn split_crc(frame: &[u8]) -> Option<(&[u8], [u8; 2])> {
    if frame.len() < 3 {
        return None;
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    Some((body, [tail[0], tail[1]]))
}
