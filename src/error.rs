use std::time::Duration;

use thiserror::Error;

use crate::message::Quantity;
use crate::transport::Characteristic;

/// Everything that can end a battery read attempt.
#[derive(Error, Debug)]
pub enum Error {
    /// The transport refused or dropped the connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A characteristic write was rejected.
    #[error("Write to {characteristic} failed: {reason}")]
    Write {
        characteristic: Characteristic,
        reason: String,
    },

    /// A reply was too short to hold the value of its quantity.
    #[error("Reply for {quantity} too short: needed {needed} bytes, got {actual}")]
    Decode {
        quantity: Quantity,
        needed: usize,
        actual: usize,
    },

    /// The reply did not answer a register read, e.g. a MODBUS exception.
    #[error("Reply for {quantity} has function code {function:#04x} (exception code {code:#04x})")]
    UnexpectedFunction {
        quantity: Quantity,
        function: u8,
        code: u8,
    },

    /// A notification arrived while no command was pending.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No reply arrived for the pending command in time.
    #[error("No reply for {quantity} within {timeout:?}")]
    ReplyTimeout { quantity: Quantity, timeout: Duration },

    /// The reply CRC did not match its contents.
    #[error("Reply for {quantity} failed CRC check: expected {expected:04x}, got {actual:04x}")]
    ChecksumMismatch {
        quantity: Quantity,
        expected: u16,
        actual: u16,
    },

    /// Every attempt of the session failed.
    #[error("Giving up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<Error> },
}

pub type Result<T> = std::result::Result<T, Error>;
