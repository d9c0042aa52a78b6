//! Requests the battery understands and how to read its replies.

mod command;
mod reply;

pub use command::{lookup, Command, Decoding, Quantity, DEVICE_ADDRESS, READ_HOLDING_REGISTERS};
pub use reply::decode;
