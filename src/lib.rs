//! Read telemetry from Renogy smart LiFePO4 batteries over Bluetooth Low Energy
//!
//! Tested with Renogy 12V smart lithium batteries fitted with the built-in Bluetooth module.
//!
//! The battery exposes a MODBUS register map. Requests are MODBUS RTU frames written to a GATT
//! characteristic and each reply comes back as a single notification on another one. The battery
//! only talks to one host at a time, so connecting often fails while a phone is holding it and
//! the whole exchange is retried.
//!
//! Currently the following data can be accessed:
//!
//! - Voltage (V)
//! - Current (A, negative while discharging)
//! - Temperature (°C)
//! - Remaining charge (Ah)
//!
//! # Example
//!
//! ```no_run
//! # use std::time::Duration;
//! # use renogy_bt_read::{BatteryClient, BleTransport, SessionConfig, TelegrafSink};
//! #
//! # #[tokio::main]
//! # pub async fn main() -> anyhow::Result<()> {
//!     let transport = BleTransport::new(Duration::from_secs(30)).await?;
//!     let mut sink = TelegrafSink::connect("127.0.0.1:8094").await?;
//!     let mut battery_client = BatteryClient::new(transport, SessionConfig::default());
//!     let battery_state = battery_client.read_battery("F8:33:31:00:00:00", &mut sink).await?;
//!     println!("{battery_state:?}");
//! #   Ok(())
//! # }
//! ```

mod battery_client;
mod battery_state;
mod ble;
pub mod crc;
mod error;
pub mod message;
pub mod report;
pub mod telegraf;
pub mod transport;

pub use battery_client::{BatteryClient, SessionConfig};
pub use battery_state::BatteryState;
pub use ble::BleTransport;
pub use error::{Error, Result};
pub use report::{Measurement, MetricsSink};
pub use telegraf::TelegrafSink;
pub use transport::{Characteristic, Transport};
