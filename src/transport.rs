use std::fmt;
use std::future::Future;

use bluest::Uuid;
use tokio::sync::mpsc;

use crate::error::Result;

/// Bytes written to [`Characteristic::ResetControl`] right after connecting, as the vendor app does.
pub const RESET_PAYLOAD: [u8; 2] = [0x08, 0x30];

/// The GATT characteristics used to talk to the battery's Bluetooth module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Characteristic {
    /// Resets the Bluetooth module
    ResetControl,
    /// Requests are written here
    CommandWrite,
    /// Replies arrive here as notifications
    Notify,
}

impl Characteristic {
    const RESET_CONTROL_ID: Uuid = Uuid::from_u128(0xf000ffd1_0451_4000_b000_000000000000);
    const COMMAND_WRITE_ID: Uuid = Uuid::from_u128(0x0000ffd1_0000_1000_8000_00805f9b34fb);
    const NOTIFY_ID: Uuid = Uuid::from_u128(0x0000fff1_0000_1000_8000_00805f9b34fb);

    pub const ALL: [Characteristic; 3] = [
        Characteristic::ResetControl,
        Characteristic::CommandWrite,
        Characteristic::Notify,
    ];

    pub fn uuid(&self) -> Uuid {
        match self {
            Characteristic::ResetControl => Self::RESET_CONTROL_ID,
            Characteristic::CommandWrite => Self::COMMAND_WRITE_ID,
            Characteristic::Notify => Self::NOTIFY_ID,
        }
    }
}

impl fmt::Display for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.uuid())
    }
}

/// The link to a battery.
///
/// Implementations handle the physical layer (BLE in production, a script in tests)
/// while the session drives the request/response exchange on top.
pub trait Transport {
    /// Connect to the device with the given address.
    fn connect(&mut self, address: &str) -> impl Future<Output = Result<()>> + Send;

    /// Drop the connection. Safe to call when not connected; never fails.
    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;

    /// Write `bytes` to a characteristic.
    fn write(
        &mut self,
        characteristic: Characteristic,
        bytes: &[u8],
    ) -> impl Future<Output = Result<()>> + Send;

    /// Forward every notification of `characteristic` into `handler` until unsubscribed.
    fn subscribe(
        &mut self,
        characteristic: Characteristic,
        handler: mpsc::Sender<Vec<u8>>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Stop forwarding notifications of `characteristic`.
    fn unsubscribe(&mut self, characteristic: Characteristic) -> impl Future<Output = ()> + Send;
}

#[test]
fn test_characteristic_ids() {
    assert_eq!(
        Characteristic::ResetControl.uuid().to_string(),
        "f000ffd1-0451-4000-b000-000000000000"
    );
    assert_eq!(
        Characteristic::CommandWrite.uuid().to_string(),
        "0000ffd1-0000-1000-8000-00805f9b34fb"
    );
    assert_eq!(
        Characteristic::Notify.uuid().to_string(),
        "0000fff1-0000-1000-8000-00805f9b34fb"
    );
}
