use std::fmt;

use crate::crc;

/// Device id every Renogy smart battery answers to
pub const DEVICE_ADDRESS: u8 = 0xff;
/// MODBUS "read holding registers"
pub const READ_HOLDING_REGISTERS: u8 = 0x03;

/// The telemetry values the battery can be asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quantity {
    /// Pack voltage in V
    Voltage,
    /// Pack current in A, negative while discharging
    Current,
    /// Temperature in °C
    Temperature,
    /// Remaining charge in Ah
    Charge,
}

impl Quantity {
    /// The order in which a session queries the battery.
    pub const ALL: [Quantity; 4] = [
        Quantity::Voltage,
        Quantity::Current,
        Quantity::Temperature,
        Quantity::Charge,
    ];
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Quantity::Voltage => "voltage",
            Quantity::Current => "current",
            Quantity::Temperature => "temperature",
            Quantity::Charge => "charge",
        };
        f.write_str(name)
    }
}

/// Where a value sits in a reply and how to scale it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decoding {
    /// Offset of the first byte of the value, counted from the start of the reply
    pub offset: usize,
    /// Width of the big-endian value in bytes
    pub width: usize,
    pub signed: bool,
    /// The raw value is divided by this
    pub scale: f64,
}

/// A read request for one quantity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Command {
    pub quantity: Quantity,
    pub register: u16,
    pub register_count: u16,
    pub decoding: Decoding,
}

impl Command {
    /// The unframed request: device address, function code, register and register count.
    pub fn template(&self) -> [u8; 6] {
        let [register_hi, register_lo] = self.register.to_be_bytes();
        let [count_hi, count_lo] = self.register_count.to_be_bytes();
        [
            DEVICE_ADDRESS,
            READ_HOLDING_REGISTERS,
            register_hi,
            register_lo,
            count_hi,
            count_lo,
        ]
    }

    /// The request as it goes on the wire, CRC included.
    pub fn request(&self) -> Vec<u8> {
        crc::frame(&self.template())
    }
}

const VOLTAGE: Command = Command {
    quantity: Quantity::Voltage,
    register: 0x13b3,
    register_count: 1,
    // Only the low byte of the register carries the value
    decoding: Decoding { offset: 4, width: 1, signed: false, scale: 10.0 },
};

const CURRENT: Command = Command {
    quantity: Quantity::Current,
    register: 0x13b2,
    register_count: 1,
    decoding: Decoding { offset: 3, width: 2, signed: true, scale: 100.0 },
};

const TEMPERATURE: Command = Command {
    quantity: Quantity::Temperature,
    register: 0x139a,
    register_count: 1,
    decoding: Decoding { offset: 3, width: 2, signed: true, scale: 10.0 },
};

const CHARGE: Command = Command {
    quantity: Quantity::Charge,
    register: 0x13b4,
    register_count: 2,
    decoding: Decoding { offset: 3, width: 4, signed: false, scale: 2000.0 },
};

/// The request template for a quantity.
pub fn lookup(quantity: Quantity) -> &'static Command {
    match quantity {
        Quantity::Voltage => &VOLTAGE,
        Quantity::Current => &CURRENT,
        Quantity::Temperature => &TEMPERATURE,
        Quantity::Charge => &CHARGE,
    }
}

#[test]
fn test_requests() {
    let cases = [
        (Quantity::Voltage, "ff0313b3000164b7"),
        (Quantity::Current, "ff0313b200013577"),
        (Quantity::Temperature, "ff03139a0001b57f"),
        (Quantity::Charge, "ff0313b400029577"),
    ];
    for (quantity, expected) in cases {
        assert_eq!(hex::encode(lookup(quantity).request()), expected, "{quantity}");
    }
}

#[test]
fn test_lookup_matches_tag() {
    for quantity in Quantity::ALL {
        assert_eq!(lookup(quantity).quantity, quantity);
    }
}

#[test]
fn test_distinct_registers() {
    let mut registers: Vec<u16> = Quantity::ALL.iter().map(|q| lookup(*q).register).collect();
    registers.sort_unstable();
    registers.dedup();
    assert_eq!(registers.len(), 4);
}
