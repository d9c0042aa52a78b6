use crate::error::{Error, Result};
use crate::message::{lookup, Quantity, READ_HOLDING_REGISTERS};

/// Decode the value of `quantity` from a raw reply.
///
/// A reply has the layout:
///
/// Start Byte | End Byte     | Meaning
/// 0          | 0            | Device address
/// 1          | 1            | Function code, 0x03
/// 2          | 2            | Number of data bytes that follow
/// 3          | x            | The register data, big-endian
/// x+1        | x+2          | A MODBUS CRC over the bytes 0-x
///
/// A reply too short for the value is an error, never a zero. So is a reply to anything
/// other than a register read, such as an exception reply (function code `0x83`).
pub fn decode(quantity: Quantity, raw: &[u8]) -> Result<f64> {
    let rule = lookup(quantity).decoding;
    let needed = rule.offset + rule.width;
    let bytes = raw.get(rule.offset..needed).ok_or(Error::Decode {
        quantity,
        needed,
        actual: raw.len(),
    })?;

    // Long enough for the value, so the header is there too
    if raw[1] != READ_HOLDING_REGISTERS {
        return Err(Error::UnexpectedFunction {
            quantity,
            function: raw[1],
            code: raw[2],
        });
    }

    let unsigned = bytes
        .iter()
        .fold(0u64, |acc, &byte| (acc << 8) | u64::from(byte));

    let value = if rule.signed {
        // Sign-extend from the value's own width
        let shift = 64 - 8 * rule.width as u32;
        (((unsigned << shift) as i64) >> shift) as f64
    } else {
        unsigned as f64
    };

    Ok(value / rule.scale)
}

#[test]
fn test_decode_voltage() {
    let reply = hex::decode("ff0302008491f3").unwrap();
    assert_eq!(decode(Quantity::Voltage, &reply).unwrap(), 13.2);
}

#[test]
fn test_decode_current_discharging() {
    let reply = hex::decode("ff0302ffce0000").unwrap();
    assert_eq!(decode(Quantity::Current, &reply).unwrap(), -0.5);
}

#[test]
fn test_decode_current_charging() {
    let reply = hex::decode("ff030204d20000").unwrap();
    assert_eq!(decode(Quantity::Current, &reply).unwrap(), 12.34);
}

#[test]
fn test_decode_temperature() {
    let below_zero = hex::decode("ff0302ffec0000").unwrap();
    assert_eq!(decode(Quantity::Temperature, &below_zero).unwrap(), -2.0);

    let warm = hex::decode("ff030200d70000").unwrap();
    assert_eq!(decode(Quantity::Temperature, &warm).unwrap(), 21.5);
}

#[test]
fn test_decode_charge() {
    let reply = hex::decode("ff030400003a980000").unwrap();
    assert_eq!(decode(Quantity::Charge, &reply).unwrap(), 7.5);

    // The top bit is magnitude, not sign
    let large = hex::decode("ff0304800000000000").unwrap();
    assert_eq!(decode(Quantity::Charge, &large).unwrap(), 2147483648.0 / 2000.0);
}

#[test]
fn test_decode_short_reply() {
    let cases = [
        (Quantity::Voltage, "ff030200", 5),
        (Quantity::Current, "ff0302ff", 5),
        (Quantity::Temperature, "ff03", 5),
        (Quantity::Charge, "ff0304003a98", 7),
    ];
    for (quantity, reply, expected_needed) in cases {
        let reply = hex::decode(reply).unwrap();
        match decode(quantity, &reply) {
            Err(Error::Decode { quantity: q, needed, actual }) => {
                assert_eq!(q, quantity);
                assert_eq!(needed, expected_needed);
                assert_eq!(actual, reply.len());
            }
            other => panic!("{quantity}: expected decode error, got {other:?}"),
        }
    }
}

#[test]
fn test_decode_exception_reply() {
    // Illegal data address, CRC included: long enough to pass for a voltage or current
    let reply = crate::crc::frame(&hex::decode("ff8302").unwrap());
    for quantity in [Quantity::Voltage, Quantity::Current] {
        match decode(quantity, &reply) {
            Err(Error::UnexpectedFunction { quantity: q, function, code }) => {
                assert_eq!(q, quantity);
                assert_eq!(function, 0x83);
                assert_eq!(code, 0x02);
            }
            other => panic!("{quantity}: expected exception, got {other:?}"),
        }
    }

    // Still too short for the charge
    assert!(matches!(decode(Quantity::Charge, &reply), Err(Error::Decode { .. })));
}

#[test]
fn test_decode_empty_reply() {
    for quantity in Quantity::ALL {
        assert!(matches!(decode(quantity, &[]), Err(Error::Decode { .. })));
    }
}
