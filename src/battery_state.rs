use crate::error::{Error, Result};
use crate::message::Quantity;

/// The reported state of the battery
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryState {
    /// Pack voltage in V
    pub voltage_v: f64,
    /// Pack current in A. Negative while discharging
    pub current_a: f64,
    /// Temperature in °C
    pub temperature_c: f64,
    /// Remaining charge in Ah
    pub charge_ah: f64,
}

/// Readings gathered so far during one attempt.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct PartialState {
    voltage_v: Option<f64>,
    current_a: Option<f64>,
    temperature_c: Option<f64>,
    charge_ah: Option<f64>,
}

impl PartialState {
    pub fn insert(&mut self, quantity: Quantity, value: f64) {
        let slot = match quantity {
            Quantity::Voltage => &mut self.voltage_v,
            Quantity::Current => &mut self.current_a,
            Quantity::Temperature => &mut self.temperature_c,
            Quantity::Charge => &mut self.charge_ah,
        };
        *slot = Some(value);
    }

    /// The full state, provided every quantity has been read.
    pub fn complete(self) -> Result<BatteryState> {
        match self {
            PartialState {
                voltage_v: Some(voltage_v),
                current_a: Some(current_a),
                temperature_c: Some(temperature_c),
                charge_ah: Some(charge_ah),
            } => Ok(BatteryState { voltage_v, current_a, temperature_c, charge_ah }),
            incomplete => Err(Error::Protocol(format!("session ended with readings missing: {incomplete:?}"))),
        }
    }
}

#[test]
fn test_complete() {
    let mut partial = PartialState::default();
    partial.insert(Quantity::Voltage, 13.2);
    partial.insert(Quantity::Current, -0.5);
    partial.insert(Quantity::Temperature, 21.5);
    partial.insert(Quantity::Charge, 7.5);
    let state = partial.complete().unwrap();
    assert_eq!(
        state,
        BatteryState { voltage_v: 13.2, current_a: -0.5, temperature_c: 21.5, charge_ah: 7.5 }
    );
}

#[test]
fn test_incomplete() {
    let mut partial = PartialState::default();
    partial.insert(Quantity::Voltage, 13.2);
    partial.insert(Quantity::Charge, 7.5);
    assert!(matches!(partial.complete(), Err(Error::Protocol(_))));
}
