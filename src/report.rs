//! Hand a finished reading to a metrics collector.

use std::fmt::Write;
use std::future::Future;

use crate::battery_state::BatteryState;

/// Name of the measurement every reading is recorded under
pub const MEASUREMENT_NAME: &str = "battery";
/// Tag carrying the device address
pub const ADDRESS_TAG: &str = "battery";

/// One labelled measurement: a name, numeric fields and string tags.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub name: String,
    pub fields: Vec<(String, f64)>,
    pub tags: Vec<(String, String)>,
}

impl Measurement {
    /// The measurement for a battery reading, tagged with the battery's address.
    pub fn from_state(address: &str, state: &BatteryState) -> Self {
        Self {
            name: MEASUREMENT_NAME.to_string(),
            fields: vec![
                ("voltage".to_string(), state.voltage_v),
                ("current".to_string(), state.current_a),
                ("temp".to_string(), state.temperature_c),
                ("charge".to_string(), state.charge_ah),
            ],
            tags: vec![(ADDRESS_TAG.to_string(), address.to_string())],
        }
    }

    /// Render as one line of InfluxDB line protocol, without a timestamp so that the
    /// collector stamps it on arrival.
    pub fn to_line_protocol(&self) -> String {
        let mut line = escape(&self.name, &[',', ' ']);

        for (key, value) in &self.tags {
            // Writing to a String cannot fail
            let _ = write!(
                line,
                ",{}={}",
                escape(key, &[',', '=', ' ']),
                escape(value, &[',', '=', ' '])
            );
        }

        line.push(' ');
        for (i, (key, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                line.push(',');
            }
            let _ = write!(line, "{}={}", escape(key, &[',', '=', ' ']), value);
        }

        line
    }
}

fn escape(s: &str, special: &[char]) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        if special.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Somewhere to send measurements. Recording is fire-and-forget: a sink deals with
/// its own failures.
pub trait MetricsSink {
    fn record(&mut self, measurement: &Measurement) -> impl Future<Output = ()> + Send;
}

/// Package a complete reading as one measurement and hand it to `sink`.
pub async fn report<S: MetricsSink>(sink: &mut S, address: &str, state: &BatteryState) {
    let measurement = Measurement::from_state(address, state);
    tracing::debug!(line = %measurement.to_line_protocol(), "reporting");
    sink.record(&measurement).await;
}
