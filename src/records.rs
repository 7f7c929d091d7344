//! Decoded data as it is handed over to the publishers.

use crate::bitfield::BitFields;
use crate::registers::Value;

/// Analog telemetry, refreshed on every poll cycle.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalogTelemetry {
    pub water_level: Value,
    pub target_speed: Value,
    pub motor_current: Value,
    pub heatsink_temperature: Value,
    pub dclink_voltage: Value,
    pub motor_speed_percentage: Value,
    #[serde(rename = "motorSpeedRPM")]
    pub motor_speed_rpm: Value,
    pub motor_input: Value,
    pub compressor_power_consumption: Value,
    pub compressor_volume_percentage: Value,
    pub compressor_volume: Value,
    pub group_volume: Value,
    pub stage1_output_pressure: Value,
    pub line_pressure: Value,
    pub stage1_output_temperature: Value,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerInfo {
    pub running_hours: u32,
    pub loaded_hours: u32,
    pub lowest_service_counter: u16,
    pub run_on_timer: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressorIdentity {
    pub software_version: String,
    pub serial_number: String,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
}

/// Every kind of record the device publishes.
#[derive(Clone, Debug, PartialEq, serde::Serialize, strum::IntoStaticStr)]
#[serde(untagged)]
#[strum(serialize_all = "camelCase")]
pub enum Record {
    Status(BitFields),
    Errors(BitFields),
    Warnings(BitFields),
    AnalogData(AnalogTelemetry),
    TimerInfo(TimerInfo),
    CompressorInfo(CompressorIdentity),
    ConnectionStatus(ConnectionStatus),
}

impl Record {
    /// Name of the record, e.g. `status` or `analogData`.
    pub fn name(&self) -> &'static str {
        self.into()
    }

    /// Record fields as `(name, value)` pairs in their published representation.
    pub fn fields(&self) -> Vec<(String, String)> {
        let value = match serde_json::to_value(self) {
            Ok(value) => value,
            Err(_) => return Vec::new(),
        };
        let serde_json::Value::Object(map) = value else {
            return Vec::new();
        };
        map.into_iter()
            .map(|(k, v)| {
                let v = match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, v)
            })
            .collect()
    }
}

/// Assemble a 32-bit counter stored as two registers, high word first.
pub fn u32_from_words(high: u16, low: u16) -> u32 {
    u32::from(high) << 16 | u32::from(low)
}

/// Decode a string stored as one character code per register.
pub fn string_from_words(words: &[u16]) -> String {
    words
        .iter()
        .map(|&w| char::from_u32(u32::from(w)).unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_high_word_first() {
        assert_eq!(u32_from_words(0x0001, 0x0002), 0x0001_0002);
        assert_eq!(u32_from_words(0xFFFF, 0xFFFF), u32::MAX);
    }

    #[test]
    fn strings_use_one_register_per_character() {
        let words = "SN-42".chars().map(|c| c as u16).collect::<Vec<_>>();
        assert_eq!(string_from_words(&words), "SN-42");
        assert_eq!(string_from_words(&[0xD800]), "\u{FFFD}");
    }

    #[test]
    fn record_names() {
        let record = Record::ConnectionStatus(ConnectionStatus { connected: true });
        assert_eq!(record.name(), "connectionStatus");
        assert_eq!(record.fields(), [("connected".to_string(), "true".to_string())]);
        assert_eq!(Record::Status(BitFields::default()).name(), "status");
    }

    #[test]
    fn timer_fields_are_camel_case() {
        let record = Record::TimerInfo(TimerInfo {
            running_hours: 10,
            loaded_hours: 5,
            lowest_service_counter: 3,
            run_on_timer: 0,
        });
        let keys = record.fields().into_iter().map(|(k, _)| k).collect::<Vec<_>>();
        assert!(keys.contains(&"runningHours".to_string()));
        assert!(keys.contains(&"lowestServiceCounter".to_string()));
    }
}
