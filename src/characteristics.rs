use bytes::Buf;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Bluetooth SIG base UUID, into which 16-bit assigned numbers are spliced
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Expand a 16-bit assigned number into its full 128-bit UUID
#[must_use]
pub const fn short_uuid(short: u16) -> Uuid {
    Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
}

/// Health Thermometer service
pub const HEALTH_THERMOMETER_SERVICE: Uuid = short_uuid(0x1809);
/// Environmental Sensing service
pub const ENVIRONMENTAL_SENSING_SERVICE: Uuid = short_uuid(0x181A);
/// Battery service
pub const BATTERY_SERVICE: Uuid = short_uuid(0x180F);
/// Device Information service
pub const DEVICE_INFORMATION_SERVICE: Uuid = short_uuid(0x180A);
/// Heart Rate service
pub const HEART_RATE_SERVICE: Uuid = short_uuid(0x180D);
/// Pulse Oximeter service
pub const PULSE_OXIMETER_SERVICE: Uuid = short_uuid(0x1822);
/// Blood Pressure service
pub const BLOOD_PRESSURE_SERVICE: Uuid = short_uuid(0x1810);
/// Automation IO service
pub const AUTOMATION_IO_SERVICE: Uuid = short_uuid(0x1815);

/// Services requested when the device is chosen.
///
/// These do not decide compatibility; they only grant access to the
/// characteristics below on platforms that gate service access.
pub const KNOWN_SERVICE_UUIDS: [Uuid; 8] = [
    HEALTH_THERMOMETER_SERVICE,
    ENVIRONMENTAL_SENSING_SERVICE,
    BATTERY_SERVICE,
    DEVICE_INFORMATION_SERVICE,
    HEART_RATE_SERVICE,
    PULSE_OXIMETER_SERVICE,
    BLOOD_PRESSURE_SERVICE,
    AUTOMATION_IO_SERVICE,
];

/// Characteristics this crate knows how to decode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// Environmental sensing temperature (0x2A6E), sint16 in 0.01 °C
    Temperature,
    /// Environmental sensing humidity (0x2A6F), uint16 in 0.01 %
    Humidity,
    /// Battery level (0x2A19), uint8 percent
    Battery,
    /// Health thermometer temperature measurement (0x2A1C)
    HealthTemperature,
    /// Heart rate measurement (0x2A37)
    HeartRate,
}

impl DataType {
    /// Every known characteristic
    pub const ALL: [Self; 5] = [
        Self::Temperature,
        Self::Humidity,
        Self::Battery,
        Self::HealthTemperature,
        Self::HeartRate,
    ];

    /// Full characteristic UUID
    #[must_use]
    pub const fn uuid(self) -> Uuid {
        match self {
            Self::Temperature => short_uuid(0x2A6E),
            Self::Humidity => short_uuid(0x2A6F),
            Self::Battery => short_uuid(0x2A19),
            Self::HealthTemperature => short_uuid(0x2A1C),
            Self::HeartRate => short_uuid(0x2A37),
        }
    }

    /// Look up the known characteristic for a UUID
    #[must_use]
    pub fn from_uuid(uuid: &Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|data_type| data_type.uuid() == *uuid)
    }

    /// Semantic name, also used as the serialized form
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::Battery => "battery",
            Self::HealthTemperature => "health_temperature",
            Self::HeartRate => "heart_rate",
        }
    }

    /// Display unit
    #[must_use]
    pub const fn unit(self) -> &'static str {
        match self {
            Self::Temperature | Self::HealthTemperature => "°C",
            Self::Humidity | Self::Battery => "%",
            Self::HeartRate => "bpm",
        }
    }

    /// Decode a raw payload into engineering units.
    ///
    /// Payloads shorter than the fixed layout decode to `NaN`.
    #[must_use]
    pub fn decode(self, data: &[u8]) -> f64 {
        let mut buf = data;
        match self {
            Self::Temperature if buf.remaining() >= 2 => f64::from(buf.get_i16_le()) / 100.0,
            Self::Humidity if buf.remaining() >= 2 => f64::from(buf.get_u16_le()) / 100.0,
            Self::Battery if buf.has_remaining() => f64::from(buf.get_u8()),
            Self::HealthTemperature => parse_temperature_measurement(data),
            Self::HeartRate => parse_heart_rate(data),
            _ => f64::NAN,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for DataType {
    type Err = crate::DashboardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|data_type| data_type.name() == s)
            .ok_or_else(|| {
                crate::DashboardError::InvalidParameters(format!("Unknown data type: {s}"))
            })
    }
}

/// IEEE-11073 32-bit FLOAT: 24-bit two's-complement mantissa, 8-bit signed exponent
fn parse_ieee11073_float(data: &[u8]) -> f64 {
    if data.len() < 4 {
        return f64::NAN;
    }
    let raw = u32::from(data[0]) | (u32::from(data[1]) << 8) | (u32::from(data[2]) << 16);
    // Shift the sign bit of the 24-bit value into the i32 sign position and back.
    #[allow(clippy::cast_possible_wrap)]
    let mantissa = ((raw << 8) as i32) >> 8;
    #[allow(clippy::cast_possible_wrap)]
    let exponent = data[3] as i8;
    f64::from(mantissa) * 10f64.powi(i32::from(exponent))
}

/// Temperature Measurement: flags byte then a FLOAT; flag bit 0 means Fahrenheit
fn parse_temperature_measurement(data: &[u8]) -> f64 {
    let Some((&flags, rest)) = data.split_first() else {
        return f64::NAN;
    };
    let value = parse_ieee11073_float(rest);
    if flags & 0x01 == 0 {
        value
    } else {
        (value - 32.0) * 5.0 / 9.0
    }
}

/// Heart Rate Measurement: flag bit 0 selects a uint16 value over uint8
fn parse_heart_rate(data: &[u8]) -> f64 {
    let mut buf = data;
    if !buf.has_remaining() {
        return f64::NAN;
    }
    let flags = buf.get_u8();
    if flags & 0x01 == 0 {
        if buf.has_remaining() {
            f64::from(buf.get_u8())
        } else {
            f64::NAN
        }
    } else if buf.remaining() >= 2 {
        f64::from(buf.get_u16_le())
    } else {
        f64::NAN
    }
}

/// Decode a characteristic value.
///
/// Unknown characteristics fall back to the widest little-endian signed
/// integer the payload holds (4, 2 or 1 bytes), or `NaN` when empty.
#[must_use]
pub fn decode(uuid: &Uuid, data: &[u8]) -> f64 {
    if let Some(data_type) = DataType::from_uuid(uuid) {
        return data_type.decode(data);
    }

    let mut buf = data;
    match buf.remaining() {
        n if n >= 4 => f64::from(buf.get_i32_le()),
        n if n >= 2 => f64::from(buf.get_i16_le()),
        1 => f64::from(buf.get_i8()),
        _ => f64::NAN,
    }
}

/// Human-readable name, the UUID itself when unknown
#[must_use]
pub fn name(uuid: &Uuid) -> String {
    DataType::from_uuid(uuid).map_or_else(
        || uuid.to_string(),
        |data_type| data_type.name().to_string(),
    )
}

/// Display unit, empty when unknown
#[must_use]
pub fn unit(uuid: &Uuid) -> &'static str {
    DataType::from_uuid(uuid).map_or("", DataType::unit)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_short_uuid_expansion() {
        assert_eq!(
            short_uuid(0x2A6E).to_string(),
            "00002a6e-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            BATTERY_SERVICE.to_string(),
            "0000180f-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_temperature_decode() {
        let cases: [(i16, f64); 4] = [(2130, 21.3), (-550, -5.5), (0, 0.0), (i16::MIN, -327.68)];
        for (raw, expected) in cases {
            let value = DataType::Temperature.decode(&raw.to_le_bytes());
            assert!(close(value, expected), "{raw} decoded to {value}");
            assert!(close(value, f64::from(raw) / 100.0));
        }
    }

    #[test]
    fn test_humidity_is_not_clamped() {
        let value = decode(&DataType::Humidity.uuid(), &u16::MAX.to_le_bytes());
        assert!(close(value, 655.35));
        let value = decode(&DataType::Humidity.uuid(), &4512u16.to_le_bytes());
        assert!(close(value, 45.12));
    }

    #[test]
    fn test_battery_decode() {
        assert!(close(DataType::Battery.decode(&[87]), 87.0));
        assert!(close(DataType::Battery.decode(&[255, 1]), 255.0));
    }

    #[test]
    fn test_health_thermometer_celsius() {
        // flags=0, mantissa=3650, exponent=-2 -> 36.5 °C
        let payload = [0x00, 0x42, 0x0E, 0x00, 0xFE];
        assert!(close(DataType::HealthTemperature.decode(&payload), 36.5));

        // negative mantissa -1 * 10^0
        let payload = [0x00, 0xFF, 0xFF, 0xFF, 0x00];
        assert!(close(DataType::HealthTemperature.decode(&payload), -1.0));
    }

    #[test]
    fn test_health_thermometer_fahrenheit() {
        // flags=1, mantissa=986, exponent=-1 -> 98.6 °F -> 37 °C
        let payload = [0x01, 0xDA, 0x03, 0x00, 0xFF];
        let value = DataType::HealthTemperature.decode(&payload);
        assert!((value - 37.0).abs() < 1e-6, "got {value}");

        // 212 °F -> 100 °C
        let payload = [0x01, 0xD4, 0x00, 0x00, 0x00];
        assert!((DataType::HealthTemperature.decode(&payload) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_heart_rate_formats() {
        assert!(close(DataType::HeartRate.decode(&[0x00, 72]), 72.0));
        assert!(close(DataType::HeartRate.decode(&[0x01, 0x2C, 0x01]), 300.0));
        assert!(DataType::HeartRate.decode(&[0x01, 0x2C]).is_nan());
    }

    #[test]
    fn test_short_payloads_are_nan() {
        assert!(DataType::Temperature.decode(&[0x01]).is_nan());
        assert!(DataType::Battery.decode(&[]).is_nan());
        assert!(DataType::HealthTemperature.decode(&[0x00, 0x01]).is_nan());
    }

    #[test]
    fn test_generic_fallback() {
        let unknown = short_uuid(0x2A00);
        assert!(close(decode(&unknown, &(-70_000i32).to_le_bytes()), -70_000.0));
        assert!(close(decode(&unknown, &[0xFF, 0xFF, 0x01]), -1.0));
        assert!(close(decode(&unknown, &[0x80]), -128.0));
        assert!(decode(&unknown, &[]).is_nan());
    }

    #[test]
    fn test_name_and_unit_lookup() {
        assert_eq!(name(&DataType::Humidity.uuid()), "humidity");
        assert_eq!(unit(&DataType::Temperature.uuid()), "°C");

        let unknown = short_uuid(0x2A00);
        assert_eq!(name(&unknown), unknown.to_string());
        assert_eq!(unit(&unknown), "");
    }

    #[test]
    fn test_data_type_parse() {
        assert_eq!("heart_rate".parse::<DataType>().unwrap(), DataType::HeartRate);
        assert!("glucose".parse::<DataType>().is_err());
        assert_eq!(
            serde_json::to_string(&DataType::HealthTemperature).unwrap(),
            "\"health_temperature\""
        );
    }
}
