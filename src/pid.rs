//! The catalogue of recognized physical quantities.
//!
//! Each quantity carries a two-character mode-01 wire identifier and a
//! documented byte-to-value decoding rule. This table is effectively the
//! wire format: it must match what real adapters send, byte for byte.

use crate::error::DecodeError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A vehicle measurement type (OBD-II mode 01 parameter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Pid {
    /// Vehicle speed (0x0D), km/h
    Speed,
    /// Engine RPM (0x0C)
    Rpm,
    /// Mass air flow rate (0x10), g/s
    Maf,
    /// Intake manifold absolute pressure (0x0B), kPa
    IntakePressure,
    /// Intake air temperature (0x0F), degrees C
    IntakeTemperature,
    /// Calculated engine load (0x04), percent
    EngineLoad,
    /// Throttle position (0x11), percent
    ThrottlePosition,
}

impl Pid {
    /// Every catalogued quantity, in polling order.
    pub const ALL: [Pid; 7] = [
        Pid::Speed,
        Pid::Rpm,
        Pid::Maf,
        Pid::IntakePressure,
        Pid::IntakeTemperature,
        Pid::EngineLoad,
        Pid::ThrottlePosition,
    ];

    pub fn code(self) -> u8 {
        match self {
            Pid::Speed => 0x0D,
            Pid::Rpm => 0x0C,
            Pid::Maf => 0x10,
            Pid::IntakePressure => 0x0B,
            Pid::IntakeTemperature => 0x0F,
            Pid::EngineLoad => 0x04,
            Pid::ThrottlePosition => 0x11,
        }
    }

    /// Two-character hexadecimal wire identifier.
    pub fn identifier(self) -> &'static str {
        match self {
            Pid::Speed => "0D",
            Pid::Rpm => "0C",
            Pid::Maf => "10",
            Pid::IntakePressure => "0B",
            Pid::IntakeTemperature => "0F",
            Pid::EngineLoad => "04",
            Pid::ThrottlePosition => "11",
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Pid::ALL.iter().copied().find(|p| p.code() == code)
    }

    pub fn from_identifier(id: &str) -> Option<Self> {
        Pid::ALL
            .iter()
            .copied()
            .find(|p| p.identifier().eq_ignore_ascii_case(id))
    }

    pub fn name(self) -> &'static str {
        match self {
            Pid::Speed => "Speed",
            Pid::Rpm => "RPM",
            Pid::Maf => "MAF",
            Pid::IntakePressure => "Intake Pressure",
            Pid::IntakeTemperature => "Intake Temperature",
            Pid::EngineLoad => "Engine Load",
            Pid::ThrottlePosition => "Throttle Position",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            Pid::Speed => "km/h",
            Pid::Rpm => "rpm",
            Pid::Maf => "g/s",
            Pid::IntakePressure => "kPa",
            Pid::IntakeTemperature => "\u{00b0}C",
            Pid::EngineLoad | Pid::ThrottlePosition => "%",
        }
    }

    /// Expected payload width in data bytes.
    pub fn expected_bytes(self) -> usize {
        match self {
            Pid::Rpm | Pid::Maf => 2,
            _ => 1,
        }
    }

    /// Apply this quantity's scale/offset convention to raw data bytes.
    pub fn decode(self, data: &[u8]) -> Result<f64, DecodeError> {
        if data.len() < self.expected_bytes() {
            return Err(DecodeError::MalformedPayload {
                pid: self.name(),
                expected: self.expected_bytes(),
                actual: data.len(),
            });
        }

        let value = match self {
            Pid::Speed => f64::from(data[0]),
            Pid::Rpm => (f64::from(data[0]) * 256.0 + f64::from(data[1])) / 4.0,
            Pid::Maf => (f64::from(data[0]) * 256.0 + f64::from(data[1])) / 100.0,
            Pid::IntakePressure => f64::from(data[0]),
            Pid::IntakeTemperature => f64::from(data[0]) - 40.0,
            Pid::EngineLoad | Pid::ThrottlePosition => f64::from(data[0]) * 100.0 / 255.0,
        };
        Ok(value)
    }
}

/// One successfully decoded sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedMeasurement {
    pub pid: Pid,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Convert ASCII hex text into raw bytes.
///
/// Fails deterministically on non-hex characters so that a corrupted value
/// costs one quantity, never the whole session.
pub fn hex_to_bytes(hex: &str) -> Result<Vec<u8>, DecodeError> {
    // Lossy decoding turns a corrupted serial byte into a multi-byte
    // replacement character; the pairwise indexing below assumes ASCII.
    if !hex.is_ascii() || hex.len() % 2 != 0 {
        return Err(DecodeError::InvalidHex(hex.to_string()));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| DecodeError::InvalidHex(hex[i..i + 2].to_string()))
        })
        .collect()
}

/// Decode a mode-01 response frame (`41 <id> <data...>`, spaces already
/// stripped by the framer) into a measurement.
pub fn decode_mode01_frame(
    frame: &str,
    at: DateTime<Utc>,
) -> Result<DecodedMeasurement, DecodeError> {
    if frame.contains("NODATA") {
        return Err(DecodeError::NoData);
    }
    if !frame.is_ascii() || frame.len() < 4 || !frame.starts_with("41") {
        return Err(DecodeError::UnknownIdentifier(frame.to_string()));
    }

    let id = &frame[2..4];
    let pid =
        Pid::from_identifier(id).ok_or_else(|| DecodeError::UnknownIdentifier(id.to_string()))?;

    let data = hex_to_bytes(&frame[4..])?;
    let value = pid.decode(&data)?;

    Ok(DecodedMeasurement {
        pid,
        value,
        timestamp: at,
    })
}

/// Expand a "PIDs supported" bitmask into the catalogued quantities it
/// declares.
///
/// `group` is the base parameter of the queried range (0x00 for PIDs
/// 0x01-0x20); bit 0 of the first mask byte, counted from the most
/// significant bit, declares `group + 1`.
pub fn supported_from_bitmask(group: u8, mask: &[u8]) -> Vec<Pid> {
    let mut supported = Vec::new();
    for (byte_index, byte) in mask.iter().enumerate() {
        for bit in 0..8 {
            if byte & (0x80 >> bit) != 0 {
                let code = group as usize + byte_index * 8 + bit + 1;
                if let Some(pid) = u8::try_from(code).ok().and_then(Pid::from_code) {
                    supported.push(pid);
                }
            }
        }
    }
    supported
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpm_decode() {
        // 1A F8 => ((0x1A * 256) + 0xF8) / 4 = 1726
        let value = Pid::Rpm.decode(&[0x1A, 0xF8]).unwrap();
        assert!((value - 1726.0).abs() < f64::EPSILON);
    }

    #[test]
    fn speed_and_pressure_are_raw_bytes() {
        assert_eq!(Pid::Speed.decode(&[0x55]).unwrap(), 85.0);
        assert_eq!(Pid::IntakePressure.decode(&[0x64]).unwrap(), 100.0);
    }

    #[test]
    fn intake_temperature_offset() {
        // 0x73 = 115 => 75 degrees C
        assert_eq!(Pid::IntakeTemperature.decode(&[0x73]).unwrap(), 75.0);
    }

    #[test]
    fn maf_scaling() {
        let value = Pid::Maf.decode(&[0x02, 0x58]).unwrap();
        assert!((value - 6.0).abs() < 0.001);
    }

    #[test]
    fn short_payload_is_malformed_not_a_panic() {
        // One byte short of RPM's two-byte width.
        match Pid::Rpm.decode(&[0x1A]) {
            Err(DecodeError::MalformedPayload {
                expected, actual, ..
            }) => {
                assert_eq!(expected, 2);
                assert_eq!(actual, 1);
            }
            other => panic!("expected MalformedPayload, got {other:?}"),
        }
    }

    #[test]
    fn mode01_frame_roundtrip() {
        let m = decode_mode01_frame("410D2A", Utc::now()).unwrap();
        assert_eq!(m.pid, Pid::Speed);
        assert_eq!(m.value, 42.0);
    }

    #[test]
    fn unknown_identifier_is_reported() {
        match decode_mode01_frame("41FF00", Utc::now()) {
            Err(DecodeError::UnknownIdentifier(id)) => assert_eq!(id, "FF"),
            other => panic!("expected UnknownIdentifier, got {other:?}"),
        }
    }

    #[test]
    fn non_hex_payload_fails_deterministically() {
        match decode_mode01_frame("410DZZ", Utc::now()) {
            Err(DecodeError::InvalidHex(chunk)) => assert_eq!(chunk, "ZZ"),
            other => panic!("expected InvalidHex, got {other:?}"),
        }
    }

    #[test]
    fn corrupted_serial_byte_is_an_error_not_a_panic() {
        // One non-UTF-8 noise byte on the line survives lossy decoding as
        // the multi-byte replacement character.
        match decode_mode01_frame("410D\u{FFFD}A", Utc::now()) {
            Err(DecodeError::UnknownIdentifier(_)) => {}
            other => panic!("expected UnknownIdentifier, got {other:?}"),
        }

        match hex_to_bytes("\u{FFFD}A") {
            Err(DecodeError::InvalidHex(_)) => {}
            other => panic!("expected InvalidHex, got {other:?}"),
        }
    }

    #[test]
    fn no_data_marker() {
        assert_eq!(
            decode_mode01_frame("NODATA", Utc::now()),
            Err(DecodeError::NoData)
        );
    }

    #[test]
    fn bitmask_expansion_matches_bit_positions() {
        // Bits 4 (0x04), 11 (0x0B), 12 (0x0C), 13 (0x0D), 15 (0x0F),
        // 16 (0x10), 17 (0x11) => every catalogued PID in group 00.
        let mask = [0x10, 0x3B, 0x80, 0x00];
        let pids = supported_from_bitmask(0x00, &mask);
        assert_eq!(pids.len(), 7);
        assert!(pids.contains(&Pid::Speed));
        assert!(pids.contains(&Pid::Rpm));
        assert!(pids.contains(&Pid::Maf));
        assert!(pids.contains(&Pid::ThrottlePosition));
    }

    #[test]
    fn measurement_serializes_for_downstream_consumers() {
        let m = DecodedMeasurement {
            pid: Pid::Speed,
            value: 42.0,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains("\"Speed\""));
    }
}
