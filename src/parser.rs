//! # Payload Parsing Module
//!
//! Turns raw device payloads into [`Sample`] records.
//!
//! ## Supported Shapes
//! - JSON object: `{"accX": 0.01, "accY": -0.02, ..., "gyrZ": 1.5, "battery": 87}`
//! - Tagged text: `AX:0.01 AY:-0.02 AZ:0.98 GX:1.2 GY:0.4 GZ:-0.1 Battery: 87%`
//!
//! Tags and keys are matched case-insensitively. Tokens may be separated by
//! whitespace, commas, semicolons or pipes, and a tag may be followed by
//! `:`/`=`, by its value directly, or by a separate value token.
//!
//! ## Defaults
//! Every axis and the battery level start at zero. A recognized field with a
//! malformed value keeps its zero instead of failing the whole sample, and
//! unknown tags are skipped. Only a payload that cannot be read at all
//! (empty, not UTF-8, broken JSON) is an error.
//!
//! The receipt timestamp is supplied by the caller; anything the device put
//! in the payload is ignored.

use crate::error::ParseError;
use crate::sample::{Sample, Vector3};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// The two wire shapes a device may emit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload<'a> {
    Json(&'a str),
    TaggedText(&'a str),
}

impl<'a> Payload<'a> {
    /// Decide which shape `raw` is in.
    pub fn classify(raw: &'a [u8]) -> Result<Self, ParseError> {
        let text = std::str::from_utf8(raw).map_err(ParseError::InvalidUtf8)?;
        // BLE characteristic reads are often NUL padded
        let text = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');

        if text.is_empty() {
            Err(ParseError::Empty)
        } else if text.starts_with('{') {
            Ok(Payload::Json(text))
        } else {
            Ok(Payload::TaggedText(text))
        }
    }

    /// Normalize into a sample stamped with `timestamp`.
    pub fn normalize(self, timestamp: DateTime<Utc>) -> Result<Sample, ParseError> {
        let mut fields = Fields::default();

        match self {
            Payload::Json(text) => fields.read_json(text)?,
            Payload::TaggedText(text) => fields.read_tagged(text),
        }

        Ok(fields.into_sample(timestamp))
    }
}

/// Decode `raw` and stamp it with the receipt time.
pub fn parse_payload(raw: &[u8], timestamp: DateTime<Utc>) -> Result<Sample, ParseError> {
    Payload::classify(raw)?.normalize(timestamp)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Acc(usize),
    Gyr(usize),
    Mag(usize),
    Battery,
}

impl Field {
    fn from_tag(tag: &str) -> Option<Self> {
        let field = match tag.to_ascii_lowercase().as_str() {
            "ax" | "accx" => Field::Acc(0),
            "ay" | "accy" => Field::Acc(1),
            "az" | "accz" => Field::Acc(2),
            "gx" | "gyrx" => Field::Gyr(0),
            "gy" | "gyry" => Field::Gyr(1),
            "gz" | "gyrz" => Field::Gyr(2),
            "mx" | "magx" => Field::Mag(0),
            "my" | "magy" => Field::Mag(1),
            "mz" | "magz" => Field::Mag(2),
            "battery" => Field::Battery,
            _ => return None,
        };
        Some(field)
    }
}

/// Accumulates field values while a payload is walked
#[derive(Debug, Default)]
struct Fields {
    acc: [f64; 3],
    gyr: [f64; 3],
    mag: [f64; 3],
    has_mag: bool,
    battery: u8,
}

impl Fields {
    fn set(&mut self, field: Field, value: Option<f64>) {
        // The magnetometer counts as present once any of its tags shows up,
        // even with a bad value.
        if let Field::Mag(_) = field {
            self.has_mag = true;
        }

        let Some(value) = value else {
            log::debug!("Malformed value for {:?}, defaulting to 0", field);
            return;
        };

        match field {
            Field::Acc(i) => self.acc[i] = value,
            Field::Gyr(i) => self.gyr[i] = value,
            Field::Mag(i) => self.mag[i] = value,
            Field::Battery => self.battery = value.round().clamp(0.0, 100.0) as u8,
        }
    }

    fn read_json(&mut self, text: &str) -> Result<(), ParseError> {
        let value: Value = serde_json::from_str(text).map_err(ParseError::InvalidJson)?;
        let Value::Object(map) = value else {
            return Err(ParseError::NotAnObject);
        };

        for (key, value) in &map {
            if let Some(field) = Field::from_tag(key) {
                let number = match value {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => parse_number(s),
                    _ => None,
                };
                self.set(field, number);
            }
        }

        Ok(())
    }

    fn read_tagged(&mut self, text: &str) {
        let mut tokens = text
            .split(|c: char| c.is_whitespace() || matches!(c, ',' | ';' | '|'))
            .filter(|t| !t.is_empty())
            .peekable();

        while let Some(token) = tokens.next() {
            let split = token
                .find(|c: char| !c.is_ascii_alphabetic())
                .unwrap_or(token.len());
            let (tag, rest) = token.split_at(split);

            let Some(field) = Field::from_tag(tag) else {
                continue;
            };

            let rest = rest.trim_start_matches([':', '=']);
            let value = if rest.is_empty() {
                // "Battery: 87%" puts the value in the next token
                match tokens.peek() {
                    Some(next) if !next.starts_with(|c: char| c.is_ascii_alphabetic()) => {
                        tokens.next().and_then(parse_number)
                    }
                    _ => None,
                }
            } else {
                parse_number(rest)
            };

            self.set(field, value);
        }
    }

    fn into_sample(self, timestamp: DateTime<Utc>) -> Sample {
        Sample {
            acc: Vector3::new(self.acc[0], self.acc[1], self.acc[2]),
            gyr: Vector3::new(self.gyr[0], self.gyr[1], self.gyr[2]),
            mag: self
                .has_mag
                .then(|| Vector3::new(self.mag[0], self.mag[1], self.mag[2])),
            battery: self.battery,
            timestamp,
        }
    }
}

fn parse_number(token: &str) -> Option<f64> {
    token
        .trim()
        .trim_end_matches('%')
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamp() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_classify_shapes() {
        assert!(matches!(Payload::classify(b"{\"accX\":1}"), Ok(Payload::Json(_))));
        assert!(matches!(Payload::classify(b"AX:1 AY:2"), Ok(Payload::TaggedText(_))));
        assert!(matches!(Payload::classify(b"  \0\0"), Err(ParseError::Empty)));
        assert!(matches!(Payload::classify(&[0xff, 0xfe]), Err(ParseError::InvalidUtf8(_))));
    }

    #[test]
    fn test_parse_json_payload() {
        let raw = br#"{"accX":0.1,"accY":-0.2,"accZ":0.98,"gyrX":1.5,"gyrY":0,"gyrZ":-3,"battery":76}"#;
        let ts = stamp();
        let sample = parse_payload(raw, ts).unwrap();

        assert_eq!(sample.acc, Vector3::new(0.1, -0.2, 0.98));
        assert_eq!(sample.gyr, Vector3::new(1.5, 0.0, -3.0));
        assert_eq!(sample.mag, None);
        assert_eq!(sample.battery, 76);
        assert_eq!(sample.timestamp, ts);
    }

    #[test]
    fn test_json_device_timestamp_is_ignored() {
        let raw = br#"{"accX":1,"timestamp":"1999-01-01T00:00:00"}"#;
        let ts = stamp();
        let sample = parse_payload(raw, ts).unwrap();
        assert_eq!(sample.timestamp, ts);
    }

    #[test]
    fn test_json_bad_field_defaults() {
        let raw = br#"{"accX":"oops","accY":"0.5","gyrZ":null,"magX":2}"#;
        let sample = parse_payload(raw, stamp()).unwrap();

        assert_eq!(sample.acc, Vector3::new(0.0, 0.5, 0.0));
        assert_eq!(sample.gyr.z, 0.0);
        assert_eq!(sample.mag, Some(Vector3::new(2.0, 0.0, 0.0)));
    }

    #[test]
    fn test_json_must_be_object() {
        assert!(matches!(parse_payload(b"[1,2,3]", stamp()), Err(ParseError::NotAnObject)));
        assert!(matches!(parse_payload(b"{\"accX\":", stamp()), Err(ParseError::InvalidJson(_))));
    }

    #[test]
    fn test_parse_tagged_text() {
        let raw = b"AX:0.01 AY:-0.02 AZ:0.98 GX:1.2 GY:0.4 GZ:-0.1 Battery: 87%";
        let sample = parse_payload(raw, stamp()).unwrap();

        assert_eq!(sample.acc, Vector3::new(0.01, -0.02, 0.98));
        assert_eq!(sample.gyr, Vector3::new(1.2, 0.4, -0.1));
        assert_eq!(sample.battery, 87);
        assert_eq!(sample.mag, None);
    }

    #[test]
    fn test_tagged_text_separators_and_forms() {
        let raw = b"ax=1.5,AY 2.5;az3|MX:4 my=5 Battery:100%";
        let sample = parse_payload(raw, stamp()).unwrap();

        assert_eq!(sample.acc, Vector3::new(1.5, 2.5, 3.0));
        assert_eq!(sample.mag, Some(Vector3::new(4.0, 5.0, 0.0)));
        assert_eq!(sample.battery, 100);
    }

    #[test]
    fn test_missing_gyroscope_defaults_to_zero() {
        let sample = parse_payload(b"AX:1 AY:2 AZ:3", stamp()).unwrap();
        assert_eq!(sample.gyr, Vector3::default());
        assert_eq!(sample.battery, 0);
    }

    #[test]
    fn test_corrupt_field_keeps_rest_of_sample() {
        let sample = parse_payload(b"AX:1.0 AY:1.2.3 AZ:nan GX:45 Temp:22 Battery: abc%", stamp()).unwrap();

        assert_eq!(sample.acc, Vector3::new(1.0, 0.0, 0.0));
        assert_eq!(sample.gyr.x, 45.0);
        assert_eq!(sample.battery, 0);
    }

    #[test]
    fn test_tag_without_value_does_not_swallow_next_tag() {
        let sample = parse_payload(b"AX: AY:2", stamp()).unwrap();
        assert_eq!(sample.acc, Vector3::new(0.0, 2.0, 0.0));
    }

    #[test]
    fn test_battery_is_clamped() {
        let sample = parse_payload(br#"{"battery":250}"#, stamp()).unwrap();
        assert_eq!(sample.battery, 100);

        let sample = parse_payload(br#"{"battery":-5}"#, stamp()).unwrap();
        assert_eq!(sample.battery, 0);
    }
}
