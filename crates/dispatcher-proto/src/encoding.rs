//! JSON codec extensions.
//!
//! Values with no native JSON representation travel as single-key objects:
//!
//! | wrapper          | wire form                       |
//! |------------------|---------------------------------|
//! | [`Timestamp`]    | `{"$date": "<ISO-8601>"}`       |
//! | [`Binary`]       | `{"$binary": "<base64>"}`       |
//! | [`RegexPattern`] | `{"$regex": "<pattern>"}`       |
//! | [`Password`]     | `{"$password": "<secret>"}`     |
//!
//! The wrappers are ordinary serde types, so they compose with any payload
//! struct.  `{"$fd": N}` is the fifth extension; it lives in
//! [`crate::fdpass`] because it interacts with transport ancillary data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A point in time, carried as `{"$date": ISO-8601}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    #[serde(rename = "$date")]
    pub value: DateTime<Utc>,
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(value: DateTime<Utc>) -> Self {
        Timestamp { value }
    }
}

/// A byte blob, carried as `{"$binary": base64}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binary {
    #[serde(rename = "$binary", with = "base64_bytes")]
    pub bytes: Vec<u8>,
}

impl From<Vec<u8>> for Binary {
    fn from(bytes: Vec<u8>) -> Self {
        Binary { bytes }
    }
}

/// A regular-expression pattern, carried as `{"$regex": pattern}`.
///
/// The pattern is kept as source text; compiling it is the consumer's
/// business (event masks compile with the `regex` crate).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegexPattern {
    #[serde(rename = "$regex")]
    pub pattern: String,
}

impl RegexPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        RegexPattern {
            pattern: pattern.into(),
        }
    }
}

/// An opaque secret, carried as `{"$password": secret}`.
///
/// `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Password {
    #[serde(rename = "$password")]
    pub secret: String,
}

impl Password {
    pub fn new(secret: impl Into<String>) -> Self {
        Password {
            secret: secret.into(),
        }
    }
}

impl std::fmt::Debug for Password {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Password(<redacted>)")
    }
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(de)?;
        STANDARD.decode(encoded).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamp_round_trip() {
        let ts = Timestamp::from(Utc.with_ymd_and_hms(2016, 3, 1, 12, 30, 0).unwrap());
        let value = serde_json::to_value(ts).unwrap();
        assert!(value.get("$date").is_some_and(|v| v.is_string()));
        let back: Timestamp = serde_json::from_value(value).unwrap();
        assert_eq!(back, ts);
    }

    #[test]
    fn binary_round_trip() {
        let blob = Binary::from(vec![0u8, 1, 2, 0xff]);
        let value = serde_json::to_value(&blob).unwrap();
        assert_eq!(value["$binary"], "AAEC/w==");
        let back: Binary = serde_json::from_value(value).unwrap();
        assert_eq!(back, blob);
    }

    #[test]
    fn regex_round_trip() {
        let re = RegexPattern::new("server\\..*");
        let value = serde_json::to_value(&re).unwrap();
        assert_eq!(value["$regex"], "server\\..*");
        let back: RegexPattern = serde_json::from_value(value).unwrap();
        assert_eq!(back, re);
    }

    #[test]
    fn password_round_trip_and_redacted_debug() {
        let pw = Password::new("hunter2");
        let value = serde_json::to_value(&pw).unwrap();
        assert_eq!(value["$password"], "hunter2");
        let back: Password = serde_json::from_value(value).unwrap();
        assert_eq!(back, pw);
        assert_eq!(format!("{pw:?}"), "Password(<redacted>)");
    }
}
