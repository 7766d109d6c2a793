use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const METERS_TO_FEET: f64 = 3.28084;
pub const MPS_TO_KNOTS: f64 = 1.943844;

/// Barometric altitude as reported by ADS-B feeds: either feet or the literal `"ground"`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawAltitude", into = "RawAltitude")]
pub enum BaroAltitude {
    Feet(f64),
    OnGround,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum RawAltitude {
    Feet(f64),
    Text(String),
}

impl TryFrom<RawAltitude> for BaroAltitude {
    type Error = String;

    fn try_from(raw: RawAltitude) -> Result<Self, Self::Error> {
        match raw {
            RawAltitude::Feet(ft) if ft.is_finite() => Ok(BaroAltitude::Feet(ft)),
            RawAltitude::Feet(ft) => Err(format!("non-finite altitude {ft}")),
            RawAltitude::Text(s) if s.eq_ignore_ascii_case("ground") => Ok(BaroAltitude::OnGround),
            RawAltitude::Text(s) => Err(format!("unknown altitude '{s}'")),
        }
    }
}

impl From<BaroAltitude> for RawAltitude {
    fn from(alt: BaroAltitude) -> Self {
        match alt {
            BaroAltitude::Feet(ft) => RawAltitude::Feet(ft),
            BaroAltitude::OnGround => RawAltitude::Text("ground".to_string()),
        }
    }
}

/// One observed aircraft position report, normalized from whichever upstream provider
/// produced it. Serialized with the field names the browser map reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AircraftState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hex: Option<String>,

    #[serde(rename = "flight", default, skip_serializing_if = "Option::is_none")]
    pub callsign: Option<String>,

    #[serde(rename = "r", default, skip_serializing_if = "Option::is_none")]
    pub registration: Option<String>,

    #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
    pub type_code: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,

    pub lat: f64,
    pub lon: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<f64>,

    #[serde(rename = "gs", default, skip_serializing_if = "Option::is_none")]
    pub ground_speed: Option<f64>,

    #[serde(rename = "alt_baro", default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<BaroAltitude>,

    #[serde(rename = "lastSeen", with = "chrono::serde::ts_milliseconds")]
    pub last_seen: DateTime<Utc>,
}

impl AircraftState {
    /// Minimal record at a position, mostly useful to build fixtures.
    pub fn at(hex: &str, lat: f64, lon: f64) -> Self {
        AircraftState {
            hex: Some(hex.to_string()),
            callsign: None,
            registration: None,
            type_code: None,
            desc: None,
            lat,
            lon,
            track: None,
            ground_speed: None,
            altitude: None,
            last_seen: Utc::now(),
        }
    }

    /// Identity of this record: transponder hex, else callsign, else a key derived from the position.
    /// Not stable across providers.
    pub fn key(&self) -> String {
        if let Some(hex) = non_blank(self.hex.as_deref()) {
            return hex.to_ascii_lowercase();
        }
        if let Some(callsign) = non_blank(self.callsign.as_deref()) {
            return callsign.to_string();
        }
        format!("{}_{}", self.lat, self.lon)
    }
}

/// `Some(trimmed)` unless the text is absent or only whitespace.
pub fn non_blank(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

pub(crate) fn non_blank_owned(s: Option<String>) -> Option<String> {
    non_blank(s.as_deref()).map(str::to_string)
}

pub fn is_valid_position(lat: f64, lon: f64) -> bool {
    lat.is_finite() && lon.is_finite() && (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_fallbacks() {
        let mut ac = AircraftState::at("C0FFEE", 43.7, -79.4);
        assert_eq!(ac.key(), "c0ffee");

        ac.hex = Some("  ".to_string());
        ac.callsign = Some(" ACA123 ".to_string());
        assert_eq!(ac.key(), "ACA123");

        ac.callsign = Some("   ".to_string());
        assert_eq!(ac.key(), "43.7_-79.4");
    }

    #[test]
    fn test_position_validity() {
        assert!(is_valid_position(90.0, -180.0));
        assert!(!is_valid_position(90.5, 0.0));
        assert!(!is_valid_position(0.0, 181.0));
        assert!(!is_valid_position(f64::NAN, 0.0));
    }

    #[test]
    fn test_wire_names() {
        let mut ac = AircraftState::at("a1", 43.7, -79.4);
        ac.callsign = Some("ACA123".to_string());
        ac.altitude = Some(BaroAltitude::OnGround);
        ac.ground_speed = Some(12.5);

        let json = serde_json::to_value(&ac).unwrap();
        assert_eq!(json["hex"], "a1");
        assert_eq!(json["flight"], "ACA123");
        assert_eq!(json["alt_baro"], "ground");
        assert_eq!(json["gs"], 12.5);
        assert!(json["lastSeen"].is_i64());
        assert!(json.get("r").is_none());
    }

    #[test]
    fn test_altitude_parse() {
        let ft: BaroAltitude = serde_json::from_str("35000").unwrap();
        assert_eq!(ft, BaroAltitude::Feet(35000.0));
        let gnd: BaroAltitude = serde_json::from_str("\"ground\"").unwrap();
        assert_eq!(gnd, BaroAltitude::OnGround);
        assert!(serde_json::from_str::<BaroAltitude>("\"high\"").is_err());
    }
}
